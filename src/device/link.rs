//! Wireless link liveness
//!
//! The card is reached over its own access point. When the computer drops
//! off that network a pending HTTP read can hang far longer than the request
//! timeout suggests, so every transfer is raced against a watcher that polls
//! the currently joined SSID.

use crate::core::error::SyncError;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Default time between two liveness probes
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Something that can tell whether the link to the card is still up
///
/// Implementations may block (spawn a process, query the OS); they are always
/// called from a blocking thread.
pub trait LinkProbe: Send + Sync {
    fn is_link_up(&self) -> bool;
}

/// Probe that checks the joined network's SSID against the card's SSID
#[derive(Debug, Clone)]
pub struct SsidProbe {
    expected_ssid: String,
}

impl SsidProbe {
    pub fn new(expected_ssid: impl Into<String>) -> Self {
        Self {
            expected_ssid: expected_ssid.into(),
        }
    }

    pub fn expected_ssid(&self) -> &str {
        &self.expected_ssid
    }
}

impl LinkProbe for SsidProbe {
    fn is_link_up(&self) -> bool {
        match current_ssid() {
            Some(ssid) => {
                let up = ssid == self.expected_ssid;
                if !up {
                    debug!("Joined network is '{}', expected '{}'", ssid, self.expected_ssid);
                }
                up
            }
            // Can't tell, so don't abort a transfer over it
            None => true,
        }
    }
}

/// SSID of the wireless network this machine is joined to, if it can be read
pub fn current_ssid() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let output = std::process::Command::new("iwgetid").arg("-r").output().ok()?;
        if !output.status.success() {
            return None;
        }
        let ssid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!ssid.is_empty()).then_some(ssid)
    }

    #[cfg(target_os = "windows")]
    {
        let output = std::process::Command::new("netsh")
            .args(["wlan", "show", "interfaces"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_netsh_ssid(&String::from_utf8_lossy(&output.stdout))
    }

    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("networksetup")
            .args(["-getairportnetwork", "en0"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.split_once(": ")
            .map(|(_, ssid)| ssid.trim().to_string())
            .filter(|ssid| !ssid.is_empty())
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        None
    }
}

/// Pick the `SSID : name` line (not `BSSID`) out of `netsh` output
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_netsh_ssid(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "SSID" {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Resolve once the link is observed to be down
///
/// Polls `probe` every `interval`. Without a probe this never resolves, which
/// lets callers race it unconditionally inside `tokio::select!`.
pub async fn watch_link(probe: Option<Arc<dyn LinkProbe>>, interval: Duration) -> SyncError {
    let probe = match probe {
        Some(p) => p,
        None => return std::future::pending().await,
    };

    loop {
        tokio::time::sleep(interval).await;

        let p = Arc::clone(&probe);
        let up = match tokio::task::spawn_blocking(move || p.is_link_up()).await {
            Ok(up) => up,
            Err(e) => {
                warn!("Link probe panicked: {}", e);
                true
            }
        };

        if !up {
            warn!("Wireless link to the card dropped");
            return SyncError::ConnectionLost;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    impl LinkProbe for FlagProbe {
        fn is_link_up(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_parse_netsh_ssid() {
        let text = "\
    Name                   : Wi-Fi
    State                  : connected
    SSID                   : flashair_12345
    BSSID                  : 00:11:22:33:44:55
";
        assert_eq!(parse_netsh_ssid(text).as_deref(), Some("flashair_12345"));
        assert_eq!(parse_netsh_ssid("    State : disconnected"), None);
    }

    #[tokio::test]
    async fn test_watch_link_reports_drop() {
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
        let watcher = tokio::spawn(watch_link(
            Some(probe.clone() as Arc<dyn LinkProbe>),
            Duration::from_millis(10),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!watcher.is_finished());

        probe.0.store(false, Ordering::SeqCst);
        let err = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should resolve")
            .unwrap();
        assert!(matches!(err, SyncError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_watch_link_without_probe_never_resolves() {
        let result =
            tokio::time::timeout(Duration::from_millis(50), watch_link(None, Duration::ZERO)).await;
        assert!(result.is_err());
    }
}
