//! Card identity and capability model
//!
//! A card is identified by its firmware version, CID and SSID. Older firmware
//! lacks some endpoints, so the capabilities are derived from the version
//! before anything else is asked. Change detection is a pure comparison of
//! two identities probed as a batch.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Firmware that first answers the CID request (op=120)
const CID_SINCE: FirmwareVersion = FirmwareVersion::new(1, 0, 3);

/// Firmware that first answers the capacity request (op=140)
const CAPACITY_SINCE: FirmwareVersion = FirmwareVersion::new(2, 0, 0);

/// Firmware that first answers write-timestamp (op=121) and upload (op=118)
const WRITE_TIMESTAMP_SINCE: FirmwareVersion = FirmwareVersion::new(2, 0, 2);

/// Numeric firmware version `major.minor.patch` (e.g. `3.00.01`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the trailing `X.YY.ZZ` of a firmware string
    ///
    /// The card reports strings like `F24A6W3AW1.00.03` or `FlashAir 3.00.01`;
    /// everything before the last run of dotted digits is a model prefix.
    pub fn parse(firmware: &str) -> Option<Self> {
        let firmware = firmware.trim();
        let start = firmware
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
            .last()
            .map(|(i, _)| i)?;

        let mut parts = firmware[start..].split('.').filter(|p| !p.is_empty());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}.{:02}", self.major, self.minor, self.patch)
    }
}

/// Endpoints the card's firmware is known to support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_get_cid: bool,
    pub can_get_capacity: bool,
    pub can_get_write_timestamp: bool,
    pub can_get_upload: bool,
}

impl Capabilities {
    /// Derive capabilities from a firmware string; unparseable means none
    pub fn from_firmware(firmware: &str) -> Self {
        match FirmwareVersion::parse(firmware) {
            Some(version) => Self {
                can_get_cid: version >= CID_SINCE,
                can_get_capacity: version >= CAPACITY_SINCE,
                can_get_write_timestamp: version >= WRITE_TIMESTAMP_SINCE,
                can_get_upload: version >= WRITE_TIMESTAMP_SINCE,
            },
            None => Self::default(),
        }
    }
}

/// Free and total bytes on the card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl Capacity {
    /// Parse the op=140 answer `free_sectors/total_sectors,sector_size`
    pub fn parse(body: &str) -> Option<Self> {
        let (sectors, sector_size) = body.trim().split_once(',')?;
        let (free, total) = sectors.split_once('/')?;
        let sector_size: u64 = sector_size.trim().parse().ok()?;
        Some(Self {
            free_bytes: free.trim().parse::<u64>().ok()?.checked_mul(sector_size)?,
            total_bytes: total.trim().parse::<u64>().ok()?.checked_mul(sector_size)?,
        })
    }
}

/// Everything probed about a card in one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentity {
    pub firmware_version: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub ssid: String,
    #[serde(default)]
    pub capacity: Option<Capacity>,
    #[serde(default)]
    pub write_timestamp: Option<i64>,
    #[serde(default)]
    pub upload_enabled: Option<bool>,
}

impl CardIdentity {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_firmware(&self.firmware_version)
    }

    /// A CID that is actually usable for comparison
    pub fn usable_cid(&self) -> Option<&str> {
        self.cid.as_deref().filter(|cid| !cid.trim().is_empty())
    }
}

/// Outcome of comparing two identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResult {
    Changed,
    Unchanged,
    /// Cannot tell; the caller must fall back to a heuristic
    Unknown,
}

/// Decide whether `current` is a different card than `previous`
///
/// Both identities must come from a complete batch probe (firmware, CID,
/// SSID in that order).
pub fn detect_change(previous: Option<&CardIdentity>, current: &CardIdentity) -> ChangeResult {
    let previous = match previous {
        Some(p) => p,
        None => return ChangeResult::Unknown,
    };

    if previous.firmware_version != current.firmware_version || previous.ssid != current.ssid {
        return ChangeResult::Changed;
    }

    match (previous.usable_cid(), current.usable_cid()) {
        (Some(a), Some(b)) if a == b => ChangeResult::Unchanged,
        (Some(_), Some(_)) => ChangeResult::Changed,
        _ => ChangeResult::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(firmware: &str, cid: Option<&str>, ssid: &str) -> CardIdentity {
        CardIdentity {
            firmware_version: firmware.to_string(),
            cid: cid.map(str::to_string),
            ssid: ssid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_firmware_parse() {
        assert_eq!(
            FirmwareVersion::parse("F24A6W3AW1.00.03"),
            Some(FirmwareVersion::new(1, 0, 3))
        );
        assert_eq!(
            FirmwareVersion::parse("FlashAir 3.00.01"),
            Some(FirmwareVersion::new(3, 0, 1))
        );
        assert_eq!(
            FirmwareVersion::parse("9.00.01"),
            Some(FirmwareVersion::new(9, 0, 1))
        );
        assert_eq!(FirmwareVersion::parse("garbage"), None);
        assert_eq!(FirmwareVersion::parse("1.2"), None);
        assert_eq!(FirmwareVersion::new(2, 0, 2).to_string(), "2.00.02");
    }

    #[test]
    fn test_capabilities_thresholds() {
        let old = Capabilities::from_firmware("F19BAW3AW1.00.00");
        assert!(!old.can_get_cid);
        assert!(!old.can_get_capacity);
        assert!(!old.can_get_write_timestamp);

        let middle = Capabilities::from_firmware("F24A6W3AW1.00.03");
        assert!(middle.can_get_cid);
        assert!(!middle.can_get_capacity);

        let v2 = Capabilities::from_firmware("W2.00.00");
        assert!(v2.can_get_capacity);
        assert!(!v2.can_get_write_timestamp);

        let new = Capabilities::from_firmware("FlashAir 3.00.01");
        assert!(new.can_get_cid);
        assert!(new.can_get_capacity);
        assert!(new.can_get_write_timestamp);
        assert!(new.can_get_upload);

        assert_eq!(Capabilities::from_firmware(""), Capabilities::default());
    }

    #[test]
    fn test_cid_change_is_detected() {
        let first = identity("9.00.01", Some("AAA"), "X");
        let second = identity("9.00.01", Some("BBB"), "X");
        assert_eq!(detect_change(Some(&first), &second), ChangeResult::Changed);
    }

    #[test]
    fn test_same_card_is_unchanged() {
        let first = identity("9.00.01", Some("AAA"), "X");
        let again = identity("9.00.01", Some("AAA"), "X");
        assert_eq!(detect_change(Some(&first), &again), ChangeResult::Unchanged);
    }

    #[test]
    fn test_firmware_or_ssid_change() {
        let first = identity("9.00.01", Some("AAA"), "X");
        assert_eq!(
            detect_change(Some(&first), &identity("9.00.02", Some("AAA"), "X")),
            ChangeResult::Changed
        );
        assert_eq!(
            detect_change(Some(&first), &identity("9.00.01", Some("AAA"), "Y")),
            ChangeResult::Changed
        );
    }

    #[test]
    fn test_unknown_without_cid_or_history() {
        let current = identity("1.00.00", None, "X");
        assert_eq!(detect_change(None, &current), ChangeResult::Unknown);
        let previous = identity("1.00.00", None, "X");
        assert_eq!(
            detect_change(Some(&previous), &current),
            ChangeResult::Unknown
        );
        let blank = identity("1.00.00", Some("  "), "X");
        assert_eq!(detect_change(Some(&previous), &blank), ChangeResult::Unknown);
    }

    #[test]
    fn test_capacity_parse() {
        let capacity = Capacity::parse("1000/2000,512").unwrap();
        assert_eq!(capacity.free_bytes, 512_000);
        assert_eq!(capacity.total_bytes, 1_024_000);
        assert!(Capacity::parse("nonsense").is_none());
        assert!(Capacity::parse("18446744073709551615/18446744073709551615,512").is_none());
    }
}
