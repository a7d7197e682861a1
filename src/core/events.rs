//! Sync events
//!
//! Thread-safe event types sent from the orchestrator to whatever presents
//! the sync (the CLI renderer thread, or nothing at all). Events go through
//! an unbounded crossbeam channel so the async side never blocks on the UI.

use crate::core::progress::ProgressSnapshot;
use crate::device::identity::{CardIdentity, ChangeResult};
use crossbeam_channel::{Receiver, Sender};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Status
// =============================================================================

/// What the synchronizer is doing, or how the last cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Idle,
    Checking,
    Copying,
    LoadingThumbnails,
    /// Waiting for the next automatic check
    Waiting,
    Done,
    /// Stopped by the user
    Stopped,
    /// Lost the card (connection-class error)
    Interrupted,
    Failed,
}

impl OperationStatus {
    pub fn display_name(&self) -> &'static str {
        match self {
            OperationStatus::Idle => "idle",
            OperationStatus::Checking => "checking",
            OperationStatus::Copying => "copying",
            OperationStatus::LoadingThumbnails => "loading thumbnails",
            OperationStatus::Waiting => "waiting",
            OperationStatus::Done => "done",
            OperationStatus::Stopped => "stopped",
            OperationStatus::Interrupted => "interrupted",
            OperationStatus::Failed => "failed",
        }
    }

    /// Whether a cycle is in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            OperationStatus::Checking | OperationStatus::Copying | OperationStatus::LoadingThumbnails
        )
    }
}

// =============================================================================
// Events
// =============================================================================

/// Outcome of a check phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    /// Files in the listing after filtering
    pub listed: usize,
    /// Files seen for the first time
    pub new_items: usize,
    /// Files queued for copying
    pub queued: usize,
    /// Bytes queued for copying
    pub queued_bytes: u64,
    /// Tracked files that left the card
    pub gone: usize,
    /// Local copies moved to the trash
    pub recycled: usize,
    /// Skipped because the signature store knew them
    pub once_copied: usize,
    /// Tracking was reset because another card showed up
    pub card_changed: bool,
}

/// Outcome of a copy phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: usize,
    pub bytes: u64,
    /// Served with the wrong size
    pub weird: usize,
    /// Gone from the card before they could be copied
    pub missing: usize,
    /// Deleted from the card after copying
    pub deleted: usize,
    pub duration: Duration,
}

/// Events emitted during a sync cycle
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StatusChanged {
        status: OperationStatus,
        /// Error text for failed or interrupted cycles
        message: Option<String>,
    },

    /// The card was probed at the start of a check
    CardIdentified {
        identity: CardIdentity,
        change: ChangeResult,
    },

    CheckComplete(CheckSummary),

    CopyStarted {
        files: usize,
        bytes: u64,
    },

    FileStarted {
        name: String,
        size: u64,
        /// 1-based
        index: usize,
        total: usize,
    },

    FileProgress {
        name: String,
        snapshot: ProgressSnapshot,
    },

    FileCopied {
        name: String,
        destination: PathBuf,
        size: u64,
    },

    /// A single file failed; the cycle may go on
    FileFailed {
        name: String,
        error: String,
    },

    FileDeleted {
        name: String,
    },

    ThumbnailLoaded {
        file_path: String,
        bytes: usize,
    },

    CopyComplete(CopySummary),
}

// =============================================================================
// Sender
// =============================================================================

/// Optional event channel; sending never fails the caller
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<Sender<SyncEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it
    pub fn channel() -> (Self, Receiver<SyncEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A sink that drops everything
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(sender) = &self.sender {
            // a gone receiver just means nobody is watching
            let _ = sender.send(event);
        }
    }

    pub fn status(&self, status: OperationStatus, message: Option<String>) {
        self.emit(SyncEvent::StatusChanged { status, message });
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format ETA as human-readable string
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) if d.as_secs() == 0 => "< 1s".to_string(),
        Some(d) => format_duration(d),
        None => "calculating...".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.0 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "calculating...");
        assert_eq!(format_eta(Some(Duration::from_millis(300))), "< 1s");
        assert_eq!(format_eta(Some(Duration::from_secs(125))), "2m 5s");
        assert_eq!(format_eta(Some(Duration::from_secs(3725))), "1h 2m 5s");
    }

    #[test]
    fn test_sink_delivers_and_tolerates_no_receiver() {
        let (sink, receiver) = EventSink::channel();
        sink.status(OperationStatus::Checking, None);
        match receiver.try_recv().unwrap() {
            SyncEvent::StatusChanged { status, message } => {
                assert_eq!(status, OperationStatus::Checking);
                assert!(message.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(receiver);
        sink.status(OperationStatus::Done, None);
        EventSink::none().status(OperationStatus::Done, None);
    }

    #[test]
    fn test_busy_statuses() {
        assert!(OperationStatus::Checking.is_busy());
        assert!(OperationStatus::LoadingThumbnails.is_busy());
        assert!(!OperationStatus::Stopped.is_busy());
        assert!(!OperationStatus::Waiting.is_busy());
    }
}
