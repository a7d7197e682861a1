//! Per-profile card state
//!
//! Each profile directory holds, next to its signature store, a small JSON
//! file that remembers:
//! - The identity of the card last synced (so a swapped card is noticed
//!   across runs, not just within one)
//! - Cumulative copy statistics
//! - A bounded history of sync sessions
//!
//! ```rust,no_run
//! use wifi_card_sync::core::profile::CardProfile;
//! use std::path::Path;
//!
//! let mut profile = CardProfile::open(Path::new("profiles/default")).unwrap();
//! profile.start_session();
//! profile.record_copied(4096);
//! profile.end_session(true, false);
//! profile.save().unwrap();
//! ```

use crate::core::error::{Result, SyncError};
use crate::device::identity::CardIdentity;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// File name of the profile state inside a profile directory
pub const PROFILE_FILE_NAME: &str = "profile.json";

/// Sessions kept in the history
pub const MAX_SESSIONS: usize = 50;

const STATE_VERSION: u32 = 1;

/// What is stored in the profile file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileState {
    /// Version of the file format
    pub version: u32,

    /// Identity of the card seen by the last check
    #[serde(default)]
    pub last_card: Option<CardIdentity>,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    #[serde(default)]
    pub stats: CopyStats,

    /// Newest last
    #[serde(default)]
    pub sessions: Vec<SyncSession>,
}

/// Cumulative statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub total_files_copied: u64,
    pub total_bytes_copied: u64,
    pub total_files_deleted: u64,
    pub total_sessions: u64,
    /// Cards seen replacing one another
    pub card_changes: u64,
}

/// Record of one check/copy cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSession {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub files_deleted: u64,
    /// Files served with a size other than listed
    pub files_weird: u64,
    pub errors: u64,
    pub completed: bool,
    pub interrupted: bool,
}

impl SyncSession {
    fn starting(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            ended_at: now,
            files_copied: 0,
            bytes_copied: 0,
            files_deleted: 0,
            files_weird: 0,
            errors: 0,
            completed: false,
            interrupted: false,
        }
    }
}

impl ProfileState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            last_card: None,
            first_seen: now,
            last_seen: now,
            stats: CopyStats::default(),
            sessions: Vec::new(),
        }
    }
}

/// Loaded profile file plus the session in progress
pub struct CardProfile {
    path: PathBuf,
    state: ProfileState,
    current_session: Option<SyncSession>,
    dirty: bool,
}

impl CardProfile {
    /// Load `<profile_dir>/profile.json`, or start a fresh profile
    ///
    /// An unreadable file is not fatal: it is logged and replaced on save.
    pub fn open(profile_dir: &Path) -> Result<Self> {
        let path = profile_dir.join(PROFILE_FILE_NAME);

        let (state, dirty) = if path.exists() {
            match Self::load_state(&path) {
                Ok(state) => {
                    debug!(
                        "Loaded profile {} ({} files copied so far)",
                        path.display(),
                        state.stats.total_files_copied
                    );
                    (state, false)
                }
                Err(e) => {
                    warn!("{}. Starting a new profile.", e);
                    (ProfileState::new(), true)
                }
            }
        } else {
            debug!("Creating new profile at {}", path.display());
            (ProfileState::new(), true)
        };

        Ok(Self {
            path,
            state,
            current_session: None,
            dirty,
        })
    }

    fn load_state(path: &Path) -> Result<ProfileState> {
        let file = File::open(path).map_err(|e| {
            SyncError::Io(format!("Failed to open profile {}: {}", path.display(), e))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            SyncError::Io(format!("Failed to parse profile {}: {}", path.display(), e))
        })
    }

    /// Write the profile if anything changed
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            trace!("Profile not modified, skipping save");
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SyncError::Io(format!("Failed to create profile directory: {}", e))
            })?;
        }

        let file = File::create(&self.path).map_err(|e| {
            SyncError::Io(format!("Failed to create profile {}: {}", self.path.display(), e))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.state).map_err(|e| {
            SyncError::Io(format!("Failed to write profile {}: {}", self.path.display(), e))
        })?;

        debug!("Saved profile to {}", self.path.display());
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &ProfileState {
        &self.state
    }

    pub fn stats(&self) -> &CopyStats {
        &self.state.stats
    }

    pub fn last_identity(&self) -> Option<&CardIdentity> {
        self.state.last_card.as_ref()
    }

    /// Remember the card just probed
    pub fn remember_identity(&mut self, identity: &CardIdentity, changed: bool) {
        if changed {
            self.state.stats.card_changes += 1;
        }
        self.state.last_card = Some(identity.clone());
        self.state.last_seen = Utc::now();
        self.dirty = true;
    }

    pub fn start_session(&mut self) {
        self.current_session = Some(SyncSession::starting(Utc::now()));
        self.dirty = true;
    }

    pub fn record_copied(&mut self, bytes: u64) {
        if let Some(session) = self.current_session.as_mut() {
            session.files_copied += 1;
            session.bytes_copied += bytes;
        }
        self.state.stats.total_files_copied += 1;
        self.state.stats.total_bytes_copied += bytes;
        self.dirty = true;
    }

    pub fn record_deleted(&mut self) {
        if let Some(session) = self.current_session.as_mut() {
            session.files_deleted += 1;
        }
        self.state.stats.total_files_deleted += 1;
        self.dirty = true;
    }

    pub fn record_weird(&mut self) {
        if let Some(session) = self.current_session.as_mut() {
            session.files_weird += 1;
        }
        self.dirty = true;
    }

    pub fn record_error(&mut self) {
        if let Some(session) = self.current_session.as_mut() {
            session.errors += 1;
        }
        self.dirty = true;
    }

    /// Close the session in progress and add it to the history
    pub fn end_session(&mut self, completed: bool, interrupted: bool) {
        let Some(mut session) = self.current_session.take() else {
            return;
        };
        session.ended_at = Utc::now();
        session.completed = completed;
        session.interrupted = interrupted;
        debug!(
            "Session ended: {} files copied, {} deleted, {} errors",
            session.files_copied, session.files_deleted, session.errors
        );

        self.state.sessions.push(session);
        if self.state.sessions.len() > MAX_SESSIONS {
            let excess = self.state.sessions.len() - MAX_SESSIONS;
            self.state.sessions.drain(..excess);
        }
        self.state.stats.total_sessions += 1;
        self.dirty = true;
    }
}

impl Drop for CardProfile {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.save() {
                warn!("Failed to save profile on drop: {}", e);
            }
        }
    }
}
