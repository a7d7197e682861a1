//! Persisted index of copied-file signatures
//!
//! Remembers every file ever copied from a card so it is not copied again
//! after the local copy has been deleted or moved. Each record is a fixed
//! 16-byte [`Signature`]; the file is a flat sequence of them, newest last.
//!
//! # Bounding
//!
//! Only the newest `max_count` records are loaded. New records are appended
//! on flush; once the file would grow past `max_count * 1.2` records it is
//! rewritten from memory with the newest `max_count` (temp file, then
//! rename). The in-memory set never shrinks during a session.
//!
//! ```rust,no_run
//! use wifi_card_sync::device::Signature;
//! use wifi_card_sync::duplicate::signatures::SignatureStore;
//! use std::path::Path;
//!
//! let mut store = SignatureStore::open(Path::new("copied.sig"), 10_000).unwrap();
//! let signature = Signature::from_bytes([0u8; Signature::LEN]);
//! if !store.contains(&signature) {
//!     // ... copy the file ...
//!     store.append(signature);
//! }
//! store.flush().unwrap();
//! ```

use crate::core::error::{Result, SyncError};
use crate::device::entry::Signature;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default number of signatures kept
pub const DEFAULT_MAX_COUNT: usize = 10_000;

/// File name of the store inside a profile directory
pub const STORE_FILE_NAME: &str = "copied.sig";

const RECORD: u64 = Signature::LEN as u64;

pub struct SignatureStore {
    path: PathBuf,
    max_count: usize,
    known: HashSet<Signature>,
    /// Every known signature, oldest first
    order: Vec<Signature>,
    /// Appended since the last flush
    pending: Vec<Signature>,
    /// Whole records currently in the file
    persisted_count: u64,
    /// The file ends in a partial record and must be rewritten
    misaligned: bool,
}

impl SignatureStore {
    /// Open (or start) the store at `path`, loading the newest `max_count` records
    pub fn open(path: &Path, max_count: usize) -> Result<Self> {
        let max_count = max_count.max(1);
        let mut store = Self {
            path: path.to_path_buf(),
            max_count,
            known: HashSet::new(),
            order: Vec::new(),
            pending: Vec::new(),
            persisted_count: 0,
            misaligned: false,
        };

        if !path.exists() {
            debug!("No signature file at {}, starting empty", path.display());
            return Ok(store);
        }

        let mut file = File::open(path).map_err(|e| {
            SyncError::Io(format!(
                "Failed to open signature file {}: {}",
                path.display(),
                e
            ))
        })?;
        let length = file.metadata()?.len();
        let records = length / RECORD;
        store.persisted_count = records;
        store.misaligned = length % RECORD != 0;
        if store.misaligned {
            warn!(
                "Signature file {} ends in a partial record, it will be rewritten",
                path.display()
            );
        }

        let take = records.min(max_count as u64);
        file.seek(SeekFrom::Start((records - take) * RECORD))?;
        let mut buffer = vec![0u8; (take * RECORD) as usize];
        file.read_exact(&mut buffer)?;

        for chunk in buffer.chunks_exact(Signature::LEN) {
            let mut bytes = [0u8; Signature::LEN];
            bytes.copy_from_slice(chunk);
            let signature = Signature::from_bytes(bytes);
            if store.known.insert(signature) {
                store.order.push(signature);
            }
        }

        info!(
            "Loaded {} copy signatures from {} ({} on disk)",
            store.order.len(),
            path.display(),
            records
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.known.contains(signature)
    }

    /// Remember a signature; returns false if it was already known
    pub fn append(&mut self, signature: Signature) -> bool {
        if !self.known.insert(signature) {
            return false;
        }
        self.order.push(signature);
        self.pending.push(signature);
        true
    }

    /// Write pending signatures to disk
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() && !self.misaligned {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let limit = (self.max_count as u64) * 6 / 5;
        let after_append = self.persisted_count + self.pending.len() as u64;
        if self.misaligned || after_append > limit {
            self.compact()?;
        } else {
            self.append_pending()?;
        }
        self.pending.clear();
        Ok(())
    }

    fn append_pending(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                SyncError::Io(format!(
                    "Failed to open signature file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        let mut buffer = Vec::with_capacity(self.pending.len() * Signature::LEN);
        for signature in &self.pending {
            buffer.extend_from_slice(signature.as_bytes());
        }
        file.write_all(&buffer)?;
        file.sync_data()?;

        self.persisted_count += self.pending.len() as u64;
        debug!(
            "Appended {} signatures to {}",
            self.pending.len(),
            self.path.display()
        );
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let keep = self.order.len().min(self.max_count);
        let newest = &self.order[self.order.len() - keep..];

        let mut buffer = Vec::with_capacity(keep * Signature::LEN);
        for signature in newest {
            buffer.extend_from_slice(signature.as_bytes());
        }

        let temp_path = self.path.with_extension("sig.tmp");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(&buffer)?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| {
            SyncError::Io(format!(
                "Failed to replace signature file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        info!(
            "Compacted signature file {} to {} records",
            self.path.display(),
            keep
        );
        self.persisted_count = keep as u64;
        self.misaligned = false;
        Ok(())
    }
}

impl Drop for SignatureStore {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "{} copy signatures were never flushed to {}",
                self.pending.len(),
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn signature(n: u32) -> Signature {
        let mut bytes = [0u8; Signature::LEN];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        bytes[15] = 0xA5;
        Signature::from_bytes(bytes)
    }

    fn file_records(path: &Path) -> u64 {
        fs::metadata(path).unwrap().len() / RECORD
    }

    #[test]
    fn test_contains_and_append() {
        let dir = TempDir::new().unwrap();
        let mut store = SignatureStore::open(&dir.path().join(STORE_FILE_NAME), 10).unwrap();

        assert!(store.is_empty());
        assert!(!store.contains(&signature(1)));
        assert!(store.append(signature(1)));
        assert!(store.contains(&signature(1)));
        assert!(!store.append(signature(1)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_count(), 1);
        store.flush().unwrap();
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiles").join("default").join(STORE_FILE_NAME);

        {
            let mut store = SignatureStore::open(&path, 100).unwrap();
            for n in 0..5 {
                store.append(signature(n));
            }
            store.flush().unwrap();
            store.append(signature(5));
            store.flush().unwrap();
        }
        assert_eq!(file_records(&path), 6);

        let store = SignatureStore::open(&path, 100).unwrap();
        assert_eq!(store.len(), 6);
        for n in 0..6 {
            assert!(store.contains(&signature(n)));
        }
    }

    #[test]
    fn test_reload_keeps_newest_max_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILE_NAME);

        {
            let mut store = SignatureStore::open(&path, 10).unwrap();
            for n in 0..11 {
                store.append(signature(n));
            }
            store.flush().unwrap();
        }
        // 11 records is under the 12-record compaction threshold
        assert_eq!(file_records(&path), 11);

        let store = SignatureStore::open(&path, 10).unwrap();
        assert_eq!(store.len(), 10);
        assert!(!store.contains(&signature(0)));
        for n in 1..11 {
            assert!(store.contains(&signature(n)));
        }
    }

    #[test]
    fn test_compaction_bounds_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILE_NAME);

        let mut store = SignatureStore::open(&path, 10).unwrap();
        for n in 0..30 {
            store.append(signature(n));
        }
        store.flush().unwrap();
        assert_eq!(file_records(&path), 10);
        // the session still remembers everything
        assert!(store.contains(&signature(0)));
        assert!(!path.with_extension("sig.tmp").exists());
        drop(store);

        let store = SignatureStore::open(&path, 10).unwrap();
        assert!(!store.contains(&signature(19)));
        for n in 20..30 {
            assert!(store.contains(&signature(n)));
        }
    }

    #[test]
    fn test_growth_across_sessions_triggers_compaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILE_NAME);

        for session in 0..5u32 {
            let mut store = SignatureStore::open(&path, 10).unwrap();
            for n in 0..4 {
                store.append(signature(session * 4 + n));
            }
            store.flush().unwrap();
            assert!(file_records(&path) <= 12);
        }

        let store = SignatureStore::open(&path, 10).unwrap();
        for n in 10..20 {
            assert!(store.contains(&signature(n)));
        }
    }

    #[test]
    fn test_partial_trailing_record_is_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILE_NAME);

        let mut bytes = signature(7).as_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        fs::write(&path, bytes).unwrap();

        let mut store = SignatureStore::open(&path, 10).unwrap();
        assert!(store.contains(&signature(7)));
        store.append(signature(8));
        store.flush().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * RECORD);
        let store = SignatureStore::open(&path, 10).unwrap();
        assert!(store.contains(&signature(8)));
    }
}
