//! In-memory wireless SD card
//!
//! [`MockCard`] implements [`CardApi`] over a simulated file system so the
//! orchestrator can be exercised (and demonstrated with `card-sync simulate`)
//! without hardware. Individual files can be told to fail in the ways a real
//! card fails; the card can be swapped for another one mid-session.

use crate::core::error::{Result, SyncError};
use crate::core::exif;
use crate::core::progress::ProgressReporter;
use crate::device::entry::{normalize_directory, FileAttributes, RemoteFileEntry};
use crate::device::identity::{CardIdentity, Capacity};
use crate::device::traits::{CardApi, ProgressSink};
use crate::testdb::generator::generate_for_name;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Chunk size used when reporting download progress
const CHUNK: usize = 64 * 1024;

/// Bytes per sector reported by the capacity endpoint
const SECTOR: u64 = 512;

/// How a file misbehaves when downloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The card answers 404
    NotFound,
    /// The card serves a different number of bytes than it lists
    WrongSize,
    /// The card refuses the request (HTTP 500)
    Refuse,
    /// The wireless link drops halfway through
    DropConnection,
    /// The user stops the cycle halfway through
    CancelMidway,
}

/// Request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCardStats {
    pub list_requests: usize,
    pub downloads: usize,
    pub thumbnail_requests: usize,
    pub deletes: usize,
    pub identity_probes: usize,
    pub update_probes: usize,
}

#[derive(Debug, Clone)]
struct MockFile {
    entry: RemoteFileEntry,
    content: Vec<u8>,
}

/// Simulated card
pub struct MockCard {
    identity: RwLock<CardIdentity>,
    files: RwLock<Vec<MockFile>>,
    failures: RwLock<HashMap<String, FailureMode>>,
    stats: Mutex<MockCardStats>,
    thumbnails: bool,
    transfer_delay: Option<Duration>,
    updated: AtomicBool,
    write_timestamp: AtomicI64,
    upload_enabled: AtomicBool,
}

/// FAT timestamps have two-second resolution
fn fat_round(date: NaiveDateTime) -> NaiveDateTime {
    let second = date.second() - date.second() % 2;
    date.with_second(second)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(date)
}

fn key(path: &str) -> String {
    path.to_ascii_lowercase()
}

fn base_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(10, 0, 0))
        .unwrap_or_default()
}

impl MockCard {
    pub fn builder() -> MockCardBuilder {
        MockCardBuilder::default()
    }

    fn count(&self, update: impl FnOnce(&mut MockCardStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    fn touch(&self) {
        self.updated.store(true, Ordering::SeqCst);
        self.write_timestamp.fetch_add(1, Ordering::SeqCst);
    }

    fn failure(&self, file_path: &str) -> Option<FailureMode> {
        self.failures
            .read()
            .ok()
            .and_then(|f| f.get(&key(file_path)).copied())
    }

    fn find(&self, file_path: &str) -> Option<MockFile> {
        let files = self.files.read().ok()?;
        files
            .iter()
            .find(|f| f.entry.file_path().eq_ignore_ascii_case(file_path))
            .cloned()
    }

    fn check(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(SyncError::Canceled)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Inspection and manipulation
    // =========================================================================

    pub fn stats(&self) -> MockCardStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Every file (not folder) on the card
    pub fn entries(&self) -> Vec<RemoteFileEntry> {
        self.files
            .read()
            .map(|files| files.iter().map(|f| f.entry.clone()).collect())
            .unwrap_or_default()
    }

    pub fn content(&self, file_path: &str) -> Option<Vec<u8>> {
        self.find(file_path).map(|f| f.content)
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.find(file_path).is_some()
    }

    pub fn identity(&self) -> CardIdentity {
        self.identity
            .read()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    /// Put a file on the card, as a camera would
    pub fn add_file(&self, directory: &str, file_name: &str, date: NaiveDateTime, content: Vec<u8>) {
        let entry = RemoteFileEntry::new(
            directory,
            file_name,
            content.len() as u64,
            FileAttributes::from_bits(FileAttributes::ARCHIVE),
            fat_round(date),
        );
        if let Ok(mut files) = self.files.write() {
            files.push(MockFile { entry, content });
        }
        self.touch();
    }

    /// Delete a file behind the synchronizer's back
    pub fn remove_file(&self, file_path: &str) -> bool {
        let removed = match self.files.write() {
            Ok(mut files) => {
                let before = files.len();
                files.retain(|f| !f.entry.file_path().eq_ignore_ascii_case(file_path));
                files.len() != before
            }
            Err(_) => false,
        };
        if removed {
            self.touch();
        }
        removed
    }

    pub fn set_failure(&self, file_path: &str, mode: FailureMode) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(key(file_path), mode);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.write() {
            failures.clear();
        }
    }

    /// Pretend another card was inserted: new CID, new content
    pub fn swap_card(&self, cid: &str, files: Vec<(String, String, NaiveDateTime, Vec<u8>)>) {
        if let Ok(mut identity) = self.identity.write() {
            identity.cid = Some(cid.to_string());
        }
        if let Ok(mut current) = self.files.write() {
            current.clear();
        }
        for (directory, name, date, content) in files {
            self.add_file(&directory, &name, date, content);
        }
        self.touch();
    }

    pub fn set_upload_enabled(&self, enabled: bool) {
        self.upload_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether something changed since the last update probe
    pub fn mark_updated(&self) {
        self.touch();
    }

    // =========================================================================
    // Listing
    // =========================================================================

    fn listing(&self, directory: &str) -> String {
        let prefix = normalize_directory(directory);
        let files = match self.files.read() {
            Ok(files) => files,
            Err(_) => return String::new(),
        };

        let mut lines = vec!["WLANSD_FILELIST".to_string()];
        let mut folders = BTreeSet::new();

        for file in files.iter() {
            let dir = file.entry.directory();
            if dir.eq_ignore_ascii_case(prefix) {
                lines.push(file.entry.listing_line());
                continue;
            }
            // a deeper file reveals the next folder level below `prefix`
            let is_below = dir.len() > prefix.len()
                && dir.is_char_boundary(prefix.len())
                && dir[..prefix.len()].eq_ignore_ascii_case(prefix)
                && dir[prefix.len()..].starts_with('/');
            if is_below {
                if let Some(name) = dir[prefix.len() + 1..].split('/').next() {
                    folders.insert(name.to_string());
                }
            }
        }

        for name in folders {
            let folder = RemoteFileEntry::new(
                prefix,
                &name,
                0,
                FileAttributes::from_bits(FileAttributes::DIRECTORY),
                base_date(),
            );
            lines.push(folder.listing_line());
        }
        lines.join("\r\n")
    }
}

impl CardApi for MockCard {
    async fn list_raw(&self, directory: &str, cancel: &CancellationToken) -> Result<String> {
        Self::check(cancel)?;
        self.count(|s| s.list_requests += 1);
        Ok(self.listing(directory))
    }

    async fn file_count(&self, directory: &str, cancel: &CancellationToken) -> Result<u32> {
        Self::check(cancel)?;
        let prefix = normalize_directory(directory);
        Ok(self
            .entries()
            .iter()
            .filter(|e| e.directory().eq_ignore_ascii_case(prefix))
            .count() as u32)
    }

    async fn thumbnail(&self, file_path: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        Self::check(cancel)?;
        self.count(|s| s.thumbnail_requests += 1);

        let file = self
            .find(file_path)
            .ok_or_else(|| SyncError::RemoteFileNotFound(file_path.to_string()))?;
        if !self.thumbnails || !file.entry.kind().is_jpeg() {
            return Err(SyncError::RemoteFileNotFound(format!(
                "no thumbnail for {}",
                file_path
            )));
        }
        exif::embedded_thumbnail(&file.content)
            .ok_or_else(|| SyncError::Protocol(format!("{} has no Exif thumbnail", file_path)))
    }

    async fn download_file(
        &self,
        file_path: &str,
        expected_size: u64,
        progress: Option<ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        Self::check(cancel)?;
        self.count(|s| s.downloads += 1);

        let failure = self.failure(file_path);
        match failure {
            Some(FailureMode::NotFound) => {
                return Err(SyncError::RemoteFileNotFound(file_path.to_string()))
            }
            Some(FailureMode::Refuse) => {
                return Err(SyncError::ConnectionUnable(format!("HTTP 500 for {}", file_path)))
            }
            _ => {}
        }

        let file = self
            .find(file_path)
            .ok_or_else(|| SyncError::RemoteFileNotFound(file_path.to_string()))?;
        let mut content = file.content;
        if failure == Some(FailureMode::WrongSize) {
            content.push(0);
        }
        if expected_size > 0 && content.len() as u64 != expected_size {
            return Err(SyncError::RemoteFileInvalid(format!(
                "{}: served {} bytes, listed {}",
                file_path,
                content.len(),
                expected_size
            )));
        }

        let Some(sink) = progress else {
            return Ok(content);
        };

        let total = content.len() as u64;
        let half = total / 2;
        let mut reporter = ProgressReporter::start(sink, total);
        let mut received = 0u64;
        for chunk in content.chunks(CHUNK) {
            if let Some(delay) = self.transfer_delay {
                tokio::time::sleep(delay).await;
            }
            if cancel.is_cancelled() {
                reporter.fail(received);
                return Err(SyncError::Canceled);
            }
            // the chunk that crosses the midpoint never arrives
            if received + chunk.len() as u64 > half {
                match failure {
                    Some(FailureMode::DropConnection) => {
                        reporter.fail(received);
                        return Err(SyncError::ConnectionLost);
                    }
                    Some(FailureMode::CancelMidway) => {
                        cancel.cancel();
                        reporter.fail(received);
                        return Err(SyncError::Canceled);
                    }
                    _ => {}
                }
            }
            received += chunk.len() as u64;
            reporter.advance(received);
        }
        Ok(content)
    }

    async fn delete_file(&self, file_path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check(cancel)?;
        self.count(|s| s.deletes += 1);
        if !self.upload_enabled.load(Ordering::SeqCst) || !self.remove_file(file_path) {
            return Err(SyncError::RemoteFileDeletionFailed(file_path.to_string()));
        }
        Ok(())
    }

    async fn firmware_version(&self, cancel: &CancellationToken) -> Result<String> {
        Self::check(cancel)?;
        self.count(|s| s.identity_probes += 1);
        Ok(self.identity().firmware_version)
    }

    async fn cid(&self, cancel: &CancellationToken) -> Result<String> {
        Self::check(cancel)?;
        Ok(self.identity().cid.unwrap_or_default())
    }

    async fn ssid(&self, cancel: &CancellationToken) -> Result<String> {
        Self::check(cancel)?;
        Ok(self.identity().ssid)
    }

    async fn capacity(&self, cancel: &CancellationToken) -> Result<Capacity> {
        Self::check(cancel)?;
        let used: u64 = self.entries().iter().map(|e| e.size()).sum();
        let total = 8 * 1024 * 1024 * 1024u64;
        Ok(Capacity {
            free_bytes: (total - used.min(total)) / SECTOR * SECTOR,
            total_bytes: total,
        })
    }

    async fn write_timestamp(&self, cancel: &CancellationToken) -> Result<i64> {
        Self::check(cancel)?;
        Ok(self.write_timestamp.load(Ordering::SeqCst))
    }

    async fn upload_enabled(&self, cancel: &CancellationToken) -> Result<bool> {
        Self::check(cancel)?;
        Ok(self.upload_enabled.load(Ordering::SeqCst))
    }

    async fn is_updated(&self, cancel: &CancellationToken) -> Result<bool> {
        Self::check(cancel)?;
        self.count(|s| s.update_probes += 1);
        Ok(self.updated.swap(false, Ordering::SeqCst))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`MockCard`]
pub struct MockCardBuilder {
    identity: CardIdentity,
    files: Vec<(String, String, NaiveDateTime, Option<Vec<u8>>, u8)>,
    failures: HashMap<String, FailureMode>,
    thumbnails: bool,
    transfer_delay: Option<Duration>,
    upload_enabled: bool,
}

impl Default for MockCardBuilder {
    fn default() -> Self {
        Self {
            identity: CardIdentity {
                firmware_version: "FA9CAW3AW3.00.01".to_string(),
                cid: Some("02544d53573038470b1a2b3c4d5e6f70".to_string()),
                ssid: "flashair_mock".to_string(),
                ..CardIdentity::default()
            },
            files: Vec::new(),
            failures: HashMap::new(),
            thumbnails: true,
            transfer_delay: None,
            upload_enabled: true,
        }
    }
}

impl MockCardBuilder {
    pub fn firmware(mut self, firmware: &str) -> Self {
        self.identity.firmware_version = firmware.to_string();
        self
    }

    pub fn cid(mut self, cid: Option<&str>) -> Self {
        self.identity.cid = cid.map(str::to_string);
        self
    }

    pub fn ssid(mut self, ssid: &str) -> Self {
        self.identity.ssid = ssid.to_string();
        self
    }

    pub fn upload_enabled(mut self, enabled: bool) -> Self {
        self.upload_enabled = enabled;
        self
    }

    pub fn without_thumbnails(mut self) -> Self {
        self.thumbnails = false;
        self
    }

    /// Sleep before each 64 KiB chunk of a download
    pub fn transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = Some(delay);
        self
    }

    /// A file with generated content
    pub fn file(mut self, directory: &str, name: &str, date: NaiveDateTime) -> Self {
        self.files
            .push((directory.to_string(), name.to_string(), date, None, FileAttributes::ARCHIVE));
        self
    }

    pub fn file_with_content(
        mut self,
        directory: &str,
        name: &str,
        date: NaiveDateTime,
        content: Vec<u8>,
    ) -> Self {
        self.files.push((
            directory.to_string(),
            name.to_string(),
            date,
            Some(content),
            FileAttributes::ARCHIVE,
        ));
        self
    }

    /// A file with the given attribute bits (hidden, system, read-only ...)
    pub fn file_with_attributes(
        mut self,
        directory: &str,
        name: &str,
        date: NaiveDateTime,
        attributes: u8,
    ) -> Self {
        self.files
            .push((directory.to_string(), name.to_string(), date, None, attributes));
        self
    }

    /// `count` JPEGs named IMG_0001.JPG onwards, one minute apart
    pub fn jpegs(mut self, directory: &str, count: usize) -> Self {
        let start = self.files.len();
        for i in 0..count {
            let date = base_date() + ChronoDuration::minutes((start + i) as i64);
            self = self.file(directory, &format!("IMG_{:04}.JPG", start + i + 1), date);
        }
        self
    }

    pub fn fail(mut self, file_path: &str, mode: FailureMode) -> Self {
        self.failures.insert(key(file_path), mode);
        self
    }

    pub fn build(self) -> MockCard {
        let files = self
            .files
            .into_iter()
            .enumerate()
            .map(|(seed, (directory, name, date, content, attributes))| {
                let content =
                    content.unwrap_or_else(|| generate_for_name(&name, date, seed as u64));
                MockFile {
                    entry: RemoteFileEntry::new(
                        &directory,
                        &name,
                        content.len() as u64,
                        FileAttributes::from_bits(attributes),
                        fat_round(date),
                    ),
                    content,
                }
            })
            .collect();

        MockCard {
            identity: RwLock::new(self.identity),
            files: RwLock::new(files),
            failures: RwLock::new(self.failures),
            stats: Mutex::new(MockCardStats::default()),
            thumbnails: self.thumbnails,
            transfer_delay: self.transfer_delay,
            updated: AtomicBool::new(false),
            write_timestamp: AtomicI64::new(1_000),
            upload_enabled: AtomicBool::new(self.upload_enabled),
        }
    }
}
