//! Tracked remote files and their copy state
//!
//! The orchestrator keeps one [`TrackedItem`] per file seen on the card. Items
//! survive across checks until the file is confirmed gone from the card and
//! there is nothing left to do locally. Each item carries a [`CopyStatus`]
//! that only moves along these edges:
//!
//! ```text
//! NotCopied ──▶ ToBeCopied ──▶ Copying ──▶ Copied ──▶ Recycled
//!     ▲             │  ▲          │
//!     └─────────────┘  └──────────┤
//!                                 └──▶ Weird
//! ```
//!
//! The status an item is created with is free: `Copied` when the file is
//! already present locally, `NotCopied` otherwise.

use crate::core::config::OutputConfig;
use crate::core::progress::SessionTotals;
use crate::device::entry::RemoteFileEntry;
use log::{trace, warn};
use serde::Serialize;
use std::fmt::{self, Display, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Highest `_N` suffix tried when looking for a free local name
const MAX_NAME_SUFFIX: u32 = 99;

// =============================================================================
// Copy status
// =============================================================================

/// Where a tracked file stands in the copy pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CopyStatus {
    NotCopied,
    ToBeCopied,
    Copying,
    Copied,
    /// The card served something other than what it listed
    Weird,
    /// The local copy was moved to the trash after the original left the card
    Recycled,
}

impl CopyStatus {
    /// Whether `self -> next` is an edge of the state machine
    pub fn can_become(self, next: CopyStatus) -> bool {
        use CopyStatus::*;
        matches!(
            (self, next),
            (NotCopied, ToBeCopied)
                | (ToBeCopied, NotCopied)
                | (ToBeCopied, Copying)
                | (Copying, Copied)
                | (Copying, Weird)
                | (Copying, ToBeCopied)
                | (Copied, Recycled)
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            CopyStatus::NotCopied => "not copied",
            CopyStatus::ToBeCopied => "queued",
            CopyStatus::Copying => "copying",
            CopyStatus::Copied => "copied",
            CopyStatus::Weird => "weird",
            CopyStatus::Recycled => "recycled",
        }
    }
}

impl Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A status change outside the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid copy status change {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CopyStatus,
    pub to: CopyStatus,
}

// =============================================================================
// Local files
// =============================================================================

/// What is at a file's local path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// Nothing there; the file can be written
    Missing,
    /// A file of the same size, taken to be the copy
    Present,
    /// A different file occupies the name
    Conflict,
}

/// Resolved local destination for a remote file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub path: PathBuf,
    /// 0 for the plain name, N for `name_N.ext`
    pub suffix: u32,
    pub state: LocalState,
}

/// Folder a remote file is copied into
pub fn local_folder(output: &OutputConfig, entry: &RemoteFileEntry) -> PathBuf {
    if !output.create_dated_folder || !entry.has_valid_date() {
        return output.destination.clone();
    }

    let mut folder = String::new();
    if write!(folder, "{}", entry.date().format(&output.dated_folder_format)).is_err() {
        warn!(
            "Invalid dated folder format '{}', using the destination folder",
            output.dated_folder_format
        );
        return output.destination.clone();
    }
    output.destination.join(folder)
}

/// `IMG_0001.JPG` with suffix 2 is `IMG_0001_2.JPG`
pub fn suffixed_name(file_name: &str, suffix: u32) -> String {
    if suffix == 0 {
        return file_name.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, suffix, ext),
        _ => format!("{}_{}", file_name, suffix),
    }
}

fn probe(path: &Path, size: u64) -> LocalState {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == size => LocalState::Present,
        Ok(_) => LocalState::Conflict,
        Err(_) => LocalState::Missing,
    }
}

/// Work out where `entry` lives (or would live) locally
///
/// Without do-not-overwrite this is simply `folder/name`. With it, suffixes
/// 0..=99 are probed until one holds a same-size file or is free; if all are
/// taken by other files the last one is returned as a conflict.
pub fn resolve_local_path(output: &OutputConfig, entry: &RemoteFileEntry) -> LocalTarget {
    let folder = local_folder(output, entry);

    if !output.do_not_overwrite {
        let path = folder.join(entry.file_name());
        let state = probe(&path, entry.size());
        return LocalTarget {
            path,
            suffix: 0,
            state,
        };
    }

    let mut last = None;
    for suffix in 0..=MAX_NAME_SUFFIX {
        let path = folder.join(suffixed_name(entry.file_name(), suffix));
        match probe(&path, entry.size()) {
            LocalState::Conflict => last = Some(path),
            state => {
                return LocalTarget {
                    path,
                    suffix,
                    state,
                }
            }
        }
    }

    LocalTarget {
        path: last.unwrap_or_else(|| folder.join(entry.file_name())),
        suffix: MAX_NAME_SUFFIX,
        state: LocalState::Conflict,
    }
}

// =============================================================================
// Tracked item
// =============================================================================

/// One remote file and everything known about it
#[derive(Debug, Clone)]
pub struct TrackedItem {
    entry: RemoteFileEntry,
    status: CopyStatus,

    /// Seen in the latest listing
    pub is_alive_remote: bool,
    /// Something exists at the local path
    pub is_alive_local: bool,
    /// The local file is the copy and can be read
    pub is_available_local: bool,
    /// Signature store says it was copied before (`None` = not asked)
    pub is_once_copied: Option<bool>,
    pub local_path: PathBuf,
    pub local_suffix: u32,

    pub thumbnail: Option<Vec<u8>>,
    pub can_load_thumbnail_local: bool,
    pub can_load_thumbnail_remote: bool,

    /// Copied during the current session
    pub copied_this_session: bool,
    /// The card original was deleted by us after copying
    pub deleted_by_copy: bool,
}

impl TrackedItem {
    /// Create an item for a freshly listed entry
    pub fn new(entry: RemoteFileEntry, output: &OutputConfig) -> Self {
        let target = resolve_local_path(output, &entry);
        let available = target.state == LocalState::Present;
        let remote_thumbnail = entry.kind().is_jpeg();

        Self {
            status: if available {
                CopyStatus::Copied
            } else {
                CopyStatus::NotCopied
            },
            is_alive_remote: true,
            is_alive_local: target.state != LocalState::Missing,
            is_available_local: available,
            is_once_copied: None,
            local_path: target.path,
            local_suffix: target.suffix,
            thumbnail: None,
            can_load_thumbnail_local: entry.kind().is_image(),
            can_load_thumbnail_remote: remote_thumbnail,
            copied_this_session: false,
            deleted_by_copy: false,
            entry,
        }
    }

    pub fn entry(&self) -> &RemoteFileEntry {
        &self.entry
    }

    pub fn status(&self) -> CopyStatus {
        self.status
    }

    pub fn size(&self) -> u64 {
        self.entry.size()
    }

    /// Move to `next`, refusing edges outside the state machine
    pub fn transition(&mut self, next: CopyStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_become(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        trace!(
            "{}: {} -> {}",
            self.entry.file_path(),
            self.status,
            next
        );
        self.status = next;
        Ok(())
    }

    /// Re-derive the local path and what is there
    pub fn refresh_local(&mut self, output: &OutputConfig) {
        let target = resolve_local_path(output, &self.entry);
        self.is_alive_local = target.state != LocalState::Missing;
        self.is_available_local = target.state == LocalState::Present;
        self.local_path = target.path;
        self.local_suffix = target.suffix;
    }

    /// Whether the thumbnail backfill still has work for this item
    pub fn wants_thumbnail(&self) -> bool {
        self.thumbnail.is_none()
            && ((self.is_available_local && self.can_load_thumbnail_local)
                || (self.is_alive_remote && self.can_load_thumbnail_remote))
    }
}

// =============================================================================
// Tracked list
// =============================================================================

/// Tracked items kept in remote-entry order
#[derive(Debug, Default)]
pub struct TrackedList {
    items: Vec<TrackedItem>,
}

impl TrackedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &[TrackedItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&TrackedItem> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TrackedItem> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedItem> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedItem> {
        self.items.iter_mut()
    }

    /// Index of the item for the same file (directory, name, size)
    pub fn position_matching(&self, entry: &RemoteFileEntry) -> Option<usize> {
        self.items.iter().position(|item| item.entry.matches(entry))
    }

    /// Insert keeping the list sorted by entry; returns the index used
    pub fn insert_sorted(&mut self, item: TrackedItem) -> usize {
        let index = self
            .items
            .partition_point(|existing| existing.entry <= item.entry);
        self.items.insert(index, item);
        index
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&TrackedItem) -> bool,
    {
        self.items.retain(keep);
    }

    /// How many `entries` are already tracked
    pub fn overlap(&self, entries: &[RemoteFileEntry]) -> usize {
        entries
            .iter()
            .filter(|entry| self.position_matching(entry).is_some())
            .count()
    }

    /// Indices of items waiting to be copied, in list order
    pub fn queued(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == CopyStatus::ToBeCopied)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn count_status(&self, status: CopyStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    /// Byte totals for progress accounting
    pub fn totals(&self) -> SessionTotals {
        let mut totals = SessionTotals::default();
        for item in &self.items {
            let size = item.size();
            match item.status {
                CopyStatus::Copied => {
                    totals.overall += size;
                    totals.copied_all += size;
                }
                CopyStatus::ToBeCopied | CopyStatus::Copying => {
                    totals.overall += size;
                    totals.remaining_session += size;
                }
                _ => {}
            }
            if item.copied_this_session {
                totals.copied_session += size;
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::entry::FileAttributes;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn entry(name: &str, size: u64, day: u32) -> RemoteFileEntry {
        let date = NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        RemoteFileEntry::new(
            "/DCIM/101CANON",
            name,
            size,
            FileAttributes::from_bits(FileAttributes::ARCHIVE),
            date,
        )
    }

    fn output(dir: &Path) -> OutputConfig {
        OutputConfig {
            destination: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_transitions() {
        use CopyStatus::*;
        assert!(NotCopied.can_become(ToBeCopied));
        assert!(ToBeCopied.can_become(NotCopied));
        assert!(Copying.can_become(ToBeCopied));
        assert!(Copied.can_become(Recycled));

        assert!(!NotCopied.can_become(Copied));
        assert!(!NotCopied.can_become(Copying));
        assert!(!Copied.can_become(ToBeCopied));
        assert!(!Weird.can_become(ToBeCopied));
        assert!(!Recycled.can_become(Copied));
    }

    #[test]
    fn test_item_rejects_shortcut_to_copied() {
        let dir = TempDir::new().unwrap();
        let mut item = TrackedItem::new(entry("A.JPG", 10, 1), &output(dir.path()));
        assert_eq!(item.status(), CopyStatus::NotCopied);

        let err = item.transition(CopyStatus::Copied).unwrap_err();
        assert_eq!(err.from, CopyStatus::NotCopied);
        assert_eq!(item.status(), CopyStatus::NotCopied);

        item.transition(CopyStatus::ToBeCopied).unwrap();
        item.transition(CopyStatus::Copying).unwrap();
        // a failed copy goes back to the queue
        item.transition(CopyStatus::ToBeCopied).unwrap();
        assert_eq!(item.status(), CopyStatus::ToBeCopied);
    }

    #[test]
    fn test_existing_local_file_starts_copied() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("A.JPG"), vec![0u8; 10]).unwrap();

        let item = TrackedItem::new(entry("A.JPG", 10, 1), &output(dir.path()));
        assert_eq!(item.status(), CopyStatus::Copied);
        assert!(item.is_alive_local);
        assert!(item.is_available_local);
    }

    #[test]
    fn test_suffixed_name() {
        assert_eq!(suffixed_name("IMG_0001.JPG", 0), "IMG_0001.JPG");
        assert_eq!(suffixed_name("IMG_0001.JPG", 3), "IMG_0001_3.JPG");
        assert_eq!(suffixed_name("archive.tar.gz", 1), "archive.tar_1.gz");
        assert_eq!(suffixed_name("README", 2), "README_2");
        assert_eq!(suffixed_name(".hidden", 1), ".hidden_1");
    }

    #[test]
    fn test_resolve_skips_different_files() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path());
        fs::write(dir.path().join("A.JPG"), vec![0u8; 5]).unwrap();
        fs::write(dir.path().join("A_1.JPG"), vec![0u8; 6]).unwrap();

        let target = resolve_local_path(&out, &entry("A.JPG", 10, 1));
        assert_eq!(target.path, dir.path().join("A_2.JPG"));
        assert_eq!(target.suffix, 2);
        assert_eq!(target.state, LocalState::Missing);

        fs::write(dir.path().join("A_1.JPG"), vec![0u8; 10]).unwrap();
        let target = resolve_local_path(&out, &entry("A.JPG", 10, 1));
        assert_eq!(target.suffix, 1);
        assert_eq!(target.state, LocalState::Present);
    }

    #[test]
    fn test_resolve_without_do_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let out = OutputConfig {
            do_not_overwrite: false,
            ..output(dir.path())
        };
        fs::write(dir.path().join("A.JPG"), vec![0u8; 5]).unwrap();

        let target = resolve_local_path(&out, &entry("A.JPG", 10, 1));
        assert_eq!(target.path, dir.path().join("A.JPG"));
        assert_eq!(target.state, LocalState::Conflict);
    }

    #[test]
    fn test_dated_folder() {
        let dir = TempDir::new().unwrap();
        let out = OutputConfig {
            create_dated_folder: true,
            ..output(dir.path())
        };
        let target = resolve_local_path(&out, &entry("A.JPG", 10, 7));
        assert_eq!(target.path, dir.path().join("20240507").join("A.JPG"));

        let undated = RemoteFileEntry::new(
            "/DCIM",
            "B.JPG",
            1,
            FileAttributes::default(),
            Default::default(),
        );
        assert_eq!(local_folder(&out, &undated), dir.path().to_path_buf());
    }

    #[test]
    fn test_list_sorted_insert_and_matching() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path());
        let mut list = TrackedList::new();

        list.insert_sorted(TrackedItem::new(entry("C.JPG", 3, 3), &out));
        list.insert_sorted(TrackedItem::new(entry("A.JPG", 1, 1), &out));
        let index = list.insert_sorted(TrackedItem::new(entry("B.JPG", 2, 2), &out));
        assert_eq!(index, 1);

        let names: Vec<_> = list.iter().map(|i| i.entry().file_name()).collect();
        assert_eq!(names, ["A.JPG", "B.JPG", "C.JPG"]);

        let relisted = RemoteFileEntry::new(
            "/dcim/101canon",
            "b.jpg",
            2,
            FileAttributes::default(),
            Default::default(),
        );
        assert_eq!(list.position_matching(&relisted), Some(1));
        assert_eq!(list.overlap(&[relisted, entry("Z.JPG", 9, 9)]), 1);
    }

    #[test]
    fn test_totals() {
        let dir = TempDir::new().unwrap();
        let out = output(dir.path());
        let mut list = TrackedList::new();
        for (i, size) in [100u64, 200, 300, 400].into_iter().enumerate() {
            list.insert_sorted(TrackedItem::new(
                entry(&format!("{}.JPG", i), size, i as u32 + 1),
                &out,
            ));
        }

        // 100 copied this session, 200 + 300 queued, 400 left alone
        for i in 0..3 {
            list.get_mut(i).unwrap().transition(CopyStatus::ToBeCopied).unwrap();
        }
        let first = list.get_mut(0).unwrap();
        first.transition(CopyStatus::Copying).unwrap();
        first.transition(CopyStatus::Copied).unwrap();
        first.copied_this_session = true;

        let totals = list.totals();
        assert_eq!(totals.overall, 600);
        assert_eq!(totals.copied_all, 100);
        assert_eq!(totals.copied_session, 100);
        assert_eq!(totals.remaining_session, 500);
        assert_eq!(list.queued(), vec![1, 2]);
        assert_eq!(list.count_status(CopyStatus::NotCopied), 1);
    }
}
