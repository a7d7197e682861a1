//! Check / copy orchestration
//!
//! The [`Orchestrator`] owns the card, the tracked file list and everything
//! persisted between runs, and drives the three phases of a sync cycle:
//!
//! 1. **Check**: probe the card identity, list the configured remote folder
//!    recursively, reconcile the listing with the tracked list and queue
//!    whatever still needs copying.
//! 2. **Copy**: download queued files one at a time, write them under the
//!    destination, stamp their modification time and remember their
//!    signatures. Optionally delete the originals from the card.
//! 3. **Thumbnails**: backfill missing thumbnails (see [`thumbnails`]).
//!
//! Only one cycle runs at a time; a second request while one is in flight is
//! rejected with [`SyncError::Busy`]. Every cycle gets its own cancellation
//! token, and [`StopHandle::stop`] cancels the running cycle as well as the
//! watch loop.
//!
//! [`thumbnails`]: crate::core::thumbnails

use crate::core::auto_check::{AutoCheckPolicy, AutoCheckState, CheckPlan};
use crate::core::config::Config;
use crate::core::error::{Result, SyncError};
use crate::core::events::{CheckSummary, CopySummary, EventSink, OperationStatus, SyncEvent};
use crate::core::profile::CardProfile;
use crate::core::progress::{ProgressAccounting, ProgressSample};
use crate::core::services::{Services, Sound};
use crate::core::thumbnails::{self, BackfillSummary};
use crate::core::tracking::{CopyStatus, TrackedItem, TrackedList};
use crate::device::entry::RemoteFileEntry;
use crate::device::identity::{detect_change, CardIdentity, ChangeResult};
use crate::device::traits::CardApi;
use crate::duplicate::signatures::{SignatureStore, STORE_FILE_NAME};
use chrono::{Local, NaiveDateTime, TimeZone};
use filetime::FileTime;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Busy gate
// =============================================================================

/// Admits one cycle at a time
#[derive(Debug, Clone, Default)]
pub struct CycleGate {
    busy: Arc<AtomicBool>,
}

/// Held for the duration of a cycle; reopens the gate on drop
#[derive(Debug)]
pub struct GateGuard {
    busy: Arc<AtomicBool>,
}

impl CycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Result<GateGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        Ok(GateGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Stop handle
// =============================================================================

/// Cancels the running cycle from another task or thread (e.g. Ctrl+C)
#[derive(Debug, Clone)]
pub struct StopHandle {
    /// Never reset: once stopped, the watch loop ends
    halt: CancellationToken,
    current: Arc<Mutex<CancellationToken>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let halt = CancellationToken::new();
        let current = Arc::new(Mutex::new(halt.child_token()));
        Self { halt, current }
    }

    fn current(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh token for a new cycle; `stop` and `stop_cycle` cancel it
    pub fn begin_cycle(&self) -> CancellationToken {
        let token = self.halt.child_token();
        *self.current() = token.clone();
        token
    }

    /// Cancel the running cycle and end the watch loop
    pub fn stop(&self) {
        self.current().cancel();
        self.halt.cancel();
    }

    /// Cancel only the running cycle; a watch loop carries on
    pub fn stop_cycle(&self) {
        self.current().cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.halt.is_cancelled()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Configuration plus the state persisted in the profile directory
pub struct SyncContext {
    config: Config,
    profile_dir: Option<PathBuf>,
    /// Opened on first use
    signatures: OnceCell<SignatureStore>,
    profile: Option<CardProfile>,
}

impl SyncContext {
    /// Use the profile directory named by the configuration
    pub fn new(config: Config) -> Result<Self> {
        let profile_dir = config.dedup.profile_dir();
        Self::with_profile_dir(config, profile_dir)
    }

    /// Use an explicit profile directory; `None` keeps nothing between runs
    pub fn with_profile_dir(config: Config, profile_dir: Option<PathBuf>) -> Result<Self> {
        let profile = match profile_dir.as_deref() {
            Some(dir) => Some(CardProfile::open(dir)?),
            None => {
                warn!("No data directory available; copied files will not be remembered");
                None
            }
        };
        Ok(Self {
            config,
            profile_dir,
            signatures: OnceCell::new(),
            profile,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile_dir(&self) -> Option<&Path> {
        self.profile_dir.as_deref()
    }

    pub fn profile(&self) -> Option<&CardProfile> {
        self.profile.as_ref()
    }

    /// The signature store, if it has been opened
    pub fn signatures(&self) -> Option<&SignatureStore> {
        self.signatures.get()
    }

    /// Open the signature store unless dedup is off; no-op once opened
    async fn ensure_signatures(&self) -> Result<bool> {
        if !self.config.dedup.enabled {
            return Ok(false);
        }
        let Some(dir) = self.profile_dir.clone() else {
            return Ok(false);
        };
        let max_count = self.config.dedup.max_count;
        self.signatures
            .get_or_try_init(|| async move {
                let path = dir.join(STORE_FILE_NAME);
                tokio::task::spawn_blocking(move || SignatureStore::open(&path, max_count))
                    .await
                    .map_err(|e| SyncError::unexpected("opening the signature store", e))?
            })
            .await?;
        Ok(true)
    }

    fn save_profile(&mut self) {
        if let Some(profile) = self.profile.as_mut() {
            if let Err(e) = profile.save() {
                warn!("Failed to save profile: {}", e);
            }
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// What one `sync` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub check: CheckSummary,
    pub copy: CopySummary,
    /// `None` when thumbnail loading is disabled
    pub thumbnails: Option<BackfillSummary>,
}

pub struct Orchestrator<C: CardApi> {
    card: C,
    context: SyncContext,
    services: Services,
    events: EventSink,
    list: TrackedList,
    /// Identity from the latest check
    identity: Option<CardIdentity>,
    accounting: ProgressAccounting,
    auto: AutoCheckState,
    gate: CycleGate,
    stop: StopHandle,
    status: OperationStatus,
}

fn set_status(item: &mut TrackedItem, next: CopyStatus) -> Result<()> {
    item.transition(next)
        .map_err(|e| SyncError::unexpected("copy status", e))
}

/// Key used to match a listing against tracked items
fn match_key(entry: &RemoteFileEntry) -> (String, String, u64) {
    (
        entry.directory().to_lowercase(),
        entry.file_name().to_lowercase(),
        entry.size(),
    )
}

async fn write_local(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            SyncError::Io(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    if let Err(e) = tokio::fs::write(path, data).await {
        // never leave a truncated copy that would later look available
        let _ = tokio::fs::remove_file(path).await;
        return Err(SyncError::Io(format!(
            "Failed to write {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Set the file's modification time to `date` (local wall-clock time)
fn stamp_modified(path: &Path, date: NaiveDateTime) -> Result<()> {
    let Some(local) = Local.from_local_datetime(&date).earliest() else {
        return Ok(());
    };
    filetime::set_file_mtime(path, FileTime::from_unix_time(local.timestamp(), 0)).map_err(|e| {
        SyncError::Io(format!(
            "Failed to set modification time of {}: {}",
            path.display(),
            e
        ))
    })
}

impl<C: CardApi> Orchestrator<C> {
    pub fn new(card: C, context: SyncContext, services: Services, events: EventSink) -> Self {
        Self {
            card,
            context,
            services,
            events,
            list: TrackedList::new(),
            identity: None,
            accounting: ProgressAccounting::new(),
            auto: AutoCheckState::new(),
            gate: CycleGate::new(),
            stop: StopHandle::new(),
            status: OperationStatus::Idle,
        }
    }

    /// Share a stop handle created before the orchestrator (e.g. for Ctrl+C)
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn gate(&self) -> CycleGate {
        self.gate.clone()
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn tracked(&self) -> &TrackedList {
        &self.list
    }

    pub fn identity(&self) -> Option<&CardIdentity> {
        self.identity.as_ref()
    }

    pub fn card(&self) -> &C {
        &self.card
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    fn set_cycle_status(&mut self, status: OperationStatus) {
        self.status = status;
        self.events.status(status, None);
    }

    /// Queue or unqueue one tracked file between cycles
    ///
    /// Returns false if there is no item at `index`.
    pub fn set_queued(&mut self, index: usize, queued: bool) -> Result<bool> {
        if self.gate.is_busy() {
            return Err(SyncError::Busy);
        }
        let Some(item) = self.list.get_mut(index) else {
            return Ok(false);
        };
        let next = if queued {
            CopyStatus::ToBeCopied
        } else {
            CopyStatus::NotCopied
        };
        if item.status() != next {
            set_status(item, next)?;
        }
        Ok(true)
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// Run a check phase on its own
    pub async fn check(&mut self) -> Result<CheckSummary> {
        let _guard = self.gate.try_enter()?;
        let cancel = self.stop.begin_cycle();
        let result = self.check_inner(&cancel).await;
        self.finish(&result, false);
        result
    }

    /// Copy whatever the last check queued
    pub async fn copy(&mut self) -> Result<CopySummary> {
        let _guard = self.gate.try_enter()?;
        let cancel = self.stop.begin_cycle();
        let result = self.copy_inner(&cancel).await;
        let copied = matches!(&result, Ok(summary) if summary.copied > 0);
        self.finish(&result, copied);
        result
    }

    /// Load missing thumbnails
    pub async fn backfill_thumbnails(&mut self) -> Result<BackfillSummary> {
        let _guard = self.gate.try_enter()?;
        let cancel = self.stop.begin_cycle();
        let result = self.thumbnails_inner(&cancel).await;
        self.finish(&result, false);
        result
    }

    /// Check, copy, then backfill thumbnails when enabled
    pub async fn sync(&mut self) -> Result<SyncReport> {
        let _guard = self.gate.try_enter()?;
        let cancel = self.stop.begin_cycle();
        let result = self.sync_inner(&cancel).await;
        let copied = matches!(&result, Ok(report) if report.copy.copied > 0);
        self.finish(&result, copied);
        result
    }

    async fn sync_inner(&mut self, cancel: &CancellationToken) -> Result<SyncReport> {
        let check = self.check_inner(cancel).await?;
        let copy = self.copy_inner(cancel).await?;
        let thumbnails = if self.context.config.copy.load_thumbnails {
            Some(self.thumbnails_inner(cancel).await?)
        } else {
            self.auto.set_thumbnails_complete(true);
            None
        };
        Ok(SyncReport {
            check,
            copy,
            thumbnails,
        })
    }

    /// Map a cycle result to the final status and sound
    fn finish<T>(&mut self, result: &Result<T>, copied: bool) {
        let (status, sound, message) = match result {
            Ok(_) => (OperationStatus::Done, copied.then_some(Sound::Done), None),
            Err(e) if e.is_canceled() => {
                info!("Stopped");
                (OperationStatus::Stopped, None, None)
            }
            Err(e) if e.is_connection_class() => {
                warn!("Card connection interrupted: {}", e);
                (OperationStatus::Interrupted, Some(Sound::Interrupted), Some(e.to_string()))
            }
            Err(e) => {
                warn!("Cycle failed: {}", e);
                (OperationStatus::Failed, Some(Sound::Error), Some(e.to_string()))
            }
        };

        self.status = status;
        self.events.status(status, message);
        if let Some(sound) = sound {
            self.services.notifier.play(sound);
        }
        self.context.save_profile();
    }

    /// Watch the card until stopped
    ///
    /// The first pass runs immediately. Later passes wait for the interval
    /// (or the failure backoff) and, when the previous pass left nothing to
    /// do, only ask the card whether it changed.
    pub async fn run_auto(&mut self) -> Result<()> {
        let policy = AutoCheckPolicy::from(&self.context.config.auto_check);
        let halt = self.stop.halt.clone();
        let mut failed = false;
        let mut first = true;
        info!("Watching the card every {}s", policy.interval.as_secs());

        loop {
            if !first {
                self.set_cycle_status(OperationStatus::Waiting);
                tokio::select! {
                    _ = halt.cancelled() => break,
                    _ = tokio::time::sleep(policy.next_delay(failed)) => {}
                }
            }
            first = false;
            if halt.is_cancelled() {
                break;
            }

            if self.auto.plan(&policy, Instant::now()) == CheckPlan::Cheap {
                match self.quick_probe().await {
                    Ok(false) => {
                        trace!("No changes on the card");
                        failed = false;
                        continue;
                    }
                    Ok(true) => debug!("Card reports changes, running a full check"),
                    Err(e) if e.is_canceled() => {
                        if halt.is_cancelled() {
                            break;
                        }
                        continue;
                    }
                    Err(SyncError::Busy) => continue,
                    Err(e) => {
                        warn!("Change probe failed: {}", e);
                        self.auto.reset();
                        failed = true;
                        continue;
                    }
                }
            }

            match self.sync().await {
                Ok(_) => failed = false,
                Err(e) if e.is_canceled() => {
                    if halt.is_cancelled() {
                        break;
                    }
                    failed = false;
                }
                Err(SyncError::Busy) => failed = false,
                Err(_) => {
                    self.auto.reset();
                    failed = true;
                }
            }
        }

        self.set_cycle_status(OperationStatus::Stopped);
        Ok(())
    }

    async fn quick_probe(&mut self) -> Result<bool> {
        let _guard = self.gate.try_enter()?;
        let cancel = self.stop.begin_cycle();
        self.auto.card_changed(&self.card, &cancel).await
    }

    // =========================================================================
    // Check
    // =========================================================================

    /// Every file under the remote path that is eligible for syncing
    async fn list_remote(&self, cancel: &CancellationToken) -> Result<Vec<RemoteFileEntry>> {
        let card_config = &self.context.config.card;
        let jpeg_only = self.context.config.copy.jpeg_only;
        let mut pending = vec![card_config.remote_path.clone()];
        let mut files = Vec::new();

        while let Some(directory) = pending.pop() {
            for entry in self.card.list_directory(&directory, cancel).await? {
                if entry.is_hidden_from_sync() {
                    trace!("Skipping hidden {}", entry.file_path());
                    continue;
                }
                if entry.is_directory() {
                    if card_config.is_excluded(entry.file_name()) {
                        debug!("Skipping excluded folder {}", entry.file_path());
                    } else {
                        pending.push(entry.file_path());
                    }
                    continue;
                }
                if jpeg_only && !entry.kind().is_jpeg() {
                    continue;
                }
                files.push(entry);
            }
        }

        files.sort();
        Ok(files)
    }

    async fn check_inner(&mut self, cancel: &CancellationToken) -> Result<CheckSummary> {
        self.set_cycle_status(OperationStatus::Checking);

        let identity = self.card.probe_identity(cancel).await?;
        let previous = self
            .identity
            .as_ref()
            .or_else(|| self.context.profile.as_ref().and_then(|p| p.last_identity()));
        let mut change = detect_change(previous, &identity);
        debug!(
            "Card firmware {}, SSID {}: {:?}",
            identity.firmware_version, identity.ssid, change
        );

        let entries = self.list_remote(cancel).await?;
        if change == ChangeResult::Unknown
            && !self.list.is_empty()
            && !entries.is_empty()
            && self.list.overlap(&entries) == 0
        {
            debug!("None of the listed files is tracked, assuming another card");
            change = ChangeResult::Changed;
        }

        let mut summary = CheckSummary {
            listed: entries.len(),
            ..CheckSummary::default()
        };
        if change == ChangeResult::Changed {
            info!("Card changed, starting over");
            self.list.clear();
            summary.card_changed = true;
        }

        if let Some(profile) = self.context.profile.as_mut() {
            profile.remember_identity(&identity, change == ChangeResult::Changed);
        }
        self.events.emit(SyncEvent::CardIdentified {
            identity: identity.clone(),
            change,
        });

        let fresh = self.reconcile(entries, &mut summary)?;
        summary.new_items = fresh;

        self.mark_once_copied().await?;
        self.queue_eligible(&mut summary)?;

        info!(
            "{} files on the card, {} new, {} queued ({} bytes)",
            summary.listed, summary.new_items, summary.queued, summary.queued_bytes
        );
        self.auto.record_full_check(Instant::now(), &identity);
        self.identity = Some(identity);
        self.events.emit(SyncEvent::CheckComplete(summary.clone()));
        Ok(summary)
    }

    /// Merge a listing into the tracked list; returns how many items are new
    fn reconcile(
        &mut self,
        entries: Vec<RemoteFileEntry>,
        summary: &mut CheckSummary,
    ) -> Result<usize> {
        let output = self.context.config.output.clone();

        for item in self.list.iter_mut() {
            item.is_alive_remote = false;
        }
        let index: HashMap<_, _> = self
            .list
            .iter()
            .enumerate()
            .map(|(i, item)| (match_key(item.entry()), i))
            .collect();

        let mut fresh = Vec::new();
        for entry in entries {
            match index.get(&match_key(&entry)) {
                Some(&i) => {
                    if let Some(item) = self.list.get_mut(i) {
                        item.is_alive_remote = true;
                    }
                }
                None => fresh.push(entry),
            }
        }

        // files that left the card
        let recycle = self.context.config.copy.recycle_on_remote_delete;
        let mut keep = Vec::with_capacity(self.list.len());
        for item in self.list.iter_mut() {
            if item.is_alive_remote {
                item.refresh_local(&output);
                keep.push(true);
                continue;
            }
            if item.status() == CopyStatus::Recycled {
                keep.push(false);
                continue;
            }
            // our own delete-on-copy, not a deletion to mirror locally
            if item.deleted_by_copy {
                keep.push(false);
                continue;
            }

            summary.gone += 1;
            item.refresh_local(&output);
            let copied = item.status() == CopyStatus::Copied;
            if recycle && copied && item.is_available_local {
                match self.services.trash.move_to_trash(&item.local_path) {
                    Ok(()) => {
                        set_status(item, CopyStatus::Recycled)?;
                        item.is_alive_local = false;
                        item.is_available_local = false;
                        summary.recycled += 1;
                    }
                    Err(e) => warn!("Failed to recycle {}: {}", item.local_path.display(), e),
                }
                keep.push(true);
                continue;
            }
            keep.push(copied && item.is_alive_local);
        }
        let mut flags = keep.into_iter();
        self.list.retain(|_| flags.next().unwrap_or(true));

        let count = fresh.len();
        for entry in fresh {
            self.list.insert_sorted(TrackedItem::new(entry, &output));
        }
        Ok(count)
    }

    /// Ask the signature store about files missing locally
    async fn mark_once_copied(&mut self) -> Result<()> {
        let wanted = self
            .list
            .iter()
            .any(|i| i.is_alive_remote && !i.is_available_local && i.is_once_copied.is_none());
        if !wanted || !self.context.ensure_signatures().await? {
            return Ok(());
        }
        let Some(store) = self.context.signatures.get() else {
            return Ok(());
        };
        for item in self.list.iter_mut() {
            if item.is_alive_remote && !item.is_available_local && item.is_once_copied.is_none() {
                item.is_once_copied = Some(store.contains(&item.entry().signature()));
            }
        }
        Ok(())
    }

    fn queue_eligible(&mut self, summary: &mut CheckSummary) -> Result<()> {
        let skip_once = self.context.config.copy.skip_once_copied;
        let protect = self.context.config.output.do_not_overwrite;

        for item in self.list.iter_mut() {
            let once_copied = skip_once && item.is_once_copied == Some(true);
            // with do_not_overwrite, alive but unavailable means every name is taken
            let no_free_name = protect && item.is_alive_local && !item.is_available_local;
            let eligible =
                item.is_alive_remote && !item.is_available_local && !once_copied && !no_free_name;

            match item.status() {
                CopyStatus::NotCopied if eligible => set_status(item, CopyStatus::ToBeCopied)?,
                CopyStatus::ToBeCopied if !eligible => set_status(item, CopyStatus::NotCopied)?,
                _ => {}
            }
            if once_copied && item.is_alive_remote && !item.is_available_local {
                summary.once_copied += 1;
            }
            if no_free_name && item.is_alive_remote {
                warn!("No free local name for {}", item.entry().file_path());
            }
        }

        for index in self.list.queued() {
            if let Some(item) = self.list.get(index) {
                summary.queued += 1;
                summary.queued_bytes += item.size();
            }
        }
        Ok(())
    }

    // =========================================================================
    // Copy
    // =========================================================================

    /// Refuse to copy from a card other than the one checked
    async fn verify_card(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(identity) = self.identity.as_ref() else {
            return Ok(());
        };
        let capabilities = identity.capabilities();

        if let Some(known) = identity.usable_cid() {
            if capabilities.can_get_cid {
                let current = self.card.cid(cancel).await?;
                if current.trim() != known {
                    warn!("Card CID changed since the check ({} -> {})", known, current.trim());
                    return Err(SyncError::CardChanged);
                }
            }
        }

        if self.context.config.copy.delete_on_copy {
            let enabled = capabilities.can_get_upload && self.card.upload_enabled(cancel).await?;
            if !enabled {
                return Err(SyncError::CardUploadDisabled);
            }
        }
        Ok(())
    }

    async fn copy_inner(&mut self, cancel: &CancellationToken) -> Result<CopySummary> {
        let queued = self.list.queued();
        if queued.is_empty() {
            debug!("Nothing to copy");
            return Ok(CopySummary::default());
        }

        self.set_cycle_status(OperationStatus::Copying);
        self.verify_card(cancel).await?;
        self.context.ensure_signatures().await?;
        if let Some(profile) = self.context.profile.as_mut() {
            profile.start_session();
        }

        let bytes: u64 = queued
            .iter()
            .filter_map(|&i| self.list.get(i))
            .map(TrackedItem::size)
            .sum();
        info!("Copying {} files ({} bytes)", queued.len(), bytes);
        self.events.emit(SyncEvent::CopyStarted {
            files: queued.len(),
            bytes,
        });

        let started = Instant::now();
        let mut summary = CopySummary::default();
        let result = self.copy_queue(&queued, cancel, &mut summary).await;
        summary.duration = started.elapsed();

        let flushed = match self.context.signatures.get_mut() {
            Some(store) => store.flush(),
            None => Ok(()),
        };
        if let Some(profile) = self.context.profile.as_mut() {
            let interrupted = result
                .as_ref()
                .err()
                .is_some_and(|e| e.is_canceled() || e.is_connection_class());
            profile.end_session(result.is_ok(), interrupted);
        }
        info!(
            "Copied {} files ({} bytes), {} missing, {} weird",
            summary.copied, summary.bytes, summary.missing, summary.weird
        );
        self.events.emit(SyncEvent::CopyComplete(summary.clone()));

        match (result, flushed) {
            (Err(e), flushed) => {
                if let Err(flush_error) = flushed {
                    warn!("Failed to save copied-file signatures: {}", flush_error);
                }
                Err(e)
            }
            (Ok(()), Err(flush_error)) => Err(flush_error),
            (Ok(()), Ok(())) => Ok(summary),
        }
    }

    async fn copy_queue(
        &mut self,
        queued: &[usize],
        cancel: &CancellationToken,
        summary: &mut CopySummary,
    ) -> Result<()> {
        let output = self.context.config.output.clone();
        let delete_on_copy = self.context.config.copy.delete_on_copy;
        let total = queued.len();

        for (n, &index) in queued.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Stop requested, ending the copy");
                return Err(SyncError::Canceled);
            }

            let Some(item) = self.list.get_mut(index) else {
                continue;
            };
            if item.status() != CopyStatus::ToBeCopied {
                continue;
            }
            item.refresh_local(&output);
            let entry = item.entry().clone();
            let name = entry.file_name().to_string();
            let file_path = entry.file_path();

            if item.is_available_local {
                debug!("{} appeared locally, not copying", file_path);
                set_status(item, CopyStatus::Copying)?;
                set_status(item, CopyStatus::Copied)?;
                continue;
            }
            if output.do_not_overwrite && item.is_alive_local {
                return Err(SyncError::Io(format!(
                    "No free local name for {}",
                    file_path
                )));
            }
            set_status(item, CopyStatus::Copying)?;
            let target = item.local_path.clone();

            self.events.emit(SyncEvent::FileStarted {
                name: name.clone(),
                size: entry.size(),
                index: n + 1,
                total,
            });

            let downloaded = {
                let accounting = &mut self.accounting;
                let list = &self.list;
                let events = &self.events;
                let mut sink = |sample: ProgressSample| {
                    let snapshot = accounting.update(&sample, || list.totals());
                    events.emit(SyncEvent::FileProgress {
                        name: name.clone(),
                        snapshot,
                    });
                };
                self.card
                    .download_file(&file_path, entry.size(), Some(&mut sink), cancel)
                    .await
            };

            let Some(item) = self.list.get_mut(index) else {
                continue;
            };
            let data = match downloaded {
                Ok(data) => data,
                Err(e) if e.is_per_item() => {
                    let error = if let SyncError::RemoteFileNotFound(_) = e {
                        warn!("{} is gone from the card", file_path);
                        item.is_alive_remote = false;
                        set_status(item, CopyStatus::ToBeCopied)?;
                        summary.missing += 1;
                        "not found on the card".to_string()
                    } else {
                        warn!("{}", e);
                        set_status(item, CopyStatus::Weird)?;
                        summary.weird += 1;
                        if let Some(profile) = self.context.profile.as_mut() {
                            profile.record_weird();
                        }
                        e.to_string()
                    };
                    self.events.emit(SyncEvent::FileFailed { name, error });
                    continue;
                }
                Err(e) => {
                    set_status(item, CopyStatus::ToBeCopied)?;
                    if !e.is_canceled() {
                        if let Some(profile) = self.context.profile.as_mut() {
                            profile.record_error();
                        }
                    }
                    return Err(e);
                }
            };

            if let Err(e) = write_local(&target, &data).await {
                set_status(item, CopyStatus::ToBeCopied)?;
                if let Some(profile) = self.context.profile.as_mut() {
                    profile.record_error();
                }
                return Err(e);
            }

            let taken = if entry.kind().is_jpeg() {
                self.services.images.date_taken(&data)
            } else {
                None
            };
            if let Some(date) = taken.or_else(|| entry.has_valid_date().then(|| entry.date())) {
                if let Err(e) = stamp_modified(&target, date) {
                    warn!("{}", e);
                }
            }

            set_status(item, CopyStatus::Copied)?;
            item.is_alive_local = true;
            item.is_available_local = true;
            item.is_once_copied = Some(true);
            item.copied_this_session = true;
            if let Some(store) = self.context.signatures.get_mut() {
                store.append(entry.signature());
            }
            if let Some(profile) = self.context.profile.as_mut() {
                profile.record_copied(entry.size());
            }
            summary.copied += 1;
            summary.bytes += entry.size();
            info!("Copied {} -> {}", file_path, target.display());
            self.events.emit(SyncEvent::FileCopied {
                name: name.clone(),
                destination: target,
                size: entry.size(),
            });

            if !delete_on_copy {
                continue;
            }
            if entry.attributes().is_read_only() {
                debug!("Keeping read-only {} on the card", file_path);
                continue;
            }
            match self.card.delete_file(&file_path, cancel).await {
                Ok(()) => {
                    item.is_alive_remote = false;
                    item.deleted_by_copy = true;
                    summary.deleted += 1;
                    if let Some(profile) = self.context.profile.as_mut() {
                        profile.record_deleted();
                    }
                    self.events.emit(SyncEvent::FileDeleted { name });
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    warn!("Failed to delete {}: {}", file_path, e);
                    return Err(SyncError::RemoteFileDeletionFailed(file_path));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Thumbnails
    // =========================================================================

    async fn thumbnails_inner(&mut self, cancel: &CancellationToken) -> Result<BackfillSummary> {
        self.set_cycle_status(OperationStatus::LoadingThumbnails);
        let result = thumbnails::backfill(
            &self.card,
            &self.services.images,
            &mut self.list,
            cancel,
            &self.events,
        )
        .await;
        let complete = result.is_ok() && !self.list.iter().any(TrackedItem::wants_thumbnail);
        self.auto.set_thumbnails_complete(complete);
        if let Ok(summary) = &result {
            debug!(
                "Thumbnails: {} loaded, {} failed",
                summary.loaded, summary.failed
            );
        }
        result
    }
}
