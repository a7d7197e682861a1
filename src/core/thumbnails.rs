//! Thumbnail backfill
//!
//! After a check, every tracked item that still lacks a thumbnail gets one,
//! from the local copy when there is one and from the card otherwise. The
//! two sources run as concurrent queues joined by a bounded [`HandOff`]:
//!
//! ```text
//! local queue ──(no local copy, or failed but the card can serve it)──▶ HandOff ──▶ remote queue
//! ```
//!
//! The local queue closes the hand-off when it runs out of work, which is
//! how the remote queue learns it can stop waiting. A source that fails for
//! good clears the matching capability flag on the item so the next backfill
//! does not try again.

use crate::core::error::{Result, SyncError};
use crate::core::events::{EventSink, SyncEvent};
use crate::core::services::ImageService;
use crate::core::tracking::TrackedList;
use crate::device::traits::CardApi;
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Items that may wait in the hand-off at once
pub const HANDOFF_CAPACITY: usize = 16;

// =============================================================================
// Hand-off channel
// =============================================================================

/// Sending half of a bounded channel that the producer closes explicitly
pub struct HandOff<T> {
    sender: Option<mpsc::Sender<T>>,
}

impl<T> HandOff<T> {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Pass `value` on; false once closed or when nobody receives any more
    pub async fn send(&self, value: T) -> bool {
        match &self.sender {
            Some(sender) => sender.send(value).await.is_ok(),
            None => false,
        }
    }

    /// No more values will follow; the receiver sees the end of the stream
    pub fn close(&mut self) {
        self.sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

// =============================================================================
// Backfill
// =============================================================================

#[derive(Debug, Clone)]
struct Job {
    index: usize,
    file_path: String,
    local_path: Option<PathBuf>,
    remote: bool,
}

#[derive(Debug)]
enum Outcome {
    Loaded(usize, Vec<u8>),
    LocalFailed(usize),
    RemoteFailed(usize),
}

/// Counts from one backfill
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub loaded: usize,
    pub failed: usize,
}

async fn run_local_queue(
    jobs: Vec<Job>,
    images: Arc<dyn ImageService>,
    mut handoff: HandOff<Job>,
    cancel: &CancellationToken,
) -> Vec<Outcome> {
    let mut outcomes = Vec::new();

    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        let Some(path) = job.local_path.clone() else {
            // nothing to read here; the card is the only source
            if job.remote && !handoff.send(job).await {
                debug!("Remote queue is gone, not handing over");
            }
            continue;
        };

        let service = Arc::clone(&images);
        let read = tokio::task::spawn_blocking(move || service.local_thumbnail(&path)).await;
        match read {
            Ok(Ok(bytes)) => outcomes.push(Outcome::Loaded(job.index, bytes)),
            Ok(Err(e)) => {
                debug!("Local thumbnail of {} failed: {}", job.file_path, e);
                let index = job.index;
                if job.remote && !handoff.send(job).await {
                    debug!("Remote queue is gone, not handing over");
                }
                outcomes.push(Outcome::LocalFailed(index));
            }
            Err(e) => {
                warn!("Thumbnail worker failed: {}", e);
                outcomes.push(Outcome::LocalFailed(job.index));
            }
        }
    }

    handoff.close();
    outcomes
}

async fn fetch_remote<C: CardApi>(
    card: &C,
    job: &Job,
    cancel: &CancellationToken,
    outcomes: &mut Vec<Outcome>,
) -> Result<()> {
    match card.thumbnail(&job.file_path, cancel).await {
        Ok(bytes) => {
            outcomes.push(Outcome::Loaded(job.index, bytes));
            Ok(())
        }
        Err(e) if e.is_canceled() || e.is_connection_class() => Err(e),
        Err(e) => {
            debug!("Card thumbnail of {} failed: {}", job.file_path, e);
            outcomes.push(Outcome::RemoteFailed(job.index));
            Ok(())
        }
    }
}

/// Drains whatever the local queue hands over until it closes the hand-off
async fn run_remote_queue<C: CardApi>(
    card: &C,
    mut handed_over: mpsc::Receiver<Job>,
    cancel: &CancellationToken,
) -> (Vec<Outcome>, Result<()>) {
    let mut outcomes = Vec::new();

    while let Some(job) = handed_over.recv().await {
        if let Err(e) = fetch_remote(card, &job, cancel, &mut outcomes).await {
            return (outcomes, Err(e));
        }
    }

    (outcomes, Ok(()))
}

/// Load missing thumbnails for every tracked item that wants one
///
/// Results are applied to `list` even when the backfill ends early; a
/// connection-class error or cancellation is returned afterwards.
pub async fn backfill<C: CardApi>(
    card: &C,
    images: &Arc<dyn ImageService>,
    list: &mut TrackedList,
    cancel: &CancellationToken,
    events: &EventSink,
) -> Result<BackfillSummary> {
    let mut jobs = Vec::new();
    let mut from_card = 0;

    for (index, item) in list.iter().enumerate() {
        if !item.wants_thumbnail() {
            continue;
        }
        let local = item.is_available_local && item.can_load_thumbnail_local;
        let job = Job {
            index,
            file_path: item.entry().file_path(),
            local_path: local.then(|| item.local_path.clone()),
            remote: item.is_alive_remote && item.can_load_thumbnail_remote,
        };
        if !local {
            from_card += 1;
        }
        jobs.push(job);
    }

    if jobs.is_empty() {
        return Ok(BackfillSummary::default());
    }
    debug!(
        "Backfilling thumbnails: {} local, {} from the card",
        jobs.len() - from_card,
        from_card
    );

    let (handoff, handed_over) = HandOff::bounded(HANDOFF_CAPACITY);
    let (local_outcomes, (remote_outcomes, remote_result)) = tokio::join!(
        run_local_queue(jobs, Arc::clone(images), handoff, cancel),
        run_remote_queue(card, handed_over, cancel),
    );

    let mut summary = BackfillSummary::default();
    for outcome in local_outcomes.into_iter().chain(remote_outcomes) {
        match outcome {
            Outcome::Loaded(index, bytes) => {
                if let Some(item) = list.get_mut(index) {
                    events.emit(SyncEvent::ThumbnailLoaded {
                        file_path: item.entry().file_path(),
                        bytes: bytes.len(),
                    });
                    item.thumbnail = Some(bytes);
                    summary.loaded += 1;
                }
            }
            Outcome::LocalFailed(index) => {
                if let Some(item) = list.get_mut(index) {
                    item.can_load_thumbnail_local = false;
                    if !item.can_load_thumbnail_remote || !item.is_alive_remote {
                        summary.failed += 1;
                    }
                }
            }
            Outcome::RemoteFailed(index) => {
                if let Some(item) = list.get_mut(index) {
                    item.can_load_thumbnail_remote = false;
                    summary.failed += 1;
                }
            }
        }
    }

    remote_result?;
    if cancel.is_cancelled() {
        return Err(SyncError::Canceled);
    }
    Ok(summary)
}
