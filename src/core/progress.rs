//! Transfer progress and ETA accounting
//!
//! Two layers live here:
//!
//! - [`ProgressReporter`] turns a byte stream into a small number of evenly
//!   spaced [`ProgressSample`]s for a single file. It is shared by the real
//!   protocol client and the mock card so both report identically.
//! - [`ProgressAccounting`] combines the current file's samples with the
//!   totals of the tracked list into all-time and session percentages and a
//!   remaining-time estimate.

use std::time::Duration;
use tokio::time::Instant;

/// Report at least every this many bytes
const REPORT_EVERY_BYTES: u64 = 512 * 1024;

/// Report at least this many times per file
const MIN_REPORT_STEPS: u64 = 6;

// =============================================================================
// Samples
// =============================================================================

/// One progress report for the file being transferred
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Bytes received so far
    pub current: u64,
    /// Expected size of the file
    pub total: u64,
    /// Time since the transfer started
    pub elapsed: Duration,
    /// First report of a new file (always zero bytes)
    pub is_first: bool,
    /// The transfer failed after this many bytes
    pub is_error: bool,
}

/// Bytes between two reports for a file of `total` bytes
///
/// Whichever of "6 steps" or "every 512 KiB" gives more steps wins.
pub fn report_step(total: u64) -> u64 {
    let steps = MIN_REPORT_STEPS.max(total.div_ceil(REPORT_EVERY_BYTES));
    total.div_ceil(steps).max(1)
}

/// Emits samples for one transfer into a caller-supplied sink
pub struct ProgressReporter<'a> {
    sink: &'a mut dyn FnMut(ProgressSample),
    total: u64,
    step: u64,
    next_report: u64,
    last_reported: Option<u64>,
    started: Instant,
}

impl<'a> ProgressReporter<'a> {
    /// Start a transfer; emits the `is_first` zero-byte sample immediately
    pub fn start(sink: &'a mut dyn FnMut(ProgressSample), total: u64) -> Self {
        let step = report_step(total);
        let mut reporter = Self {
            sink,
            total,
            step,
            next_report: step,
            last_reported: None,
            started: Instant::now(),
        };
        reporter.emit(0, true, false);
        reporter
    }

    /// Record that `current` bytes have arrived in total
    pub fn advance(&mut self, current: u64) {
        if current >= self.next_report || current == self.total {
            if self.last_reported != Some(current) {
                self.emit(current, false, false);
            }
            while self.next_report <= current {
                self.next_report += self.step;
            }
        }
    }

    /// Report a failure at `current` bytes
    pub fn fail(&mut self, current: u64) {
        self.emit(current, false, true);
    }

    fn emit(&mut self, current: u64, is_first: bool, is_error: bool) {
        self.last_reported = Some(current);
        (self.sink)(ProgressSample {
            current,
            total: self.total,
            elapsed: self.started.elapsed(),
            is_first,
            is_error,
        });
    }
}

// =============================================================================
// Accounting
// =============================================================================

/// Byte totals over the tracked list, recomputed at the start of each file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTotals {
    /// Everything that is or will be copied: Copied + ToBeCopied + Copying
    pub overall: u64,
    /// Bytes of items already Copied, in any session
    pub copied_all: u64,
    /// Bytes copied during this session
    pub copied_session: u64,
    /// Bytes still queued this session: ToBeCopied + Copying
    pub remaining_session: u64,
}

/// Derived view of the transfer for the presentation layer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub file_current: u64,
    pub file_total: u64,
    pub file_percent: f64,
    pub all_time_percent: f64,
    pub session_percent: f64,
    pub remaining: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct ProgressAccounting {
    totals: SessionTotals,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).min(100.0)
}

impl ProgressAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> SessionTotals {
        self.totals
    }

    /// Fold in one sample
    ///
    /// `recompute` is only called for an `is_first` sample, which is when the
    /// tracked list's statuses have moved on since the last file.
    pub fn update<F>(&mut self, sample: &ProgressSample, recompute: F) -> ProgressSnapshot
    where
        F: FnOnce() -> SessionTotals,
    {
        if sample.is_first {
            self.totals = recompute();
        }
        let totals = self.totals;
        let current = sample.current;

        let session_whole = totals.copied_session + totals.remaining_session;

        let remaining = if current == 0 || sample.elapsed.is_zero() {
            None
        } else {
            let per_byte = sample.elapsed.as_secs_f64() / current as f64;
            let bytes_left = totals.remaining_session.saturating_sub(current);
            Some(Duration::from_secs_f64(per_byte * bytes_left as f64))
        };

        ProgressSnapshot {
            file_current: current,
            file_total: sample.total,
            file_percent: percent(current, sample.total),
            all_time_percent: percent(totals.copied_all + current, totals.overall),
            session_percent: percent(totals.copied_session + current, session_whole),
            remaining,
        }
    }
}
