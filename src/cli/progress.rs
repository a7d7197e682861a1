//! Progress bar utilities for CLI output
//!
//! The orchestrator never touches the terminal. It emits [`SyncEvent`]s into
//! a crossbeam channel and a [`SyncRenderer`] thread turns them into
//! indicatif bars:
//! - A spinner showing what the synchronizer is doing
//! - A byte bar for the current file
//! - A byte bar for the whole copy, with the remaining time
//!
//! Log output and one-off messages suspend the bars so lines never tear.

use crate::core::events::{
    format_bytes, format_duration, format_eta, OperationStatus, SyncEvent,
};
use crate::device::identity::ChangeResult;
use crossbeam_channel::Receiver;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ============================================================================
// Styles - Consistent visual appearance
// ============================================================================

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷")
}

fn file_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:30.cyan/dim}] {bytes}/{total_bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╾─")
}

fn session_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  Σ [{bar:30.green/dim}] {bytes}/{total_bytes} ({percent}%) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╾─")
}

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 68;
    let title_padded = format!("{:^width$}", title, width = width - 4);
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{}║", title_padded);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

/// Print a success message with checkmark
pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

/// Print an info message with bullet
pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("  ⚠ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

// ============================================================================
// Event renderer
// ============================================================================

/// What the renderer saw, for the final summary line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTotals {
    pub copied: usize,
    pub bytes: u64,
    pub failed: usize,
    pub deleted: usize,
    pub thumbnails: usize,
}

/// Bars for one run; lives on the renderer thread
struct Bars {
    multi: MultiProgress,
    status: ProgressBar,
    file: Option<ProgressBar>,
    session: Option<ProgressBar>,
    /// Bytes of files finished in the current copy
    done: u64,
    totals: RenderTotals,
}

impl Bars {
    fn new() -> Self {
        let multi = MultiProgress::new();
        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(spinner_style());
        status.enable_steady_tick(Duration::from_millis(100));
        Self {
            multi,
            status,
            file: None,
            session: None,
            done: 0,
            totals: RenderTotals::default(),
        }
    }

    fn line(&self, msg: String) {
        self.multi.suspend(|| println!("  {}", msg));
    }

    fn clear_copy_bars(&mut self) {
        if let Some(bar) = self.file.take() {
            bar.finish_and_clear();
        }
        if let Some(bar) = self.session.take() {
            bar.finish_and_clear();
        }
    }

    fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::StatusChanged { status, message } => {
                self.status.set_message(status.display_name().to_string());
                if let Some(message) = message {
                    let mark = if status == OperationStatus::Interrupted {
                        "⚠"
                    } else {
                        "✗"
                    };
                    self.line(format!("{} {}: {}", mark, status.display_name(), message));
                }
            }
            SyncEvent::CardIdentified { identity, change } => {
                let note = match change {
                    ChangeResult::Changed => " (another card than last time)",
                    ChangeResult::Unchanged => "",
                    ChangeResult::Unknown => "",
                };
                self.line(format!(
                    "• Card '{}' firmware {}{}",
                    identity.ssid, identity.firmware_version, note
                ));
            }
            SyncEvent::CheckComplete(summary) => {
                self.line(format!(
                    "• {} files on the card, {} new, {} to copy ({})",
                    summary.listed,
                    summary.new_items,
                    summary.queued,
                    format_bytes(summary.queued_bytes)
                ));
                if summary.once_copied > 0 {
                    self.line(format!(
                        "• {} files skipped, copied in an earlier session",
                        summary.once_copied
                    ));
                }
                if summary.recycled > 0 {
                    self.line(format!("• {} local copies moved to the trash", summary.recycled));
                }
            }
            SyncEvent::CopyStarted { bytes, .. } => {
                self.clear_copy_bars();
                let session = self.multi.add(ProgressBar::new(bytes));
                session.set_style(session_bar_style());
                let file = self.multi.add(ProgressBar::new(0));
                file.set_style(file_bar_style());
                file.enable_steady_tick(Duration::from_millis(100));
                self.session = Some(session);
                self.file = Some(file);
                self.done = 0;
            }
            SyncEvent::FileStarted {
                name,
                size,
                index,
                total,
            } => {
                if let Some(file) = &self.file {
                    file.reset();
                    file.set_length(size);
                    file.set_message(format!("{} ({}/{})", name, index, total));
                }
            }
            SyncEvent::FileProgress { snapshot, .. } => {
                if let Some(file) = &self.file {
                    file.set_position(snapshot.file_current);
                }
                if let Some(session) = &self.session {
                    session.set_position(self.done + snapshot.file_current);
                    session.set_message(format!("{} left", format_eta(snapshot.remaining)));
                }
            }
            SyncEvent::FileCopied { size, .. } => {
                self.done += size;
                self.totals.copied += 1;
                self.totals.bytes += size;
                if let Some(session) = &self.session {
                    session.set_position(self.done);
                }
            }
            SyncEvent::FileFailed { name, error } => {
                self.totals.failed += 1;
                self.line(format!("⚠ {}: {}", name, error));
            }
            SyncEvent::FileDeleted { .. } => {
                self.totals.deleted += 1;
            }
            SyncEvent::ThumbnailLoaded { .. } => {
                self.totals.thumbnails += 1;
            }
            SyncEvent::CopyComplete(summary) => {
                self.clear_copy_bars();
                self.line(format!(
                    "✓ Copied {} files ({}) in {}",
                    summary.copied,
                    format_bytes(summary.bytes),
                    format_duration(summary.duration)
                ));
                if summary.deleted > 0 {
                    self.line(format!("• Deleted {} originals from the card", summary.deleted));
                }
                if summary.missing + summary.weird > 0 {
                    self.line(format!(
                        "⚠ {} files vanished from the card, {} were served with the wrong size",
                        summary.missing, summary.weird
                    ));
                }
            }
        }
    }

    fn finish(mut self) -> RenderTotals {
        self.clear_copy_bars();
        self.status.finish_and_clear();
        self.totals
    }
}

/// Renders events on its own thread until every sender is dropped
pub struct SyncRenderer {
    handle: JoinHandle<RenderTotals>,
}

impl SyncRenderer {
    pub fn spawn(events: Receiver<SyncEvent>) -> Self {
        let handle = thread::spawn(move || {
            let mut bars = Bars::new();
            for event in events.iter() {
                bars.handle(event);
            }
            bars.finish()
        });
        Self { handle }
    }

    /// Wait for the channel to close and the bars to clear
    pub fn finish(self) -> RenderTotals {
        self.handle.join().unwrap_or_default()
    }
}

// ============================================================================
// Dual writer for file + console logging
// ============================================================================

/// A writer that writes to both console and file
///
/// Used for logging to both stderr and a log file simultaneously.
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // the log file is authoritative; console errors are ignored
        let _ = self.console.write(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}

// ============================================================================
// Tests
// ============================================================================
