//! Card abstraction trait for testability
//!
//! `CardApi` is everything the orchestrator needs from a card. The real
//! HTTP client ([`crate::device::client::CardClient`]) and the in-memory mock
//! ([`crate::testdb::mock_card::MockCard`]) both implement it, so the whole
//! check/copy pipeline can run without a card on the network.
//!
//! Implementors provide the raw endpoints; listing parsing and the identity
//! batch are provided on top of them so every implementation behaves the same.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use wifi_card_sync::device::CardApi;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn count_jpegs<C: CardApi>(card: &C) -> wifi_card_sync::core::error::Result<usize> {
//!     let cancel = CancellationToken::new();
//!     let entries = card.list_directory("/DCIM/100__TSB", &cancel).await?;
//!     Ok(entries.iter().filter(|e| e.kind().is_jpeg()).count())
//! }
//! ```

#![allow(async_fn_in_trait)]

use crate::core::error::Result;
use crate::core::progress::ProgressSample;
use crate::device::entry::{parse_listing, RemoteFileEntry};
use crate::device::identity::{CardIdentity, Capacity};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

/// Progress callback for a single download
pub type ProgressSink<'a> = &'a mut dyn FnMut(ProgressSample);

/// Operations a wireless card exposes
pub trait CardApi {
    /// Raw body of a directory listing (op=100)
    async fn list_raw(&self, directory: &str, cancel: &CancellationToken) -> Result<String>;

    /// Number of entries in a directory (op=101)
    async fn file_count(&self, directory: &str, cancel: &CancellationToken) -> Result<u32>;

    /// Card-generated JPEG thumbnail of a file
    async fn thumbnail(&self, file_path: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;

    /// Download a whole file
    ///
    /// `expected_size` of 0 skips the size check. When `progress` is given the
    /// body is streamed and reported in steps.
    async fn download_file(
        &self,
        file_path: &str,
        expected_size: u64,
        progress: Option<ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Delete a file through the upload endpoint
    async fn delete_file(&self, file_path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Firmware version string (op=108)
    async fn firmware_version(&self, cancel: &CancellationToken) -> Result<String>;

    /// Card identification register (op=120)
    async fn cid(&self, cancel: &CancellationToken) -> Result<String>;

    /// SSID of the card's access point (op=104)
    async fn ssid(&self, cancel: &CancellationToken) -> Result<String>;

    /// Free and total space (op=140)
    async fn capacity(&self, cancel: &CancellationToken) -> Result<Capacity>;

    /// Time of the last write to the card (op=121)
    async fn write_timestamp(&self, cancel: &CancellationToken) -> Result<i64>;

    /// Whether the upload endpoint, and so deletion, is enabled (op=118)
    async fn upload_enabled(&self, cancel: &CancellationToken) -> Result<bool>;

    /// Whether the card content changed since the last ask (op=102)
    async fn is_updated(&self, cancel: &CancellationToken) -> Result<bool>;

    /// List and parse one directory
    async fn list_directory(
        &self,
        directory: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteFileEntry>> {
        let body = self.list_raw(directory, cancel).await?;
        let entries = parse_listing(&body, directory);
        debug!("Listed {} entries in '{}'", entries.len(), directory);
        Ok(entries)
    }

    /// Probe the card's identity as one batch
    ///
    /// Firmware, CID and SSID are always asked in that order so the result is
    /// comparable with a previous probe. Capability-gated fields follow; their
    /// failures are logged and left empty instead of failing the probe.
    async fn probe_identity(&self, cancel: &CancellationToken) -> Result<CardIdentity> {
        let firmware_version = self.firmware_version(cancel).await?;
        let mut identity = CardIdentity {
            firmware_version,
            ..Default::default()
        };
        let capabilities = identity.capabilities();

        if capabilities.can_get_cid {
            identity.cid = Some(self.cid(cancel).await?);
        }
        identity.ssid = self.ssid(cancel).await?;

        if capabilities.can_get_capacity {
            match self.capacity(cancel).await {
                Ok(capacity) => identity.capacity = Some(capacity),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => warn!("Could not read card capacity: {}", e),
            }
        }
        if capabilities.can_get_write_timestamp {
            match self.write_timestamp(cancel).await {
                Ok(ts) => identity.write_timestamp = Some(ts),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => warn!("Could not read card write timestamp: {}", e),
            }
        }
        if capabilities.can_get_upload {
            match self.upload_enabled(cancel).await {
                Ok(enabled) => identity.upload_enabled = Some(enabled),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => warn!("Could not read card upload setting: {}", e),
            }
        }

        Ok(identity)
    }
}
