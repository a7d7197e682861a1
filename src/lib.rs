//! Wireless Card Sync Library
//!
//! Copies new photos and videos from a wireless SD card (FlashAir-style
//! HTTP firmware) into a local folder. Every file is copied once: a
//! signature store remembers what was taken in earlier sessions, even after
//! the local copy was moved away.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`core`] - Configuration, errors, the tracked file list, events and
//!   the orchestrator that runs check/copy/thumbnail cycles
//! - [`device`] - The card's HTTP API, listing parser, identity and link
//!   monitoring
//! - [`duplicate`] - Persistent store of signatures of copied files
//! - [`cli`] - Command-line interface (only used by the binary)
//! - [`testdb`] - In-memory mock card and test content generators
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use wifi_card_sync::core::config::Config;
//! use wifi_card_sync::core::events::EventSink;
//! use wifi_card_sync::core::orchestrator::{Orchestrator, SyncContext};
//! use wifi_card_sync::core::services::Services;
//! use wifi_card_sync::device::CardClient;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load_default()?;
//! let card = CardClient::new(config.card.client_config())?;
//! let services = Services::standard(&config.output.destination);
//! let context = SyncContext::new(config)?;
//!
//! let mut orchestrator = Orchestrator::new(card, context, services, EventSink::none());
//! let report = orchestrator.sync().await?;
//! println!("Copied {} files", report.copy.copied);
//! # Ok(())
//! # }
//! ```
//!
//! # Testing Without a Card
//!
//! [`testdb::MockCard`] implements the same [`device::CardApi`] trait as the
//! HTTP client, with scripted failures:
//!
//! ```rust,no_run
//! use wifi_card_sync::testdb::{FailureMode, MockCard};
//!
//! let card = MockCard::builder()
//!     .jpegs("/DCIM/100CANON", 10)
//!     .fail("/DCIM/100CANON/IMG_0004.JPG", FailureMode::DropConnection)
//!     .build();
//! assert_eq!(card.entries().len(), 10);
//! ```

pub mod cli;
pub mod core;
pub mod device;
pub mod duplicate;
pub mod testdb;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
