//! Core functionality module
//!
//! This module contains the synchronizer's business logic: configuration,
//! error handling, the tracked file list and its state machine, and the
//! orchestrator that drives check, copy and thumbnail cycles.
//!
//! # Submodules
//!
//! - `auto_check` - Scheduling of periodic checks
//! - `config` - Configuration loading, saving, and management
//! - `error` - Error types and result aliases
//! - `events` - Events and summaries sent to the presentation layer
//! - `exif` - EXIF thumbnail extraction and image decoding
//! - `orchestrator` - Check/copy/thumbnail cycles and the busy gate
//! - `profile` - Per-profile card identity and copy statistics
//! - `progress` - Transfer speed and remaining-time estimation
//! - `services` - Image decoding and trash seams
//! - `thumbnails` - Thumbnail backfill pipeline
//! - `tracking` - Tracked remote files and local path resolution

pub mod auto_check;
pub mod config;
pub mod error;
pub mod events;
pub mod exif;
pub mod orchestrator;
pub mod profile;
pub mod progress;
pub mod services;
pub mod thumbnails;
pub mod tracking;
