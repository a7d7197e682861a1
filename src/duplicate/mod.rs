//! Duplicate detection module
//!
//! Files copied from a card are remembered by a coarse signature (timestamp,
//! remote path, size) rather than by content, so the check is possible
//! before any byte is downloaded.
//!
//! # Submodules
//!
//! - `signatures` - Persisted, bounded signature store

pub mod signatures;

pub use signatures::SignatureStore;
