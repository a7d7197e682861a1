//! Card interaction module
//!
//! Everything that talks to, or describes, the wireless SD card.
//!
//! # Submodules
//!
//! - `entry` - Remote file entries and the listing-line parser
//! - `identity` - Firmware/CID/SSID identity, capabilities and change detection
//! - `traits` - The `CardApi` abstraction shared by the real client and the mock
//! - `client` - HTTP implementation of `CardApi`
//! - `retry` - Retry policy for refused requests
//! - `link` - Wireless link liveness monitor

pub mod client;
pub mod entry;
pub mod identity;
pub mod link;
pub mod retry;
pub mod traits;

pub use client::{CardClient, ClientConfig};
pub use entry::{FileAttributes, FileKind, RemoteFileEntry, Signature};
pub use identity::{detect_change, Capabilities, CardIdentity, ChangeResult};
pub use link::{LinkProbe, SsidProbe};
pub use retry::RetryPolicy;
pub use traits::CardApi;
