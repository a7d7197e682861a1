//! Command-line interface for the card synchronizer
//!
//! # Submodules
//!
//! - `args` - Command-line argument definitions using clap
//! - `commands` - Command handler implementations
//! - `progress` - Event rendering and CLI output utilities

pub mod args;
pub mod commands;
pub mod progress;

pub use args::{Args, Commands};
pub use commands::{apply_overrides, run_command};
pub use progress::{DualWriter, SyncRenderer};
