//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pull photos and videos from a wireless SD card into a local folder
#[derive(Parser, Debug)]
#[command(name = "card-sync")]
#[command(version)]
#[command(about = "Copy new photos from a wireless SD card, once, without duplicates", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Destination folder for copied files (overrides config)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Card address, e.g. http://192.168.0.1/ (overrides config)
    #[arg(long, global = true)]
    pub card: Option<String>,

    /// Remote folder to copy from (overrides config)
    #[arg(long, global = true)]
    pub remote_path: Option<String>,

    /// Profile whose copy history is used (overrides config)
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Only copy JPEG files (overrides config)
    #[arg(long, global = true)]
    pub jpeg_only: Option<bool>,

    /// Delete originals from the card after copying (overrides config)
    #[arg(long, global = true)]
    pub delete_on_copy: Option<bool>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the card and copy new files once (default)
    Sync,

    /// Keep checking the card until Ctrl+C
    Watch {
        /// Seconds between checks (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Check the card and show what would be copied
    Check,

    /// Show the card's identity and capabilities
    Info,

    /// List every file on the card
    List {
        /// Folder to list (defaults to the configured remote path)
        path: Option<String>,
    },

    /// Show current configuration
    ShowConfig,

    /// Generate a configuration file at a specific location
    GenerateConfig {
        /// Where to write the config file (defaults to standard location)
        path: Option<PathBuf>,
    },

    /// Run a full sync against a simulated card (no hardware required)
    ///
    /// Files are copied into the given folder; the copy history lives in a
    /// `.card-sync` folder next to them so repeated runs show deduplication.
    Simulate {
        /// Destination folder for the simulated copy
        destination: PathBuf,

        /// Number of photos on the simulated card
        #[arg(short = 'n', long, default_value = "20")]
        photos: usize,

        /// Number of videos on the simulated card
        #[arg(long, default_value = "2")]
        videos: usize,

        /// Milliseconds to wait per 64 KiB chunk, to watch the progress bars
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Drop the connection halfway through this file (e.g. IMG_0003.JPG)
        #[arg(long, value_name = "FILE")]
        drop_at: Option<String>,
    },
}
