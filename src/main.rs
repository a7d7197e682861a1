//! Wireless card sync - CLI Entry Point
//!
//! Pulls new photos and videos from a wireless SD card over HTTP into a
//! local folder, once per file, and optionally clears them from the card.
//!
//! This binary is a thin wrapper around the library, handling argument parsing,
//! logging setup, Ctrl+C and the async runtime.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use std::fs::OpenOptions;
use std::io::Write;
use wifi_card_sync::cli::{self, Args, DualWriter};
use wifi_card_sync::core::config::Config;
use wifi_card_sync::core::orchestrator::StopHandle;

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(ref config_path) = args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Warning: Failed to load config file: {}", e);
                Config::default()
            }
        }
    } else {
        Config::load_default().unwrap_or_default()
    };
    cli::apply_overrides(&args, &mut config);

    // First Ctrl+C stops the current cycle, the second one exits
    let stop = StopHandle::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if handler_stop.is_stopped() {
            eprintln!("\nForce shutdown requested. Exiting immediately...");
            std::process::exit(1);
        }
        handler_stop.stop();
        eprintln!("\nStopping... (Press Ctrl+C again to force quit)");
    })
    .context("Failed to set Ctrl+C handler")?;

    // Initialize logger
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    if config.logging.log_to_file {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.log_file)
            .with_context(|| {
                format!("Failed to open log file {}", config.logging.log_file.display())
            })?;

        Builder::new()
            .filter_level(log_level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {} {}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .target(env_logger::Target::Pipe(Box::new(DualWriter {
                console: std::io::stderr(),
                file: log_file,
            })))
            .init();

        info!("Logging to file: {}", config.logging.log_file.display());
    } else {
        Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level))
            .init();
    }

    info!("{} v{}", wifi_card_sync::NAME, wifi_card_sync::VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(cli::run_command(&args, config, stop))
}
