//! Command handler implementations
//!
//! This module contains the implementation of all CLI commands. Every
//! command that talks to a card runs on the tokio runtime built in `main`;
//! cycles are reported through a [`SyncRenderer`] on its own thread.

use crate::cli::progress::{
    print_error, print_header, print_info, print_success, print_warning, SyncRenderer,
};
use crate::cli::{Args, Commands};
use crate::core::config::{get_config_path, init_config, Config};
use crate::core::error::SyncError;
use crate::core::events::{format_bytes, EventSink};
use crate::core::orchestrator::{Orchestrator, StopHandle, SyncContext};
use crate::core::services::Services;
use crate::core::tracking::CopyStatus;
use crate::device::traits::CardApi;
use crate::device::{CardClient, SsidProbe};
use crate::testdb::mock_card::{FailureMode, MockCard};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, info};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Name of the folder holding the simulated card's copy history
const SIMULATION_STATE_DIR: &str = ".card-sync";

/// Apply command-line overrides to the loaded configuration
pub fn apply_overrides(args: &Args, config: &mut Config) {
    if let Some(output) = &args.output {
        config.output.destination = output.clone();
    }
    if let Some(card) = &args.card {
        config.card.remote_root = card.clone();
    }
    if let Some(remote_path) = &args.remote_path {
        config.card.remote_path = remote_path.clone();
    }
    if let Some(profile) = &args.profile {
        config.dedup.profile = profile.clone();
    }
    if let Some(jpeg_only) = args.jpeg_only {
        config.copy.jpeg_only = jpeg_only;
    }
    if let Some(delete) = args.delete_on_copy {
        config.copy.delete_on_copy = delete;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
}

/// Run the appropriate command based on CLI arguments
pub async fn run_command(args: &Args, config: Config, stop: StopHandle) -> Result<()> {
    match &args.command {
        None | Some(Commands::Sync) => sync_once(config, &stop).await,
        Some(Commands::Watch { interval }) => {
            let mut config = config;
            if let Some(secs) = interval {
                config.auto_check.interval_secs = (*secs).max(1);
            }
            watch(config, &stop).await
        }
        Some(Commands::Check) => check(config, &stop).await,
        Some(Commands::Info) => card_info(&config, &stop).await,
        Some(Commands::List { path }) => list_card(&config, path.as_deref(), &stop).await,
        Some(Commands::ShowConfig) => {
            show_config(&config);
            Ok(())
        }
        Some(Commands::GenerateConfig { path }) => generate_config_file(path.clone()),
        Some(Commands::Simulate {
            destination,
            photos,
            videos,
            delay_ms,
            drop_at,
        }) => {
            let options = SimulationOptions {
                destination: destination.clone(),
                photos: *photos,
                videos: *videos,
                delay: Duration::from_millis(*delay_ms),
                drop_at: drop_at.clone(),
            };
            simulate(config, options, &stop).await
        }
    }
}

// ============================================================================
// Card commands
// ============================================================================

/// HTTP client for the configured card, watching the link when asked to
async fn build_client(config: &Config, stop: &StopHandle) -> Result<CardClient> {
    let client = CardClient::new(config.card.client_config())?;
    if !config.card.monitor_link {
        return Ok(client);
    }

    let ssid = match &config.card.expected_ssid {
        Some(ssid) => ssid.clone(),
        None => client
            .ssid(&stop.begin_cycle())
            .await
            .context("Could not read the card's SSID for link monitoring")?,
    };
    debug!("Monitoring link to '{}'", ssid);
    Ok(client.with_link_probe(Arc::new(SsidProbe::new(ssid))))
}

/// Orchestrator plus the renderer listening to it
fn start<C: CardApi>(
    card: C,
    context: SyncContext,
    stop: &StopHandle,
) -> (Orchestrator<C>, SyncRenderer) {
    let services = Services::standard(&context.config().output.destination);
    let (events, receiver) = EventSink::channel();
    let renderer = SyncRenderer::spawn(receiver);
    let orchestrator =
        Orchestrator::new(card, context, services, events).with_stop_handle(stop.clone());
    (orchestrator, renderer)
}

/// `Ok(None)` for a stopped cycle, the error for anything else
fn settle<T>(result: crate::core::error::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SyncError::Canceled) => {
            print_warning("Stopped before the cycle finished");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_profile_stats<C: CardApi>(orchestrator: &Orchestrator<C>) {
    if let Some(profile) = orchestrator.context().profile() {
        let stats = profile.stats();
        print_info(&format!(
            "{} files ({}) copied with this profile so far",
            stats.total_files_copied,
            format_bytes(stats.total_bytes_copied)
        ));
    }
}

/// Check then copy once
pub async fn sync_once(config: Config, stop: &StopHandle) -> Result<()> {
    print_header("SYNC");
    info!("Destination: {}", config.output.destination.display());
    let client = build_client(&config, stop).await?;
    let context = SyncContext::new(config)?;
    let (mut orchestrator, renderer) = start(client, context, stop);

    let result = orchestrator.sync().await;
    print_profile_stats(&orchestrator);
    drop(orchestrator);
    renderer.finish();

    if let Some(report) = settle(result)? {
        if report.check.queued == 0 {
            print_success("Nothing new on the card");
        } else {
            print_success(&format!("Copied {} of {} files", report.copy.copied, report.check.queued));
        }
    }
    Ok(())
}

/// Auto-check loop until Ctrl+C
pub async fn watch(config: Config, stop: &StopHandle) -> Result<()> {
    print_header("WATCH");
    print_info(&format!(
        "Checking the card every {}s. Press Ctrl+C to stop.",
        config.auto_check.interval_secs
    ));
    let client = build_client(&config, stop).await?;
    let context = SyncContext::new(config)?;
    let (mut orchestrator, renderer) = start(client, context, stop);

    let result = orchestrator.run_auto().await;
    print_profile_stats(&orchestrator);
    drop(orchestrator);
    renderer.finish();

    settle(result)?;
    Ok(())
}

/// Check only, then print the queue
pub async fn check(config: Config, stop: &StopHandle) -> Result<()> {
    print_header("CHECK");
    let client = build_client(&config, stop).await?;
    let context = SyncContext::new(config)?;
    let (mut orchestrator, renderer) = start(client, context, stop);

    let result = orchestrator.check().await;
    let queued: Vec<String> = orchestrator
        .tracked()
        .iter()
        .filter(|item| item.status() == CopyStatus::ToBeCopied)
        .map(|item| {
            format!(
                "{}  {:>10}  {}",
                item.entry().date().format("%Y-%m-%d %H:%M:%S"),
                format_bytes(item.size()),
                item.entry().file_path()
            )
        })
        .collect();
    drop(orchestrator);
    renderer.finish();

    if settle(result)?.is_some() {
        println!();
        if queued.is_empty() {
            print_success("Nothing to copy");
        }
        for line in queued {
            println!("  {}", line);
        }
    }
    Ok(())
}

/// Probe and print the card's identity
pub async fn card_info(config: &Config, stop: &StopHandle) -> Result<()> {
    let client = CardClient::new(config.card.client_config())?;
    let identity = client.probe_identity(&stop.begin_cycle()).await?;
    let capabilities = identity.capabilities();

    print_header("CARD");
    println!("  Address:          {}", config.card.remote_root);
    println!("  Firmware:         {}", identity.firmware_version);
    println!("  SSID:             {}", identity.ssid);
    println!(
        "  CID:              {}",
        identity.usable_cid().unwrap_or("(not available)")
    );
    if let Some(capacity) = identity.capacity {
        println!(
            "  Free space:       {} of {}",
            format_bytes(capacity.free_bytes),
            format_bytes(capacity.total_bytes)
        );
    }
    if let Some(enabled) = identity.upload_enabled {
        println!("  Upload/delete:    {}", if enabled { "enabled" } else { "disabled" });
    }
    println!();
    println!("  Capabilities:");
    println!("    CID               {}", capabilities.can_get_cid);
    println!("    capacity          {}", capabilities.can_get_capacity);
    println!("    write timestamp   {}", capabilities.can_get_write_timestamp);
    println!("    upload flag       {}", capabilities.can_get_upload);
    Ok(())
}

/// Print every file below `path`, unfiltered
pub async fn list_card(config: &Config, path: Option<&str>, stop: &StopHandle) -> Result<()> {
    let client = CardClient::new(config.card.client_config())?;
    let cancel = stop.begin_cycle();
    let root = path.unwrap_or(&config.card.remote_path).to_string();

    let mut pending = vec![root];
    let mut files = 0usize;
    let mut bytes = 0u64;
    while let Some(directory) = pending.pop() {
        for entry in client.list_directory(&directory, &cancel).await? {
            if entry.is_directory() {
                println!("  {:<50} <dir>", entry.file_path());
                pending.push(entry.file_path());
                continue;
            }
            files += 1;
            bytes += entry.size();
            println!(
                "  {:<50} {:>10}  {}",
                entry.file_path(),
                format_bytes(entry.size()),
                entry.date().format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    println!();
    print_info(&format!("{} files, {}", files, format_bytes(bytes)));
    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

/// Settings for `card-sync simulate`
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub destination: PathBuf,
    pub photos: usize,
    pub videos: usize,
    pub delay: Duration,
    /// File name that loses the connection halfway
    pub drop_at: Option<String>,
}

/// In-memory card with the requested content
pub fn simulated_card(options: &SimulationOptions) -> MockCard {
    const FOLDER: &str = "/DCIM/100CANON";

    let mut builder = MockCard::builder().jpegs(FOLDER, options.photos);
    let base = NaiveDate::from_ymd_opt(2024, 1, 2)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap_or_default();
    for i in 0..options.videos {
        let date = base + chrono::Duration::minutes(i as i64);
        builder = builder.file(FOLDER, &format!("MVI_{:04}.MOV", i + 1), date);
    }
    // card housekeeping that is never copied
    builder = builder.file("/DCIM/100__TSB", "FA000001.JPG", base);

    if !options.delay.is_zero() {
        builder = builder.transfer_delay(options.delay);
    }
    if let Some(name) = &options.drop_at {
        builder = builder.fail(&format!("{}/{}", FOLDER, name), FailureMode::DropConnection);
    }
    builder.build()
}

/// Full sync against a simulated card
pub async fn simulate(config: Config, options: SimulationOptions, stop: &StopHandle) -> Result<()> {
    print_header("SIMULATED SYNC");
    let mut config = config;
    config.output.destination = options.destination.clone();
    fs::create_dir_all(&options.destination).with_context(|| {
        format!("Failed to create {}", options.destination.display())
    })?;

    let state_dir = options.destination.join(SIMULATION_STATE_DIR);
    print_info(&format!(
        "Simulated card: {} photos, {} videos",
        options.photos, options.videos
    ));
    print_info(&format!("Copy history: {}", state_dir.display()));

    let card = simulated_card(&options);
    let context = SyncContext::with_profile_dir(config, Some(state_dir))?;
    let (mut orchestrator, renderer) = start(card, context, stop);

    let result = orchestrator.sync().await;
    let stats = orchestrator.card().stats();
    drop(orchestrator);
    renderer.finish();

    match settle(result) {
        Ok(Some(report)) => {
            print_success(&format!(
                "Copied {} files, {} skipped as copied before",
                report.copy.copied, report.check.once_copied
            ));
            if let Some(thumbnails) = report.thumbnails {
                print_info(&format!("{} thumbnails loaded", thumbnails.loaded));
            }
        }
        Ok(None) => {}
        Err(e) => print_error(&format!("Simulated sync failed: {}", e)),
    }
    print_info(&format!(
        "Card requests: {} listings, {} downloads, {} thumbnails",
        stats.list_requests, stats.downloads, stats.thumbnail_requests
    ));
    Ok(())
}

// ============================================================================
// Configuration commands
// ============================================================================

/// Generate a configuration file at the specified or default location
pub fn generate_config_file(output: Option<PathBuf>) -> Result<()> {
    let output_path = match output {
        Some(path) => {
            fs::write(&path, Config::generate_default_config())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            path
        }
        None => init_config()?,
    };

    info!("Configuration file: {}", output_path.display());
    info!("Edit this file to point the tool at your card and destination folder.");
    Ok(())
}

/// Show the current configuration settings
pub fn show_config(config: &Config) {
    let config_path = Config::get_active_config_path();
    info!("Configuration file: {}", config_path.display());
    if !config_path.exists() {
        info!("(Using default settings - no config file found)");
        if let Some(path) = get_config_path() {
            info!("Run 'card-sync generate-config' to create {}", path.display());
        }
    }
    info!("");
    info!("[card]");
    info!("  remote_root = \"{}\"", config.card.remote_root);
    info!("  remote_path = \"{}\"", config.card.remote_path);
    info!("  timeout_secs = {}", config.card.timeout_secs);
    info!("  monitor_link = {}", config.card.monitor_link);
    info!("  monitor_interval_secs = {}", config.card.monitor_interval_secs);
    info!(
        "  expected_ssid = {:?}",
        config.card.expected_ssid.as_deref().unwrap_or("(card's SSID)")
    );
    info!("  max_retries = {}", config.card.max_retries);
    info!("  retry_backoff_ms = {}", config.card.retry_backoff_ms);
    info!("  excluded_folders = {:?}", config.card.excluded_folders);
    info!("");
    info!("[output]");
    info!("  destination = \"{}\"", config.output.destination.display());
    info!("  create_dated_folder = {}", config.output.create_dated_folder);
    info!("  dated_folder_format = \"{}\"", config.output.dated_folder_format);
    info!("  do_not_overwrite = {}", config.output.do_not_overwrite);
    info!("");
    info!("[copy]");
    info!("  jpeg_only = {}", config.copy.jpeg_only);
    info!("  skip_once_copied = {}", config.copy.skip_once_copied);
    info!("  delete_on_copy = {}", config.copy.delete_on_copy);
    info!(
        "  recycle_on_remote_delete = {}",
        config.copy.recycle_on_remote_delete
    );
    info!("  load_thumbnails = {}", config.copy.load_thumbnails);
    info!("");
    info!("[auto_check]");
    info!("  interval_secs = {}", config.auto_check.interval_secs);
    info!(
        "  full_check_ceiling_secs = {}",
        config.auto_check.full_check_ceiling_secs
    );
    info!(
        "  failure_backoff_secs = {}",
        config.auto_check.failure_backoff_secs
    );
    info!("");
    info!("[dedup]");
    info!("  enabled = {}", config.dedup.enabled);
    info!("  max_count = {}", config.dedup.max_count);
    info!("  profile = \"{}\"", config.dedup.profile);
    match config.dedup.profile_dir() {
        Some(dir) => info!("  # profile data in {}", dir.display()),
        None => info!("  # no data directory available"),
    }
    info!("");
    info!("[logging]");
    info!("  level = \"{}\"", config.logging.level);
    info!("  log_to_file = {}", config.logging.log_to_file);
    info!("  log_file = \"{}\"", config.logging.log_file.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_apply() {
        let args = Args::parse_from([
            "card-sync",
            "--output",
            "/photos",
            "--card",
            "http://192.168.0.1/",
            "--profile",
            "travel",
            "--delete-on-copy",
            "true",
        ]);
        let mut config = Config::default();
        apply_overrides(&args, &mut config);

        assert_eq!(config.output.destination, PathBuf::from("/photos"));
        assert_eq!(config.card.remote_root, "http://192.168.0.1/");
        assert_eq!(config.dedup.profile, "travel");
        assert!(config.copy.delete_on_copy);
        assert!(!config.copy.jpeg_only);
    }

    #[test]
    fn test_simulated_card_content() {
        let options = SimulationOptions {
            destination: PathBuf::from("out"),
            photos: 3,
            videos: 1,
            delay: Duration::ZERO,
            drop_at: None,
        };
        let card = simulated_card(&options);
        assert_eq!(card.entries().len(), 5);
        assert!(card.contains("/DCIM/100CANON/MVI_0001.MOV"));
    }

    #[tokio::test]
    async fn test_simulate_copies_then_skips() {
        let dir = TempDir::new().unwrap();
        let options = SimulationOptions {
            destination: dir.path().join("photos"),
            photos: 3,
            videos: 1,
            delay: Duration::ZERO,
            drop_at: None,
        };
        let stop = StopHandle::new();

        simulate(Config::default(), options.clone(), &stop).await.unwrap();
        assert!(options.destination.join("IMG_0003.JPG").exists());
        assert!(options.destination.join("MVI_0001.MOV").exists());
        assert!(!options.destination.join("FA000001.JPG").exists());
        assert!(options.destination.join(SIMULATION_STATE_DIR).join("copied.sig").exists());

        simulate(Config::default(), options, &stop).await.unwrap();
    }

    #[test]
    fn test_generate_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        generate_config_file(Some(path.clone())).unwrap();
        assert!(Config::load(&path).is_ok());
    }
}
