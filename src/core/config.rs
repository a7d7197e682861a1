//! Configuration module for the card synchronizer
//!
//! Supports loading configuration from a TOML file.
//! Configuration is stored in a standard location:
//! - Windows: %APPDATA%\wifi_card_sync\config.toml
//! - Linux: ~/.config/wifi_card_sync/config.toml
//! - macOS: ~/Library/Application Support/wifi_card_sync/config.toml

use crate::device::client::{ClientConfig, DEFAULT_REMOTE_ROOT};
use crate::device::retry::RetryPolicy;
use crate::duplicate::signatures::DEFAULT_MAX_COUNT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config and data directories
pub const APP_NAME: &str = "wifi_card_sync";

/// Default config file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config files looked up in the current directory, in order
const LOCAL_CONFIG_FILES: &[&str] = &["./config.toml", "./card_sync.toml"];

/// Get the standard configuration directory for the application.
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

/// Get the standard configuration file path.
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Get the directory holding per-card profile state
pub fn get_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_NAME))
}

/// Ensure the configuration directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let config_dir = get_config_dir().ok_or(ConfigError::ConfigDirNotFound)?;

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .map_err(|e| ConfigError::WriteError(config_dir.clone(), e.to_string()))?;
    }

    Ok(config_dir)
}

/// Initialize the configuration file if it doesn't exist.
///
/// Creates the config directory and copies the default config template.
/// Returns the path to the config file.
pub fn init_config() -> Result<PathBuf, ConfigError> {
    let config_dir = ensure_config_dir()?;
    let config_path = config_dir.join(CONFIG_FILE_NAME);

    if !config_path.exists() {
        let default_config = Config::generate_default_config();
        fs::write(&config_path, default_config)
            .map_err(|e| ConfigError::WriteError(config_path.clone(), e.to_string()))?;
    }

    Ok(config_path)
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Card connection settings
    pub card: CardConfig,

    /// Where and how copied files are written
    pub output: OutputConfig,

    /// What gets copied and what happens afterwards
    pub copy: CopyConfig,

    /// Periodic re-check settings
    pub auto_check: AutoCheckConfig,

    /// Copy-signature store settings
    pub dedup: DedupConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Card connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    /// Base URL of the card
    pub remote_root: String,

    /// Folder on the card to synchronize (recursively)
    pub remote_path: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Check that the card's network is still joined during transfers
    pub monitor_link: bool,

    /// Seconds between two link checks
    pub monitor_interval_secs: u64,

    /// SSID to watch; defaults to the SSID the card reports
    pub expected_ssid: Option<String>,

    /// Retries after a refused request
    pub max_retries: u32,

    /// Pause between retries in milliseconds
    pub retry_backoff_ms: u64,

    /// Folder names on the card that are never listed
    pub excluded_folders: Vec<String>,
}

/// Output directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Local destination folder
    pub destination: PathBuf,

    /// Put files into a folder named after their date
    pub create_dated_folder: bool,

    /// chrono format for the dated folder name
    pub dated_folder_format: String,

    /// Never overwrite a different local file; add `_N` to the name instead
    pub do_not_overwrite: bool,
}

/// Copy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Only JPEG files are listed and copied
    pub jpeg_only: bool,

    /// Do not copy files whose signature says they were copied before
    pub skip_once_copied: bool,

    /// Delete the original from the card after a successful copy
    pub delete_on_copy: bool,

    /// Move local copies to the trash when their original leaves the card
    pub recycle_on_remote_delete: bool,

    /// Fetch thumbnails after each check
    pub load_thumbnails: bool,
}

/// Auto-check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCheckConfig {
    /// Seconds between two checks
    pub interval_secs: u64,

    /// Longest time between two full checks, in seconds
    pub full_check_ceiling_secs: u64,

    /// Seconds to wait after a failed check
    pub failure_backoff_secs: u64,
}

/// Copy-signature store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Remember copied files across runs
    pub enabled: bool,

    /// Number of signatures kept
    pub max_count: usize,

    /// Profile name; each profile has its own store and card state
    pub profile: String,

    /// Override for the profile data directory
    pub data_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log to file
    pub log_to_file: bool,

    /// Log file path
    pub log_file: PathBuf,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            remote_path: "/DCIM".to_string(),
            timeout_secs: 10,
            monitor_link: true,
            monitor_interval_secs: 2,
            expected_ssid: None,
            max_retries: 3,
            retry_backoff_ms: 500,
            excluded_folders: vec![
                "SD_WLAN".to_string(),
                "100__TSB".to_string(),
                "GUPIXINF".to_string(),
            ],
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("./card_photos"),
            create_dated_folder: false,
            dated_folder_format: "%Y%m%d".to_string(),
            do_not_overwrite: true,
        }
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            jpeg_only: false,
            skip_once_copied: true,
            delete_on_copy: false,
            recycle_on_remote_delete: false,
            load_thumbnails: true,
        }
    }
}

impl Default for AutoCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            full_check_ceiling_secs: 600,
            failure_backoff_secs: 60,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_count: DEFAULT_MAX_COUNT,
            profile: "default".to_string(),
            data_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: PathBuf::from("./card_sync.log"),
        }
    }
}

impl CardConfig {
    /// Settings for the protocol client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            remote_root: self.remote_root.clone(),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }

    /// Whether a folder of this name is skipped when listing
    pub fn is_excluded(&self, folder_name: &str) -> bool {
        self.excluded_folders
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(folder_name))
    }
}

impl DedupConfig {
    /// Directory holding this profile's signature store and card state
    pub fn profile_dir(&self) -> Option<PathBuf> {
        let base = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => get_data_dir()?,
        };
        Some(base.join("profiles").join(&self.profile))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;

        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./config.toml (current directory - for development/override)
    /// 2. ./card_sync.toml (current directory - alternative name)
    /// 3. Standard config location
    ///
    /// If no config file is found, returns default configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        for path in LOCAL_CONFIG_FILES {
            let path = Path::new(path);
            if path.exists() {
                return Self::load(path);
            }
        }

        if let Some(config_path) = get_config_path() {
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        Ok(Self::default())
    }

    /// Get the path where the config file is (or would be) located.
    pub fn get_active_config_path() -> PathBuf {
        for path in LOCAL_CONFIG_FILES {
            let path = Path::new(path);
            if path.exists() {
                return path.to_path_buf();
            }
        }

        get_config_path().unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::WriteError(path.as_ref().to_path_buf(), e.to_string()))?;

        Ok(())
    }

    /// Generate a default config file with comments
    /// This uses the example config file to ensure it stays up to date
    pub fn generate_default_config() -> String {
        include_str!("../../config.example.toml").to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file was not found at the specified path
    FileNotFound(PathBuf),
    /// Failed to read the configuration file
    ReadError(PathBuf, String),
    /// Failed to parse the configuration file (invalid TOML)
    ParseError(PathBuf, String),
    /// Failed to serialize configuration to TOML
    SerializeError(String),
    /// Failed to write configuration file
    WriteError(PathBuf, String),
    /// Could not determine config directory
    ConfigDirNotFound,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::ReadError(path, err) => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::ParseError(path, err) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::SerializeError(err) => {
                write!(f, "Failed to serialize configuration: {}", err)
            }
            ConfigError::WriteError(path, err) => {
                write!(
                    f,
                    "Failed to write config file '{}': {}",
                    path.display(),
                    err
                )
            }
            ConfigError::ConfigDirNotFound => {
                write!(f, "Could not determine configuration directory")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.card.remote_root, "http://flashair/");
        assert_eq!(config.card.remote_path, "/DCIM");
        assert_eq!(config.card.timeout_secs, 10);
        assert_eq!(config.auto_check.interval_secs, 30);
        assert_eq!(config.auto_check.full_check_ceiling_secs, 600);
        assert_eq!(config.auto_check.failure_backoff_secs, 60);
        assert_eq!(config.dedup.max_count, 10_000);
        assert!(config.output.do_not_overwrite);
        assert!(!config.copy.delete_on_copy);
    }

    #[test]
    fn test_example_config_parses_to_defaults() {
        let parsed: Config = toml::from_str(&Config::generate_default_config()).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.card.remote_root, defaults.card.remote_root);
        assert_eq!(parsed.card.excluded_folders, defaults.card.excluded_folders);
        assert_eq!(parsed.output.dated_folder_format, "%Y%m%d");
        assert_eq!(parsed.dedup.profile, "default");
        assert_eq!(parsed.copy.skip_once_copied, defaults.copy.skip_once_copied);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [card]
            remote_root = "http://192.168.0.1"

            [copy]
            jpeg_only = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.card.remote_root, "http://192.168.0.1");
        assert_eq!(parsed.card.remote_path, "/DCIM");
        assert!(parsed.copy.jpeg_only);
        assert!(parsed.copy.skip_once_copied);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.dedup.profile = "camera-b".to_string();
        config.card.expected_ssid = Some("flashair_b".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.dedup.profile, "camera-b");
        assert_eq!(loaded.card.expected_ssid.as_deref(), Some("flashair_b"));
    }

    #[test]
    fn test_load_missing_and_invalid() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::FileNotFound(_))
        ));

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[card\nremote_root = ").unwrap();
        let err = Config::load(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_, _)));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_client_config_and_exclusions() {
        let card = CardConfig::default();
        let client = card.client_config();
        assert_eq!(client.timeout, Duration::from_secs(10));
        assert_eq!(client.retry.max_retries, 3);
        assert_eq!(client.retry.backoff, Duration::from_millis(500));

        assert!(card.is_excluded("sd_wlan"));
        assert!(card.is_excluded("100__TSB"));
        assert!(!card.is_excluded("101CANON"));
    }

    #[test]
    fn test_profile_dir_override() {
        let dedup = DedupConfig {
            data_dir: Some(PathBuf::from("/data")),
            profile: "cam".to_string(),
            ..Default::default()
        };
        assert_eq!(
            dedup.profile_dir(),
            Some(PathBuf::from("/data").join("profiles").join("cam"))
        );
    }
}
