//! Configuration management for the time machine.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every operation works on an immutable [`Settings`] snapshot; callers obtain
//! a fresh one from [`ConfigLoader::load`] when they start an operation.

use crate::utils::errors::{Result, TimeMachineError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage shape used for new snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Content-addressed revision history (one git repository per backup root)
    #[serde(alias = "git")]
    History,
    /// Timestamped directory copies
    #[default]
    Folder,
}

impl std::str::FromStr for BackendMode {
    type Err = TimeMachineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "history" | "git" => Ok(BackendMode::History),
            "folder" => Ok(BackendMode::Folder),
            other => Err(TimeMachineError::Config(format!("unknown backup mode: {other}"))),
        }
    }
}

/// Which parts of the live tree the change watcher observes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WatchSelector {
    Config,
    Lovelace,
    Esphome,
    Packages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub mode: BackendMode,

    /// Live configuration directory
    #[serde(default = "default_live_config_path")]
    pub live_config_path: PathBuf,

    /// Root of the backup store
    #[serde(default = "default_backup_folder_path")]
    pub backup_folder_path: PathBuf,

    #[serde(default)]
    pub max_backups_enabled: bool,

    #[serde(default = "default_max_backups_count")]
    pub max_backups_count: usize,

    /// IANA timezone used for folder names (local time when unset)
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,

    #[serde(default = "default_watched_paths")]
    pub paths: Vec<WatchSelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Back up the ESPHome device definitions subtree
    #[serde(default)]
    pub esphome: bool,

    /// Back up the packages subtree
    #[serde(default)]
    pub packages: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// Set from `SUPERVISOR_TOKEN` when running as an addon
    #[serde(skip)]
    pub supervisor_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Persistent state (schedule file)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_live_config_path() -> PathBuf {
    PathBuf::from("/config")
}

fn default_backup_folder_path() -> PathBuf {
    PathBuf::from("/media/timemachine")
}

fn default_max_backups_count() -> usize {
    100
}

fn default_debounce_seconds() -> u64 {
    60
}

fn default_watched_paths() -> Vec<WatchSelector> {
    vec![
        WatchSelector::Config,
        WatchSelector::Lovelace,
        WatchSelector::Esphome,
        WatchSelector::Packages,
    ]
}

fn default_port() -> u16 {
    54000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/homeassistant-time-machine")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            live_config_path: default_live_config_path(),
            backup_folder_path: default_backup_folder_path(),
            max_backups_enabled: false,
            max_backups_count: default_max_backups_count(),
            timezone: None,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_seconds: default_debounce_seconds(),
            paths: default_watched_paths(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            backup: BackupConfig::default(),
            watch: WatchConfig::default(),
            features: FeatureConfig::default(),
            home_assistant: HomeAssistantConfig::default(),
            server: ServerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text without applying environment overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TimeMachineError::Config(e.to_string()))
    }

    /// Apply environment variable overrides in place.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("LIVE_CONFIG_PATH") {
            self.backup.live_config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BACKUP_FOLDER_PATH") {
            self.backup.backup_folder_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BACKUP_MODE") {
            self.backup.mode = v.parse()?;
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let (Ok(url), Ok(token)) = (
            std::env::var("HOME_ASSISTANT_URL"),
            std::env::var("LONG_LIVED_ACCESS_TOKEN"),
        ) {
            self.home_assistant.url = Some(url);
            self.home_assistant.token = Some(token);
        }
        self.home_assistant.supervisor_token = std::env::var("SUPERVISOR_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        Ok(())
    }

    /// Whether the upstream platform's reload API could be called.
    pub fn reload_credentials_configured(&self) -> bool {
        self.home_assistant.supervisor_token.is_some()
            || (self.home_assistant.url.is_some() && self.home_assistant.token.is_some())
    }

    /// Location of the persisted schedule document.
    pub fn schedule_file(&self) -> PathBuf {
        self.server.data_dir.join("scheduled-jobs.json")
    }

    /// Debounce window for the change watcher.
    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.watch.debounce_seconds.max(1))
    }
}

pub const DEFAULT_CONFIG_PATH: &str = "/data/timemachine.toml";

/// Re-reads the configuration file on every [`load`](ConfigLoader::load).
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Resolve the file path from the explicit argument, `TIMEMACHINE_CONFIG`,
    /// or [`DEFAULT_CONFIG_PATH`], in that order.
    pub fn from_args(path: Option<PathBuf>) -> Self {
        let _ = dotenvy::dotenv();
        let path = path
            .or_else(|| std::env::var("TIMEMACHINE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self { path: Some(path) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Produce a fresh settings snapshot.
    ///
    /// A configured but missing file falls back to defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(&self) -> Result<Settings> {
        let mut settings = match &self.path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                Settings::from_toml(&content)?
            }
            Some(path) => {
                tracing::debug!(path = %path.display(), "No settings file found, using defaults");
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.backup.mode, BackendMode::Folder);
        assert_eq!(settings.backup.live_config_path, PathBuf::from("/config"));
        assert_eq!(settings.watch.debounce_seconds, 60);
        assert_eq!(settings.watch.paths.len(), 4);
        assert!(!settings.features.esphome);
    }

    #[test]
    fn test_partial_toml() {
        let settings = Settings::from_toml(
            r#"
            [backup]
            mode = "git"
            backup_folder_path = "/backups"
            max_backups_enabled = true
            max_backups_count = 5

            [watch]
            enabled = true
            paths = ["config", "lovelace"]

            [features]
            packages = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.backup.mode, BackendMode::History);
        assert_eq!(settings.backup.backup_folder_path, PathBuf::from("/backups"));
        assert_eq!(settings.backup.max_backups_count, 5);
        assert_eq!(settings.watch.paths, vec![WatchSelector::Config, WatchSelector::Lovelace]);
        assert_eq!(settings.watch.debounce_seconds, 60);
        assert!(settings.features.packages);
        assert!(!settings.features.esphome);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Settings::from_toml("[backup\nmode=").unwrap_err();
        assert!(matches!(err, TimeMachineError::Config(_)));
    }

    #[test]
    fn test_loader_rereads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("timemachine.toml");
        std::fs::write(&path, "[watch]\ndebounce_seconds = 5\n").unwrap();

        let loader = ConfigLoader::new(Some(path.clone()));
        assert_eq!(loader.load().unwrap().watch.debounce_seconds, 5);

        std::fs::write(&path, "[watch]\ndebounce_seconds = 9\n").unwrap();
        assert_eq!(loader.load().unwrap().watch.debounce_seconds, 9);
    }

    #[test]
    fn test_backend_mode_parse() {
        assert_eq!("git".parse::<BackendMode>().unwrap(), BackendMode::History);
        assert_eq!("Folder".parse::<BackendMode>().unwrap(), BackendMode::Folder);
        assert!("tape".parse::<BackendMode>().is_err());
    }
}
