//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. FINGERLOCK_CONFIG environment variable
//! 3. Default: ~/.fingerlock/config.toml
//!
//! Every key is optional; a missing file means defaults.

use crate::domain::types::PlatformSetting;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "FINGERLOCK_CONFIG";
const CONFIG_DIR_NAME: &str = ".fingerlock";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// What happens after `max_attempts` failed unlock attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockoutMode {
    /// Ignore input for the cool-down, then re-arm the challenge
    #[default]
    Rearm,
    /// Re-issue the OS lock and double the cool-down per consecutive lockout
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_lock_delay_seconds")]
    pub lock_delay_seconds: u64,
    #[serde(default)]
    pub platform_lock: PlatformSetting,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Treat a lock command that is still running at its timeout as a success
    #[serde(default = "default_true")]
    pub timeout_as_success: bool,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            lock_delay_seconds: default_lock_delay_seconds(),
            platform_lock: PlatformSetting::Auto,
            tick_interval_ms: default_tick_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            timeout_as_success: true,
        }
    }
}

fn default_lock_delay_seconds() -> u64 {
    10
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_stability_delay_ms")]
    pub stability_delay_ms: u64,
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    #[serde(default)]
    pub lockout_policy: LockoutMode,
    #[serde(default = "default_lockout_cooldown_secs")]
    pub lockout_cooldown_secs: u64,
    #[serde(default = "default_lockout_max_cooldown_secs")]
    pub lockout_max_cooldown_secs: u64,
    #[serde(default = "default_true")]
    pub constant_time_compare: bool,
    /// Read-only credential override; takes precedence over the credential file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_hash: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stability_delay_ms: default_stability_delay_ms(),
            min_points: default_min_points(),
            lockout_policy: LockoutMode::Rearm,
            lockout_cooldown_secs: default_lockout_cooldown_secs(),
            lockout_max_cooldown_secs: default_lockout_max_cooldown_secs(),
            constant_time_compare: true,
            pattern_hash: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stability_delay_ms() -> u64 {
    150
}

fn default_min_points() -> usize {
    3
}

fn default_lockout_cooldown_secs() -> u64 {
    30
}

fn default_lockout_max_cooldown_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorsSection {
    #[serde(default = "default_true")]
    pub input_listener: bool,
    #[serde(default)]
    pub input_devices: bool,
    #[serde(default = "default_input_device_dir")]
    pub input_device_dir: String,
    #[serde(default = "default_true")]
    pub feed_enabled: bool,
    #[serde(default = "default_feed_bind")]
    pub feed_bind: String,
}

impl Default for SensorsSection {
    fn default() -> Self {
        Self {
            input_listener: true,
            input_devices: false,
            input_device_dir: default_input_device_dir(),
            feed_enabled: true,
            feed_bind: default_feed_bind(),
        }
    }
}

fn default_input_device_dir() -> String {
    "/dev/input".to_string()
}

fn default_feed_bind() -> String {
    "127.0.0.1:47800".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub sensors: SensorsSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    lock_delay_seconds: u64,
    platform_lock: PlatformSetting,
    tick_interval_ms: u64,
    command_timeout_ms: u64,
    timeout_as_success: bool,
    max_attempts: u32,
    stability_delay_ms: u64,
    min_points: usize,
    lockout_policy: LockoutMode,
    lockout_cooldown_secs: u64,
    lockout_max_cooldown_secs: u64,
    constant_time_compare: bool,
    pattern_hash: Option<String>,
    input_listener: bool,
    input_devices: bool,
    input_device_dir: String,
    feed_enabled: bool,
    feed_bind: String,
    log_path: PathBuf,
    credential_path: PathBuf,
    status_path: PathBuf,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    /// Directory holding the default config, credential, status and log files
    pub fn default_dir() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(CONFIG_DIR_NAME)
    }

    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }

        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        Self::default_dir().join(CONFIG_FILE_NAME)
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let dir = Self::default_dir();
        let path_or = |value: Option<String>, file: &str| {
            value.map(PathBuf::from).unwrap_or_else(|| dir.join(file))
        };

        Self {
            lock_delay_seconds: toml_config.lock.lock_delay_seconds,
            platform_lock: toml_config.lock.platform_lock,
            tick_interval_ms: toml_config.lock.tick_interval_ms,
            command_timeout_ms: toml_config.lock.command_timeout_ms,
            timeout_as_success: toml_config.lock.timeout_as_success,
            max_attempts: toml_config.auth.max_attempts,
            stability_delay_ms: toml_config.auth.stability_delay_ms,
            min_points: toml_config.auth.min_points,
            lockout_policy: toml_config.auth.lockout_policy,
            lockout_cooldown_secs: toml_config.auth.lockout_cooldown_secs,
            lockout_max_cooldown_secs: toml_config.auth.lockout_max_cooldown_secs,
            constant_time_compare: toml_config.auth.constant_time_compare,
            pattern_hash: toml_config.auth.pattern_hash.filter(|h| !h.trim().is_empty()),
            input_listener: toml_config.sensors.input_listener,
            input_devices: toml_config.sensors.input_devices,
            input_device_dir: toml_config.sensors.input_device_dir,
            feed_enabled: toml_config.sensors.feed_enabled,
            feed_bind: toml_config.sensors.feed_bind,
            log_path: path_or(toml_config.paths.log_path, "fingerlock.log"),
            credential_path: path_or(toml_config.paths.credential_path, "credential.toml"),
            status_path: path_or(toml_config.paths.status_path, "status.json"),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }

        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Reject values the lock loop cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_delay_seconds < 1 {
            return Err(ConfigError::Invalid {
                field: "lock_delay_seconds",
                reason: "must be >= 1".to_string(),
            });
        }
        if !(50..=1000).contains(&self.tick_interval_ms) {
            return Err(ConfigError::Invalid {
                field: "tick_interval_ms",
                reason: format!("{} is outside 50..=1000", self.tick_interval_ms),
            });
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "command_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.min_points < 3 {
            return Err(ConfigError::Invalid {
                field: "min_points",
                reason: "patterns need at least 3 zones".to_string(),
            });
        }
        if self.lockout_max_cooldown_secs < self.lockout_cooldown_secs {
            return Err(ConfigError::Invalid {
                field: "lockout_max_cooldown_secs",
                reason: "must be >= lockout_cooldown_secs".to_string(),
            });
        }
        if let Some(hash) = &self.pattern_hash {
            let valid = hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::Invalid {
                    field: "pattern_hash",
                    reason: "expected 64 hex characters".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Render the effective configuration back to TOML
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        let toml_config = TomlConfig {
            lock: LockSection {
                lock_delay_seconds: self.lock_delay_seconds,
                platform_lock: self.platform_lock,
                tick_interval_ms: self.tick_interval_ms,
                command_timeout_ms: self.command_timeout_ms,
                timeout_as_success: self.timeout_as_success,
            },
            auth: AuthSection {
                max_attempts: self.max_attempts,
                stability_delay_ms: self.stability_delay_ms,
                min_points: self.min_points,
                lockout_policy: self.lockout_policy,
                lockout_cooldown_secs: self.lockout_cooldown_secs,
                lockout_max_cooldown_secs: self.lockout_max_cooldown_secs,
                constant_time_compare: self.constant_time_compare,
                pattern_hash: self.pattern_hash.clone(),
            },
            sensors: SensorsSection {
                input_listener: self.input_listener,
                input_devices: self.input_devices,
                input_device_dir: self.input_device_dir.clone(),
                feed_enabled: self.feed_enabled,
                feed_bind: self.feed_bind.clone(),
            },
            paths: PathsSection {
                log_path: Some(self.log_path.display().to_string()),
                credential_path: Some(self.credential_path.display().to_string()),
                status_path: Some(self.status_path.display().to_string()),
            },
            metrics: MetricsSection { interval_secs: self.metrics_interval_secs },
        };
        toml::to_string_pretty(&toml_config).context("Failed to render config")
    }

    // Getters for all config fields
    pub fn lock_delay_seconds(&self) -> u64 {
        self.lock_delay_seconds
    }

    pub fn lock_delay(&self) -> Duration {
        Duration::from_secs(self.lock_delay_seconds)
    }

    pub fn platform_lock(&self) -> PlatformSetting {
        self.platform_lock
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn timeout_as_success(&self) -> bool {
        self.timeout_as_success
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn stability_delay(&self) -> Duration {
        Duration::from_millis(self.stability_delay_ms)
    }

    pub fn min_points(&self) -> usize {
        self.min_points
    }

    pub fn lockout_policy(&self) -> LockoutMode {
        self.lockout_policy
    }

    pub fn lockout_cooldown(&self) -> Duration {
        Duration::from_secs(self.lockout_cooldown_secs)
    }

    pub fn lockout_max_cooldown(&self) -> Duration {
        Duration::from_secs(self.lockout_max_cooldown_secs)
    }

    pub fn constant_time_compare(&self) -> bool {
        self.constant_time_compare
    }

    pub fn pattern_hash(&self) -> Option<&str> {
        self.pattern_hash.as_deref()
    }

    pub fn input_listener(&self) -> bool {
        self.input_listener
    }

    pub fn input_devices(&self) -> bool {
        self.input_devices
    }

    pub fn input_device_dir(&self) -> &str {
        &self.input_device_dir
    }

    pub fn feed_enabled(&self) -> bool {
        self.feed_enabled
    }

    pub fn feed_bind(&self) -> &str {
        &self.feed_bind
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn credential_path(&self) -> &Path {
        &self.credential_path
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder used for the `--delay` CLI override
    pub fn with_lock_delay_seconds(mut self, seconds: u64) -> Self {
        self.lock_delay_seconds = seconds;
        self
    }

    pub fn with_platform_lock(mut self, platform: PlatformSetting) -> Self {
        self.platform_lock = platform;
        self
    }

    #[cfg(test)]
    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.lock_delay_seconds(), 10);
        assert_eq!(config.platform_lock(), PlatformSetting::Auto);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.stability_delay(), Duration::from_millis(150));
        assert_eq!(config.min_points(), 3);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert!(config.timeout_as_success());
        assert_eq!(config.lockout_policy(), LockoutMode::Rearm);
        assert_eq!(config.pattern_hash(), None);
        assert!(config.log_path().ends_with("fingerlock.log"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_config_path_from_cli() {
        assert_eq!(
            Config::resolve_config_path(Some("/tmp/custom.toml")),
            PathBuf::from("/tmp/custom.toml")
        );
    }

    #[test]
    fn test_validate_rejects_zero_delay() {
        let config = Config::default().with_lock_delay_seconds(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "lock_delay_seconds", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_short_min_points() {
        let config = Config::default().with_min_points(2);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "min_points", .. })));
    }

    #[test]
    fn test_empty_pattern_hash_is_ignored() {
        let mut toml_config = TomlConfig::default();
        toml_config.auth.pattern_hash = Some("  ".to_string());
        let config = Config::from_toml(toml_config, "test".to_string());
        assert_eq!(config.pattern_hash(), None);
    }

    #[test]
    fn test_to_toml_round_trips_lock_section() {
        let config = Config::default()
            .with_lock_delay_seconds(42)
            .with_platform_lock(PlatformSetting::Linux);
        let rendered = config.to_toml_string().unwrap();
        let parsed: TomlConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.lock.lock_delay_seconds, 42);
        assert_eq!(parsed.lock.platform_lock, PlatformSetting::Linux);
    }
}
