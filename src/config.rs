//! Engine configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MBOXSTORE_CONFIG` (environment variable)
//! 2. `~/.config/mboxstore/config.toml` (Linux/macOS)
//!    `%APPDATA%\mboxstore\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MboxError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Scanner tuning.
    pub scan: ScanConfig,
    /// Advisory locking.
    pub lock: LockConfig,
    /// Expunge / compaction.
    pub expunge: ExpungeConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Scanner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Read buffer size in bytes (default: 131072 = 128 KB).
    pub read_buffer_size: usize,
    /// Emit a progress event every this many lines.
    pub progress_every_lines: u64,
    /// Refresh the advisory lock every this many messages.
    pub touch_every_messages: usize,
    /// Header fields remembered per message for summary display.
    pub header_cache: Vec<String>,
    /// Number of messages whose cached header fields are kept.
    pub header_cache_size: usize,
}

/// Advisory locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How many times to retry a contended lock before giving up.
    pub retries: u32,
    /// Pause between retries, in milliseconds.
    pub retry_interval_ms: u64,
    /// Age after which a contended lock is reported as possibly abandoned.
    /// Locks are never broken; a dead holder's `flock` is already gone.
    pub expire_secs: u64,
    /// Suffix appended to the mailbox path to name the lock file.
    pub lock_file_suffix: String,
}

/// Expunge / compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpungeConfig {
    /// Directory for the spill file (default: system temp dir).
    pub temp_dir: Option<PathBuf>,
    /// Keep the spill file on disk if copying it back fails.
    pub keep_backup_on_failure: bool,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 128 * 1024, // 128 KB
            progress_every_lines: 1000,
            touch_every_messages: 50,
            header_cache: ["From", "Subject", "Date", "Message-ID"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            header_cache_size: 1024,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: 10,
            retry_interval_ms: 100,
            expire_secs: 600,
            lock_file_suffix: ".lock".to_string(),
        }
    }
}

impl Default for ExpungeConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            keep_backup_on_failure: true,
        }
    }
}

impl LockConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }
}

impl Config {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scan.read_buffer_size == 0 {
            return Err(MboxError::InvalidConfig(
                "scan.read_buffer_size must be non-zero".into(),
            ));
        }
        if self.scan.header_cache_size == 0 {
            return Err(MboxError::InvalidConfig(
                "scan.header_cache_size must be non-zero".into(),
            ));
        }
        if self.lock.lock_file_suffix.is_empty() {
            return Err(MboxError::InvalidConfig(
                "lock.lock_file_suffix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MBOXSTORE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mboxstore").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mboxstore")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mboxstore.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.scan.progress_every_lines, 1000);
        assert_eq!(cfg.lock.lock_file_suffix, ".lock");
        assert!(cfg.expunge.keep_backup_on_failure);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.scan.header_cache, cfg.scan.header_cache);
        assert_eq!(parsed.lock.retries, cfg.lock.retries);
        assert_eq!(parsed.scan.read_buffer_size, cfg.scan.read_buffer_size);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[lock]
retries = 2

[scan]
header_cache = ["Subject"]
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.lock.retries, 2);
        assert_eq!(cfg.scan.header_cache, vec!["Subject".to_string()]);
        // Other fields use defaults
        assert_eq!(cfg.lock.retry_interval_ms, 100);
        assert_eq!(cfg.scan.touch_every_messages, 50);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut cfg = Config::default();
        cfg.scan.read_buffer_size = 0;
        assert!(matches!(cfg.validate(), Err(MboxError::InvalidConfig(_))));
    }
}
