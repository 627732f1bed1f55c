//! Configuration management for relayrace.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::{decode_entries, ReachabilityConfig, ServerEntry};
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::task::TaskConfig;
use crate::transport::{EraConfig, HelperConfig};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection race configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Session era configuration.
    #[serde(default)]
    pub era: EraConfig,

    /// Reachability reorder configuration.
    #[serde(default)]
    pub reachability: ReachabilityConfig,

    /// Supervised task timing.
    #[serde(default)]
    pub task: TaskConfig,

    /// Relay helper configuration.
    #[serde(default)]
    pub helper: HelperConfig,

    /// Catalog storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool.pool_limit == 0 {
            return Err(Error::InvalidConfig("pool_limit must be at least 1".into()));
        }

        if self.pool.poll_interval.is_zero() || self.task.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("Poll intervals must be non-zero".into()));
        }

        if self.pool.connect_timeout <= self.pool.poll_interval {
            return Err(Error::InvalidConfig(
                "connect_timeout must exceed the pool poll interval".into(),
            ));
        }

        if self.reachability.enabled {
            if self.reachability.max_worker_threads == 0 {
                return Err(Error::InvalidConfig(
                    "Reachability enabled but max_worker_threads is 0".into(),
                ));
            }
            let factor = self.reachability.threshold_factor;
            if !factor.is_finite() || factor < 1.0 {
                return Err(Error::InvalidConfig(
                    "threshold_factor must be at least 1.0".into(),
                ));
            }
        }

        if self.helper.program.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("Helper program not configured".into()));
        }

        if self.helper.local_socks_port == 0 {
            return Err(Error::InvalidConfig("local_socks_port must be non-zero".into()));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "relayrace", "relayrace").map_or_else(
            || PathBuf::from("relayrace.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            helper: HelperConfig {
                program: PathBuf::from("/usr/local/bin/relay-helper"),
                fronting_domain: Some("cdn.example.com".into()),
                ..Default::default()
            },
            storage: StorageConfig {
                path: Some(PathBuf::from("/var/lib/relayrace/catalog.db")),
                embedded_servers: None,
            },
            ..Default::default()
        }
    }
}

/// Catalog storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite catalog database. Defaults next to the config file.
    pub path: Option<PathBuf>,

    /// Encoded baseline server list merged into every catalog.
    pub embedded_servers: Option<String>,
}

impl StorageConfig {
    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            Config::default_path()
                .parent()
                .map_or_else(|| PathBuf::from("catalog.db"), |dir| dir.join("catalog.db"))
        })
    }

    /// Decoded baseline entries. Corrupt records are skipped.
    pub fn embedded_entries(&self) -> Vec<ServerEntry> {
        self.embedded_servers
            .as_deref()
            .map(decode_entries)
            .unwrap_or_default()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
///
/// With a log file configured, output goes to the file without colour.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use std::sync::Arc;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let file = match config.file {
        Some(ref path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))?,
        )),
        None => None,
    };

    let result = match (config.format.as_str(), file) {
        ("json", Some(file)) => subscriber.with(fmt::layer().json().with_writer(file)).try_init(),
        ("json", None) => subscriber.with(fmt::layer().json()).try_init(),
        (_, Some(file)) => subscriber
            .with(fmt::layer().with_ansi(false).with_writer(file))
            .try_init(),
        (_, None) => subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to init logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pool.pool_limit, 10);
        assert_eq!(config.pool.head_size, 2);
        assert_eq!(config.pool.head_start, Duration::from_millis(500));
        assert_eq!(config.reachability.max_probe_servers, 30);
        assert_eq!(config.task.graceful_stop_timeout, Duration::from_secs(2));
        assert_eq!(config.helper.local_socks_port, 1080);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            pool_limit = 4
            head_start = "250ms"

            [reachability]
            enabled = false

            [helper]
            program = "/opt/helper"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.pool_limit, 4);
        assert_eq!(config.pool.head_start, Duration::from_millis(250));
        assert_eq!(config.pool.connect_timeout, Duration::from_secs(20));
        assert!(!config.reachability.enabled);
        assert_eq!(config.helper.program, PathBuf::from("/opt/helper"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pool.pool_limit = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.reachability.threshold_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.connect_timeout = Duration::from_millis(50);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::example();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.helper.program, config.helper.program);
        assert_eq!(loaded.storage.database_path(), PathBuf::from("/var/lib/relayrace/catalog.db"));
        assert_eq!(loaded.era.retire_lead, config.era.retire_lead);
    }

    #[test]
    fn test_embedded_entries_decode() {
        let entries = vec![ServerEntry::new("192.0.2.1"), ServerEntry::new("192.0.2.2")];
        let storage = StorageConfig {
            path: None,
            embedded_servers: Some(crate::catalog::encode_entries(&entries).unwrap()),
        };
        assert_eq!(storage.embedded_entries(), entries);
        assert!(StorageConfig::default().embedded_entries().is_empty());
    }
}
