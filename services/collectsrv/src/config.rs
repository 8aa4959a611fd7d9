//! Service configuration
//!
//! Loaded once at startup: built-in defaults, then the YAML file, then
//! `COLLECTSRV_` environment variables (`__` separates nested keys, e.g.
//! `COLLECTSRV_BUS__URL`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::core::bus::{BusTopics, LogPublisher, Publisher, RedisPublisher};
use crate::core::store::{ConfigStore, FileConfigStore, SqliteConfigStore};
use crate::error::{CollectError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/collectsrv.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub monitor: MonitorSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "collectsrv".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub json: bool,
    /// Write a daily log file besides the console
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            json: false,
            file: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_true() -> bool {
    true
}

/// Where the workstation configuration comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    File { path: PathBuf },
    Sqlite { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("config/workstation.yaml"),
        }
    }
}

impl StoreConfig {
    pub async fn open(&self) -> Result<Arc<dyn ConfigStore>> {
        match self {
            Self::File { path } => Ok(Arc::new(FileConfigStore::new(path.clone()))),
            Self::Sqlite { url } => Ok(Arc::new(SqliteConfigStore::connect(url).await?)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Publish into the log only; no inbound commands
    #[default]
    Log,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub topics: BusTopics,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Log,
            url: default_redis_url(),
            topics: BusTopics::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl BusConfig {
    pub fn publisher(&self) -> Result<Arc<dyn Publisher>> {
        match self.kind {
            BusKind::Log => Ok(Arc::new(LogPublisher)),
            BusKind::Redis => Ok(Arc::new(RedisPublisher::new(&self.url)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    5000
}

impl MonitorSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(100))
    }
}

impl ServiceConfig {
    /// Defaults < YAML file < environment
    ///
    /// A missing file is not an error; the defaults and environment still apply.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| CollectError::config(format!("Failed to load configuration: {}", e)))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("COLLECTSRV_").split("__"))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        figment::Jail::expect_with(|_| {
            let config = ServiceConfig::load("missing.yaml").unwrap();
            assert_eq!(config, ServiceConfig::default());
            assert_eq!(config.bus.topics.data, "edgelink:data");
            Ok(())
        });
    }

    #[test]
    fn test_yaml_then_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "collectsrv.yaml",
                r#"
service:
  name: edge-a
logging:
  level: debug
store:
  kind: sqlite
  url: "sqlite::memory:"
bus:
  kind: redis
  topics:
    data: "plant:data"
monitor:
  interval_ms: 2000
"#,
            )?;
            jail.set_env("COLLECTSRV_BUS__URL", "redis://10.0.0.5:6379");
            jail.set_env("COLLECTSRV_MONITOR__INTERVAL_MS", "750");

            let config = ServiceConfig::load("collectsrv.yaml").unwrap();
            assert_eq!(config.service.name, "edge-a");
            assert_eq!(config.logging.level, "debug");
            assert_eq!(
                config.store,
                StoreConfig::Sqlite {
                    url: "sqlite::memory:".into()
                }
            );
            assert_eq!(config.bus.kind, BusKind::Redis);
            assert_eq!(config.bus.url, "redis://10.0.0.5:6379");
            assert_eq!(config.bus.topics.data, "plant:data");
            assert_eq!(config.bus.topics.write_command, "edgelink:write");
            assert_eq!(config.monitor.interval(), Duration::from_millis(750));
            Ok(())
        });
    }

    #[test]
    fn test_bad_value_is_config_error() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("collectsrv.yaml", "monitor:\n  interval_ms: soon\n")?;
            let err = ServiceConfig::load("collectsrv.yaml").unwrap_err();
            assert!(matches!(err, CollectError::Config(_)));
            Ok(())
        });
    }
}
