//! Configuration stores
//!
//! The store is the sole source of truth for what should be running. A
//! snapshot pairs the workstation with an opaque revision; the monitor only
//! compares revisions for equality.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use edgelink_model::Workstation;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{CollectError, ErrorExt, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub workstation: Workstation,
    pub revision: String,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn latest(&self) -> Result<ConfigSnapshot>;
}

/// Workstation file with an optional explicit revision
#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    revision: Option<String>,
    #[serde(flatten)]
    workstation: Workstation,
}

/// YAML or JSON workstation file. Without a `revision` field the file
/// modification time is used.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_json(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn latest(&self) -> Result<ConfigSnapshot> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .storage_error(&format!("Failed to read {}", self.path.display()))?;
        let document: Document = if self.is_json() {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };

        let revision = match document.revision {
            Some(revision) => revision,
            None => {
                let modified = tokio::fs::metadata(&self.path).await?.modified()?;
                DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Nanos, true)
            },
        };
        debug!("Loaded {} at revision {}", self.path.display(), revision);

        Ok(ConfigSnapshot {
            workstation: document.workstation,
            revision,
        })
    }
}

/// `workstation_config(revision TEXT, payload TEXT)`; the payload is the
/// workstation as JSON and the greatest revision wins
#[derive(Debug, Clone)]
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = url.parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.create_if_missing(true))
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workstation_config (
                revision TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        info!("Config store ready");
        Ok(Self { pool })
    }

    pub async fn insert(&self, revision: &str, workstation: &Workstation) -> Result<()> {
        let payload = serde_json::to_string(workstation)?;
        sqlx::query("INSERT INTO workstation_config (revision, payload) VALUES (?, ?)")
            .bind(revision)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn latest(&self) -> Result<ConfigSnapshot> {
        let row = sqlx::query(
            "SELECT revision, payload FROM workstation_config ORDER BY revision DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CollectError::NotFound("Workstation configuration".to_string()))?;

        let revision: String = row.try_get("revision")?;
        let payload: String = row.try_get("payload")?;
        Ok(ConfigSnapshot {
            workstation: serde_json::from_str(&payload)?,
            revision,
        })
    }
}
