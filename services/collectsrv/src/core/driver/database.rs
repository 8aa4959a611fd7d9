//! SQL (SQLite) codec binding
//!
//! A read runs the configured query and takes the column named by the point
//! address from the first row. The interface is read-only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgelink_model::{InterfaceConfig, Protocol};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use super::registry::{DriverFactory, DriverRegistry};
use super::{Driver, LinkSettings, ProtocolDriver, RawValue, ReadRequest, TransportStrategy, WriteRequest};
use crate::error::{CollectError, ErrorExt, Result};

fn map_sqlx_error(err: sqlx::Error) -> CollectError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            CollectError::connection(err.to_string())
        },
        other => CollectError::protocol(other.to_string()),
    }
}

/// SQLite columns are dynamically typed; try the narrowest decoding first
fn column_value(row: &SqliteRow, column: &str) -> Result<RawValue> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(column) {
        return v
            .map(|v| RawValue::Scalar(v as f64))
            .ok_or_else(|| CollectError::protocol(format!("Column '{}' is NULL", column)));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(column) {
        return v
            .map(RawValue::Scalar)
            .ok_or_else(|| CollectError::protocol(format!("Column '{}' is NULL", column)));
    }
    match row.try_get::<Option<String>, _>(column) {
        Ok(Some(s)) => Ok(RawValue::Text(s)),
        Ok(None) => Err(CollectError::protocol(format!("Column '{}' is NULL", column))),
        Err(e) => Err(map_sqlx_error(e)),
    }
}

#[derive(Default)]
pub struct DatabaseTransport {
    pool: Option<SqlitePool>,
    query: String,
}

impl DatabaseTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportStrategy for DatabaseTransport {
    async fn open(&mut self, protocol: &Protocol) -> Result<()> {
        let InterfaceConfig::Database {
            connection_string,
            query,
        } = &protocol.interface
        else {
            return Err(CollectError::config(format!(
                "Database needs a Database interface, got {}",
                protocol.interface.kind()
            )));
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(protocol.connect_timeout_ms))
            .connect(connection_string)
            .await
            .connection_error("Database connect")?;
        debug!("Proto{} database pool opened", protocol.id);

        self.pool = Some(pool);
        self.query = query.clone();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    fn configure(&mut self, _settings: LinkSettings) {}

    async fn read(&mut self, request: ReadRequest<'_>) -> Result<RawValue> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| CollectError::NullTransport("database".to_string()))?;
        let row = sqlx::query(self.query.as_str())
            .fetch_optional(pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| CollectError::protocol("Query returned no rows"))?;
        column_value(&row, request.address)
    }

    async fn write(&mut self, request: WriteRequest<'_>) -> Result<()> {
        Err(CollectError::protocol(format!(
            "Database interface is read-only (point {})",
            request.address
        )))
    }
}

struct DatabaseFactory;

impl DriverFactory for DatabaseFactory {
    fn protocol_types(&self) -> &'static [&'static str] {
        &["Database", "Sql", "Sqlite"]
    }

    fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(ProtocolDriver::new(
            protocol,
            Arc::new(|_: &Protocol| Ok(DatabaseTransport::new())),
        )))
    }
}

pub fn register(registry: &DriverRegistry) {
    registry.register(Arc::new(DatabaseFactory));
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use edgelink_model::DataType;

    fn db_protocol(query: &str) -> Protocol {
        let mut protocol = crate::test_utils::sample_protocol("db");
        protocol.protocol_type = "Database".into();
        protocol.interface = InterfaceConfig::Database {
            connection_string: "sqlite::memory:".into(),
            query: query.into(),
        };
        protocol
    }

    fn request(address: &str) -> ReadRequest<'_> {
        ReadRequest {
            equipment_id: "e1",
            address,
            data_type: &DataType::Double,
            registers: 4,
            zero_based: false,
        }
    }

    #[tokio::test]
    async fn test_reads_named_columns() {
        let protocol = db_protocol("SELECT 42 AS power, 1.5 AS ratio, 'run' AS mode");
        let mut transport = DatabaseTransport::new();
        transport.open(&protocol).await.unwrap();

        assert_eq!(transport.read(request("power")).await.unwrap(), RawValue::Scalar(42.0));
        assert_eq!(transport.read(request("ratio")).await.unwrap(), RawValue::Scalar(1.5));
        assert_eq!(
            transport.read(request("mode")).await.unwrap(),
            RawValue::Text("run".into())
        );
        assert!(matches!(
            transport.read(request("missing")).await.unwrap_err(),
            CollectError::ProtocolDefault(_)
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_result_and_writes_fail() {
        let protocol = db_protocol("SELECT 1 AS v WHERE 1 = 0");
        let mut transport = DatabaseTransport::new();
        transport.open(&protocol).await.unwrap();
        assert!(transport.read(request("v")).await.is_err());

        let value = super::super::NativeValue::F64(1.0);
        let err = transport
            .write(WriteRequest {
                equipment_id: "e1",
                address: "v",
                data_type: &DataType::Double,
                zero_based: false,
                registers: value.to_registers(Default::default()),
                value,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::ProtocolDefault(_)));
    }
}
