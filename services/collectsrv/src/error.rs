//! Error handling for the collection service
//!
//! `CollectError` is the closed taxonomy every driver, codec and scheduler
//! operation reports. Codec-specific failures are folded into it at the codec
//! boundary so callers only ever match one enum.

use errors::{ErrorCategory, GatewayError, GatewayErrorTrait};
use thiserror::Error;

/// Collection Service Error Type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    /// Transport could not be opened or failed mid-session
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Point declares a data type the driver cannot dispatch
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// Read/write attempted without an open transport (caller logic error)
    #[error("Transport not open for {0}")]
    NullTransport(String),

    /// Transform expression failed for a single point
    #[error("Expression error: {0}")]
    Expression(String),

    /// Any other codec failure, carrying the original cause
    #[error("Protocol operation failed: {0}")]
    ProtocolDefault(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration store errors (file, SQLite)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Message bus errors
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Lifecycle / state machine violations
    #[error("State error: {0}")]
    State(String),
}

/// Result type alias for the collection service
pub type Result<T> = std::result::Result<T, CollectError>;

impl CollectError {
    pub fn connection(msg: impl Into<String>) -> Self {
        CollectError::Connection(msg.into())
    }

    pub fn unsupported(data_type: impl std::fmt::Display) -> Self {
        CollectError::UnsupportedDataType(data_type.to_string())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CollectError::ProtocolDefault(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CollectError::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CollectError::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        CollectError::Storage(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        CollectError::Bus(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        CollectError::State(msg.into())
    }

    pub fn protocol_not_found(id: impl std::fmt::Display) -> Self {
        CollectError::NotFound(format!("Protocol {}", id))
    }

    /// Categories a driver lets through unchanged; everything else is wrapped
    /// as `ProtocolDefault`.
    pub fn is_recognized(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::NullTransport(_)
                | Self::UnsupportedDataType(_)
                | Self::Cancelled(_)
        )
    }

    /// Normalize an arbitrary codec failure into the driver taxonomy
    pub fn into_driver_error(self) -> Self {
        if self.is_recognized() || matches!(self, Self::ProtocolDefault(_)) {
            self
        } else {
            Self::ProtocolDefault(self.to_string())
        }
    }

    /// Failures that leave the transport in an unknown state
    pub fn faults_transport(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<edgelink_calc::CalcError> for CollectError {
    fn from(err: edgelink_calc::CalcError) -> Self {
        CollectError::Expression(err.to_string())
    }
}

impl From<edgelink_model::ModelError> for CollectError {
    fn from(err: edgelink_model::ModelError) -> Self {
        CollectError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for CollectError {
    fn from(err: serde_json::Error) -> Self {
        CollectError::Config(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for CollectError {
    fn from(err: serde_yaml::Error) -> Self {
        CollectError::Config(format!("YAML: {err}"))
    }
}

impl From<std::io::Error> for CollectError {
    fn from(err: std::io::Error) -> Self {
        CollectError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for CollectError {
    fn from(err: sqlx::Error) -> Self {
        CollectError::Storage(format!("SQLite: {err}"))
    }
}

impl From<redis::RedisError> for CollectError {
    fn from(err: redis::RedisError) -> Self {
        CollectError::Bus(format!("Redis: {err}"))
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn connection_error(self, msg: &str) -> Result<T>;
    fn config_error(self, msg: &str) -> Result<T>;
    fn storage_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CollectError::Connection(format!("{msg}: {e}")))
    }

    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CollectError::Config(format!("{msg}: {e}")))
    }

    fn storage_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CollectError::Storage(format!("{msg}: {e}")))
    }
}

// ============================================================================
// Conversion to GatewayError at the process boundary
// ============================================================================

impl From<CollectError> for GatewayError {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::Connection(msg) => GatewayError::Communication(msg),
            CollectError::UnsupportedDataType(msg) => GatewayError::Validation(msg),
            CollectError::NullTransport(msg) => GatewayError::Internal(msg),
            CollectError::Expression(msg) => GatewayError::Calculation(msg),
            CollectError::ProtocolDefault(msg) => GatewayError::Protocol {
                protocol: "collectsrv".to_string(),
                message: msg,
            },
            CollectError::Config(msg) => GatewayError::Configuration(msg),
            CollectError::Validation(msg) => GatewayError::Validation(msg),
            CollectError::Storage(msg) => GatewayError::Database(msg),
            CollectError::Bus(msg) => GatewayError::Bus(msg),
            CollectError::Cancelled(msg) => GatewayError::Shutdown(msg),
            CollectError::NotFound(msg) => GatewayError::NotFound { resource: msg },
            CollectError::State(msg) => GatewayError::ResourceBusy(msg),
        }
    }
}

impl GatewayErrorTrait for CollectError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "COLLECT_CONNECTION_ERROR",
            Self::UnsupportedDataType(_) => "COLLECT_UNSUPPORTED_TYPE",
            Self::NullTransport(_) => "COLLECT_NULL_TRANSPORT",
            Self::Expression(_) => "COLLECT_EXPRESSION_ERROR",
            Self::ProtocolDefault(_) => "COLLECT_PROTOCOL_ERROR",
            Self::Config(_) => "COLLECT_CONFIG_ERROR",
            Self::Validation(_) => "COLLECT_VALIDATION_ERROR",
            Self::Storage(_) => "COLLECT_STORAGE_ERROR",
            Self::Bus(_) => "COLLECT_BUS_ERROR",
            Self::Cancelled(_) => "COLLECT_CANCELLED",
            Self::NotFound(_) => "COLLECT_NOT_FOUND",
            Self::State(_) => "COLLECT_STATE_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Connection,
            Self::UnsupportedDataType(_) => ErrorCategory::Validation,
            Self::NullTransport(_) => ErrorCategory::Internal,
            Self::Expression(_) => ErrorCategory::Calculation,
            Self::ProtocolDefault(_) => ErrorCategory::Protocol,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Storage(_) => ErrorCategory::Database,
            Self::Bus(_) => ErrorCategory::Network,
            Self::Cancelled(_) => ErrorCategory::Internal,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::State(_) => ErrorCategory::ResourceBusy,
        }
    }
}
