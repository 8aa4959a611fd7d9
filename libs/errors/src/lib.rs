//! Unified error handling for EdgeLink gateway services
//!
//! Every library keeps its own domain error enum (`CalcError`, `ModelError`,
//! `CollectError`, ...). This crate provides the process-level `GatewayError`
//! those errors collapse into at the service boundary, plus the
//! `GatewayErrorTrait` capability interface used for logging and retry decisions.

use thiserror::Error;

// ============================================================================
// GatewayError - Main error type
// ============================================================================

/// Main error type for all EdgeLink services
#[derive(Debug, Error)]
pub enum GatewayError {
    // ======================================
    // Configuration
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Storage
    // ======================================
    #[error("Database error: {0}")]
    Database(String),

    // ======================================
    // Protocol / communication
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Message bus error: {0}")]
    Bus(String),

    // ======================================
    // Calculation
    // ======================================
    #[error("Calculation error: {0}")]
    Calculation(String),

    // ======================================
    // Validation / lookup
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    // ======================================
    // IO / serialization
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Runtime
    // ======================================
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using GatewayError
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceBusy(_) | Self::Communication(_)
                | Self::Bus(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(format!("YAML: {err}"))
    }
}

impl GatewayErrorTrait for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Bus(_) => "BUS_ERROR",
            Self::Calculation(_) => "CALCULATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ResourceBusy(_) => "RESOURCE_BUSY",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Shutdown(_) => "SHUTDOWN_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Database(_) => ErrorCategory::Database,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Communication(_) | Self::Bus(_) => ErrorCategory::Network,
            Self::Calculation(_) => ErrorCategory::Calculation,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::ResourceBusy(_) => ErrorCategory::ResourceBusy,
            Self::Io(_)
            | Self::Serialization(_)
            | Self::Shutdown(_)
            | Self::Internal(_) => ErrorCategory::Internal,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

// ============================================================================
// Gateway Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Database,
    Network,
    Timeout,

    // Business logic layer
    Validation,
    NotFound,

    // Protocol/communication layer
    Protocol,
    Connection,

    // Point transform layer
    Calculation,

    // System level
    Internal,
    ResourceBusy,

    Unknown,
}

/// Error capability trait
///
/// Each crate keeps its own domain error type (e.g. `CollectError`) and gains
/// a common outward-facing interface by implementing this trait.
pub trait GatewayErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and notifications)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::ResourceBusy
                | ErrorCategory::Connection
        )
    }

    /// Recommended retry delay in milliseconds
    fn retry_delay_ms(&self) -> u64 {
        match self.category() {
            ErrorCategory::Network => 1000,
            ErrorCategory::Timeout => 500,
            ErrorCategory::ResourceBusy => 2000,
            ErrorCategory::Connection => 1500,
            _ => 0,
        }
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}
