//! Model Layer Error Types

use thiserror::Error;

/// Result type for edgelink-model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Model layer errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    /// Generic validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// A protocol's interface parameters are missing or malformed
    #[error("Protocol {protocol} interface invalid: {reason}")]
    InvalidInterface { protocol: String, reason: String },

    /// Protocol id used more than once in a workstation
    #[error("Duplicate protocol id: {0}")]
    DuplicateProtocol(String),

    /// Point label used more than once in an equipment
    #[error("Duplicate point label {label} in equipment {equipment}")]
    DuplicateLabel { equipment: String, label: String },

    /// Unparseable enumerated value
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ModelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn interface(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInterface {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }
}
