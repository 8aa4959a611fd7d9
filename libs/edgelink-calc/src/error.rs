//! Error types for edgelink-calc

use thiserror::Error;

/// Calculation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalcError {
    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Non-numeric input: {0}")]
    NonNumeric(String),

    #[error("Result is not a finite number: {0}")]
    NotFinite(String),

    #[error("Expression is not affine in x (residual {residual:e}): {expression}")]
    NotAffine { expression: String, residual: f64 },

    #[error("Expression is not invertible (constant in x): {0}")]
    NotInvertible(String),

    #[error("Unresolved point reference: {}", .0.join(", "))]
    UnresolvedReference(Vec<String>),

    #[error("Hex conversion error: {0}")]
    Hex(String),
}

impl CalcError {
    pub fn expression(msg: impl Into<String>) -> Self {
        Self::Expression(msg.into())
    }

    pub fn non_numeric(msg: impl Into<String>) -> Self {
        Self::NonNumeric(msg.into())
    }

    pub fn hex(msg: impl Into<String>) -> Self {
        Self::Hex(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CalcError>;
