//! Values flowing through the transform pipeline

use serde::{Deserialize, Serialize};

use crate::error::{CalcError, Result};

/// A raw or transformed point value.
///
/// Booleans enter as numbers (0/1); everything a device or expression can
/// produce is either numeric or textual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CalcValue {
    Number(f64),
    Text(String),
}

impl CalcValue {
    /// Numeric view of the value; text must parse as a float
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| CalcError::non_numeric(format!("'{}'", s))),
        }
    }

    /// Textual view of the value
    pub fn as_text(&self) -> String {
        match self {
            Self::Number(v) => v.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for CalcValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for CalcValue {
    fn from(v: bool) -> Self {
        Self::Number(if v { 1.0 } else { 0.0 })
    }
}

impl From<&str> for CalcValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for CalcValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl std::fmt::Display for CalcValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}
