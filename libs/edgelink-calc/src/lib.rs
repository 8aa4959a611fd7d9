//! edgelink-calc - Point value transforms for EdgeLink
//!
//! Converts raw device values into business values and back. Everything in
//! this crate is pure and synchronous; the collection service calls it once per
//! point per poll cycle.
//!
//! # Features
//!
//! - **Forward transform**: arbitrary single-variable expressions with `x` bound to the raw value
//! - **Inverse transform**: only for expressions that are affine in `x` (`a·x + b`, `a ≠ 0`)
//! - **Base conversion**: the named operators `HEX2DEC` and `DEC2HEX`
//! - **Virtual points**: expressions over other points' labels, resolved in order
//!
//! # Example
//!
//! ```rust
//! use edgelink_calc::{forward, inverse, CalcValue};
//!
//! let value = forward("x * 0.1 + 2", &CalcValue::Number(1234.0)).unwrap();
//! assert_eq!(value, CalcValue::Number(125.4));
//!
//! let raw = inverse("x * 0.1 + 2", &CalcValue::Number(125.4)).unwrap();
//! assert_eq!(raw, CalcValue::Number(1234.0));
//!
//! assert_eq!(forward("HEX2DEC", &"0xFF".into()).unwrap(), CalcValue::Number(255.0));
//! ```
//!
//! # Named Operators
//!
//! | Operator | Forward | Inverse |
//! |----------|---------|---------|
//! | `HEX2DEC` | hex text (`0xFF`, `ff`) → number | number → hex text |
//! | `DEC2HEX` | number → uppercase hex text | hex text → number |

pub mod error;
pub mod hex;
pub mod transform;
pub mod value;
pub mod virtual_point;

// Re-exports for convenience
pub use error::{CalcError, Result};
pub use hex::{dec_to_hex, hex_to_dec};
pub use transform::{evaluate, forward, inverse, round2, AFFINE_TOLERANCE, MIN_SLOPE};
pub use value::CalcValue;
pub use virtual_point::{resolve_virtual_points, VirtualOutcome};
