//! Forward and inverse point transforms
//!
//! Forward: `raw → value`, evaluating the point expression with `x` bound to the
//! raw value. Inverse: `value → raw`, only for expressions that are affine in `x`.
//! Numeric results are rounded to two decimals, half away from zero.

use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};

use crate::error::{CalcError, Result};
use crate::hex::{dec_to_hex, hex_to_dec};
use crate::value::CalcValue;

/// Residual allowed between `f(2)` and `2a + b` when checking affinity
pub const AFFINE_TOLERANCE: f64 = 1e-9;

/// Slopes below this magnitude are treated as constant expressions
pub const MIN_SLOPE: f64 = 1e-12;

const HEX2DEC: &str = "HEX2DEC";
const DEC2HEX: &str = "DEC2HEX";

/// Round to two decimals using round-half-away-from-zero
///
/// Magnitudes too large to scale have no fractional digits left and are
/// returned as is.
pub fn round2(value: f64) -> f64 {
    let scaled = value * 100.0;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / 100.0
}

/// Evaluate `expression` with `x` bound to `x` (no rounding)
pub fn evaluate(expression: &str, x: f64) -> Result<f64> {
    let mut context = HashMapContext::new();
    context
        .set_value("x".to_string(), Value::Float(x))
        .map_err(|e| CalcError::expression(format!("Failed to bind x: {}", e)))?;

    let value = evalexpr::eval_with_context(expression, &context).map_err(|e| {
        CalcError::expression(format!("Failed to evaluate '{}': {}", expression, e))
    })?;

    finite(value_to_f64(value, expression)?, expression)
}

/// Transform a raw device value into its business value
pub fn forward(expression: &str, raw: &CalcValue) -> Result<CalcValue> {
    let expression = expression.trim();

    if expression.is_empty() {
        return Ok(match raw {
            CalcValue::Number(v) => CalcValue::Number(round2(finite(*v, "passthrough")?)),
            CalcValue::Text(_) => raw.clone(),
        });
    }

    if expression.eq_ignore_ascii_case(HEX2DEC) {
        let text = match raw {
            CalcValue::Text(s) => s.clone(),
            CalcValue::Number(v) => integral_digits(*v)?,
        };
        return Ok(CalcValue::Number(hex_to_dec(&text)? as f64));
    }

    if expression.eq_ignore_ascii_case(DEC2HEX) {
        return Ok(CalcValue::Text(dec_to_hex(raw.as_f64()?, false)?));
    }

    let x = raw.as_f64()?;
    let mut context = HashMapContext::new();
    context
        .set_value("x".to_string(), Value::Float(x))
        .map_err(|e| CalcError::expression(format!("Failed to bind x: {}", e)))?;

    let value = evalexpr::eval_with_context(expression, &context).map_err(|e| {
        CalcError::expression(format!("Failed to evaluate '{}': {}", expression, e))
    })?;

    match value {
        Value::String(s) => Ok(CalcValue::Text(s)),
        other => Ok(CalcValue::Number(round2(finite(
            value_to_f64(other, expression)?,
            expression,
        )?))),
    }
}

/// Transform a business value back into the raw value to send to the device
///
/// The expression is sampled at `x = 0, 1, 2`; it must satisfy
/// `f(2) == 2·(f(1) - f(0)) + f(0)` within [`AFFINE_TOLERANCE`] and have a slope
/// of at least [`MIN_SLOPE`].
pub fn inverse(expression: &str, target: &CalcValue) -> Result<CalcValue> {
    let expression = expression.trim();

    if expression.is_empty() {
        return Ok(match target {
            CalcValue::Number(v) => CalcValue::Number(round2(*v)),
            CalcValue::Text(_) => target.clone(),
        });
    }

    if expression.eq_ignore_ascii_case(HEX2DEC) {
        return Ok(CalcValue::Text(dec_to_hex(target.as_f64()?, false)?));
    }

    if expression.eq_ignore_ascii_case(DEC2HEX) {
        return Ok(CalcValue::Number(hex_to_dec(&target.as_text())? as f64));
    }

    let y = target.as_f64()?;
    let f0 = evaluate(expression, 0.0)?;
    let f1 = evaluate(expression, 1.0)?;
    let f2 = evaluate(expression, 2.0)?;

    let a = f1 - f0;
    let b = f0;
    let residual = (f2 - (2.0 * a + b)).abs();

    if residual > AFFINE_TOLERANCE {
        return Err(CalcError::NotAffine {
            expression: expression.to_string(),
            residual,
        });
    }
    if a.abs() < MIN_SLOPE {
        return Err(CalcError::NotInvertible(expression.to_string()));
    }

    Ok(CalcValue::Number(round2(finite((y - b) / a, expression)?)))
}

pub(crate) fn value_to_f64(value: Value, expression: &str) -> Result<f64> {
    match value {
        Value::Float(f) => Ok(f),
        Value::Int(i) => Ok(i as f64),
        Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
        _ => Err(CalcError::expression(format!(
            "Expression did not evaluate to a number: {}",
            expression
        ))),
    }
}

pub(crate) fn finite(value: f64, expression: &str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalcError::NotFinite(format!("{} = {}", expression, value)))
    }
}

/// Decimal digits of an integral register value, read back as hex digits
fn integral_digits(value: f64) -> Result<String> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(CalcError::hex(format!(
            "HEX2DEC expects hex text or an integral value, got {}",
            value
        )));
    }
    Ok(format!("{}", value as i64))
}
