//! Virtual point resolution
//!
//! A virtual point has no device address; its value is an expression over the
//! labels of other points in the same protocol. Points are resolved in the
//! order given, so a virtual point may reference any earlier virtual point.

use std::collections::HashMap;

use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};
use tracing::debug;

use crate::error::{CalcError, Result};
use crate::transform::{finite, round2, value_to_f64};

/// Outcome of resolving one virtual point
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualOutcome {
    pub label: String,
    pub result: Result<f64>,
}

/// Resolve virtual points against the numeric values collected so far.
///
/// Each successfully resolved point is inserted into `values` before the next
/// one is evaluated. A failing point (bad expression, unknown label, non-finite
/// result) is reported in its outcome and leaves `values` untouched.
pub fn resolve_virtual_points<'a, I>(
    points: I,
    values: &mut HashMap<String, f64>,
) -> Vec<VirtualOutcome>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    points
        .into_iter()
        .map(|(label, expression)| {
            let result = resolve_one(expression, values);
            match &result {
                Ok(v) => {
                    values.insert(label.to_string(), *v);
                },
                Err(e) => debug!("Virtual {} unresolved: {}", label, e),
            }
            VirtualOutcome {
                label: label.to_string(),
                result,
            }
        })
        .collect()
}

fn resolve_one(expression: &str, values: &HashMap<String, f64>) -> Result<f64> {
    let tree = evalexpr::build_operator_tree(expression).map_err(|e| {
        CalcError::expression(format!("Failed to parse '{}': {}", expression, e))
    })?;

    let mut missing: Vec<String> = tree
        .iter_variable_identifiers()
        .filter(|name| !values.contains_key(*name))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(CalcError::UnresolvedReference(missing));
    }

    let mut context = HashMapContext::new();
    for name in tree.iter_variable_identifiers() {
        if let Some(v) = values.get(name) {
            context
                .set_value(name.to_string(), Value::Float(*v))
                .map_err(|e| CalcError::expression(format!("Failed to bind {}: {}", name, e)))?;
        }
    }

    let value = tree.eval_with_context(&context).map_err(|e| {
        CalcError::expression(format!("Failed to evaluate '{}': {}", expression, e))
    })?;

    Ok(round2(finite(value_to_f64(value, expression)?, expression)?))
}
