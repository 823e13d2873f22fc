//! Runtime kind checks for nodes with `validate_types` enabled.

use crate::error::{DagError, Result};
use crate::node::Node;
use crate::types::{NodeInputs, ValueKind};
use serde_json::Value;

/// Name reported for output mismatches
pub const RETURN_PARAMETER: &str = "return";

fn check(node: &Node, parameter: &str, expected: ValueKind, value: &Value) -> Result<()> {
    if expected.matches(value) {
        return Ok(());
    }
    Err(DagError::Validation {
        node: node.name().to_string(),
        parameter: parameter.to_string(),
        expected,
        actual: ValueKind::of(value),
    })
}

/// Check resolved inputs against dependency and parameter kinds
pub fn validate_inputs(node: &Node, inputs: &NodeInputs) -> Result<()> {
    if !node.options().validate_types {
        return Ok(());
    }

    for dep in node.dependencies() {
        if let Some(value) = inputs.get(&dep.binding) {
            check(node, &dep.binding, dep.kind, value)?;
        }
    }
    for param in node.params() {
        if let Some(value) = inputs.get(&param.name) {
            check(node, &param.name, param.kind, value)?;
        }
    }
    Ok(())
}

/// Check a computed value against the declared output kind
pub fn validate_output(node: &Node, value: &Value) -> Result<()> {
    match node.returns() {
        Some(kind) if node.options().validate_types => check(node, RETURN_PARAMETER, kind, value),
        _ => Ok(()),
    }
}
