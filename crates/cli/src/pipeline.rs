//! Order pricing pipeline the CLI runs against.
//!
//! ```text
//! quantity ─┐
//!           ├─ subtotal ─┬─ discount ─┬─ tax ─ total ─ report
//! unit_price┘            └────────────┘
//! ```

use anyhow::{anyhow, Context};
use knot_core::{EngineConfig, Node, Registry, ValueKind};
use serde_json::{json, Value};

pub const REGISTRY_NAME: &str = "pricing";

/// Subtotal from which the bulk discount applies
pub const DISCOUNT_THRESHOLD: f64 = 100.0;
pub const DISCOUNT_RATE: f64 = 0.10;
pub const DEFAULT_TAX_RATE: f64 = 0.08;

fn cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

pub fn build_registry(config: EngineConfig) -> knot_core::Result<Registry> {
    let registry = Registry::with_config(REGISTRY_NAME, config);

    let quantity = Node::input("quantity", ValueKind::Integer);
    let unit_price = Node::input("unit_price", ValueKind::Number);

    let subtotal = registry
        .builder("subtotal")
        .depends_on(&quantity)
        .depends_on(&unit_price)
        .returns(ValueKind::Number)
        .build(|inputs| {
            let quantity = inputs.i64("quantity")?;
            if quantity < 0 {
                return Err(anyhow!("quantity cannot be negative: {}", quantity));
            }
            Ok(json!(cents(quantity as f64 * inputs.f64("unit_price")?)))
        })?;

    let discount = registry
        .builder("discount")
        .depends_on("subtotal")
        .returns(ValueKind::Number)
        .build(|inputs| {
            let subtotal = inputs.f64("subtotal")?;
            let discount = if subtotal >= DISCOUNT_THRESHOLD {
                cents(subtotal * DISCOUNT_RATE)
            } else {
                0.0
            };
            Ok(json!(discount))
        })?;

    let tax = registry
        .builder("tax")
        .depends_on("subtotal")
        .depends_on("discount")
        .optional_input("tax_rate", ValueKind::Number, DEFAULT_TAX_RATE)
        .returns(ValueKind::Number)
        .build(|inputs| {
            let taxable = inputs.f64("subtotal")? - inputs.f64("discount")?;
            Ok(json!(cents(taxable * inputs.f64("tax_rate")?)))
        })?;

    let total = registry
        .builder("total")
        .depends_on("subtotal")
        .depends_on("discount")
        .depends_on("tax")
        .returns(ValueKind::Number)
        .build(|inputs| {
            let total = inputs.f64("subtotal")? - inputs.f64("discount")? + inputs.f64("tax")?;
            Ok(json!(cents(total)))
        })?;

    let report = registry
        .builder("report")
        .depends_on_as("items", "quantity")
        .depends_on("total")
        .returns(ValueKind::Object)
        .build(|inputs| {
            Ok(json!({
                "items": inputs.value("items")?,
                "total": inputs.value("total")?,
            }))
        })?;

    registry.register_all([quantity, unit_price, subtotal, discount, tax, total, report])?;
    Ok(registry)
}

/// Parse a `name=value` run input. Values are read as JSON, falling back to a plain string.
pub fn parse_input(raw: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("input '{}' must look like name=value", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("input '{}' has an empty name", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
