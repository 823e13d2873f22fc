use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Unique identifier for one execution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a node.
///
/// Ids are handed out from a process-wide counter when a node is constructed, so comparing two
/// ids also compares declaration order. The scheduler relies on this for its tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Position of the node in declaration order
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared kind of a node parameter or output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Any,
    Null,
    Bool,
    /// Integral numbers only
    Integer,
    /// Any number, integral or not
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// The most specific kind describing a value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Check whether a value belongs to this kind
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            kind => *kind == Self::of(value),
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Named values bound to one node invocation.
///
/// The same type carries caller-supplied run inputs. Keys are kept sorted so two bindings with
/// the same contents always look the same, which the result cache depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeInputs(BTreeMap<String, Value>);

impl NodeInputs {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }

    /// Get a bound value, failing with a descriptive error when absent
    pub fn value(&self, name: &str) -> Result<&Value> {
        self.0
            .get(name)
            .ok_or_else(|| anyhow!("input '{}' is not bound", name))
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        let value = self.value(name)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow!("input '{}' is not an integer: {}", name, value))
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        let value = self.value(name)?;
        value
            .as_f64()
            .ok_or_else(|| anyhow!("input '{}' is not a number: {}", name, value))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        let value = self.value(name)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("input '{}' is not a string: {}", name, value))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        let value = self.value(name)?;
        value
            .as_bool()
            .ok_or_else(|| anyhow!("input '{}' is not a bool: {}", name, value))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for NodeInputs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<BTreeMap<String, Value>> for NodeInputs {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl IntoIterator for NodeInputs {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_ids_follow_declaration_order() {
        let first = NodeId::next();
        let second = NodeId::next();
        assert!(first < second);
        assert!(first.sequence() < second.sequence());
    }

    #[test]
    fn test_value_kind_matching() {
        assert_eq!(ValueKind::of(&json!(3)), ValueKind::Integer);
        assert_eq!(ValueKind::of(&json!(3.5)), ValueKind::Number);
        assert_eq!(ValueKind::of(&json!("x")), ValueKind::String);

        assert!(ValueKind::Number.matches(&json!(3)));
        assert!(ValueKind::Number.matches(&json!(3.5)));
        assert!(!ValueKind::Integer.matches(&json!(3.5)));
        assert!(ValueKind::Any.matches(&json!(null)));
        assert!(!ValueKind::String.matches(&json!([1, 2])));
    }

    #[test]
    fn test_typed_accessors() {
        let inputs = NodeInputs::new()
            .with("count", 4)
            .with("ratio", 0.5)
            .with("label", "total")
            .with("flag", true);

        assert_eq!(inputs.i64("count").unwrap(), 4);
        assert_eq!(inputs.f64("ratio").unwrap(), 0.5);
        assert_eq!(inputs.str("label").unwrap(), "total");
        assert!(inputs.bool("flag").unwrap());

        let err = inputs.i64("label").unwrap_err();
        assert!(err.to_string().contains("not an integer"));
        let err = inputs.value("missing").unwrap_err();
        assert!(err.to_string().contains("'missing' is not bound"));
    }

    #[test]
    fn test_inputs_keep_sorted_keys() {
        let inputs: NodeInputs = vec![("b", json!(2)), ("a", json!(1))].into_iter().collect();
        let names: Vec<&str> = inputs.names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
