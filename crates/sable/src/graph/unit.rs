use std::collections::BTreeMap;
use std::fmt;

use sable_core::{Error, Result};

use super::node::NodeKey;

/// Registry-assigned key of a UnitState. Separate namespace from NodeKey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey(pub(crate) usize);

impl UnitKey {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Opaque per-layer state: named tensors, scalars and strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitState {
    kind: String,
    tensors: BTreeMap<String, NodeKey>,
    scalars: BTreeMap<String, f64>,
    strings: BTreeMap<String, String>,
}

impl UnitState {
    /// Empty state for a layer of the given kind (e.g. "linear").
    pub fn new(kind: impl Into<String>) -> Self {
        UnitState {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn with_tensor(mut self, name: impl Into<String>, key: NodeKey) -> Self {
        self.tensors.insert(name.into(), key);
        self
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(name.into(), value.into());
        self
    }

    pub fn set_tensor(&mut self, name: impl Into<String>, key: NodeKey) {
        self.tensors.insert(name.into(), key);
    }

    pub fn set_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.scalars.insert(name.into(), value);
    }

    pub fn set_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.strings.insert(name.into(), value.into());
    }

    pub fn tensor(&self, name: &str) -> Result<NodeKey> {
        self.tensors.get(name).copied().ok_or_else(|| missing(&self.kind, "tensor", name))
    }

    /// A tensor entry that may legitimately be absent (e.g. an optional bias).
    pub fn try_tensor(&self, name: &str) -> Option<NodeKey> {
        self.tensors.get(name).copied()
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.scalars.get(name).copied().ok_or_else(|| missing(&self.kind, "scalar", name))
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        self.strings
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| missing(&self.kind, "string", name))
    }

    /// Every tensor key, ordered by name.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, NodeKey)> {
        self.tensors.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

fn missing(kind: &str, what: &str, name: &str) -> Error {
    Error::invalid_argument(format!("{kind} unit has no {what} named '{name}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_entries() {
        let unit = UnitState::new("linear")
            .with_tensor("weight", NodeKey(3))
            .with_scalar("in_features", 4.0)
            .with_string("activation", "relu");
        assert_eq!(unit.kind(), "linear");
        assert_eq!(unit.tensor("weight").unwrap(), NodeKey(3));
        assert_eq!(unit.scalar("in_features").unwrap(), 4.0);
        assert_eq!(unit.string("activation").unwrap(), "relu");
        assert!(unit.tensor("bias").is_err());
        assert!(unit.try_tensor("bias").is_none());
    }
}
