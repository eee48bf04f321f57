//! Chained key/value store.
//!
//! A [`Register`] holds ordered `name -> Primitive` pairs and an optional
//! parent. Lookups that miss fall back to the parent, which lets a child
//! rule inherit unset metadata (such as `bigendian`) from its parent rule,
//! and lets per-file scan state shadow user-supplied globals.

use crate::value::{Number, Primitive};
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::Arc;

/// Ordered, parent-linked map of primitive values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Register {
    values: IndexMap<String, Primitive>,
    parent: Option<Arc<Register>>,
}

impl Register {
    /// Creates an empty register without a parent
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty register that falls back to `parent`
    pub fn with_parent(parent: Arc<Register>) -> Self {
        Self {
            values: IndexMap::new(),
            parent: Some(parent),
        }
    }

    /// Replaces the fallback register
    pub fn set_parent(&mut self, parent: Option<Arc<Register>>) {
        self.parent = parent;
    }

    /// The fallback register, if any
    pub fn parent(&self) -> Option<&Arc<Register>> {
        self.parent.as_ref()
    }

    /// Stores a value in this register; later writes shadow earlier ones
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Primitive>) {
        self.values.insert(key.into(), value.into());
    }

    /// Looks `key` up here, then along the parent chain
    pub fn get(&self, key: &str) -> Option<&Primitive> {
        let mut current = Some(self);
        while let Some(register) = current {
            if let Some(value) = register.values.get(key) {
                return Some(value);
            }
            current = register.parent.as_deref();
        }
        None
    }

    /// Looks `key` up, returning `default` when absent everywhere
    pub fn get_or<'a>(&'a self, key: &str, default: &'a Primitive) -> &'a Primitive {
        self.get(key).unwrap_or(default)
    }

    /// Looks up a number; values of another kind count as not found
    pub fn get_number(&self, key: &str) -> Option<Number> {
        match self.get(key) {
            Some(Primitive::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Looks up a boolean; values of another kind count as not found
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Primitive::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Looks up a byte string; values of another kind count as not found
    pub fn get_string(&self, key: &str) -> Option<&Bytes> {
        match self.get(key) {
            Some(Primitive::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Whether this register itself (not its parents) holds `key`
    pub fn contains_local(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterates over the entries stored directly in this register
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Primitive)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries stored directly in this register
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether this register itself holds no entries
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Width;

    #[test]
    fn test_parent_fallback() {
        let mut parent = Register::new();
        parent.set("bigendian", false);
        parent.set("pass", Number::literal(2));
        let mut child = Register::with_parent(Arc::new(parent));
        child.set("bigendian", true);

        assert_eq!(child.get_bool("bigendian"), Some(true));
        assert_eq!(child.get_number("pass").map(|n| n.get()), Some(2));
        assert!(child.get("missing").is_none());
        assert!(!child.contains_local("pass"));
    }

    #[test]
    fn test_typed_getters_reject_other_kinds() {
        let mut reg = Register::new();
        reg.set("tag", "elf,exec");
        reg.set("size", Number::unsigned(4, Width::W8));

        assert!(reg.get_bool("tag").is_none());
        assert!(reg.get_number("tag").is_none());
        assert_eq!(reg.get_string("tag").map(|b| b.as_ref()), Some(&b"elf,exec"[..]));
        assert!(reg.get_string("size").is_none());
    }

    #[test]
    fn test_later_writes_shadow() {
        let mut reg = Register::new();
        reg.set("a", Number::literal(1));
        reg.set("a", Number::literal(2));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get_number("a").map(|n| n.get()), Some(2));
    }

    #[test]
    fn test_get_or_default() {
        let reg = Register::new();
        let default = Primitive::Bool(true);
        assert_eq!(reg.get_or("bigendian", &default), &Primitive::Bool(true));
    }
}
