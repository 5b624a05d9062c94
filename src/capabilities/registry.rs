//! Safe-Attribute Registry (C1) — spec §4.1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Call,
    Both,
}

impl AccessKind {
    pub fn permits_read(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::Both)
    }

    pub fn permits_call(self) -> bool {
        matches!(self, AccessKind::Call | AccessKind::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeAttributeEntry {
    pub attribute: String,
    pub access: AccessKind,
    pub required_capability: Option<String>,
    pub deprecated: bool,
}

impl SafeAttributeEntry {
    pub fn new(attribute: impl Into<String>, access: AccessKind) -> Self {
        Self {
            attribute: attribute.into(),
            access,
            required_capability: None,
            deprecated: false,
        }
    }

    pub fn requiring(mut self, capability_type: impl Into<String>) -> Self {
        self.required_capability = Some(capability_type.into());
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }
}

/// Whitelist of type -> {attribute -> policy}, plus a base-type table for
/// method-resolution-order (MRO) walks (spec §3 "SafeAttributeEntry",
/// §4.1). Read access is thread-safe unconditionally; writes are only valid
/// before [`Self::freeze`] is called (spec §3 "Registry: built at process
/// init; read-only thereafter").
#[derive(Debug, Default)]
pub struct SafeAttributeRegistry {
    entries: HashMap<String, HashMap<String, SafeAttributeEntry>>,
    /// `type -> bases`, bases listed in the order they should be searched
    /// after the type's own entries (declaration order, not C3 linearized —
    /// sufficient for the single-inheritance-ish standard-library shapes
    /// this registry curates).
    bases: HashMap<String, Vec<String>>,
    frozen: AtomicBool,
}

impl SafeAttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed registry for a small, illustrative set of host-runtime types
    /// (spec's "ML grammar and standard-library module contents" are out of
    /// scope; this is just enough to exercise MRO walking and capability
    /// gating end to end): `string`, `list`, `map`, `file_handle`,
    /// `http_response`.
    pub fn with_default_entries() -> Self {
        let mut reg = Self::new();
        reg.register("string", SafeAttributeEntry::new("len", AccessKind::Read))
            .unwrap();
        reg.register("string", SafeAttributeEntry::new("upper", AccessKind::Call))
            .unwrap();
        reg.register("string", SafeAttributeEntry::new("lower", AccessKind::Call))
            .unwrap();
        reg.register("string", SafeAttributeEntry::new("split", AccessKind::Call))
            .unwrap();

        reg.register("list", SafeAttributeEntry::new("len", AccessKind::Read))
            .unwrap();
        reg.register("list", SafeAttributeEntry::new("append", AccessKind::Call))
            .unwrap();
        reg.register("list", SafeAttributeEntry::new("get", AccessKind::Call))
            .unwrap();

        reg.register("map", SafeAttributeEntry::new("len", AccessKind::Read))
            .unwrap();
        reg.register("map", SafeAttributeEntry::new("keys", AccessKind::Call))
            .unwrap();
        reg.register("map", SafeAttributeEntry::new("get", AccessKind::Call))
            .unwrap();

        reg.register(
            "file_handle",
            SafeAttributeEntry::new("read", AccessKind::Call).requiring("file_read"),
        )
        .unwrap();
        reg.register(
            "file_handle",
            SafeAttributeEntry::new("write", AccessKind::Call).requiring("file_write"),
        )
        .unwrap();
        reg.register("file_handle", SafeAttributeEntry::new("close", AccessKind::Call))
            .unwrap();

        reg.register("http_response", SafeAttributeEntry::new("status", AccessKind::Read))
            .unwrap();
        reg.register(
            "http_response",
            SafeAttributeEntry::new("text", AccessKind::Call).requiring("network"),
        )
        .unwrap();
        reg.register(
            "http_response",
            SafeAttributeEntry::new("json", AccessKind::Call).requiring("network"),
        )
        .unwrap();

        reg
    }

    /// Register an attribute policy for `type_name`. Only valid before
    /// [`Self::freeze`] — spec §3: "optionally extendable only before any
    /// sandboxed execution begins".
    pub fn register(&mut self, type_name: impl Into<String>, entry: SafeAttributeEntry) -> CoreResult<()> {
        self.ensure_not_frozen()?;
        self.entries
            .entry(type_name.into())
            .or_default()
            .insert(entry.attribute.clone(), entry);
        Ok(())
    }

    /// Declare `type_name`'s base types in method-resolution order.
    pub fn register_base(&mut self, type_name: impl Into<String>, base: impl Into<String>) -> CoreResult<()> {
        self.ensure_not_frozen()?;
        self.bases.entry(type_name.into()).or_default().push(base.into());
        Ok(())
    }

    fn ensure_not_frozen(&self) -> CoreResult<()> {
        if self.frozen.load(Ordering::SeqCst) {
            Err(CoreError::Generic(
                "safe-attribute registry is frozen; register entries before sandboxed execution begins".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Freeze the registry against further writes (read-only thereafter).
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// `type_name`'s MRO: itself, then its declared bases depth-first in
    /// declaration order.
    fn mro(&self, type_name: &str) -> Vec<String> {
        let mut order = vec![type_name.to_string()];
        let mut stack: Vec<String> = self
            .bases
            .get(type_name)
            .cloned()
            .unwrap_or_default();
        let mut seen: std::collections::HashSet<String> = order.iter().cloned().collect();
        while let Some(base) = stack.pop() {
            if seen.insert(base.clone()) {
                order.push(base.clone());
                if let Some(more) = self.bases.get(&base) {
                    stack.extend(more.iter().cloned());
                }
            }
        }
        order
    }

    /// Blanket dunder block: any attribute beginning with `_` is never
    /// safe, regardless of registry contents (spec §4.1 Policy).
    fn is_dunder_blocked(attr: &str) -> bool {
        attr.starts_with('_')
    }

    pub fn is_safe(&self, type_name: &str, attr: &str) -> bool {
        self.lookup(type_name, attr).is_some()
    }

    /// Walk `type_name`'s MRO and return the first matching entry, or
    /// `None` if `attr` is dunder-blocked or not registered under any base.
    pub fn lookup(&self, type_name: &str, attr: &str) -> Option<SafeAttributeEntry> {
        if Self::is_dunder_blocked(attr) {
            return None;
        }
        for t in self.mro(type_name) {
            if let Some(entry) = self.entries.get(&t).and_then(|m| m.get(attr)) {
                return Some(entry.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dunder_attrs_are_never_safe_for_any_type() {
        let reg = SafeAttributeRegistry::with_default_entries();
        assert!(!reg.is_safe("string", "__class__"));
        assert!(!reg.is_safe("unknown_type", "__anything__"));
        assert!(!reg.is_safe("string", "_private"));
    }

    #[test]
    fn unknown_types_have_empty_whitelist() {
        let reg = SafeAttributeRegistry::with_default_entries();
        assert!(!reg.is_safe("totally_unknown", "len"));
    }

    #[test]
    fn mro_walk_finds_base_type_entries() {
        let mut reg = SafeAttributeRegistry::new();
        reg.register("base", SafeAttributeEntry::new("shared", AccessKind::Read))
            .unwrap();
        reg.register_base("derived", "base").unwrap();
        assert!(reg.is_safe("derived", "shared"));
        assert!(!reg.is_safe("unrelated", "shared"));
    }

    #[test]
    fn frozen_registry_rejects_further_registration() {
        let mut reg = SafeAttributeRegistry::new();
        reg.freeze();
        let err = reg
            .register("string", SafeAttributeEntry::new("len", AccessKind::Read))
            .unwrap_err();
        assert!(matches!(err, CoreError::Generic(_)));
    }

    #[test]
    fn file_handle_read_requires_capability() {
        let reg = SafeAttributeRegistry::with_default_entries();
        let entry = reg.lookup("file_handle", "read").unwrap();
        assert_eq!(entry.required_capability.as_deref(), Some("file_read"));
    }
}
