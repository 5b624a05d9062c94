//! Safe-Call Gate (C6) — spec §4.5.
//!
//! The single entry point generated code uses for every dynamic call and
//! attribute access (spec §6 "Generated-code contract": "Routes every
//! dynamic attribute access through `safe_attr(obj, name)`. Routes every
//! dynamic call through `safe_call(fn, *args, **kwargs)`"). Dynamic
//! dispatch is replaced by this gate plus the registry, giving one
//! chokepoint instead of virtual methods sprinkled across generated code
//! (spec §9).

use std::collections::HashMap;

use tracing::debug;

use crate::capabilities::{AccessKind, CapabilityManager, SafeAttributeRegistry};
use crate::error::{CoreError, CoreResult};

/// A value as seen at the gate boundary. The real host runtime's value
/// representation is out of scope (spec §1); this is just enough shape to
/// extract a resource argument and to report a type for registry lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum GateValue {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    /// A reference to an object of the given runtime type, opaque to the
    /// gate beyond its type name (registry lookups are keyed on it).
    Object { type_name: String },
}

impl GateValue {
    pub fn as_resource_str(&self) -> Option<&str> {
        match self {
            GateValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// How to pull the resource string out of a free function's argument list,
/// and what capability it requires (spec §4.5 point 2: "a per-function
/// resource extractor").
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub capability_type: Option<String>,
    pub operation: String,
    pub resource_arg_index: usize,
}

/// Callee shape at the gate boundary.
pub enum Callee<'a> {
    /// A bare whitelisted free function, e.g. `open_file`.
    Function(&'a str),
    /// A method/attribute call on an object, e.g. `response.text()`.
    Method { object_type: &'a str, name: &'a str },
}

/// Enforces the whitelist and capability requirements on every dynamic call
/// and attribute access (spec §4.5).
pub struct SafeCallGate<'a> {
    registry: &'a SafeAttributeRegistry,
    manager: &'a CapabilityManager,
    free_functions: HashMap<String, CallSpec>,
}

impl<'a> SafeCallGate<'a> {
    pub fn new(registry: &'a SafeAttributeRegistry, manager: &'a CapabilityManager) -> Self {
        Self {
            registry,
            manager,
            free_functions: HashMap::new(),
        }
    }

    /// Register a whitelisted free function (spec §4.5 point 1: "an
    /// explicitly whitelisted free function").
    pub fn whitelist_function(&mut self, name: impl Into<String>, spec: CallSpec) {
        self.free_functions.insert(name.into(), spec);
    }

    /// `safe_attr(obj, name)` (spec §4.5 "Attribute access through
    /// `getattr(o, name)`"): routes to `Registry.lookup`; denies if `name`
    /// starts with `_` or isn't registered.
    pub fn safe_attr(&self, object_type: &str, name: &str) -> CoreResult<AccessKind> {
        if name.starts_with('_') {
            debug!(object_type, name, "safe_attr denied: underscore-prefixed name");
            return Err(CoreError::OperationForbidden(format!(
                "'{}' is not a safe attribute of '{}'",
                name, object_type
            )));
        }
        match self.registry.lookup(object_type, name) {
            Some(entry) => Ok(entry.access),
            None => {
                debug!(object_type, name, "safe_attr denied: not whitelisted");
                Err(CoreError::OperationForbidden(format!(
                    "'{}' is not whitelisted on '{}'",
                    name, object_type
                )))
            }
        }
    }

    /// `safe_call(callee, args…, kwargs…)` (spec §4.5).
    pub fn safe_call(&self, callee: Callee<'_>, args: &[GateValue]) -> CoreResult<()> {
        match callee {
            Callee::Function(name) => self.call_function(name, args),
            Callee::Method { object_type, name } => self.call_method(object_type, name, args),
        }
    }

    fn call_function(&self, name: &str, args: &[GateValue]) -> CoreResult<()> {
        let spec = self.free_functions.get(name).ok_or_else(|| {
            CoreError::OperationForbidden(format!("'{}' is not a whitelisted function", name))
        })?;
        self.require_capability(spec, args)
    }

    fn call_method(&self, object_type: &str, name: &str, args: &[GateValue]) -> CoreResult<()> {
        let entry = self
            .registry
            .lookup(object_type, name)
            .ok_or_else(|| {
                CoreError::OperationForbidden(format!("'{}' is not whitelisted on '{}'", name, object_type))
            })?;
        if !entry.access.permits_call() {
            return Err(CoreError::OperationForbidden(format!(
                "'{}' on '{}' is not callable",
                name, object_type
            )));
        }
        if let Some(cap_type) = entry.required_capability {
            let resource = args
                .first()
                .and_then(GateValue::as_resource_str)
                .ok_or_else(|| {
                    CoreError::OperationForbidden(format!(
                        "'{}' requires a resource argument to check capability '{}'",
                        name, cap_type
                    ))
                })?;
            self.manager.use_capability(&cap_type, resource, &entry.attribute)?;
        }
        Ok(())
    }

    fn require_capability(&self, spec: &CallSpec, args: &[GateValue]) -> CoreResult<()> {
        let Some(cap_type) = &spec.capability_type else {
            return Ok(());
        };
        let resource = args
            .get(spec.resource_arg_index)
            .and_then(GateValue::as_resource_str)
            .ok_or_else(|| {
                CoreError::OperationForbidden(format!(
                    "missing resource argument at index {} for capability '{}'",
                    spec.resource_arg_index, cap_type
                ))
            })?;
        self.manager.use_capability(cap_type, resource, &spec.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityManager, CapabilityToken};
    use std::collections::HashSet as Set;
    use std::sync::Arc;
    use uuid::Uuid;

    fn token(cap_type: &str, pattern: &str, op: &str) -> Arc<CapabilityToken> {
        let vocab: Set<String> = [op.to_string()].into_iter().collect();
        Arc::new(
            CapabilityToken::create(cap_type, vec![pattern], vec![op], &vocab, None, None, Uuid::nil())
                .unwrap(),
        )
    }

    #[test]
    fn dunder_attr_access_is_denied() {
        let registry = SafeAttributeRegistry::with_default_entries();
        let manager = CapabilityManager::new();
        let gate = SafeCallGate::new(&registry, &manager);
        assert!(gate.safe_attr("string", "__class__").is_err());
    }

    #[test]
    fn whitelisted_attr_without_capability_requirement_succeeds() {
        let registry = SafeAttributeRegistry::with_default_entries();
        let manager = CapabilityManager::new();
        let gate = SafeCallGate::new(&registry, &manager);
        assert!(gate.safe_attr("string", "upper").is_ok());
    }

    #[test]
    fn method_requiring_capability_is_denied_without_grant() {
        let registry = SafeAttributeRegistry::with_default_entries();
        let manager = CapabilityManager::new();
        let gate = SafeCallGate::new(&registry, &manager);
        let args = [GateValue::Str("data/a.txt".into())];
        let err = gate
            .safe_call(
                Callee::Method {
                    object_type: "file_handle",
                    name: "read",
                },
                &args,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::CapabilityDenied { .. }));
    }

    #[test]
    fn method_requiring_capability_succeeds_when_granted() {
        let registry = SafeAttributeRegistry::with_default_entries();
        let manager = CapabilityManager::new();
        manager.grant(token("file_read", "data/*.txt", "read"));
        let gate = SafeCallGate::new(&registry, &manager);
        let args = [GateValue::Str("data/a.txt".into())];
        assert!(gate
            .safe_call(
                Callee::Method {
                    object_type: "file_handle",
                    name: "read",
                },
                &args,
            )
            .is_ok());
    }

    #[test]
    fn unwhitelisted_free_function_is_forbidden() {
        let registry = SafeAttributeRegistry::with_default_entries();
        let manager = CapabilityManager::new();
        let gate = SafeCallGate::new(&registry, &manager);
        let err = gate.safe_call(Callee::Function("system"), &[]).unwrap_err();
        assert!(matches!(err, CoreError::OperationForbidden(_)));
    }

    #[test]
    fn whitelisted_free_function_checks_capability() {
        let registry = SafeAttributeRegistry::with_default_entries();
        let manager = CapabilityManager::new();
        manager.grant(token("file_read", "data/*.txt", "read"));
        let mut gate = SafeCallGate::new(&registry, &manager);
        gate.whitelist_function(
            "open_file",
            CallSpec {
                capability_type: Some("file_read".into()),
                operation: "read".into(),
                resource_arg_index: 0,
            },
        );
        let args = [GateValue::Str("data/a.txt".into())];
        assert!(gate.safe_call(Callee::Function("open_file"), &args).is_ok());
    }
}
