//! Capability descriptors ("permactions").
//!
//! A permaction is one independently defined capability: a stable uuid, a
//! default grant state, declared default parameters, optional membership in
//! named OR-groups ("unions"), and a pure evaluator deciding whether a set
//! of granted parameters satisfies a concrete request. Capabilities live in
//! a registry keyed by uuid rather than a subclass hierarchy; services
//! register their own descriptors next to the built-ins at startup.

use std::collections::BTreeMap;

use serde_json::{Value, json};

/// Uuid of the built-in masquerade capability.
pub const MASQUERADE_PERMACTION_UUID: &str = "43204251-47fe-46c5-8277-e2ddac0451c4";

/// Union the masquerade capability participates in.
pub const MASQUERADE_UNION: &str = "masquerade";

/// Whether a capability is a boolean gate or carries a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermactionKind {
    /// Boolean gate: grant state plus evaluator decide access.
    Check,
    /// Value-bearing: the resolved value itself is the answer.
    Value,
}

impl PermactionKind {
    /// Storage string form (`perm_type` column).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Value => "value",
        }
    }
}

/// Pure evaluator: does this set of granted params satisfy the request?
pub type Evaluator = fn(granted: &Value, requested: &Value) -> bool;

/// One registered capability.
#[derive(Debug, Clone)]
pub struct PermactionDescriptor {
    /// Immutable identity.
    pub uuid: &'static str,
    /// Gate or value-bearing.
    pub kind: PermactionKind,
    /// Short human name.
    pub title: &'static str,
    /// What granting this capability means.
    pub description: &'static str,
    /// Grant state applied when no override row exists. `0` is denied.
    pub default_value: i64,
    /// Named OR-groups this capability participates in.
    pub unions: &'static [&'static str],
    /// Declared parameter shape.
    pub default_params: fn() -> Value,
    /// Capability-specific grant predicate.
    pub evaluator: Evaluator,
}

impl PermactionDescriptor {
    /// Declared default parameters.
    #[must_use]
    pub fn params(&self) -> Value {
        (self.default_params)()
    }

    /// Whether this capability participates in `union`.
    #[must_use]
    pub fn in_union(&self, union: &str) -> bool {
        self.unions.contains(&union)
    }
}

/// Registry of capability descriptors, keyed by permaction uuid.
#[derive(Debug, Clone)]
pub struct PermactionRegistry {
    descriptors: BTreeMap<&'static str, PermactionDescriptor>,
}

impl Default for PermactionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PermactionRegistry {
    /// Empty registry, for services that opt out of every built-in.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            descriptors: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with the built-in capabilities.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(MASQUERADE_DESCRIPTOR);
        registry
    }

    /// Registers a descriptor, replacing any previous one with the same
    /// uuid.
    pub fn register(&mut self, descriptor: PermactionDescriptor) {
        self.descriptors.insert(descriptor.uuid, descriptor);
    }

    /// Looks up a descriptor by uuid.
    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<&PermactionDescriptor> {
        self.descriptors.get(uuid)
    }

    /// All descriptors participating in `union`, in uuid order.
    pub fn union_members<'a>(
        &'a self,
        union: &'a str,
    ) -> impl Iterator<Item = &'a PermactionDescriptor> + 'a {
        self.descriptors
            .values()
            .filter(move |descriptor| descriptor.in_union(union))
    }

    /// All registered descriptors, in uuid order.
    pub fn iter(&self) -> impl Iterator<Item = &PermactionDescriptor> {
        self.descriptors.values()
    }
}

/// Built-in masquerade capability: the granted params carry the list of
/// actor uuids the holder may impersonate.
pub const MASQUERADE_DESCRIPTOR: PermactionDescriptor = PermactionDescriptor {
    uuid: MASQUERADE_PERMACTION_UUID,
    kind: PermactionKind::Check,
    title: "Allow masquerading.",
    description: "Allows working as another actor. The granted params list \
                  the target uuids, e.g. {\"masquerade\": [\"<uuid>\"]}.",
    default_value: 0,
    unions: &[MASQUERADE_UNION],
    default_params: default_masquerade_params,
    evaluator: masquerade_grants,
};

fn default_masquerade_params() -> Value {
    json!({ "masquerade": [] })
}

/// Every requested target must appear in the granted target list.
fn masquerade_grants(granted: &Value, requested: &Value) -> bool {
    let Some(requested_targets) = requested.get("masquerade").and_then(Value::as_array) else {
        return false;
    };
    if requested_targets.is_empty() {
        return false;
    }
    let Some(granted_targets) = granted.get("masquerade").and_then(Value::as_array) else {
        return false;
    };
    requested_targets
        .iter()
        .all(|target| granted_targets.contains(target))
}
