//! The compiled plan value object.
//!
//! A [`CompiledPlan`] is immutable data: a list of call instances with
//! fully-resolved input wiring, plus a list of output assignments. It
//! carries no behavior of its own — [`crate::engine`] walks it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::adapter::Handler;
use crate::node::CacheMode;

/// A stable identifier for one call instance within a single compiled plan,
/// derived from `(node-name, resolved-input-fingerprints, cache-mode)`.
pub type Fingerprint = u64;

/// Where one call instance's input slot gets its value from.
#[derive(Debug, Clone)]
pub enum InputSlot {
    /// Another call instance's resolved value.
    Call(Fingerprint),
    /// A dotted-path projection into another call instance's resolved value.
    CallPath(Fingerprint, Vec<String>),
    /// A value supplied in the runtime input bundle at `run()` time,
    /// optionally projected.
    RuntimeInput(String, Vec<String>),
}

/// A guard attached to a call instance: the instance transitions straight
/// to `Skipped` without running its handler if the guard's truthiness
/// (negated for `unless`) comes out false.
#[derive(Debug, Clone)]
pub struct GuardSlot {
    pub source: InputSlot,
    /// `true` for an `unless` guard (skip when truthy).
    pub negate: bool,
}

/// The shape an [`CallHandler::Assemble`] call builds: object and array
/// literals composed from other call instances' resolved values.
#[derive(Debug, Clone)]
pub enum AssembleShape {
    Object(Vec<(String, InputSlot)>),
    Array(Vec<InputSlot>),
}

/// What a call instance actually invokes.
#[derive(Clone)]
pub enum CallHandler {
    User(Arc<dyn Handler>),
    Literal(Value),
    /// A lazy wrapper: resolves to a thunk over `target`, never runs it eagerly.
    LazyThunk(Fingerprint),
    /// Builds an object or array shape from other calls' resolved values,
    /// without invoking a user handler.
    Assemble(AssembleShape),
}

/// One concrete invocation of a producer within a compiled plan.
#[derive(Clone)]
pub struct CompiledCall {
    pub fingerprint: Fingerprint,
    pub debug_name: String,
    pub node_name: String,
    pub handler: CallHandler,
    /// Ordered `(declared-arg-name, slot)` pairs.
    pub inputs: Vec<(String, InputSlot)>,
    /// Happens-before predecessors whose value is discarded.
    pub important: Vec<Fingerprint>,
    pub guards: Vec<GuardSlot>,
    /// Chain of modifier call fingerprints to pipe the raw result through,
    /// in order. Each modifier call's sole input is the previous stage's
    /// result, bound under the name `"value"`.
    pub modifiers: Vec<Fingerprint>,
    pub cache_mode: CacheMode,
}

/// Read-only introspection of one compiled call instance.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompiledNodeInfo {
    pub fingerprint: Fingerprint,
    pub debug_name: String,
    pub node_name: String,
    pub cache_mode: CacheMode,
    pub has_guards: bool,
    pub important_count: usize,
}

/// Edge kind for dependency-listing introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EdgeKind {
    Value,
    Important,
    Guard,
    Modifier,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DependencyEdge {
    pub from: Fingerprint,
    pub to: Fingerprint,
    pub kind: EdgeKind,
}

/// An immutable, fully-resolved execution plan.
#[derive(Clone)]
pub struct CompiledPlan {
    pub calls: HashMap<Fingerprint, CompiledCall>,
    /// `out-alias -> fingerprint`, in requested order.
    pub outputs: Vec<(String, Fingerprint)>,
    /// Snapshot of the registry's `RegistryConfig::callbacks_disabled` at
    /// compile time, threaded through to every `Handler::call` in this plan.
    pub callbacks_disabled: bool,
}

impl CompiledPlan {
    pub fn call(&self, fingerprint: Fingerprint) -> Option<&CompiledCall> {
        self.calls.get(&fingerprint)
    }

    /// Typed introspection over every call instance in the plan.
    pub fn compiled_nodes(&self) -> Vec<CompiledNodeInfo> {
        let mut nodes: Vec<CompiledNodeInfo> = self
            .calls
            .values()
            .map(|c| CompiledNodeInfo {
                fingerprint: c.fingerprint,
                debug_name: c.debug_name.clone(),
                node_name: c.node_name.clone(),
                cache_mode: c.cache_mode,
                has_guards: !c.guards.is_empty(),
                important_count: c.important.len(),
            })
            .collect();
        nodes.sort_by_key(|n| n.fingerprint);
        nodes
    }

    /// Adjacency listing across all edge kinds.
    pub fn dependencies(&self) -> Vec<DependencyEdge> {
        let mut edges = Vec::new();
        for call in self.calls.values() {
            for (_, slot) in &call.inputs {
                if let InputSlot::Call(fp) | InputSlot::CallPath(fp, _) = slot {
                    edges.push(DependencyEdge {
                        from: call.fingerprint,
                        to: *fp,
                        kind: EdgeKind::Value,
                    });
                }
            }
            for fp in &call.important {
                edges.push(DependencyEdge {
                    from: call.fingerprint,
                    to: *fp,
                    kind: EdgeKind::Important,
                });
            }
            for guard in &call.guards {
                if let InputSlot::Call(fp) | InputSlot::CallPath(fp, _) = guard.source {
                    edges.push(DependencyEdge {
                        from: call.fingerprint,
                        to: fp,
                        kind: EdgeKind::Guard,
                    });
                }
            }
            if let CallHandler::Assemble(shape) = &call.handler {
                let slots: Vec<&InputSlot> = match shape {
                    AssembleShape::Object(fields) => fields.iter().map(|(_, s)| s).collect(),
                    AssembleShape::Array(items) => items.iter().collect(),
                };
                for slot in slots {
                    if let InputSlot::Call(fp) | InputSlot::CallPath(fp, _) = slot {
                        edges.push(DependencyEdge {
                            from: call.fingerprint,
                            to: *fp,
                            kind: EdgeKind::Value,
                        });
                    }
                }
            }
            for fp in &call.modifiers {
                edges.push(DependencyEdge {
                    from: call.fingerprint,
                    to: *fp,
                    kind: EdgeKind::Modifier,
                });
            }
        }
        edges
    }
}

/// JSON truthiness used by `when`/`unless` guard evaluation: `null`,
/// `false`, `0`, empty string, empty array, and empty object are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
