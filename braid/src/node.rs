//! Node definitions: the registered producers that make up a graph.

use std::sync::Arc;

use crate::adapter::Handler;
use crate::reference::ValueRef;

/// Caching discipline for a node's call instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CacheMode {
    /// Deduplicated within one run, re-run on the next run. Default.
    PerRun,
    /// Never deduplicated: fingerprints uniquely per call site.
    Disabled,
    /// Cached for the life of the process in the [`crate::singleton`] store.
    Singleton,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::PerRun
    }
}

/// Public vs. private visibility, governed by a trailing underscore on the
/// node's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// A declared formal parameter: an ordered name with optional `!`/`?`
/// markers.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub important: bool,
    pub void: bool,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            important: false,
            void: false,
        }
    }

    pub fn important(mut self) -> Self {
        self.important = true;
        self
    }

    pub fn void(mut self) -> Self {
        self.void = true;
        self
    }
}

/// A sub-node invocation a node performs before its handler runs.
#[derive(Clone)]
pub struct ChildBuild {
    pub reference: ValueRef,
    pub alias: Option<String>,
    pub when: Vec<ValueRef>,
    pub unless: Vec<ValueRef>,
    pub modifiers: Vec<ValueRef>,
    /// Per-call-site overrides (`.using(...)`), resolved in the *caller's*
    /// args environment and exposed to the referenced node's own body as
    /// its `args.*` namespace.
    pub using: Vec<(String, ValueRef)>,
}

impl ChildBuild {
    pub fn new(reference: ValueRef) -> Self {
        Self {
            reference,
            alias: None,
            when: Vec::new(),
            unless: Vec::new(),
            modifiers: Vec::new(),
            using: Vec::new(),
        }
    }

    pub fn using(mut self, name: impl Into<String>, value: ValueRef) -> Self {
        self.using.push((name.into(), value));
        self
    }

    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.alias = Some(name.into());
        self
    }

    pub fn when(mut self, guard: ValueRef) -> Self {
        self.when.push(guard);
        self
    }

    pub fn unless(mut self, guard: ValueRef) -> Self {
        self.unless.push(guard);
        self
    }

    pub fn modifier(mut self, modifier: ValueRef) -> Self {
        self.modifiers.push(modifier);
        self
    }
}

/// What kind of producer a node is.
#[derive(Clone)]
pub enum HandlerKind {
    /// An ordinary user-supplied handler.
    UserFn(Arc<dyn Handler>),
    /// "My value equals my declared return child's value." `returns`
    /// defaults to the last non-important child build if `None`.
    Subgraph { returns: Option<ValueRef> },
    /// A lazy wrapper: the node's value is a thunk over `target`.
    Lazy { target: ValueRef },
}

/// A registered node definition.
#[derive(Clone)]
pub struct NodeDef {
    pub name: String,
    pub scope: String,
    pub visibility: Visibility,
    pub handler: HandlerKind,
    pub declared_args: Vec<ArgSpec>,
    pub child_builds: Vec<ChildBuild>,
    pub modifiers: Vec<ValueRef>,
    pub cache_mode: CacheMode,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, scope: impl Into<String>, handler: HandlerKind) -> Self {
        let name = name.into();
        let visibility = if name.ends_with('_') {
            Visibility::Private
        } else {
            Visibility::Public
        };
        Self {
            name,
            scope: scope.into(),
            visibility,
            handler,
            declared_args: Vec::new(),
            child_builds: Vec::new(),
            modifiers: Vec::new(),
            cache_mode: CacheMode::PerRun,
        }
    }

    pub fn with_args(mut self, args: Vec<ArgSpec>) -> Self {
        self.declared_args = args;
        self
    }

    pub fn with_children(mut self, children: Vec<ChildBuild>) -> Self {
        self.child_builds = children;
        self
    }

    pub fn with_modifiers(mut self, modifiers: Vec<ValueRef>) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn is_private(&self) -> bool {
        matches!(self.visibility, Visibility::Private)
    }

    /// All references a node directly relies on: declared args resolved
    /// through child builds, modifiers, and (for subgraphs) the returns
    /// reference. Used by the compiler to walk the dependency graph.
    pub fn all_references(&self) -> Vec<&ValueRef> {
        let mut refs: Vec<&ValueRef> = Vec::new();
        for child in &self.child_builds {
            refs.push(&child.reference);
            refs.extend(child.when.iter());
            refs.extend(child.unless.iter());
            refs.extend(child.modifiers.iter());
        }
        refs.extend(self.modifiers.iter());
        if let HandlerKind::Subgraph { returns: Some(r) } = &self.handler {
            refs.push(r);
        }
        if let HandlerKind::Lazy { target } = &self.handler {
            refs.push(target);
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::handler_sync;
    use serde_json::json;

    #[test]
    fn trailing_underscore_marks_private() {
        let def = NodeDef::new("secret_", "root", HandlerKind::UserFn(handler_sync(|_| Ok(json!(1)))));
        assert!(def.is_private());
        let def = NodeDef::new("public", "root", HandlerKind::UserFn(handler_sync(|_| Ok(json!(1)))));
        assert!(!def.is_private());
    }
}
