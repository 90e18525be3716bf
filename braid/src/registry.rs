//! Graph registry: a collection of node definitions, keyed by unique name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::adapter::{BoxFuture, Handler};
use crate::error::{BraidError, Result};
use crate::node::{ArgSpec, CacheMode, ChildBuild, HandlerKind, NodeDef};
use crate::reference::ValueRef;

/// How strictly an enforcement toggle is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforceMode {
    Silent,
    Warn,
    Error,
}

impl Default for EnforceMode {
    fn default() -> Self {
        EnforceMode::Silent
    }
}

/// The `enforce*` toggles, gathered into one struct.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub two_part_names: EnforceMode,
    pub types: EnforceMode,
    pub matching_params: bool,
    pub builder_names: EnforceMode,
    /// Callbacks administratively disabled for the graph: every compiled
    /// plan built from this registry carries this flag, and the engine
    /// passes it to every [`crate::adapter::Handler::call`], so a
    /// callback-style or hybrid handler treats "no immediate value" as the
    /// literal value `undefined` instead of waiting on a completion.
    pub callbacks_disabled: bool,
}

type ReadyCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A collection of node definitions. Not thread-shared: a registry is built
/// up single-threadedly, then `ready()`-d and handed to a
/// [`crate::builder::GraphBuilder`].
pub struct GraphRegistry {
    nodes: HashMap<String, NodeDef>,
    scope: String,
    config: RegistryConfig,
    anon_counter: u64,
    ready_callbacks: Vec<ReadyCallback>,
}

impl Default for GraphRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            scope: "root".to_string(),
            config: RegistryConfig::default(),
            anon_counter: 0,
            ready_callbacks: Vec::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn set_scope(&mut self, name: impl Into<String>) -> &mut Self {
        self.scope = name.into();
        self
    }

    pub fn enforce_two_part_names(&mut self, mode: EnforceMode) -> &mut Self {
        self.config.two_part_names = mode;
        self
    }

    pub fn enforce_types(&mut self, mode: EnforceMode) -> &mut Self {
        self.config.types = mode;
        self
    }

    pub fn enforce_matching_params(&mut self) -> &mut Self {
        self.config.matching_params = true;
        self
    }

    pub fn enforce_builder_names(&mut self, mode: EnforceMode) -> &mut Self {
        self.config.builder_names = mode;
        self
    }

    /// Administratively disable callback-style completion for every node in
    /// this graph, regardless of how each handler was individually
    /// constructed. Takes effect at the next `compile()`.
    pub fn disable_callbacks(&mut self) -> &mut Self {
        self.config.callbacks_disabled = true;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn get(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeDef)> {
        self.nodes.iter()
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(BraidError::InvalidName {
                name: name.to_string(),
                reason: "name must not be empty".into(),
            });
        }
        if matches!(self.config.two_part_names, EnforceMode::Warn | EnforceMode::Error) {
            let dashes = name.matches('-').count();
            if dashes != 1 {
                let reason = format!("expected exactly one '-' separator, found {dashes}");
                if self.config.two_part_names == EnforceMode::Error {
                    return Err(BraidError::InvalidName {
                        name: name.to_string(),
                        reason,
                    });
                }
                tracing::warn!(name, reason, "two-part naming rule violated");
            }
        }
        Ok(())
    }

    /// Register a node. `+name` (the node's own declared name carrying the
    /// `+` prefix) is the explicit override form and replaces any prior
    /// definition; a bare name fails if already registered.
    pub fn add(&mut self, def: NodeDef) -> Result<()> {
        let (final_name, is_override) = match def.name.strip_prefix('+') {
            Some(stripped) => (stripped.to_string(), true),
            None => (def.name.clone(), false),
        };
        if !is_override && self.nodes.contains_key(&final_name) {
            return Err(BraidError::DuplicateName(final_name));
        }
        self.validate_name(&final_name)?;
        if matches!(def.handler, HandlerKind::UserFn(_)) && self.config.matching_params {
            // Strict arity matching can only be verified at the boundary of
            // a concrete handler's arity, which Rust's type system already
            // enforces via the explicit `Args` accessor contract —
            // declared_args.len() is the handler's only source of truth
            // here, so this just checks declared_args for duplicate names.
            let mut seen = std::collections::HashSet::new();
            for arg in &def.declared_args {
                if !seen.insert(arg.name.clone()) {
                    return Err(BraidError::ArgCountMismatch {
                        node: final_name,
                        declared: def.declared_args.len(),
                        actual: seen.len(),
                    });
                }
            }
        }
        let mut def = def;
        def.name = final_name.clone();
        tracing::debug!(name = %final_name, scope = %def.scope, "node registered");
        self.nodes.insert(final_name, def);
        Ok(())
    }

    /// Register an anonymous node, generating a unique name from `hint`.
    /// Returns the generated name.
    pub fn add_anonymous(
        &mut self,
        hint: &str,
        handler: Arc<dyn Handler>,
        deps: Vec<(String, ValueRef)>,
    ) -> Result<String> {
        self.anon_counter += 1;
        let name = format!("{hint}$anon{}", self.anon_counter);
        let args: Vec<ArgSpec> = deps.iter().map(|(k, _)| ArgSpec::new(k.clone())).collect();
        let children: Vec<ChildBuild> = deps
            .into_iter()
            .map(|(k, r)| ChildBuild::new(r).alias(k))
            .collect();
        let def = NodeDef::new(&name, self.scope.clone(), HandlerKind::UserFn(handler))
            .with_args(args)
            .with_children(children);
        self.add(def)?;
        Ok(name)
    }

    /// Register a lazy node: `name`'s value is a thunk over a hidden
    /// sibling node carrying `handler`/`declared_args`/`children` (spec
    /// §4.1 `addLazy`).
    pub fn add_lazy(
        &mut self,
        name: &str,
        handler: Arc<dyn Handler>,
        declared_args: Vec<ArgSpec>,
        children: Vec<ChildBuild>,
    ) -> Result<()> {
        let hidden = format!("{name}$lazy_target");
        let target_def = NodeDef::new(&hidden, self.scope.clone(), HandlerKind::UserFn(handler))
            .with_args(declared_args)
            .with_children(children);
        self.add(target_def)?;
        let lazy_def = NodeDef::new(
            name,
            self.scope.clone(),
            HandlerKind::Lazy {
                target: ValueRef::parse(&hidden),
            },
        );
        self.add(lazy_def)
    }

    /// Wrap a captured value as a pure producer reference. Structural
    /// dedup across identical literals happens at compile time, not here.
    pub fn literal(&self, value: impl Into<serde_json::Value>) -> ValueRef {
        ValueRef::literal(value)
    }

    /// Queue a callback fired, in registration order, by `ready()`. If the
    /// callback's future doesn't resolve immediately, subsequent callbacks
    /// wait for it.
    pub fn on_ready<F, Fut>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ready_callbacks.push(Box::new(move || Box::pin(callback())));
        self
    }

    /// Resolve all queued `on_ready` callbacks, in registration order.
    pub async fn ready(&mut self) {
        let callbacks = std::mem::take(&mut self.ready_callbacks);
        for callback in callbacks {
            callback().await;
        }
    }
}

impl Clone for GraphRegistry {
    /// A deep copy sharing no mutable state. Handler closures are
    /// immutable `Arc<dyn Handler>`s, so sharing those `Arc`s is not
    /// sharing mutable state; `on_ready` callbacks are one-shot `FnOnce`
    /// values and cannot be cloned, so a cloned registry starts with an
    /// empty ready-callback queue (see DESIGN.md's Open Question notes).
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            scope: self.scope.clone(),
            config: self.config.clone(),
            anon_counter: self.anon_counter,
            ready_callbacks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::handler_sync;
    use serde_json::json;

    fn noop_handler() -> Arc<dyn Handler> {
        handler_sync(|_| Ok(json!(null)))
    }

    #[test]
    fn add_rejects_duplicate_without_override() {
        let mut reg = GraphRegistry::new();
        reg.add(NodeDef::new("a", "root", HandlerKind::UserFn(noop_handler()))).unwrap();
        let err = reg
            .add(NodeDef::new("a", "root", HandlerKind::UserFn(noop_handler())))
            .unwrap_err();
        assert!(matches!(err, BraidError::DuplicateName(n) if n == "a"));
    }

    #[test]
    fn override_form_replaces_prior_definition() {
        let mut reg = GraphRegistry::new();
        reg.add(NodeDef::new("a", "root", HandlerKind::UserFn(noop_handler()))).unwrap();
        reg.add(NodeDef::new("+a", "root", HandlerKind::UserFn(noop_handler()))).unwrap();
        assert!(reg.contains("a"));
    }

    #[test]
    fn two_part_naming_rule_in_error_mode() {
        let mut reg = GraphRegistry::new();
        reg.enforce_two_part_names(EnforceMode::Error);
        let err = reg
            .add(NodeDef::new("onepart", "root", HandlerKind::UserFn(noop_handler())))
            .unwrap_err();
        assert!(matches!(err, BraidError::InvalidName { .. }));
        reg.add(NodeDef::new("str-toUpper", "root", HandlerKind::UserFn(noop_handler())))
            .unwrap();
    }

    #[test]
    fn add_anonymous_generates_unique_names() {
        let mut reg = GraphRegistry::new();
        let n1 = reg.add_anonymous("inline", noop_handler(), vec![]).unwrap();
        let n2 = reg.add_anonymous("inline", noop_handler(), vec![]).unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn add_lazy_registers_hidden_sibling() {
        let mut reg = GraphRegistry::new();
        reg.add_lazy("lazyThree", noop_handler(), vec![], vec![]).unwrap();
        assert!(reg.contains("lazyThree"));
        assert!(reg.contains("lazyThree$lazy_target"));
    }

    #[tokio::test]
    async fn ready_runs_callbacks_in_order() {
        let mut reg = GraphRegistry::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let l1 = log.clone();
        reg.on_ready(move || {
            l1.lock().unwrap().push(1);
            std::future::ready(())
        });
        let l2 = log.clone();
        reg.on_ready(move || {
            l2.lock().unwrap().push(2);
            std::future::ready(())
        });
        reg.ready().await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn clone_shares_no_ready_callbacks() {
        let mut reg = GraphRegistry::new();
        reg.on_ready(|| std::future::ready(()));
        let cloned = reg.clone();
        assert_eq!(cloned.ready_callbacks.len(), 0);
    }
}
