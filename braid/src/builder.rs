//! Per-requested-output builder surface: the thing users actually call
//! `compile()`/`run()` on, backed by a [`GraphRegistry`] and the
//! [`crate::compiler`]/[`crate::engine`] pipeline underneath.
//!
//! Chained `&mut Self` setters accumulate a request, then a consuming
//! `compile()` hands off to the runtime layer.

use std::collections::HashSet;
use std::sync::Arc;

use crate::compiler::{self, CompileRequest, OutputRequest};
use crate::engine::{self, OutputValue};
use crate::error::Result;
use crate::hooks::{OutputMap, PostHooks, PreHooks, RuntimeInputs};
use crate::node::ChildBuild;
use crate::reference::ValueRef;
use crate::registry::GraphRegistry;
use crate::singleton::SingletonStore;
use crate::trace::{EventSink, TracingSink};

/// One requested output, accumulated by [`GraphBuilder::builds`] and refined
/// by [`ConfiguredOutput`] before `compile()`/`run()`.
struct PendingOutput {
    alias: String,
    build: ChildBuild,
}

/// Builds a requested-output bundle against a [`GraphRegistry`], then
/// compiles and runs it.
pub struct GraphBuilder<'a> {
    registry: &'a GraphRegistry,
    outputs: Vec<PendingOutput>,
    compile_inputs: HashSet<String>,
    pre_hooks: PreHooks,
    post_hooks: PostHooks,
    singleton_store: Arc<SingletonStore>,
    sink: Arc<dyn EventSink>,
    frozen: bool,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a GraphRegistry) -> Self {
        Self {
            registry,
            outputs: Vec::new(),
            compile_inputs: HashSet::new(),
            pre_hooks: PreHooks::new(),
            post_hooks: PostHooks::new(),
            singleton_store: Arc::new(SingletonStore::new()),
            sink: Arc::new(TracingSink),
            frozen: false,
        }
    }

    /// Share a process-wide singleton store (e.g. [`SingletonStore::global`])
    /// instead of this builder's own private one.
    pub fn with_singleton_store(mut self, store: Arc<SingletonStore>) -> Self {
        self.singleton_store = store;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Request an output built from `reference`. Returns a handle for
    /// attaching `using`/`when`/`unless`/`modifier`/`alias` configuration to
    /// that specific request.
    pub fn builds(&mut self, reference: ValueRef) -> ConfiguredOutput<'_, 'a> {
        debug_assert!(!self.frozen, "builds() called after freeze_outputs()");
        let alias = reference.node_name().unwrap_or("$out").to_string();
        self.outputs.push(PendingOutput {
            alias,
            build: ChildBuild::new(reference),
        });
        let index = self.outputs.len() - 1;
        ConfiguredOutput { builder: self, index }
    }

    /// Subgraph-local configuration for an already-requested output: `{alias
    /// remap, using overrides, modifiers}` without re-declaring the build.
    pub fn configure(&mut self, reference: ValueRef) -> ConfiguredOutput<'_, 'a> {
        self.builds(reference)
    }

    pub fn set_compile_inputs(&mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.compile_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn pre_run<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(RuntimeInputs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<RuntimeInputs>> + Send + 'static,
    {
        self.pre_hooks.push(hook);
        self
    }

    pub fn post_run<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(OutputMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<OutputMap>> + Send + 'static,
    {
        self.post_hooks.push(hook);
        self
    }

    /// Lock the requested-output set: further `builds()` calls on this
    /// builder are a programmer error, not a runtime one, so this is
    /// enforced by convention (a debug assertion) rather than a `Result`.
    pub fn freeze_outputs(&mut self) -> &mut Self {
        self.frozen = true;
        self
    }

    fn compile_request(&self) -> CompileRequest {
        CompileRequest {
            outputs: self
                .outputs
                .iter()
                .map(|o| OutputRequest {
                    alias: o.alias.clone(),
                    build: o.build.clone(),
                })
                .collect(),
            compile_inputs: self.compile_inputs.clone(),
        }
    }

    /// Compile the accumulated requested outputs into an immutable plan.
    pub fn compile(&self) -> Result<Arc<crate::plan::CompiledPlan>> {
        debug_assert!(!self.outputs.is_empty(), "compile() called with no requested outputs");
        let request = self.compile_request();
        let plan = compiler::compile(self.registry, &request)?;
        Ok(Arc::new(plan))
    }

    /// Compile (if not already) and run against a runtime input bundle,
    /// applying pre-hooks before scheduling and post-hooks on the assembled
    /// output map.
    pub async fn run(&self, inputs: RuntimeInputs) -> Result<std::collections::HashMap<String, OutputValue>> {
        let plan = self.compile()?;
        let inputs = self.pre_hooks.run(inputs).await?;
        let out = engine::run(plan, inputs, self.singleton_store.clone(), self.sink.clone()).await?;

        let (values, lazies): (Vec<_>, Vec<_>) = out.into_iter().partition(|(_, v)| matches!(v, OutputValue::Value(_)));
        let mut value_map: OutputMap = values
            .into_iter()
            .map(|(k, v)| match v {
                OutputValue::Value(val) => (k, val),
                OutputValue::Lazy(_) => unreachable!(),
            })
            .collect();
        value_map = self.post_hooks.run(value_map).await?;

        let mut result = std::collections::HashMap::with_capacity(value_map.len() + lazies.len());
        for (k, v) in value_map {
            result.insert(k, OutputValue::Value(v));
        }
        for (k, v) in lazies {
            result.insert(k, v);
        }
        Ok(result)
    }
}

/// A view onto one requested output's [`ChildBuild`], returned by
/// [`GraphBuilder::builds`]/[`GraphBuilder::configure`].
pub struct ConfiguredOutput<'b, 'a> {
    builder: &'b mut GraphBuilder<'a>,
    index: usize,
}

impl<'b, 'a> ConfiguredOutput<'b, 'a> {
    fn build_mut(&mut self) -> &mut PendingOutput {
        &mut self.builder.outputs[self.index]
    }

    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.build_mut().alias = name.into();
        self
    }

    pub fn using(mut self, name: impl Into<String>, value: ValueRef) -> Self {
        let out = self.build_mut();
        out.build = std::mem::replace(&mut out.build, ChildBuild::new(ValueRef::literal(serde_json::Value::Null))).using(name, value);
        self
    }

    pub fn modifier(mut self, modifier: ValueRef) -> Self {
        let out = self.build_mut();
        out.build = std::mem::replace(&mut out.build, ChildBuild::new(ValueRef::literal(serde_json::Value::Null))).modifier(modifier);
        self
    }

    pub fn when(mut self, guard: ValueRef) -> Self {
        let out = self.build_mut();
        out.build = std::mem::replace(&mut out.build, ChildBuild::new(ValueRef::literal(serde_json::Value::Null))).when(guard);
        self
    }

    pub fn unless(mut self, guard: ValueRef) -> Self {
        let out = self.build_mut();
        out.build = std::mem::replace(&mut out.build, ChildBuild::new(ValueRef::literal(serde_json::Value::Null))).unless(guard);
        self
    }

    /// `if/else/end` block form: attach `when(cond)` to this output and
    /// `unless(cond)` to `other`, so exactly one of the two runs.
    pub fn or_else(self, cond: ValueRef, other: ConfiguredOutput<'b, 'a>) -> (Self, ConfiguredOutput<'b, 'a>) {
        let this = self.when(cond.clone());
        let other = other.unless(cond);
        (this, other)
    }

    /// Finish configuring and get the builder back for chaining further
    /// `builds()` calls.
    pub fn done(self) -> &'b mut GraphBuilder<'a> {
        self.builder
    }
}
