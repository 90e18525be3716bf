//! Dependency compiler: turns a registry plus a set of requested outputs
//! into an immutable [`CompiledPlan`].
//!
//! Compilation walks reference trees depth-first, building one
//! [`CompiledCall`] per distinct `(node name, resolved inputs, cache mode)`
//! combination and folding together call sites that land on the same
//! combination — this is where deduplication happens, once, rather than at
//! run time. Everything here is synchronous and side-effect free: no
//! handler ever runs during compilation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::adapter::{handler_sync, Handler};
use crate::error::{BraidError, Result};
use crate::node::{CacheMode, ChildBuild, HandlerKind, NodeDef, Visibility};
use crate::plan::{AssembleShape, CallHandler, CompiledCall, CompiledPlan, Fingerprint, GuardSlot, InputSlot};
use crate::reference::{ArgsKey, ValueRef};
use crate::registry::GraphRegistry;

/// What a requested output, or a node's own declaration, resolves `args.*`
/// against. `Runtime` is only reachable at the outermost request where no
/// enclosing `using(...)` override exists; everywhere else a node body's
/// `args.*` reads the map the *caller* supplied for that specific call site.
enum ArgsEnv {
    Runtime,
    Using(HashMap<String, InputSlot>),
}

/// One requested output: an alias plus the build describing what to compute.
pub struct OutputRequest {
    pub alias: String,
    pub build: ChildBuild,
}

/// Everything the compiler needs besides the registry itself.
pub struct CompileRequest {
    pub outputs: Vec<OutputRequest>,
    /// Runtime input names the caller promises to supply to `run()`. Used
    /// to catch missing `args.K` wiring at compile time instead of at run
    /// time.
    pub compile_inputs: HashSet<String>,
}

pub fn compile(registry: &GraphRegistry, request: &CompileRequest) -> Result<CompiledPlan> {
    static_cycle_check(registry)?;

    let mut compiler = Compiler {
        registry,
        compile_inputs: request.compile_inputs.clone(),
        calls: HashMap::new(),
        dedup: HashMap::new(),
        next_fp: 1,
        anon_inline: 0,
        building: HashSet::new(),
        missing_inputs: Vec::new(),
    };

    let mut outputs = Vec::with_capacity(request.outputs.len());
    for out in &request.outputs {
        let slot = compiler.build_child(&out.build, "root", &ArgsEnv::Runtime)?;
        let fp = compiler.materialize(slot);
        outputs.push((out.alias.clone(), fp));
    }

    if !compiler.missing_inputs.is_empty() {
        let mut names: Vec<String> = compiler.missing_inputs.into_iter().collect();
        names.sort();
        return Err(BraidError::MissingCompileInput(names));
    }

    let plan = CompiledPlan {
        calls: compiler.calls,
        outputs,
        callbacks_disabled: registry.config().callbacks_disabled,
    };
    check_singleton_purity(&plan)?;
    Ok(plan)
}

struct Compiler<'a> {
    registry: &'a GraphRegistry,
    compile_inputs: HashSet<String>,
    calls: HashMap<Fingerprint, CompiledCall>,
    dedup: HashMap<String, Fingerprint>,
    next_fp: Fingerprint,
    anon_inline: u64,
    building: HashSet<String>,
    missing_inputs: Vec<String>,
}

impl<'a> Compiler<'a> {
    /// Turn an `InputSlot` that might be a bare runtime-input read into a
    /// `Fingerprint`-backed call, for call sites (guards, modifier chains,
    /// declared args) that need an actual call instance rather than a slot.
    /// Most callers keep working with `InputSlot` directly and never pay
    /// for this.
    fn materialize(&mut self, slot: InputSlot) -> Fingerprint {
        match slot {
            InputSlot::Call(fp) | InputSlot::CallPath(fp, _) => fp,
            InputSlot::RuntimeInput(..) => {
                // A bare runtime-input read as a top-level output: wrap it
                // in a trivial passthrough so the plan always has a call to
                // point outputs at.
                self.push_call(
                    format!("$runtime_input_passthrough#{}", self.next_fp),
                    "$runtime_input_passthrough".to_string(),
                    CallHandler::User(passthrough_handler()),
                    vec![("value".to_string(), slot)],
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    CacheMode::PerRun,
                )
            }
        }
    }

    fn push_call(
        &mut self,
        signature: String,
        debug_name: String,
        handler: CallHandler,
        inputs: Vec<(String, InputSlot)>,
        important: Vec<Fingerprint>,
        guards: Vec<GuardSlot>,
        modifiers: Vec<Fingerprint>,
        cache_mode: CacheMode,
    ) -> Fingerprint {
        if cache_mode != CacheMode::Disabled {
            if let Some(existing) = self.dedup.get(&signature) {
                return *existing;
            }
        }
        let fp = self.next_fp;
        self.next_fp += 1;
        if cache_mode != CacheMode::Disabled {
            self.dedup.insert(signature, fp);
        }
        let node_name = debug_name.clone();
        self.calls.insert(
            fp,
            CompiledCall {
                fingerprint: fp,
                debug_name,
                node_name,
                handler,
                inputs,
                important,
                guards,
                modifiers,
                cache_mode,
            },
        );
        fp
    }

    /// Resolve a single `ChildBuild`: its guards, its `using` overrides (in
    /// the parent env), then the reference itself in a fresh env scoped to
    /// that `using` map.
    fn build_child(&mut self, child: &ChildBuild, scope: &str, parent_env: &ArgsEnv) -> Result<InputSlot> {
        let mut using_map = HashMap::new();
        for (name, value_ref) in &child.using {
            let slot = self.build_reference(value_ref, scope, parent_env)?;
            using_map.insert(name.clone(), slot);
        }
        let child_env = if using_map.is_empty() {
            match parent_env {
                ArgsEnv::Runtime => ArgsEnv::Runtime,
                ArgsEnv::Using(_) => ArgsEnv::Using(HashMap::new()),
            }
        } else {
            ArgsEnv::Using(using_map)
        };

        let mut guards = Vec::new();
        for g in &child.when {
            let source = self.build_reference(g, scope, parent_env)?;
            guards.push(GuardSlot { source, negate: false });
        }
        for g in &child.unless {
            let source = self.build_reference(g, scope, parent_env)?;
            guards.push(GuardSlot { source, negate: true });
        }

        let base = self.build_reference(&child.reference, scope, &child_env)?;
        let base_fp = self.materialize(base);

        let modifier_chain = self.build_modifier_chain(base_fp, &child.modifiers, scope, parent_env)?;
        let final_fp = modifier_chain.last().copied().unwrap_or(base_fp);

        if guards.is_empty() {
            return Ok(InputSlot::Call(final_fp));
        }
        // Wrap the guarded call so its own guard list lives on a call
        // instance distinct from whatever else references the same target
        // unguarded.
        let wrapped_signature = format!("$guarded:{final_fp}:{guards:?}");
        let wrapped_debug_name = self.calls.get(&final_fp).map(|c| c.debug_name.clone()).unwrap_or_default();
        let fp = self.push_call(
            wrapped_signature,
            wrapped_debug_name,
            CallHandler::User(passthrough_handler()),
            vec![("value".to_string(), InputSlot::Call(final_fp))],
            Vec::new(),
            guards,
            Vec::new(),
            CacheMode::PerRun,
        );
        Ok(InputSlot::Call(fp))
    }

    fn build_modifier_chain(
        &mut self,
        mut stage: Fingerprint,
        modifiers: &[ValueRef],
        scope: &str,
        env: &ArgsEnv,
    ) -> Result<Vec<Fingerprint>> {
        let mut chain = Vec::with_capacity(modifiers.len());
        for modifier in modifiers {
            stage = self.build_modifier(stage, modifier, scope, env)?;
            chain.push(stage);
        }
        Ok(chain)
    }

    /// A modifier takes the previous stage's resolved value under the
    /// fixed argument name `value`; any other dependencies it declares
    /// resolve normally.
    fn build_modifier(&mut self, stage: Fingerprint, modifier: &ValueRef, scope: &str, env: &ArgsEnv) -> Result<Fingerprint> {
        match modifier {
            ValueRef::Node { name, .. } => {
                let value_override = HashMap::from([("value".to_string(), InputSlot::Call(stage))]);
                self.build_node_call(name, scope, ArgsEnv::Using(value_override))
            }
            ValueRef::InlineFn { handler, deps } => {
                let mut inputs = Vec::with_capacity(deps.len() + 1);
                let mut saw_value = false;
                for (dep_name, dep_ref) in deps {
                    if dep_name == "value" {
                        inputs.push((dep_name.clone(), InputSlot::Call(stage)));
                        saw_value = true;
                    } else {
                        let slot = self.build_reference(dep_ref, scope, env)?;
                        inputs.push((dep_name.clone(), slot));
                    }
                }
                if !saw_value {
                    inputs.insert(0, ("value".to_string(), InputSlot::Call(stage)));
                }
                self.anon_inline += 1;
                let debug_name = format!("$modifier#{}", self.anon_inline);
                let signature = format!("$modifier:{stage}:{debug_name}");
                Ok(self.push_call(
                    signature,
                    debug_name,
                    CallHandler::User(handler.clone()),
                    inputs,
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    CacheMode::PerRun,
                ))
            }
            other => Err(BraidError::Configuration(format!(
                "modifier references must name a node or an inline function, got {other:?}"
            ))),
        }
    }

    /// Resolve any reference form to an input slot. Does not force a
    /// `RuntimeInput` slot into its own call — callers that need a
    /// `Fingerprint` should go through [`Compiler::materialize`].
    fn build_reference(&mut self, reference: &ValueRef, scope: &str, env: &ArgsEnv) -> Result<InputSlot> {
        match reference {
            ValueRef::Node { name, path, void, .. } => {
                if !self.registry.contains(name) {
                    if *void {
                        return Ok(self.literal_slot(Value::Null));
                    }
                    return Err(BraidError::MissingProducer(name.clone()));
                }
                let fp = self.build_node_call(name, scope, clone_env(env))?;
                Ok(if path.is_empty() {
                    InputSlot::Call(fp)
                } else {
                    InputSlot::CallPath(fp, path.clone())
                })
            }
            ValueRef::Args { key, path, void, .. } => self.resolve_args(env, key, path, *void),
            ValueRef::Literal(value) => Ok(self.literal_slot(value.clone())),
            ValueRef::InlineFn { handler, deps } => {
                let mut inputs = Vec::with_capacity(deps.len());
                for (name, dep_ref) in deps {
                    let slot = self.build_reference(dep_ref, scope, env)?;
                    inputs.push((name.clone(), slot));
                }
                self.anon_inline += 1;
                let debug_name = format!("$inline#{}", self.anon_inline);
                let signature = format!("$inline:{debug_name}");
                Ok(InputSlot::Call(self.push_call(
                    signature,
                    debug_name,
                    CallHandler::User(handler.clone()),
                    inputs,
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    CacheMode::PerRun,
                )))
            }
            ValueRef::ObjectOfRefs(fields) => {
                let mut built = Vec::with_capacity(fields.len());
                for (key, value_ref) in fields {
                    built.push((key.clone(), self.build_reference(value_ref, scope, env)?));
                }
                let signature = format!("$object:{built:?}");
                self.anon_inline += 1;
                Ok(InputSlot::Call(self.push_call(
                    signature,
                    format!("$object#{}", self.anon_inline),
                    CallHandler::Assemble(AssembleShape::Object(built)),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    CacheMode::PerRun,
                )))
            }
            ValueRef::ArrayOfRefs(items) => {
                let mut built = Vec::with_capacity(items.len());
                for item in items {
                    built.push(self.build_reference(item, scope, env)?);
                }
                let signature = format!("$array:{built:?}");
                self.anon_inline += 1;
                Ok(InputSlot::Call(self.push_call(
                    signature,
                    format!("$array#{}", self.anon_inline),
                    CallHandler::Assemble(AssembleShape::Array(built)),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    CacheMode::PerRun,
                )))
            }
        }
    }

    fn resolve_args(&mut self, env: &ArgsEnv, key: &ArgsKey, path: &[String], void: bool) -> Result<InputSlot> {
        match (env, key) {
            (ArgsEnv::Runtime, ArgsKey::Named(name)) => {
                // An empty `compile_inputs` means the builder never opted into
                // the strict check at all: every `args.*` read resolves
                // against the runtime bundle at `run()` time instead.
                if !self.compile_inputs.is_empty() && !self.compile_inputs.contains(name) {
                    if void {
                        return Ok(self.literal_slot(Value::Null));
                    }
                    self.missing_inputs.push(name.clone());
                }
                Ok(InputSlot::RuntimeInput(name.clone(), path.to_vec()))
            }
            (ArgsEnv::Runtime, ArgsKey::Wildcard) => Ok(InputSlot::RuntimeInput("*".to_string(), path.to_vec())),
            (ArgsEnv::Using(map), ArgsKey::Named(name)) => {
                let _ = void;
                match map.get(name) {
                    Some(slot) => Ok(with_path(slot.clone(), path)),
                    None => Ok(self.literal_slot(Value::Null)),
                }
            }
            (ArgsEnv::Using(map), ArgsKey::Wildcard) => {
                let fields: Vec<(String, InputSlot)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                self.anon_inline += 1;
                Ok(InputSlot::Call(self.push_call(
                    format!("$args_wildcard#{}", self.anon_inline),
                    format!("$args_wildcard#{}", self.anon_inline),
                    CallHandler::Assemble(AssembleShape::Object(fields)),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    CacheMode::PerRun,
                )))
            }
        }
    }

    fn literal_slot(&mut self, value: Value) -> InputSlot {
        let signature = format!("$literal:{}", serde_json::to_string(&value).unwrap_or_default());
        InputSlot::Call(self.push_call(
            signature,
            "$literal".to_string(),
            CallHandler::Literal(value),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            CacheMode::Singleton,
        ))
    }

    fn build_node_call(&mut self, name: &str, scope: &str, env: ArgsEnv) -> Result<Fingerprint> {
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| BraidError::MissingProducer(name.to_string()))?;
        if matches!(def.visibility, Visibility::Private) && def.scope != scope {
            return Err(BraidError::PrivateAccessViolation {
                reference: name.to_string(),
                scope: def.scope.clone(),
                from_scope: scope.to_string(),
            });
        }

        if !self.building.insert(name.to_string()) {
            return Err(BraidError::CyclicDependency(format!("'{name}' depends on itself")));
        }
        let result = self.build_node_body(name, def, &env);
        self.building.remove(name);
        let (inputs, important, guards, handler) = result?;

        let signature = node_signature(name, def.cache_mode, &inputs, &guards);
        let base_fp = self.push_call(signature, name.to_string(), handler, inputs, important, guards, Vec::new(), def.cache_mode);
        if def.modifiers.is_empty() {
            return Ok(base_fp);
        }
        let chain = self.build_modifier_chain(base_fp, &def.modifiers, &def.scope, &env)?;
        Ok(chain.last().copied().unwrap_or(base_fp))
    }

    #[allow(clippy::type_complexity)]
    fn build_node_body(
        &mut self,
        name: &str,
        def: &NodeDef,
        env: &ArgsEnv,
    ) -> Result<(Vec<(String, InputSlot)>, Vec<Fingerprint>, Vec<GuardSlot>, CallHandler)> {
        let own_env = match env {
            ArgsEnv::Runtime => ArgsEnv::Runtime,
            ArgsEnv::Using(map) => ArgsEnv::Using(map.clone()),
        };

        match &def.handler {
            HandlerKind::UserFn(user_handler) => {
                let mut inputs = Vec::with_capacity(def.declared_args.len());
                let mut important = Vec::new();
                for arg in &def.declared_args {
                    let child = def
                        .child_builds
                        .iter()
                        .find(|c| c.alias.as_deref() == Some(arg.name.as_str()) || c.reference.node_name() == Some(&arg.name));
                    let slot = match child {
                        Some(child) => self.build_child(child, &def.scope, &own_env)?,
                        None => self.build_reference(&ValueRef::parse(&arg.name), &def.scope, &own_env)?,
                    };
                    if arg.important {
                        important.push(self.materialize(slot));
                    } else {
                        inputs.push((arg.name.clone(), slot));
                    }
                }
                // Child builds with no matching declared arg run purely for
                // side effects / important ordering.
                for child in &def.child_builds {
                    let matched = def
                        .declared_args
                        .iter()
                        .any(|a| child.alias.as_deref() == Some(a.name.as_str()) || child.reference.node_name() == Some(&a.name));
                    if !matched {
                        let slot = self.build_child(child, &def.scope, &own_env)?;
                        important.push(self.materialize(slot));
                    }
                }
                Ok((inputs, important, Vec::new(), CallHandler::User(user_handler.clone())))
            }
            HandlerKind::Subgraph { returns } => {
                let mut important = Vec::new();
                let return_child = match returns {
                    Some(r) => def.child_builds.iter().find(|c| same_reference(&c.reference, r)),
                    None => def.child_builds.iter().filter(|c| !c.reference.is_important()).last(),
                };
                let mut returned_slot = None;
                for child in &def.child_builds {
                    let is_return = return_child.map(|rc| std::ptr::eq(rc, child)).unwrap_or(false);
                    let slot = self.build_child(child, &def.scope, &own_env)?;
                    if is_return {
                        returned_slot = Some(slot);
                    } else {
                        important.push(self.materialize(slot));
                    }
                }
                let value_slot = match returned_slot {
                    Some(slot) => slot,
                    None => match returns {
                        Some(r) => self.build_reference(r, &def.scope, &own_env)?,
                        None => self.literal_slot(Value::Null),
                    },
                };
                Ok((
                    vec![("value".to_string(), value_slot)],
                    important,
                    Vec::new(),
                    CallHandler::User(passthrough_handler()),
                ))
            }
            HandlerKind::Lazy { target } => {
                let target_name = target.node_name().ok_or_else(|| {
                    BraidError::Configuration(format!("lazy node '{name}' target must be a plain node reference"))
                })?;
                let target_fp = self.build_node_call(target_name, &def.scope, clone_env(&own_env))?;
                Ok((Vec::new(), Vec::new(), Vec::new(), CallHandler::LazyThunk(target_fp)))
            }
        }
    }
}

fn with_path(slot: InputSlot, extra: &[String]) -> InputSlot {
    if extra.is_empty() {
        return slot;
    }
    match slot {
        InputSlot::Call(fp) => InputSlot::CallPath(fp, extra.to_vec()),
        InputSlot::CallPath(fp, mut path) => {
            path.extend_from_slice(extra);
            InputSlot::CallPath(fp, path)
        }
        InputSlot::RuntimeInput(name, mut path) => {
            path.extend_from_slice(extra);
            InputSlot::RuntimeInput(name, path)
        }
    }
}

fn clone_env(env: &ArgsEnv) -> ArgsEnv {
    match env {
        ArgsEnv::Runtime => ArgsEnv::Runtime,
        ArgsEnv::Using(map) => ArgsEnv::Using(map.clone()),
    }
}

fn same_reference(a: &ValueRef, b: &ValueRef) -> bool {
    matches!((a.node_name(), b.node_name()), (Some(x), Some(y)) if x == y)
}

fn node_signature(name: &str, cache_mode: CacheMode, inputs: &[(String, InputSlot)], guards: &[GuardSlot]) -> String {
    format!("{name}|{cache_mode:?}|{inputs:?}|{guards:?}")
}

/// A no-op handler used to wrap an already-resolved value (guarded calls,
/// subgraph returns, runtime-input passthroughs) behind the normal call
/// machinery.
fn passthrough_handler() -> Arc<dyn Handler> {
    handler_sync(|args| Ok(args.get("value").cloned().unwrap_or(Value::Null)))
}

fn static_cycle_check(registry: &GraphRegistry) -> Result<()> {
    let mut value_graph: HashMap<String, Vec<String>> = HashMap::new();
    let mut important_graph: HashMap<String, Vec<String>> = HashMap::new();

    for (name, def) in registry.iter() {
        let mut value_edges = Vec::new();
        let mut important_edges = Vec::new();
        for child in &def.child_builds {
            if let Some(target) = child.reference.node_name() {
                if child.reference.is_important() {
                    important_edges.push(target.to_string());
                } else {
                    value_edges.push(target.to_string());
                }
            }
            for guard in child.when.iter().chain(child.unless.iter()).chain(child.modifiers.iter()) {
                if let Some(target) = guard.node_name() {
                    value_edges.push(target.to_string());
                }
            }
            for (_, value_ref) in &child.using {
                if let Some(target) = value_ref.node_name() {
                    value_edges.push(target.to_string());
                }
            }
        }
        for modifier in &def.modifiers {
            if let Some(target) = modifier.node_name() {
                value_edges.push(target.to_string());
            }
        }
        match &def.handler {
            HandlerKind::Subgraph { returns: Some(r) } => {
                if let Some(target) = r.node_name() {
                    value_edges.push(target.to_string());
                }
            }
            HandlerKind::Lazy { target } => {
                if let Some(target_name) = target.node_name() {
                    value_edges.push(target_name.to_string());
                }
            }
            _ => {}
        }
        value_graph.insert(name.clone(), value_edges);
        important_graph.insert(name.clone(), important_edges);
    }

    if let Some(cycle) = detect_cycle(&value_graph) {
        return Err(BraidError::CyclicDependency(cycle.join(" -> ")));
    }
    if let Some(cycle) = detect_cycle(&important_graph) {
        return Err(BraidError::CyclicDependency(format!("{} (important edges)", cycle.join(" -> "))));
    }
    Ok(())
}

#[derive(PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

fn detect_cycle(graph: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    fn visit<'g>(
        node: &'g str,
        graph: &'g HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'g str, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                stack.push(node.to_string());
                return Some(stack.clone());
            }
            None => {}
        }
        marks.insert(node, Mark::InProgress);
        stack.push(node.to_string());
        if let Some(edges) = graph.get(node) {
            for next in edges {
                if let Some(cycle) = visit(next, graph, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for node in graph.keys() {
        if let Some(cycle) = visit(node, graph, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn check_singleton_purity(plan: &CompiledPlan) -> Result<()> {
    for call in plan.calls.values() {
        if call.cache_mode != CacheMode::Singleton {
            continue;
        }
        let mut slots: Vec<&InputSlot> = call.inputs.iter().map(|(_, s)| s).collect();
        slots.extend(call.guards.iter().map(|g| &g.source));
        for slot in slots {
            match slot {
                InputSlot::RuntimeInput(name, _) => {
                    return Err(crate::singleton::purity_error(call.debug_name.clone(), format!("args.{name}")));
                }
                InputSlot::Call(fp) | InputSlot::CallPath(fp, _) => {
                    if let Some(dep) = plan.calls.get(fp) {
                        let pure = dep.cache_mode == CacheMode::Singleton || matches!(dep.handler, CallHandler::Literal(_));
                        if !pure {
                            return Err(crate::singleton::purity_error(call.debug_name.clone(), dep.debug_name.clone()));
                        }
                    }
                }
            }
        }
        for fp in &call.modifiers {
            if let Some(dep) = plan.calls.get(fp) {
                let pure = dep.cache_mode == CacheMode::Singleton || matches!(dep.handler, CallHandler::Literal(_));
                if !pure {
                    return Err(crate::singleton::purity_error(call.debug_name.clone(), dep.debug_name.clone()));
                }
            }
        }
    }
    Ok(())
}
