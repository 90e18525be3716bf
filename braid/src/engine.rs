//! Execution engine: walks a [`CompiledPlan`], running each call instance at
//! most once per run and sharing in-flight work across every consumer that
//! needs it.
//!
//! Each call instance is backed by a [`Shared`] future, created the first
//! time something demands it and memoized for the rest of the run. A call
//! nobody demands never gets its future created at all, which is what gives
//! lazy thunks and guard-skipped branches their "never ran" property for
//! free, without any separate scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use tokio::sync::Mutex;
use uuid::Uuid;

use serde_json::Value;

use crate::adapter::BoxFuture;
use crate::args::Args;
use crate::error::{BraidError, FailureChain, Result};
use crate::hooks::RuntimeInputs;
use crate::plan::{AssembleShape, CallHandler, CompiledPlan, Fingerprint, InputSlot};
use crate::reference::project_path;
use crate::singleton::SingletonStore;
use crate::trace::{CallState, EventSink, TraceEvent};

/// The terminal (or about-to-be-terminal) state of one call instance.
#[derive(Clone)]
pub enum CallOutcome {
    Resolved(Value),
    Rejected(BraidError),
    Skipped,
}

/// What a requested output resolves to: a plain value, or — for a lazily
/// wrapped node — a handle that runs its target only when invoked.
#[derive(Clone)]
pub enum OutputValue {
    Value(Value),
    Lazy(Arc<LazyThunk>),
}

type SharedOutcome = Shared<BoxFuture<'static, CallOutcome>>;

struct Cancellation(AtomicBool);

impl Cancellation {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }
    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Shared state for a single `run()` call.
pub struct RunContext {
    plan: Arc<CompiledPlan>,
    inputs: Arc<RuntimeInputs>,
    singleton_store: Arc<SingletonStore>,
    sink: Arc<dyn EventSink>,
    run_id: Uuid,
    cache: Mutex<HashMap<Fingerprint, SharedOutcome>>,
    cancellation: Cancellation,
}

impl RunContext {
    fn new(plan: Arc<CompiledPlan>, inputs: RuntimeInputs, singleton_store: Arc<SingletonStore>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            plan,
            inputs: Arc::new(inputs),
            singleton_store,
            sink,
            run_id: Uuid::new_v4(),
            cache: Mutex::new(HashMap::new()),
            cancellation: Cancellation::new(),
        })
    }

    /// A context sharing this run's plan/singletons/sink but with its own
    /// resolve cache and its own input bundle — used for a lazy thunk's
    /// first invocation, whose `args` are only known at invoke time.
    fn fork(&self, inputs: RuntimeInputs) -> Arc<Self> {
        Arc::new(Self {
            plan: self.plan.clone(),
            inputs: Arc::new(inputs),
            singleton_store: self.singleton_store.clone(),
            sink: self.sink.clone(),
            run_id: self.run_id,
            cache: Mutex::new(HashMap::new()),
            cancellation: Cancellation::new(),
        })
    }

    fn emit(&self, fingerprint: Fingerprint, debug_name: &str, action: CallState) {
        self.sink.emit(&TraceEvent {
            run_id: self.run_id,
            fingerprint,
            debug_name: debug_name.to_string(),
            action,
            at: std::time::Instant::now(),
        });
    }

}

/// Resolve a call instance, memoized on `ctx` for the life of that context.
/// A free function rather than a method so every call site can decide
/// whether to clone an owned `Arc<RunContext>` or hand one over outright.
fn resolve_call(ctx: Arc<RunContext>, fingerprint: Fingerprint) -> BoxFuture<'static, CallOutcome> {
    Box::pin(async move {
        let shared = {
            let mut cache = ctx.cache.lock().await;
            if let Some(existing) = cache.get(&fingerprint) {
                existing.clone()
            } else {
                let ctx2 = ctx.clone();
                let fut: BoxFuture<'static, CallOutcome> = Box::pin(async move { run_call(ctx2, fingerprint).await });
                let shared = fut.shared();
                cache.insert(fingerprint, shared.clone());
                shared
            }
        };
        shared.await
    })
}

/// A thunk produced for a node registered via `add_lazy`. Its target never
/// runs until [`LazyThunk::invoke`] is called; a second invocation with
/// different arguments is an error, and a second invocation with the same
/// arguments reuses the first call's in-flight or completed result.
pub struct LazyThunk {
    name: String,
    ctx: Arc<RunContext>,
    target_fp: Fingerprint,
    first_call: Mutex<Option<(RuntimeInputs, SharedOutcome)>>,
}

impl LazyThunk {
    pub async fn invoke(&self, args: RuntimeInputs) -> Result<Value> {
        let mut guard = self.first_call.lock().await;
        let shared = match &*guard {
            Some((prev_args, shared)) => {
                if *prev_args != args {
                    return Err(BraidError::LazyArgMismatch(self.name.clone()));
                }
                shared.clone()
            }
            None => {
                let child_ctx = self.ctx.fork(args.clone());
                let target_fp = self.target_fp;
                let fut = resolve_call(child_ctx, target_fp);
                let shared = fut.shared();
                *guard = Some((args, shared.clone()));
                shared
            }
        };
        drop(guard);
        match shared.await {
            CallOutcome::Resolved(v) => Ok(v),
            CallOutcome::Rejected(e) => Err(e),
            CallOutcome::Skipped => Ok(Value::Null),
        }
    }
}

enum SlotOutcome {
    Value(Value),
    Rejected(BraidError),
    Skipped,
}

async fn await_slot(ctx: &Arc<RunContext>, slot: &InputSlot) -> SlotOutcome {
    match slot {
        InputSlot::RuntimeInput(name, path) => {
            let base = if name == "*" {
                Value::Object(ctx.inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            } else {
                ctx.inputs.get(name).cloned().unwrap_or(Value::Null)
            };
            SlotOutcome::Value(project_path(&base, path))
        }
        InputSlot::Call(fp) => match resolve_call(ctx.clone(), *fp).await {
            CallOutcome::Resolved(v) => SlotOutcome::Value(v),
            CallOutcome::Rejected(e) => SlotOutcome::Rejected(e),
            CallOutcome::Skipped => SlotOutcome::Skipped,
        },
        InputSlot::CallPath(fp, path) => match resolve_call(ctx.clone(), *fp).await {
            CallOutcome::Resolved(v) => SlotOutcome::Value(project_path(&v, path)),
            CallOutcome::Rejected(e) => SlotOutcome::Rejected(e),
            CallOutcome::Skipped => SlotOutcome::Skipped,
        },
    }
}

fn truthy_after_negate(value: &Value, negate: bool) -> bool {
    let truthy = crate::plan::is_truthy(value);
    if negate {
        !truthy
    } else {
        truthy
    }
}

async fn run_call(ctx: Arc<RunContext>, fingerprint: Fingerprint) -> CallOutcome {
    let call = match ctx.plan.call(fingerprint) {
        Some(c) => c.clone(),
        None => {
            return CallOutcome::Rejected(BraidError::Configuration(format!(
                "internal: no compiled call for fingerprint {fingerprint}"
            )))
        }
    };
    ctx.emit(fingerprint, &call.debug_name, CallState::Waiting);

    if ctx.cancellation.is_set() {
        ctx.emit(fingerprint, &call.debug_name, CallState::Skipped);
        return CallOutcome::Skipped;
    }

    for guard in &call.guards {
        match await_slot(&ctx, &guard.source).await {
            SlotOutcome::Value(v) => {
                if !truthy_after_negate(&v, guard.negate) {
                    ctx.emit(fingerprint, &call.debug_name, CallState::Skipped);
                    return CallOutcome::Skipped;
                }
            }
            SlotOutcome::Skipped => {
                ctx.emit(fingerprint, &call.debug_name, CallState::Skipped);
                return CallOutcome::Skipped;
            }
            SlotOutcome::Rejected(e) => {
                let chain = failure_chain(&e).extend(fingerprint);
                let err = BraidError::handler(call.debug_name.clone(), e.to_string(), chain);
                ctx.emit(fingerprint, &call.debug_name, CallState::Rejected);
                return CallOutcome::Rejected(err);
            }
        }
    }

    for important_fp in &call.important {
        match resolve_call(ctx.clone(), *important_fp).await {
            CallOutcome::Resolved(_) | CallOutcome::Skipped => {}
            CallOutcome::Rejected(e) => {
                let chain = failure_chain(&e).extend(fingerprint);
                let err = BraidError::handler(call.debug_name.clone(), e.to_string(), chain);
                ctx.emit(fingerprint, &call.debug_name, CallState::Rejected);
                return CallOutcome::Rejected(err);
            }
        }
    }

    ctx.emit(fingerprint, &call.debug_name, CallState::Ready);

    let mut entries = Vec::with_capacity(call.inputs.len());
    for (name, slot) in &call.inputs {
        match await_slot(&ctx, slot).await {
            SlotOutcome::Value(v) => entries.push((name.clone(), v)),
            SlotOutcome::Skipped => entries.push((name.clone(), Value::Null)),
            SlotOutcome::Rejected(e) => {
                let chain = failure_chain(&e).extend(fingerprint);
                let err = BraidError::handler(call.debug_name.clone(), e.to_string(), chain);
                ctx.emit(fingerprint, &call.debug_name, CallState::Rejected);
                return CallOutcome::Rejected(err);
            }
        }
    }

    ctx.emit(fingerprint, &call.debug_name, CallState::InFlight);

    let outcome = match &call.handler {
        CallHandler::Literal(v) => Ok(v.clone()),
        CallHandler::LazyThunk(_) => Ok(Value::Null),
        CallHandler::Assemble(shape) => assemble(&ctx, shape).await,
        CallHandler::User(handler) => {
            let args = Args::new(entries);
            let callbacks_disabled = ctx.plan.callbacks_disabled;
            if call.cache_mode == crate::node::CacheMode::Singleton {
                let key = call.node_name.clone();
                let key_for_handler = key.clone();
                let handler = handler.clone();
                ctx.singleton_store
                    .get_or_compute(&key, move || async move {
                        handler.call(args, callbacks_disabled).await.map_err(|e| {
                            BraidError::handler(key_for_handler, e.to_string(), FailureChain::root(fingerprint))
                        })
                    })
                    .await
            } else {
                handler
                    .call(args, callbacks_disabled)
                    .await
                    .map_err(|e| BraidError::handler(call.debug_name.clone(), e.to_string(), FailureChain::root(fingerprint)))
            }
        }
    };

    match outcome {
        Ok(v) => {
            ctx.emit(fingerprint, &call.debug_name, CallState::Resolved);
            CallOutcome::Resolved(v)
        }
        Err(e) => {
            ctx.emit(fingerprint, &call.debug_name, CallState::Rejected);
            CallOutcome::Rejected(e)
        }
    }
}

async fn assemble(ctx: &Arc<RunContext>, shape: &AssembleShape) -> std::result::Result<Value, BraidError> {
    match shape {
        AssembleShape::Object(fields) => {
            let mut out = serde_json::Map::with_capacity(fields.len());
            for (key, slot) in fields {
                match await_slot(ctx, slot).await {
                    SlotOutcome::Value(v) => {
                        out.insert(key.clone(), v);
                    }
                    SlotOutcome::Skipped => {
                        out.insert(key.clone(), Value::Null);
                    }
                    SlotOutcome::Rejected(e) => return Err(e),
                }
            }
            Ok(Value::Object(out))
        }
        AssembleShape::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for slot in items {
                match await_slot(ctx, slot).await {
                    SlotOutcome::Value(v) => out.push(v),
                    SlotOutcome::Skipped => out.push(Value::Null),
                    SlotOutcome::Rejected(e) => return Err(e),
                }
            }
            Ok(Value::Array(out))
        }
    }
}

fn failure_chain(error: &BraidError) -> FailureChain {
    match error {
        BraidError::Handler { chain, .. } => chain.clone(),
        _ => FailureChain::default(),
    }
}

/// Run every requested output in `plan` against `inputs`, returning a map
/// of alias to resolved value (or a lazy handle, for thunked outputs).
pub async fn run(
    plan: Arc<CompiledPlan>,
    inputs: RuntimeInputs,
    singleton_store: Arc<SingletonStore>,
    sink: Arc<dyn EventSink>,
) -> Result<HashMap<String, OutputValue>> {
    let ctx = RunContext::new(plan.clone(), inputs, singleton_store, sink);

    let mut pending = Vec::with_capacity(plan.outputs.len());
    for (alias, fp) in &plan.outputs {
        let is_lazy = matches!(plan.call(*fp).map(|c| &c.handler), Some(CallHandler::LazyThunk(_)));
        if is_lazy {
            let target_fp = match plan.call(*fp).map(|c| &c.handler) {
                Some(CallHandler::LazyThunk(t)) => *t,
                _ => unreachable!(),
            };
            let thunk = Arc::new(LazyThunk {
                name: alias.clone(),
                ctx: ctx.clone(),
                target_fp,
                first_call: Mutex::new(None),
            });
            pending.push((alias.clone(), Ok(OutputValue::Lazy(thunk))));
        } else {
            let outcome = resolve_call(ctx.clone(), *fp).await;
            let result = match outcome {
                CallOutcome::Resolved(v) => Ok(OutputValue::Value(v)),
                CallOutcome::Skipped => Ok(OutputValue::Value(Value::Null)),
                CallOutcome::Rejected(e) => Err(e),
            };
            pending.push((alias.clone(), result));
        }
    }

    ctx.cancellation.set();

    let mut outputs = HashMap::with_capacity(pending.len());
    for (alias, result) in pending {
        match result {
            Ok(v) => {
                outputs.insert(alias, v);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(outputs)
}
