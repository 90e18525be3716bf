//! Handler adapter: abstracts three handler return disciplines into one
//! completion event.
//!
//! Rust handlers can't be introspected by call arity the way dynamically
//! typed dispatch can, so rather than one polymorphic entry point this
//! module exposes three explicit constructors — one per return discipline
//! — each producing the same `Arc<dyn Handler>` the rest of the crate
//! deals in, regardless of how ergonomically it was constructed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::args::Args;

/// Error produced by a handler body, independent of which return discipline
/// produced it. The engine wraps this with node name and failure chain to
/// build a [`crate::error::BraidError::Handler`].
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single completion event, abstracting over however the handler body
/// chose to produce it.
///
/// `callbacks_disabled` carries the graph-wide
/// [`crate::registry::RegistryConfig::callbacks_disabled`] toggle down to
/// the point of invocation: a callback-style or hybrid handler treats it the
/// same as "an undefined return is the literal value `undefined`" rather
/// than waiting on a completion that administratively can't be trusted to
/// fire. Sync and async handlers have no callback discipline to disable and
/// ignore it.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Args, callbacks_disabled: bool) -> HandlerResult;
}

/// Completion callback handed to callback-style handlers: `(error, value)`.
pub type Completion = Box<dyn FnOnce(Option<HandlerError>, Option<Value>) + Send>;

struct SyncHandler<F>(F);

#[async_trait::async_trait]
impl<F> Handler for SyncHandler<F>
where
    F: Fn(Args) -> HandlerResult + Send + Sync + 'static,
{
    async fn call(&self, args: Args, _callbacks_disabled: bool) -> HandlerResult {
        (self.0)(args)
    }
}

struct AsyncHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for AsyncHandler<F>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, args: Args, _callbacks_disabled: bool) -> HandlerResult {
        (self.0)(args).await
    }
}

struct CallbackHandler<F>(F);

#[async_trait::async_trait]
impl<F> Handler for CallbackHandler<F>
where
    F: Fn(Args, Completion) + Send + Sync + 'static,
{
    async fn call(&self, args: Args, callbacks_disabled: bool) -> HandlerResult {
        if callbacks_disabled {
            // The only completion discipline this handler has is a callback;
            // administratively disabling callbacks leaves it with nothing to
            // wait for, so it resolves the literal value `undefined` (null)
            // without ever invoking the body.
            return Ok(Value::Null);
        }
        let (tx, rx) = oneshot::channel::<(Option<HandlerError>, Option<Value>)>();
        let tx = std::sync::Mutex::new(Some(tx));
        let completion: Completion = Box::new(move |err, val| {
            if let Some(tx) = tx.lock().expect("completion invoked from a single thread").take() {
                let _ = tx.send((err, val));
            }
        });
        (self.0)(args, completion);
        match rx.await {
            Ok((Some(err), _)) => Err(err),
            Ok((None, value)) => Ok(value.unwrap_or(Value::Null)),
            Err(_) => Err(HandlerError("completion callback dropped without invoking".into())),
        }
    }
}

struct HybridHandler<F> {
    f: F,
    callbacks_disabled: bool,
}

#[async_trait::async_trait]
impl<F> Handler for HybridHandler<F>
where
    F: Fn(Args, Completion) -> Option<Value> + Send + Sync + 'static,
{
    async fn call(&self, args: Args, callbacks_disabled: bool) -> HandlerResult {
        let (tx, rx) = oneshot::channel::<(Option<HandlerError>, Option<Value>)>();
        let tx = std::sync::Mutex::new(Some(tx));
        let completion: Completion = Box::new(move |err, val| {
            if let Some(tx) = tx.lock().expect("completion invoked from a single thread").take() {
                let _ = tx.send((err, val));
            }
        });
        // "when a handler both returns a non-undefined value and its
        // signature shows a completion callback, the return value wins"
        if let Some(value) = (self.f)(args, completion) {
            return Ok(value);
        }
        if self.callbacks_disabled || callbacks_disabled {
            // "an undefined return is treated as the literal value
            // undefined rather than still pending"
            return Ok(Value::Null);
        }
        match rx.await {
            Ok((Some(err), _)) => Err(err),
            Ok((None, value)) => Ok(value.unwrap_or(Value::Null)),
            Err(_) => Err(HandlerError("completion callback dropped without invoking".into())),
        }
    }
}

/// Wrap a plain synchronous function as a handler: "return a plain value".
pub fn handler_sync<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Args) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(SyncHandler(f))
}

/// Wrap an async function/closure as a handler: "return something that
/// exposes a then-style continuation".
pub fn handler_async<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(AsyncHandler(f))
}

/// Wrap a callback-style function as a handler: "accept a completion
/// callback as its last argument".
pub fn handler_callback<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Args, Completion) + Send + Sync + 'static,
{
    Arc::new(CallbackHandler(f))
}

/// Wrap a hybrid function that may return a value immediately or invoke its
/// completion callback: a returned value wins over an invoked callback.
/// `callbacks_disabled` is this handler's own opt-in; the registry's
/// graph-wide `RegistryConfig::callbacks_disabled` toggle (threaded through
/// [`Handler::call`]'s own parameter at invocation time) has the same effect
/// even when this is left `false`.
pub fn handler_hybrid<F>(f: F, callbacks_disabled: bool) -> Arc<dyn Handler>
where
    F: Fn(Args, Completion) -> Option<Value> + Send + Sync + 'static,
{
    Arc::new(HybridHandler { f, callbacks_disabled })
}
