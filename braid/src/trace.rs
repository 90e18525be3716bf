//! Trace events: a structured event emitted at each call-instance state
//! transition. External consumers (a debugger, a DOT exporter, a profiler)
//! attach their own [`EventSink`]; this crate ships only an in-memory
//! [`VecSink`] for tests, plus a `tracing`-forwarding default.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use crate::plan::Fingerprint;

/// The call-instance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Waiting,
    Ready,
    InFlight,
    Resolved,
    Rejected,
    Skipped,
}

/// One state-transition event: `{run-id, fingerprint, action, timestamp}`.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub run_id: Uuid,
    pub fingerprint: Fingerprint,
    pub debug_name: String,
    pub action: CallState,
    pub at: Instant,
}

/// Where trace events go. Implementations must be cheap and non-blocking —
/// they run inline with the call-instance state machine.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TraceEvent);
}

/// The default sink: forwards to `tracing` and keeps nothing in memory.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &TraceEvent) {
        tracing::trace!(
            run_id = %event.run_id,
            fingerprint = event.fingerprint,
            name = %event.debug_name,
            action = ?event.action,
            "call state transition"
        );
    }
}

/// An in-memory sink collecting events in emission order, for tests that
/// assert on call-ordering properties (e.g. important-edge ordering).
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().expect("trace sink mutex poisoned").clone()
    }
}

impl EventSink for VecSink {
    fn emit(&self, event: &TraceEvent) {
        self.events.lock().expect("trace sink mutex poisoned").push(event.clone());
    }
}
