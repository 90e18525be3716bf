//! Error types for graph registration, compilation, and execution.
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//! Registration and compile errors are raised synchronously and never reach
//! `run`; handler errors propagate through a run's future carrying a
//! [`FailureChain`]; conditional short-circuits are modeled as
//! [`CallOutcome::Skipped`](crate::engine::CallOutcome::Skipped) rather than
//! as errors at all, so there is no `Conditional` *error* variant here —
//! skipping a guarded branch is a normal outcome, never a failure.

use std::fmt;

use crate::plan::Fingerprint;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BraidError>;

/// Ordered list of call fingerprints whose failure caused a rejection,
/// root cause first, dependent last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureChain(pub Vec<Fingerprint>);

impl FailureChain {
    pub fn root(fingerprint: Fingerprint) -> Self {
        Self(vec![fingerprint])
    }

    pub fn extend(mut self, dependent: Fingerprint) -> Self {
        self.0.push(dependent);
        self
    }

    pub fn originating(&self) -> Option<Fingerprint> {
        self.0.first().copied()
    }
}

impl fmt::Display for FailureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|fp| format!("{fp:016x}")).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

/// The crate's unified error type.
///
/// Registration and compile errors are fatal to the operation that
/// triggered them. Handler errors are wrapped with a [`FailureChain`] and
/// surfaced through the run's future.
#[derive(thiserror::Error, Debug, Clone)]
pub enum BraidError {
    /// Duplicate name registered without the explicit override (`+name`) form.
    #[error("node '{0}' is already registered; use the override form to replace it")]
    DuplicateName(String),

    /// A node name violates an enabled naming rule.
    #[error("node name '{name}' is invalid: {reason}")]
    InvalidName { name: String, reason: String },

    /// A reference targets a private node from outside its scope.
    #[error("'{reference}' is private to scope '{scope}' and cannot be referenced from '{from_scope}'")]
    PrivateAccessViolation {
        reference: String,
        scope: String,
        from_scope: String,
    },

    /// A node was registered with no handler and is not a subgraph/lazy sentinel.
    #[error("node '{0}' has no handler")]
    HandlerMissing(String),

    /// Declared argument list doesn't match the handler's arity (strict mode).
    #[error("node '{node}' declares {declared} argument(s) but its handler expects {actual}")]
    ArgCountMismatch {
        node: String,
        declared: usize,
        actual: usize,
    },

    /// A referenced producer does not exist in the registry and was not
    /// marked void (`?`).
    #[error("no such node '{0}'")]
    MissingProducer(String),

    /// A required compile input was neither supplied nor a zero-arg producer.
    #[error("missing compile input(s): {0:?}")]
    MissingCompileInput(Vec<String>),

    /// A cyclic dependency was found among non-important (value) edges, or
    /// among important edges considered alone.
    #[error("cyclic dependency detected: {0}")]
    CyclicDependency(String),

    /// A singleton node transitively depends on a runtime input or a
    /// non-singleton, non-literal producer.
    #[error("singleton node '{node}' is not pure: depends on '{dependency}'")]
    SingletonPurityViolation { node: String, dependency: String },

    /// Registration-time or compile-time configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A handler invocation failed.
    #[error("node '{node}' failed: {message} (chain: {chain})")]
    Handler {
        node: String,
        message: String,
        chain: FailureChain,
    },

    /// The run was cancelled because every requested output already reached
    /// a terminal state.
    #[error("run cancelled")]
    Cancelled,

    /// A lazy thunk was invoked a second time with different arguments.
    #[error("lazy thunk '{0}' invoked twice with different arguments")]
    LazyArgMismatch(String),
}

impl BraidError {
    pub fn handler(node: impl Into<String>, message: impl Into<String>, chain: FailureChain) -> Self {
        Self::Handler {
            node: node.into(),
            message: message.into(),
            chain,
        }
    }

    /// True for registration errors: fatal at the operation that triggered
    /// them, never reaching `run`.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName(_)
                | Self::InvalidName { .. }
                | Self::PrivateAccessViolation { .. }
                | Self::HandlerMissing(_)
                | Self::ArgCountMismatch { .. }
        )
    }

    /// True for compile errors: raised by `compiler::compile`, before any
    /// handler runs.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Self::MissingProducer(_)
                | Self::MissingCompileInput(_)
                | Self::CyclicDependency(_)
                | Self::SingletonPurityViolation { .. }
                | Self::PrivateAccessViolation { .. }
                | Self::ArgCountMismatch { .. }
        )
    }
}
