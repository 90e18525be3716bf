//! # braid — a dataflow execution engine
//!
//! `braid` composes user-supplied asynchronous computations into a directed
//! acyclic graph and, given a set of required outputs, produces an optimized
//! execution plan that runs those computations with maximal parallelism,
//! deduplication, and short-circuiting on failure.
//!
//! ## Core Concepts
//!
//! ### 1. GraphRegistry — where producers live
//!
//! [`GraphRegistry`] holds named node definitions: handlers, their declared
//! arguments, their child builds, their cache mode. Nodes are registered
//! once and the registry is treated as immutable once handed to a
//! [`GraphBuilder`].
//!
//! ### 2. GraphBuilder — requesting outputs
//!
//! [`GraphBuilder`] accumulates a set of requested outputs against a
//! registry, with per-call-site overrides (`using`), guards (`when`/
//! `unless`), modifier chains, and pre/post hooks, then `compile()`s them
//! into a [`CompiledPlan`] or `run()`s them directly.
//!
//! ### 3. Compilation — one pass, no handler ever runs
//!
//! [`compiler::compile`] walks every requested output's reference tree,
//! inlines subgraphs, resolves `args.*` overrides, lowers guards and
//! modifiers into their own call instances, deduplicates by structural
//! fingerprint, and checks for cycles and singleton purity violations — all
//! synchronously, with no handler invoked.
//!
//! ### 4. Execution — memoized recursive resolution
//!
//! [`engine::run`] walks the compiled plan. Each call instance is backed by
//! a [`futures::future::Shared`] future created the first time something
//! demands it; nobody demanding a call's value is what gives lazy thunks and
//! guard-skipped branches their "never ran" property, without a separate
//! scheduler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use braid::{GraphRegistry, GraphBuilder, ValueRef};
//! use braid::adapter::handler_sync;
//! use braid::node::{NodeDef, HandlerKind};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> braid::error::Result<()> {
//! let mut registry = GraphRegistry::new();
//! registry.add(NodeDef::new(
//!     "name-fromLiteral",
//!     "root",
//!     HandlerKind::UserFn(handler_sync(|_| Ok(json!("Jeremy")))),
//! ))?;
//! registry.add(
//!     NodeDef::new(
//!         "str-toUpper",
//!         "root",
//!         HandlerKind::UserFn(handler_sync(|args| {
//!             Ok(json!(args.get("s").and_then(|v| v.as_str()).unwrap_or("").to_uppercase()))
//!         })),
//!     )
//!     .with_args(vec![braid::node::ArgSpec::new("s")])
//!     .with_children(vec![braid::node::ChildBuild::new(ValueRef::parse("name-fromLiteral")).alias("s")]),
//! )?;
//!
//! let mut builder = GraphBuilder::new(&registry);
//! builder.builds(ValueRef::parse("str-toUpper"));
//! let outputs = builder.run(std::collections::HashMap::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────────┐
//!                    │            GraphRegistry             │
//!                    │  • add() • add_anonymous() • add_lazy() │
//!                    └──────────────┬──────────────────────┘
//!                                   │
//!                                   ▼
//!                    ┌─────────────────────────────────────┐
//!                    │             GraphBuilder              │
//!                    │  • builds() • using() • when/unless   │
//!                    │  • pre_run() • post_run()             │
//!                    └──────────────┬──────────────────────┘
//!                        compile()  │  run()
//!                    ┌──────────────┴──────────────┐
//!                    ▼                             ▼
//!         ┌──────────────────────┐     ┌──────────────────────┐
//!         │   compiler::compile   │     │      engine::run      │
//!         │  • inline subgraphs   │────▶│  • memoized Shared     │
//!         │  • lower guards/mods  │     │    futures per call    │
//!         │  • dedup by fingerprint│    │  • important edges    │
//!         │  • cycle / purity check│    │  • lazy thunks         │
//!         └──────────────────────┘     └──────────┬───────────┘
//!                                                  │
//!                                                  ▼
//!                                   ┌──────────────────────────┐
//!                                   │       SingletonStore       │
//!                                   │  (process-wide, shared)     │
//!                                   └──────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Core APIs
//! - [`registry`] — [`GraphRegistry`], the node-definition store
//! - [`builder`] — [`GraphBuilder`], the per-requested-output surface
//! - [`compiler`] — the dependency compiler (`compile()`)
//! - [`engine`] — the execution engine (`run()`), [`engine::RunContext`],
//!   [`engine::LazyThunk`]
//!
//! ### Data model
//! - [`reference`] — [`ValueRef`], the value-reference tagged sum
//! - [`node`] — [`node::NodeDef`], [`node::ChildBuild`], [`node::HandlerKind`]
//! - [`plan`] — [`plan::CompiledPlan`], [`plan::CompiledCall`], introspection
//! - [`args`] — [`args::Args`], the resolved-input accessor handed to handlers
//!
//! ### Execution support
//! - [`adapter`] — [`adapter::Handler`] trait and the three handler
//!   constructors (`handler_sync`, `handler_async`, `handler_callback`,
//!   `handler_hybrid`)
//! - [`hooks`] — [`hooks::PreHooks`] / [`hooks::PostHooks`]
//! - [`singleton`] — [`singleton::SingletonStore`], the process-wide cache
//! - [`trace`] — [`trace::TraceEvent`], [`trace::EventSink`] state-transition
//!   events
//! - [`error`] — [`error::BraidError`], [`error::Result`]

pub mod adapter;
pub mod args;
pub mod builder;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod node;
pub mod plan;
pub mod reference;
pub mod registry;
pub mod singleton;
pub mod trace;

pub use adapter::{handler_async, handler_callback, handler_hybrid, handler_sync, Handler};
pub use args::Args;
pub use builder::{ConfiguredOutput, GraphBuilder};
pub use compiler::{compile, CompileRequest, OutputRequest};
pub use engine::{run, CallOutcome, LazyThunk, OutputValue, RunContext};
pub use error::{BraidError, FailureChain, Result};
pub use node::{ArgSpec, CacheMode, ChildBuild, HandlerKind, NodeDef, Visibility};
pub use plan::{CompiledCall, CompiledPlan, Fingerprint};
pub use reference::ValueRef;
pub use registry::{EnforceMode, GraphRegistry, RegistryConfig};
pub use singleton::SingletonStore;
pub use trace::{CallState, EventSink, TraceEvent, TracingSink, VecSink};
