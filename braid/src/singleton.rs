//! Singleton store: a process-wide map from node identity to a cached
//! completed value, gated by the compiler's purity check. First access
//! computes; subsequent accesses return the stored future. Rejections are
//! not cached (see DESIGN.md's Open Question notes).

use std::collections::HashMap;
use std::future::Future;
use std::sync::OnceLock;

use futures::future::{FutureExt, Shared};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::adapter::BoxFuture;
use crate::error::{BraidError, Result};

type SharedResult = Shared<BoxFuture<'static, Result<Value>>>;

/// A process-wide (or, for tests, locally-scoped) cache of singleton node
/// values. Safe under concurrent first-access from multiple runs: the
/// first caller to reach a key installs the in-flight future; everyone
/// else observes and awaits that same future (first-writer-wins).
pub struct SingletonStore {
    inner: Mutex<HashMap<String, SharedResult>>,
}

impl Default for SingletonStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SingletonStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide instance. Most applications share one graph's
    /// worth of singletons across their whole lifetime and should use
    /// this; tests construct their own `SingletonStore::new()` for
    /// isolation.
    pub fn global() -> &'static SingletonStore {
        static GLOBAL: OnceLock<SingletonStore> = OnceLock::new();
        GLOBAL.get_or_init(SingletonStore::new)
    }

    /// Get the cached value for `key`, computing it via `compute` on first
    /// access. A rejection is evicted from the store so the next access
    /// retries from scratch.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let shared = {
            let mut map = self.inner.lock().await;
            if let Some(existing) = map.get(key) {
                existing.clone()
            } else {
                let fut: BoxFuture<'static, Result<Value>> = Box::pin(compute());
                let shared = fut.shared();
                map.insert(key.to_string(), shared.clone());
                shared
            }
        };
        let result = shared.await;
        if result.is_err() {
            let mut map = self.inner.lock().await;
            map.remove(key);
        }
        result
    }

    pub async fn is_cached(&self, key: &str) -> bool {
        self.inner.lock().await.contains_key(key)
    }
}

/// Build a singleton-purity violation error. Used by the compiler's
/// `check_singleton_purity` pass, kept here so the error's field shape
/// stays next to the store it describes.
pub fn purity_error(node: impl Into<String>, dependency: impl Into<String>) -> BraidError {
    BraidError::SingletonPurityViolation {
        node: node.into(),
        dependency: dependency.into(),
    }
}
