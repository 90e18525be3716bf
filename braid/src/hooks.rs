//! Pre/post hooks: ordered lists of data-rewriters that run before and
//! after plan execution, with suspension allowed between them.

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use crate::adapter::BoxFuture;
use crate::error::Result;

pub type RuntimeInputs = HashMap<String, Value>;
pub type OutputMap = HashMap<String, Value>;

type PreFn = Box<dyn Fn(RuntimeInputs) -> BoxFuture<'static, Result<RuntimeInputs>> + Send + Sync>;
type PostFn = Box<dyn Fn(OutputMap) -> BoxFuture<'static, Result<OutputMap>> + Send + Sync>;

/// Ordered `preRun` hooks: each sees the previous hook's output, a
/// rejection in any hook short-circuits the run. Scheduling of calls begins
/// only once every pre-hook has resolved.
#[derive(Default)]
pub struct PreHooks(Vec<PreFn>);

impl PreHooks {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push<F, Fut>(&mut self, hook: F)
    where
        F: Fn(RuntimeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RuntimeInputs>> + Send + 'static,
    {
        self.0.push(Box::new(move |inputs| Box::pin(hook(inputs))));
    }

    pub async fn run(&self, mut inputs: RuntimeInputs) -> Result<RuntimeInputs> {
        for hook in &self.0 {
            inputs = hook(inputs).await?;
        }
        Ok(inputs)
    }
}

/// Ordered `postRun` hooks over the assembled output map.
#[derive(Default)]
pub struct PostHooks(Vec<PostFn>);

impl PostHooks {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push<F, Fut>(&mut self, hook: F)
    where
        F: Fn(OutputMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OutputMap>> + Send + 'static,
    {
        self.0.push(Box::new(move |outputs| Box::pin(hook(outputs))));
    }

    pub async fn run(&self, mut outputs: OutputMap) -> Result<OutputMap> {
        for hook in &self.0 {
            outputs = hook(outputs).await?;
        }
        Ok(outputs)
    }
}
