//! Orchestration and activity registries.
//!
//! Handlers are registered by name at runtime construction. Activities carry
//! a per-name [`RetryPolicy`] the worker dispatcher applies; only retry
//! exhaustion reaches orchestration history as a failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{codec, OrchestrationContext};

/// Orchestrator entry point. The future must be deterministic: all
/// interaction with the outside world goes through the context.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Activity entry point. Activities may do arbitrary IO and are executed
/// at-least-once.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

/// Backoff schedule for a failing activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 means no retry.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_coefficient: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, initial_delay_ms: 0, backoff_coefficient: 2.0, max_delay_ms: 30_000 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self { max_attempts, initial_delay_ms, ..Self::default() }
    }

    /// Delay before the given retry; `attempt` is the attempt that just
    /// failed, starting at 1.
    pub fn delay_before_retry_ms(&self, attempt: u32) -> u64 {
        let factor = self.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay_ms as f64 * factor) as u64;
        delay.min(self.max_delay_ms)
    }
}

#[derive(Clone)]
pub(crate) struct ActivityEntry {
    pub handler: Arc<dyn ActivityHandler>,
    pub retry: RetryPolicy,
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    entries: HashMap<String, ActivityEntry>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { entries: HashMap::new() }
    }

    pub(crate) fn get(&self, name: &str) -> Option<ActivityEntry> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct ActivityRegistryBuilder {
    entries: HashMap<String, ActivityEntry>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_with_retry(name, RetryPolicy::default(), f)
    }

    pub fn register_with_retry<F, Fut>(mut self, name: impl Into<String>, retry: RetryPolicy, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.entries
            .insert(name.into(), ActivityEntry { handler: Arc::new(FnActivity(f)), retry });
        self
    }

    /// Register an activity with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |input: String| {
            let f = f.clone();
            async move {
                let decoded: In = codec::Json::decode(&input)?;
                let out = f(decoded).await?;
                Ok(codec::Json::encode(&out))
            }
        })
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry { entries: self.entries }
    }
}

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    handlers: HashMap<String, Arc<dyn OrchestrationHandler>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder { handlers: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct OrchestrationRegistryBuilder {
    handlers: HashMap<String, Arc<dyn OrchestrationHandler>>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry { handlers: self.handlers }
    }
}
