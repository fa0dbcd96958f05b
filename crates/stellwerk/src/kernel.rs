//! The kernel seam: how task bodies are resolved and what they see.
//!
//! Kernel bodies are loaded by name at dispatch time through the
//! [`KernelResolver`] collaborator. The in-tree implementation is
//! [`KernelRegistry`], a name → async-closure table; a deployment that
//! loads bodies from shared libraries plugs in its own resolver. A body
//! calls back into the core only through [`TaskContext`]: its group, task
//! spawning, and blocking on another task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use stellwerk_core::TaskId;

use crate::error::StellwerkError;
use crate::group::GroupContext;

/// What a running kernel body sees of the system.
#[async_trait]
pub trait TaskContext: Send + Sync {
    /// Id of the task this body is executing.
    fn tid(&self) -> TaskId;

    /// The private communication context spanning the task's group.
    fn group(&self) -> &GroupContext;

    /// Submit a sub-task to the scheduler and return its id.
    async fn spawn(&self, kernel: &str, min: u32, max: u32) -> Result<TaskId, StellwerkError>;

    /// Suspend this execution context until `tid` completes. Waiting on
    /// the task's own id returns immediately.
    async fn wait_for(&self, tid: TaskId) -> Result<(), StellwerkError>;
}

/// Boxed future returned by a kernel body.
pub type KernelFuture = Pin<Box<dyn Future<Output = Result<(), StellwerkError>> + Send>>;

/// A resolved kernel implementation.
pub type KernelFn = Arc<dyn Fn(Arc<dyn TaskContext>) -> KernelFuture + Send + Sync>;

/// Resolves a kernel name to a callable implementation.
pub trait KernelResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<KernelFn>;
}

/// Name → implementation table, filled at process start.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: RwLock<HashMap<String, KernelFn>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel body under a name.
    pub fn register<F, Fut>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn(Arc<dyn TaskContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StellwerkError>> + Send + 'static,
    {
        let boxed: KernelFn = Arc::new(move |ctx| Box::pin(kernel(ctx)));
        self.kernels
            .write()
            .unwrap()
            .insert(name.into(), boxed);
    }

    pub fn names(&self) -> Vec<String> {
        self.kernels.read().unwrap().keys().cloned().collect()
    }
}

impl KernelResolver for KernelRegistry {
    fn resolve(&self, name: &str) -> Option<KernelFn> {
        self.kernels.read().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_registered_names() {
        let registry = KernelRegistry::new();
        registry.register("noop", |_ctx| async { Ok(()) });

        assert!(registry.resolve("noop").is_some());
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.names(), vec!["noop".to_string()]);
    }
}
