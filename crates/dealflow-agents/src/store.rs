use std::sync::Arc;

use dealflow_models::context::ExecutionContext;
use tokio::sync::RwLock;

/// Single-writer home of a run's [`ExecutionContext`].
///
/// Readers take cheap `Arc` snapshots. Every commit is serialized through the
/// write lock and bumps `version`, so a snapshot never observes a half-applied
/// delta.
pub struct ContextStore {
    current: RwLock<Arc<ExecutionContext>>,
}

impl ContextStore {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            current: RwLock::new(Arc::new(context)),
        }
    }

    pub async fn snapshot(&self) -> Arc<ExecutionContext> {
        Arc::clone(&*self.current.read().await)
    }

    /// Apply `f` and bump the version.
    pub async fn commit<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
        let mut guard = self.current.write().await;
        let context = Arc::make_mut(&mut *guard);
        let out = f(context);
        context.version += 1;
        out
    }

    pub async fn replace(&self, context: ExecutionContext) {
        *self.current.write().await = Arc::new(context);
    }
}
