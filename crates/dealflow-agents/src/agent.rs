use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dealflow_models::context::ExecutionContext;
use dealflow_models::task::{AgentKind, TaskRequest, TaskResult};

use crate::error::WorkflowError;

/// A collaborator that carries out one phase's domain work. Mockable for testing.
///
/// Agents get a read-only snapshot of the context and report changes through
/// [`TaskResult::delta`]; they never write the context themselves. Returning
/// `Err` counts as a failed attempt, the same as `success: false`.
#[async_trait]
pub trait DealAgent: Send + Sync {
    fn kind(&self) -> AgentKind;
    fn name(&self) -> &str;

    async fn execute_task(
        &self,
        request: &TaskRequest,
        context: &ExecutionContext,
    ) -> Result<TaskResult, WorkflowError>;
}

/// Agents available to a run, one per kind.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<dyn DealAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own kind, returning any agent it replaces.
    pub fn register(&mut self, agent: Arc<dyn DealAgent>) -> Option<Arc<dyn DealAgent>> {
        self.agents.insert(agent.kind(), agent)
    }

    pub fn with(mut self, agent: Arc<dyn DealAgent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn DealAgent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        let mut kinds: Vec<AgentKind> = self.agents.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
