pub mod agent;
pub mod control;
pub mod error;
pub mod orchestrator;
pub mod outreach;
pub mod store;

pub mod test_support;

pub use agent::{AgentRegistry, DealAgent};
pub use error::WorkflowError;
pub use orchestrator::{OrchestratorBuilder, WorkflowOrchestrator, OUTREACH_DEFERRED};
