use dealflow_models::workflow::{Phase, WorkflowStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Agent {agent} failed: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("Agent {agent} timed out after {seconds} seconds")]
    AgentTimeout { agent: String, seconds: f64 },

    #[error("Phase {phase} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        phase: Phase,
        attempts: u32,
        last_error: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] dealflow_models::ConfigError),

    #[error("Human decision required for {phase} (confidence {confidence:.2})")]
    EscalationRequired { phase: Phase, confidence: f64 },

    #[error("Cannot {operation} while workflow is {status}")]
    InvalidState {
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error("No escalation is awaiting a decision")]
    NoPendingEscalation,

    #[error("Workflow exceeded its {minutes} minute execution budget")]
    WorkflowTimeout { minutes: f64 },

    #[error("Workflow rejected by human decision")]
    Rejected,

    #[error("Workflow cancelled")]
    Cancelled,
}
