pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod task;
pub mod workflow;

pub use config::{
    CircuitBreakerConfig, DealflowConfig, EscalationPolicy, MonitorConfig, OptimizerConfig,
    ResourceLimits, RetryPolicy, WorkflowConfiguration,
};
pub use context::{
    priority, ContextDelta, ContextMessage, Deal, DealUpdate, ExecutionContext, OutgoingMessage,
    StrategyInputs,
};
pub use error::ConfigError;
pub use health::{AgentHealth, Alert, AlertSeverity, HealthSnapshot, HealthStatus, SystemMetrics};
pub use task::{AgentKind, TaskRequest, TaskResult};
pub use workflow::{
    HumanDecision, Phase, WorkflowEvent, WorkflowEventKind, WorkflowMetrics, WorkflowStatus,
};
