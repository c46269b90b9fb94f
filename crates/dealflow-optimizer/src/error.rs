use thiserror::Error;

use crate::autoscaler::ResourceType;
use crate::recovery::RecoveryStrategy;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Configuration error: {0}")]
    Config(#[from] dealflow_models::ConfigError),

    #[error("Resource limit exceeded: requested {requested} {resource}, allowed {limit}")]
    ResourceLimitExceeded {
        resource: ResourceType,
        requested: usize,
        limit: usize,
    },

    #[error("Circuit breaker open: component={component} error_type={error_type}")]
    CircuitOpen {
        component: String,
        error_type: String,
    },

    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error("Recovery not applied: {strategy} recommended for {component}")]
    NotApplied {
        component: String,
        strategy: RecoveryStrategy,
    },

    #[error("No health monitor attached")]
    NoHealthMonitor,

    #[error("Optimization is already running")]
    AlreadyRunning,
}
