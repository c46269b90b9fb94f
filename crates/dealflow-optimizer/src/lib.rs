//! Adaptive runtime tuning driven by health snapshots.
//!
//! [`PerformanceOptimizer`] periodically reads the latest snapshot from a
//! [`dealflow_monitor::SystemHealthMonitor`] and feeds three components:
//! - [`AutoScaler`] proposes (and optionally applies) thread/process scale changes
//! - [`LoadBalancer`] tracks per-agent load and recommends rebalancing
//! - [`ErrorRecoverySystem`] counts errors and guards recovery with circuit breakers

pub mod autoscaler;
pub mod error;
pub mod load_balancer;
pub mod optimizer;
pub mod recovery;

pub use autoscaler::{
    AutoScaler, ResourceScale, ResourceType, ScaleOutcome, ScalingAction, ScalingStrategy,
};
pub use error::OptimizerError;
pub use load_balancer::{LoadBalancer, LoadEntry, LoadStatistics, RebalanceRecommendation};
pub use optimizer::{
    CycleReport, OptimizationAction, OptimizationStatus, OptimizationSummary,
    PerformanceOptimizer,
};
pub use recovery::{
    ErrorRecord, ErrorRecoverySystem, ErrorStatistics, RecommendingHandler, RecoveryAction,
    RecoveryHandler, RecoveryOutcome, RecoveryStrategy, CIRCUIT_BREAKER_OPEN,
};
