use std::fmt;

use dealflow_models::config::{OptimizerConfig, ResourceLimits};
use dealflow_models::health::SystemMetrics;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::OptimizerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Threads,
    Processes,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Threads => f.write_str("threads"),
            ResourceType::Processes => f.write_str("processes"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingStrategy {
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub resource_type: ResourceType,
    pub strategy: ScalingStrategy,
    pub target: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceScale {
    pub threads: usize,
    pub processes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleOutcome {
    /// Always true: out-of-range requests are clamped rather than refused.
    pub success: bool,
    pub new_scale: ResourceScale,
    /// Whether the requested target had to be clamped into the limits.
    pub clamped: bool,
}

/// Tracks the worker thread/process scale and proposes adjustments from
/// CPU and memory pressure.
///
/// The scale never leaves `[min, max]` of the configured [`ResourceLimits`].
pub struct AutoScaler {
    limits: ResourceLimits,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
    thread_step: usize,
    process_step: usize,
    current: Mutex<ResourceScale>,
}

impl AutoScaler {
    pub fn new(config: &OptimizerConfig) -> Self {
        let limits = config.resource_limits;
        let initial = ResourceScale {
            threads: config
                .initial_threads
                .clamp(limits.min_threads, limits.max_threads),
            processes: config
                .initial_processes
                .clamp(limits.min_processes, limits.max_processes),
        };
        Self {
            limits,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            thread_step: config.thread_step.max(1),
            process_step: config.process_step.max(1),
            current: Mutex::new(initial),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub async fn current_scale(&self) -> ResourceScale {
        *self.current.lock().await
    }

    /// Scaling actions suggested by one resource reading. Targets are
    /// already within limits; nothing is applied.
    pub async fn evaluate(&self, metrics: &SystemMetrics) -> Vec<ScalingAction> {
        let scale = self.current_scale().await;
        let limits = &self.limits;
        let cpu = metrics.cpu_percent;
        let memory = metrics.memory_percent;
        let mut actions = Vec::new();

        if cpu >= self.scale_up_threshold {
            if scale.threads < limits.max_threads {
                actions.push(ScalingAction {
                    resource_type: ResourceType::Threads,
                    strategy: ScalingStrategy::ScaleUp,
                    target: (scale.threads + self.thread_step).min(limits.max_threads),
                    reason: format!("CPU at {cpu:.1}% (scale-up threshold {:.0}%)", self.scale_up_threshold),
                });
            } else if scale.processes < limits.max_processes && memory < self.scale_up_threshold {
                actions.push(ScalingAction {
                    resource_type: ResourceType::Processes,
                    strategy: ScalingStrategy::ScaleUp,
                    target: (scale.processes + self.process_step).min(limits.max_processes),
                    reason: format!("CPU at {cpu:.1}% with thread pool at its limit"),
                });
            }
        } else if cpu <= self.scale_down_threshold && memory <= self.scale_down_threshold {
            if scale.threads > limits.min_threads {
                actions.push(ScalingAction {
                    resource_type: ResourceType::Threads,
                    strategy: ScalingStrategy::ScaleDown,
                    target: scale
                        .threads
                        .saturating_sub(self.thread_step)
                        .max(limits.min_threads),
                    reason: format!("CPU at {cpu:.1}% and memory at {memory:.1}%: releasing idle threads"),
                });
            } else if scale.processes > limits.min_processes {
                actions.push(ScalingAction {
                    resource_type: ResourceType::Processes,
                    strategy: ScalingStrategy::ScaleDown,
                    target: scale
                        .processes
                        .saturating_sub(self.process_step)
                        .max(limits.min_processes),
                    reason: format!("CPU at {cpu:.1}% and memory at {memory:.1}%: releasing idle processes"),
                });
            }
        }

        if memory >= self.scale_up_threshold && scale.processes > limits.min_processes {
            actions.push(ScalingAction {
                resource_type: ResourceType::Processes,
                strategy: ScalingStrategy::ScaleDown,
                target: scale
                    .processes
                    .saturating_sub(self.process_step)
                    .max(limits.min_processes),
                reason: format!("Memory at {memory:.1}%: shedding worker processes"),
            });
        }

        actions
    }

    /// Apply an action to whichever pool its resource type names.
    pub async fn apply(&self, action: &ScalingAction) -> ScaleOutcome {
        match action.resource_type {
            ResourceType::Threads => self.scale_thread_pool(action).await,
            ResourceType::Processes => self.scale_process_pool(action).await,
        }
    }

    pub async fn scale_thread_pool(&self, action: &ScalingAction) -> ScaleOutcome {
        let (target, clamped) = clamp(
            ResourceType::Threads,
            action.target,
            self.limits.min_threads,
            self.limits.max_threads,
        );
        let mut current = self.current.lock().await;
        let previous = current.threads;
        current.threads = target;
        info!(previous, target, strategy = ?action.strategy, "Thread pool scaled");
        ScaleOutcome {
            success: true,
            new_scale: *current,
            clamped,
        }
    }

    pub async fn scale_process_pool(&self, action: &ScalingAction) -> ScaleOutcome {
        let (target, clamped) = clamp(
            ResourceType::Processes,
            action.target,
            self.limits.min_processes,
            self.limits.max_processes,
        );
        let mut current = self.current.lock().await;
        let previous = current.processes;
        current.processes = target;
        info!(previous, target, strategy = ?action.strategy, "Process pool scaled");
        ScaleOutcome {
            success: true,
            new_scale: *current,
            clamped,
        }
    }
}

fn clamp(resource: ResourceType, requested: usize, min: usize, max: usize) -> (usize, bool) {
    let limit = if requested > max {
        max
    } else if requested < min {
        min
    } else {
        return (requested, false);
    };
    let err = OptimizerError::ResourceLimitExceeded {
        resource,
        requested,
        limit,
    };
    warn!(error = %err, "Clamping scaling request");
    (limit, true)
}
