use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealflow_models::config::{OptimizerConfig, ResourceLimits};
use dealflow_monitor::SystemHealthMonitor;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoscaler::{AutoScaler, ResourceScale, ScalingAction};
use crate::error::OptimizerError;
use crate::load_balancer::{LoadBalancer, LoadStatistics, RebalanceRecommendation};
use crate::recovery::{ErrorRecoverySystem, ErrorStatistics, RecoveryHandler, RecoveryOutcome};

const ACTION_CHANNEL_CAPACITY: usize = 256;

/// Error type recorded for agents whose error rate crosses the threshold.
pub const HIGH_ERROR_RATE: &str = "high_error_rate";

/// Something a cycle decided. Broadcast to subscribers; the optimizer itself
/// only applies scaling, and only when auto-apply is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizationAction {
    Scale {
        action: ScalingAction,
        applied: bool,
    },
    Rebalance {
        recommendation: RebalanceRecommendation,
    },
    Recovery {
        component: String,
        error_type: String,
        outcome: RecoveryOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub success: bool,
    pub actions_identified: usize,
    pub actions: Vec<OptimizationAction>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub optimization_status: OptimizationStatus,
    pub optimization_cycles: u64,
    pub current_scale: ResourceScale,
    pub resource_limits: ResourceLimits,
    pub load_stats: LoadStatistics,
    pub error_stats: ErrorStatistics,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

struct OptimizerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically turns health snapshots into scaling, rebalancing and
/// recovery actions.
///
/// Never touches a workflow's execution context; its only outputs are the
/// autoscaler's own scale and the broadcast actions.
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    autoscaler: AutoScaler,
    load_balancer: LoadBalancer,
    recovery: ErrorRecoverySystem,
    monitor: RwLock<Option<Arc<SystemHealthMonitor>>>,
    cycles: AtomicU64,
    last_cycle_at: RwLock<Option<DateTime<Utc>>>,
    actions: broadcast::Sender<OptimizationAction>,
    task: Mutex<Option<OptimizerTask>>,
}

impl PerformanceOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        config.validate()?;
        let recovery = ErrorRecoverySystem::new(&config.circuit_breaker);
        Ok(Self::build(config, recovery))
    }

    pub fn with_recovery_handler(
        config: OptimizerConfig,
        handler: Arc<dyn RecoveryHandler>,
    ) -> Result<Self, OptimizerError> {
        config.validate()?;
        let recovery = ErrorRecoverySystem::with_handler(&config.circuit_breaker, handler);
        Ok(Self::build(config, recovery))
    }

    fn build(config: OptimizerConfig, recovery: ErrorRecoverySystem) -> Self {
        let (actions, _) = broadcast::channel(ACTION_CHANNEL_CAPACITY);
        Self {
            autoscaler: AutoScaler::new(&config),
            load_balancer: LoadBalancer::new(&config),
            recovery,
            config,
            monitor: RwLock::new(None),
            cycles: AtomicU64::new(0),
            last_cycle_at: RwLock::new(None),
            actions,
            task: Mutex::new(None),
        }
    }

    pub fn autoscaler(&self) -> &AutoScaler {
        &self.autoscaler
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn recovery(&self) -> &ErrorRecoverySystem {
        &self.recovery
    }

    pub fn subscribe_actions(&self) -> broadcast::Receiver<OptimizationAction> {
        self.actions.subscribe()
    }

    /// Use `monitor` as the snapshot source for subsequent cycles.
    pub async fn attach_monitor(&self, monitor: Arc<SystemHealthMonitor>) {
        *self.monitor.write().await = Some(monitor);
    }

    pub async fn start_optimization(
        self: &Arc<Self>,
        monitor: Arc<SystemHealthMonitor>,
    ) -> Result<(), OptimizerError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(OptimizerError::AlreadyRunning);
        }
        self.attach_monitor(monitor).await;

        let cancel = CancellationToken::new();
        let optimizer = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            optimizer.optimization_loop(token).await;
        });
        *task = Some(OptimizerTask { cancel, handle });

        info!(
            interval_secs = self.config.optimization_interval_seconds,
            auto_apply = self.config.auto_apply_scaling,
            "Performance optimization started"
        );
        Ok(())
    }

    /// Returns false if optimization was not running.
    pub async fn stop_optimization(&self) -> bool {
        let Some(task) = self.task.lock().await.take() else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Optimization task ended abnormally");
        }
        info!("Performance optimization stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    async fn optimization_loop(&self, cancel: CancellationToken) {
        let interval = self.config.optimization_interval();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Optimization loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let report = self.force_optimization_cycle().await;
                    if let Some(error) = report.error {
                        warn!(error = %error, "Optimization cycle failed");
                    }
                }
            }
        }
    }

    /// Run one cycle now against the attached monitor.
    pub async fn force_optimization_cycle(&self) -> CycleReport {
        let monitor = self.monitor.read().await.clone();
        let Some(monitor) = monitor else {
            return CycleReport {
                success: false,
                actions_identified: 0,
                actions: Vec::new(),
                error: Some(OptimizerError::NoHealthMonitor.to_string()),
            };
        };

        let snapshot = match monitor.latest_snapshot() {
            Some(snapshot) => snapshot,
            None => monitor.sample_now().await,
        };
        let mut actions = Vec::new();

        for action in self.autoscaler.evaluate(&snapshot.system).await {
            let applied = if self.config.auto_apply_scaling {
                self.autoscaler.apply(&action).await;
                true
            } else {
                false
            };
            actions.push(OptimizationAction::Scale { action, applied });
        }

        for (agent, health) in &snapshot.agent_health {
            self.load_balancer
                .update_agent_load(agent, health.utilization)
                .await;
        }
        if self.load_balancer.should_rebalance() {
            actions.extend(
                self.load_balancer
                    .get_rebalancing_recommendations()
                    .into_iter()
                    .map(|recommendation| OptimizationAction::Rebalance { recommendation }),
            );
        }

        for (agent, health) in &snapshot.agent_health {
            if health.executions == 0 || health.error_rate < self.config.agent_error_rate_threshold {
                continue;
            }
            let details = format!(
                "error rate {:.0}% over {} executions",
                health.error_rate * 100.0,
                health.executions
            );
            self.recovery.record_error(HIGH_ERROR_RATE, agent, &details).await;
            let outcome = self
                .recovery
                .attempt_recovery(HIGH_ERROR_RATE, agent, &details)
                .await;
            actions.push(OptimizationAction::Recovery {
                component: agent.clone(),
                error_type: HIGH_ERROR_RATE.to_string(),
                outcome,
            });
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_cycle_at.write().await = Some(Utc::now());

        for action in &actions {
            // No subscribers is fine
            let _ = self.actions.send(action.clone());
        }

        if actions.is_empty() {
            debug!(cycle, "Optimization cycle complete, no actions");
        } else {
            info!(cycle, actions = actions.len(), "Optimization cycle complete");
        }

        CycleReport {
            success: true,
            actions_identified: actions.len(),
            actions,
            error: None,
        }
    }

    pub async fn get_optimization_summary(&self) -> OptimizationSummary {
        let optimization_status = if self.is_running().await {
            OptimizationStatus::Running
        } else {
            OptimizationStatus::Stopped
        };
        OptimizationSummary {
            optimization_status,
            optimization_cycles: self.cycles.load(Ordering::Relaxed),
            current_scale: self.autoscaler.current_scale().await,
            resource_limits: self.autoscaler.limits(),
            load_stats: self.load_balancer.get_load_statistics(),
            error_stats: self.recovery.get_error_statistics().await,
            last_cycle_at: *self.last_cycle_at.read().await,
        }
    }
}
