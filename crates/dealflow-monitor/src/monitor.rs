use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealflow_models::config::MonitorConfig;
use dealflow_models::health::{
    AgentHealth, Alert, AlertSeverity, HealthSnapshot, HealthStatus, SystemMetrics,
};
use dealflow_models::workflow::WorkflowMetrics;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::AgentActivity;
use crate::error::MonitorError;
use crate::sampler::{ResourceSampler, SysinfoSampler};

/// Point-in-time view returned by [`SystemHealthMonitor::get_system_health_summary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub overall_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub system_metrics: SystemMetrics,
    pub agent_health: BTreeMap<String, AgentHealth>,
    pub active_alerts: usize,
    pub monitoring_active: bool,
}

/// Aggregates over the retained sample history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPerformance {
    pub samples: usize,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub peak_memory_percent: f64,
    pub agents_monitored: usize,
    pub avg_agent_error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    /// 0 (unusable) to 100 (idle and error free).
    pub overall_health_score: f64,
    pub overall_status: HealthStatus,
    pub system_performance: SystemPerformance,
    pub recommendations: Vec<String>,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically samples host resources and agent activity.
///
/// Purely observational: it reads what the orchestrator records and what the
/// sampler reports, and never writes back into a workflow.
pub struct SystemHealthMonitor {
    config: MonitorConfig,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    activity: AgentActivity,
    history: RwLock<VecDeque<HealthSnapshot>>,
    alerts: RwLock<VecDeque<Alert>>,
    workflows: RwLock<HashMap<Uuid, watch::Receiver<WorkflowMetrics>>>,
    latest: watch::Sender<Option<HealthSnapshot>>,
    task: Mutex<Option<MonitorTask>>,
}

impl SystemHealthMonitor {
    /// Monitor backed by the host sampler.
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        Self::with_sampler(config, SysinfoSampler::new())
    }

    pub fn with_sampler(
        config: MonitorConfig,
        sampler: impl ResourceSampler + 'static,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let (latest, _) = watch::channel(None);
        Ok(Self {
            activity: AgentActivity::new(config.activity_window()),
            config,
            sampler: Mutex::new(Box::new(sampler)),
            history: RwLock::new(VecDeque::new()),
            alerts: RwLock::new(VecDeque::new()),
            workflows: RwLock::new(HashMap::new()),
            latest,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Spawn the sampling loop. Samples once immediately, then every interval.
    pub async fn start_monitoring(self: &Arc<Self>) -> Result<(), MonitorError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(MonitorError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor.monitoring_loop(token).await;
        });
        *task = Some(MonitorTask { cancel, handle });

        info!(
            interval_secs = self.config.monitoring_interval_seconds,
            "Health monitoring started"
        );
        Ok(())
    }

    /// Stop the sampling loop. Returns false if it was not running.
    pub async fn stop_monitoring(&self) -> bool {
        let Some(task) = self.task.lock().await.take() else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Monitoring task ended abnormally");
        }
        info!("Health monitoring stopped");
        true
    }

    pub async fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    async fn monitoring_loop(&self, cancel: CancellationToken) {
        let interval = self.config.monitoring_interval();

        self.sample_now().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Monitoring loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.sample_now().await;
                }
            }
        }
    }

    /// Take one sample, raise alerts, and publish it as the latest snapshot.
    pub async fn sample_now(&self) -> HealthSnapshot {
        let system = self.sampler.lock().await.sample();
        let agent_health = self.activity.health().await;
        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            system,
            agent_health,
        };

        self.raise_alerts(&snapshot).await;
        self.push_history(snapshot.clone()).await;
        self.latest.send_replace(Some(snapshot.clone()));

        debug!(
            cpu = snapshot.system.cpu_percent,
            memory = snapshot.system.memory_percent,
            agents = snapshot.agent_health.len(),
            "Health sample collected"
        );
        snapshot
    }

    /// Hook for the orchestrator: one agent task finished.
    pub async fn record_agent_execution(&self, agent: &str, duration: Duration, success: bool) {
        self.activity.record(agent, duration, success).await;
    }

    /// Attach a run's metrics feed.
    pub async fn register_workflow(&self, workflow_id: Uuid, metrics: watch::Receiver<WorkflowMetrics>) {
        self.workflows.write().await.insert(workflow_id, metrics);
        debug!(%workflow_id, "Workflow registered for monitoring");
    }

    pub async fn unregister_workflow(&self, workflow_id: Uuid) -> bool {
        let removed = self.workflows.write().await.remove(&workflow_id).is_some();
        if removed {
            debug!(%workflow_id, "Workflow unregistered from monitoring");
        }
        removed
    }

    pub async fn monitored_workflows(&self) -> Vec<Uuid> {
        self.workflows.read().await.keys().copied().collect()
    }

    /// Latest metrics published by a monitored run.
    pub async fn get_workflow_metrics(&self, workflow_id: Uuid) -> Option<WorkflowMetrics> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .map(|rx| rx.borrow().clone())
    }

    pub fn latest_snapshot(&self) -> Option<HealthSnapshot> {
        self.latest.borrow().clone()
    }

    /// Receive every new snapshot as it is published.
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthSnapshot>> {
        self.latest.subscribe()
    }

    pub async fn get_system_health_summary(&self) -> HealthSummary {
        let snapshot = match self.latest_snapshot() {
            Some(snapshot) => snapshot,
            None => self.sample_now().await,
        };

        HealthSummary {
            overall_status: classify(&self.config, &snapshot),
            timestamp: snapshot.timestamp,
            system_metrics: snapshot.system,
            agent_health: snapshot.agent_health,
            active_alerts: self.get_active_alerts().await.len(),
            monitoring_active: self.is_monitoring().await,
        }
    }

    pub async fn get_active_alerts(&self) -> Vec<Alert> {
        let cutoff = cutoff(self.config.alert_active_window_seconds);
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Snapshots from the last `hours`, oldest first.
    pub async fn get_system_metrics_history(&self, hours: f64) -> Vec<HealthSnapshot> {
        let hours = hours.clamp(0.0, self.config.history_retention_hours);
        let cutoff = cutoff(hours * 3600.0);
        self.history
            .read()
            .await
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub async fn get_performance_report(&self) -> PerformanceReport {
        let mut history: Vec<HealthSnapshot> = self.history.read().await.iter().cloned().collect();
        if history.is_empty() {
            history.push(self.sample_now().await);
        }

        let samples = history.len();
        let avg = |f: fn(&SystemMetrics) -> f64| {
            history.iter().map(|s| f(&s.system)).sum::<f64>() / samples as f64
        };
        let peak = |f: fn(&SystemMetrics) -> f64| {
            history.iter().map(|s| f(&s.system)).fold(0.0, f64::max)
        };
        let avg_cpu = avg(|m| m.cpu_percent);
        let avg_memory = avg(|m| m.memory_percent);

        let latest = &history[samples - 1];
        let agents_monitored = latest.agent_health.len();
        let avg_error_rate = if agents_monitored > 0 {
            latest.agent_health.values().map(|h| h.error_rate).sum::<f64>()
                / agents_monitored as f64
        } else {
            0.0
        };

        let score = health_score(avg_cpu, avg_memory, avg_error_rate);
        let recommendations = self.recommendations(score, avg_cpu, avg_memory, latest);

        PerformanceReport {
            generated_at: Utc::now(),
            overall_health_score: score,
            overall_status: classify(&self.config, latest),
            system_performance: SystemPerformance {
                samples,
                avg_cpu_percent: avg_cpu,
                peak_cpu_percent: peak(|m| m.cpu_percent),
                avg_memory_percent: avg_memory,
                peak_memory_percent: peak(|m| m.memory_percent),
                agents_monitored,
                avg_agent_error_rate: avg_error_rate,
            },
            recommendations,
        }
    }

    fn recommendations(
        &self,
        score: f64,
        avg_cpu: f64,
        avg_memory: f64,
        latest: &HealthSnapshot,
    ) -> Vec<String> {
        let mut out = Vec::new();
        if avg_cpu >= self.config.cpu_warning_percent {
            out.push(format!(
                "CPU usage averaging {avg_cpu:.1}%: lower max_concurrent_deals or add worker threads"
            ));
        }
        if avg_memory >= self.config.memory_warning_percent {
            out.push(format!(
                "Memory usage averaging {avg_memory:.1}%: reduce batch sizes or shed worker processes"
            ));
        }
        for (agent, health) in &latest.agent_health {
            if health.error_rate >= self.config.error_rate_warning {
                out.push(format!(
                    "Agent '{agent}' error rate at {:.0}%: check its upstream services",
                    health.error_rate * 100.0
                ));
            }
        }
        if score < self.config.recommendation_score_threshold {
            out.push(format!(
                "Overall health score {score:.1} is below {:.0}: review active alerts before scaling the workload",
                self.config.recommendation_score_threshold
            ));
        }
        out
    }

    async fn raise_alerts(&self, snapshot: &HealthSnapshot) {
        let config = &self.config;
        let mut raised = Vec::new();

        let system = &snapshot.system;
        if let Some(severity) = band(
            system.cpu_percent,
            config.cpu_warning_percent,
            config.cpu_critical_percent,
        ) {
            raised.push(Alert::new(
                severity,
                "system",
                format!("CPU usage at {:.1}%", system.cpu_percent),
            ));
        }
        if let Some(severity) = band(
            system.memory_percent,
            config.memory_warning_percent,
            config.memory_critical_percent,
        ) {
            raised.push(Alert::new(
                severity,
                "system",
                format!("Memory usage at {:.1}%", system.memory_percent),
            ));
        }
        for (agent, health) in &snapshot.agent_health {
            if let Some(severity) = band(
                health.error_rate,
                config.error_rate_warning,
                config.error_rate_critical,
            ) {
                raised.push(Alert::new(
                    severity,
                    agent.clone(),
                    format!(
                        "Error rate at {:.0}% over {} executions",
                        health.error_rate * 100.0,
                        health.executions
                    ),
                ));
            }
        }

        if raised.is_empty() {
            return;
        }

        let mut alerts = self.alerts.write().await;
        for alert in raised {
            warn!(component = %alert.component, severity = ?alert.severity, "{}", alert.message);
            alerts.push_back(alert);
        }
        while alerts.len() > config.max_alerts {
            alerts.pop_front();
        }
    }

    async fn push_history(&self, snapshot: HealthSnapshot) {
        let cutoff = cutoff(self.config.history_retention_hours * 3600.0);
        let mut history = self.history.write().await;
        history.push_back(snapshot);
        while history.front().is_some_and(|s| s.timestamp < cutoff) {
            history.pop_front();
        }
        while history.len() > self.config.max_history_samples {
            history.pop_front();
        }
    }
}

/// Overall status from threshold crossings in one snapshot.
pub fn classify(config: &MonitorConfig, snapshot: &HealthSnapshot) -> HealthStatus {
    let system = &snapshot.system;
    let mut status = if system.cpu_percent >= config.cpu_critical_percent
        || system.memory_percent >= config.memory_critical_percent
    {
        HealthStatus::Critical
    } else {
        let cpu_hot = system.cpu_percent >= config.cpu_warning_percent;
        let memory_hot = system.memory_percent >= config.memory_warning_percent;
        match (cpu_hot, memory_hot) {
            (true, true) => HealthStatus::Degraded,
            (true, false) | (false, true) => HealthStatus::Warning,
            (false, false) => HealthStatus::Healthy,
        }
    };

    for health in snapshot.agent_health.values() {
        if health.error_rate >= config.error_rate_critical {
            status = status.max(HealthStatus::Degraded);
        } else if health.error_rate >= config.error_rate_warning {
            status = status.max(HealthStatus::Warning);
        }
    }
    status
}

/// Weighted score: 35% CPU headroom, 35% memory headroom, 30% agent success rate.
pub fn health_score(avg_cpu_percent: f64, avg_memory_percent: f64, avg_error_rate: f64) -> f64 {
    let cpu_headroom = 1.0 - (avg_cpu_percent / 100.0).clamp(0.0, 1.0);
    let memory_headroom = 1.0 - (avg_memory_percent / 100.0).clamp(0.0, 1.0);
    let success = 1.0 - avg_error_rate.clamp(0.0, 1.0);
    (100.0 * (0.35 * cpu_headroom + 0.35 * memory_headroom + 0.30 * success)).clamp(0.0, 100.0)
}

fn band(value: f64, warning: f64, critical: f64) -> Option<AlertSeverity> {
    if value >= critical {
        Some(AlertSeverity::Critical)
    } else if value >= warning {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

fn cutoff(window_seconds: f64) -> DateTime<Utc> {
    let window = chrono::Duration::milliseconds((window_seconds * 1000.0) as i64);
    Utc::now()
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
