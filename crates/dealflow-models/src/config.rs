use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for a dealflow deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DealflowConfig {
    pub workflow: WorkflowConfiguration,
    pub retry: RetryPolicy,
    pub escalation: EscalationPolicy,
    pub monitor: MonitorConfig,
    pub optimizer: OptimizerConfig,
}

impl DealflowConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workflow.validate()?;
        self.retry.validate()?;
        self.escalation.validate()?;
        self.monitor.validate()?;
        self.optimizer.validate()
    }
}

/// Tunable parameters for one orchestration run. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfiguration {
    /// Upper bound on deal pipelines advancing at the same time.
    pub max_concurrent_deals: usize,
    /// Wall-clock budget for the whole run.
    pub max_execution_time_minutes: f64,
    /// Confidence at or above which a deal is approved without review.
    pub auto_approve_threshold: f64,
    /// Confidence below which the run waits for a human decision.
    pub human_escalation_threshold: f64,
    pub enable_parallel_processing: bool,
    /// Deadline for a single agent task invocation.
    pub agent_timeout_seconds: f64,
    pub max_retries_per_agent: u32,
    /// Let the outreach agent batch communications instead of pacing each one.
    pub batch_communications: bool,
    /// Minimum spacing between outreach calls when batching is off.
    pub communication_delay_seconds: f64,
    pub max_outreach_per_hour: u32,
    /// Publish run metrics to the health monitor while the run is live.
    pub enable_real_time_monitoring: bool,
    /// Seconds between metric summaries.
    pub metrics_collection_interval: f64,
}

impl Default for WorkflowConfiguration {
    fn default() -> Self {
        Self {
            max_concurrent_deals: 5,
            max_execution_time_minutes: 60.0,
            auto_approve_threshold: 0.85,
            human_escalation_threshold: 0.6,
            enable_parallel_processing: true,
            agent_timeout_seconds: 300.0,
            max_retries_per_agent: 3,
            batch_communications: true,
            communication_delay_seconds: 1.0,
            max_outreach_per_hour: 50,
            enable_real_time_monitoring: true,
            metrics_collection_interval: 30.0,
        }
    }
}

impl WorkflowConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_deals == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_deals",
                "must be at least 1",
            ));
        }
        positive("max_execution_time_minutes", self.max_execution_time_minutes)?;
        positive("agent_timeout_seconds", self.agent_timeout_seconds)?;
        positive("metrics_collection_interval", self.metrics_collection_interval)?;
        non_negative("communication_delay_seconds", self.communication_delay_seconds)?;
        unit_interval("auto_approve_threshold", self.auto_approve_threshold)?;
        unit_interval("human_escalation_threshold", self.human_escalation_threshold)?;
        if self.max_outreach_per_hour == 0 {
            return Err(ConfigError::invalid(
                "max_outreach_per_hour",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        seconds(self.agent_timeout_seconds)
    }

    pub fn max_execution_time(&self) -> Duration {
        seconds(self.max_execution_time_minutes * 60.0)
    }

    pub fn communication_delay(&self) -> Duration {
        seconds(self.communication_delay_seconds)
    }

    pub fn metrics_interval(&self) -> Duration {
        seconds(self.metrics_collection_interval)
    }

    /// Number of deal pipelines allowed to run at once.
    pub fn pipeline_permits(&self) -> usize {
        if self.enable_parallel_processing {
            self.max_concurrent_deals.max(1)
        } else {
            1
        }
    }
}

/// Backoff applied between attempts of a failing agent task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_seconds: f64,
    pub multiplier: f64,
    pub max_backoff_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_seconds: 1.0,
            multiplier: 2.0,
            max_backoff_seconds: 30.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("retry.initial_backoff_seconds", self.initial_backoff_seconds)?;
        non_negative("retry.max_backoff_seconds", self.max_backoff_seconds)?;
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let raw = self.initial_backoff_seconds * self.multiplier.powi(exponent);
        seconds(raw.min(self.max_backoff_seconds))
    }
}

/// How long a human escalation may wait before it is auto-rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EscalationPolicy {
    /// `None` waits indefinitely.
    pub timeout_seconds: Option<f64>,
}

impl EscalationPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.timeout_seconds {
            Some(secs) => positive("escalation.timeout_seconds", secs),
            None => Ok(()),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(seconds)
    }
}

/// Configuration for the system health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitoring_interval_seconds: f64,
    /// How far back snapshots are retained.
    pub history_retention_hours: f64,
    /// Hard cap on retained snapshots regardless of age.
    pub max_history_samples: usize,
    pub max_alerts: usize,
    /// Alerts younger than this are reported as active.
    pub alert_active_window_seconds: f64,
    /// Rolling window for per-agent execution statistics.
    pub activity_window_seconds: f64,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    /// Health scores below this produce a general recommendation.
    pub recommendation_score_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_seconds: 30.0,
            history_retention_hours: 24.0,
            max_history_samples: 2880,
            max_alerts: 100,
            alert_active_window_seconds: 3600.0,
            activity_window_seconds: 300.0,
            cpu_warning_percent: 70.0,
            cpu_critical_percent: 90.0,
            memory_warning_percent: 75.0,
            memory_critical_percent: 90.0,
            error_rate_warning: 0.1,
            error_rate_critical: 0.25,
            recommendation_score_threshold: 70.0,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("monitor.monitoring_interval_seconds", self.monitoring_interval_seconds)?;
        positive("monitor.history_retention_hours", self.history_retention_hours)?;
        positive("monitor.activity_window_seconds", self.activity_window_seconds)?;
        positive("monitor.alert_active_window_seconds", self.alert_active_window_seconds)?;
        if self.max_history_samples == 0 || self.max_alerts == 0 {
            return Err(ConfigError::invalid(
                "monitor",
                "history and alert capacities must be at least 1",
            ));
        }
        if self.cpu_warning_percent > self.cpu_critical_percent {
            return Err(ConfigError::Inconsistent(
                "cpu_warning_percent exceeds cpu_critical_percent".to_string(),
            ));
        }
        if self.memory_warning_percent > self.memory_critical_percent {
            return Err(ConfigError::Inconsistent(
                "memory_warning_percent exceeds memory_critical_percent".to_string(),
            ));
        }
        unit_interval("monitor.error_rate_warning", self.error_rate_warning)?;
        unit_interval("monitor.error_rate_critical", self.error_rate_critical)
    }

    pub fn monitoring_interval(&self) -> Duration {
        seconds(self.monitoring_interval_seconds)
    }

    pub fn activity_window(&self) -> Duration {
        seconds(self.activity_window_seconds)
    }
}

/// Hard ceilings (and floors) the auto-scaler never crosses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_threads: usize,
    pub max_processes: usize,
    pub min_threads: usize,
    pub min_processes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_threads: 32,
            max_processes: 8,
            min_threads: 1,
            min_processes: 1,
        }
    }
}

/// Error-count breaker tuning, shared by every (component, error type) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Errors inside the window that open the breaker.
    pub failure_threshold: u32,
    pub window_seconds: f64,
    /// Time an open breaker blocks recovery before it resets.
    pub cooldown_seconds: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_seconds: 300.0,
            cooldown_seconds: 300.0,
        }
    }
}

/// Configuration for the performance optimizer and its sub-components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    pub optimization_interval_seconds: f64,
    /// Apply scaling actions directly instead of only recommending them.
    pub auto_apply_scaling: bool,
    pub resource_limits: ResourceLimits,
    pub initial_threads: usize,
    pub initial_processes: usize,
    /// CPU/memory percent at or above which capacity is adjusted upward.
    pub scale_up_threshold: f64,
    /// CPU/memory percent at or below which capacity is released.
    pub scale_down_threshold: f64,
    pub thread_step: usize,
    pub process_step: usize,
    /// Load spread (max - min) beyond which rebalancing is advised.
    pub rebalance_margin: f64,
    pub load_entry_ttl_seconds: f64,
    pub max_tracked_agents: u64,
    /// Agent error rate that is treated as a recoverable fault.
    pub agent_error_rate_threshold: f64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimization_interval_seconds: 60.0,
            auto_apply_scaling: false,
            resource_limits: ResourceLimits::default(),
            initial_threads: 4,
            initial_processes: 1,
            scale_up_threshold: 75.0,
            scale_down_threshold: 30.0,
            thread_step: 2,
            process_step: 1,
            rebalance_margin: 0.3,
            load_entry_ttl_seconds: 300.0,
            max_tracked_agents: 1_000,
            agent_error_rate_threshold: 0.2,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(
            "optimizer.optimization_interval_seconds",
            self.optimization_interval_seconds,
        )?;
        positive("optimizer.load_entry_ttl_seconds", self.load_entry_ttl_seconds)?;
        let limits = &self.resource_limits;
        if limits.min_threads > limits.max_threads || limits.min_processes > limits.max_processes {
            return Err(ConfigError::Inconsistent(
                "resource limit minimums exceed maximums".to_string(),
            ));
        }
        if limits.max_threads == 0 || limits.max_processes == 0 {
            return Err(ConfigError::invalid(
                "optimizer.resource_limits",
                "maximums must be at least 1",
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ConfigError::Inconsistent(
                "scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        if !self.rebalance_margin.is_finite() || !(0.0..1.0).contains(&self.rebalance_margin) {
            return Err(ConfigError::invalid(
                "optimizer.rebalance_margin",
                "must be within [0, 1)",
            ));
        }
        unit_interval(
            "optimizer.agent_error_rate_threshold",
            self.agent_error_rate_threshold,
        )?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "optimizer.circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        positive(
            "optimizer.circuit_breaker.window_seconds",
            self.circuit_breaker.window_seconds,
        )?;
        non_negative(
            "optimizer.circuit_breaker.cooldown_seconds",
            self.circuit_breaker.cooldown_seconds,
        )
    }

    pub fn optimization_interval(&self) -> Duration {
        seconds(self.optimization_interval_seconds)
    }

    pub fn load_entry_ttl(&self) -> Duration {
        seconds(self.load_entry_ttl_seconds)
    }
}

/// Convert fractional seconds to a `Duration`, mapping invalid input to zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be > 0, got {value}")))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be >= 0, got {value}")))
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be within [0, 1], got {value}"),
        ))
    }
}
