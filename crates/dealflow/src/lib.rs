//! dealflow - deal-pipeline orchestration with an adaptive runtime
//!
//! Runs real-estate deal pipelines (discovery, analysis, negotiation,
//! contract, portfolio integration) across pluggable agents, while a health
//! monitor samples the host and agent activity and a performance optimizer
//! turns those samples into scaling, rebalancing and recovery actions.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use dealflow::agents::{AgentRegistry, WorkflowOrchestrator};
//! use dealflow::models::{DealflowConfig, ExecutionContext, HumanDecision};
//! use dealflow::monitor::SystemHealthMonitor;
//! use dealflow::optimizer::PerformanceOptimizer;
//! ```

pub use dealflow_agents as agents;
pub use dealflow_models as models;
pub use dealflow_monitor as monitor;
pub use dealflow_optimizer as optimizer;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dealflow_agents::{AgentRegistry, WorkflowOrchestrator};
use dealflow_models::DealflowConfig;
use dealflow_monitor::SystemHealthMonitor;
use dealflow_optimizer::PerformanceOptimizer;
use tracing::info;

/// Read and validate a TOML configuration file. Missing sections take defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<DealflowConfig> {
    let path = path.as_ref();
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config: DealflowConfig =
        toml::from_str(&config_str).with_context(|| "Failed to parse config")?;
    config
        .validate()
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    Ok(config)
}

/// The long-lived services shared by every workflow run.
pub struct Runtime {
    config: DealflowConfig,
    monitor: Arc<SystemHealthMonitor>,
    optimizer: Arc<PerformanceOptimizer>,
}

impl Runtime {
    pub fn from_config(config: DealflowConfig) -> Result<Self> {
        let monitor = SystemHealthMonitor::new(config.monitor.clone())
            .context("Failed to build health monitor")?;
        let optimizer = PerformanceOptimizer::new(config.optimizer.clone())
            .context("Failed to build performance optimizer")?;
        Ok(Self {
            config,
            monitor: Arc::new(monitor),
            optimizer: Arc::new(optimizer),
        })
    }

    pub fn config(&self) -> &DealflowConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<SystemHealthMonitor> {
        &self.monitor
    }

    pub fn optimizer(&self) -> &Arc<PerformanceOptimizer> {
        &self.optimizer
    }

    /// An orchestrator wired to this runtime's policies and health monitor.
    pub fn orchestrator(&self, registry: AgentRegistry) -> WorkflowOrchestrator {
        WorkflowOrchestrator::builder(self.config.workflow.clone(), registry)
            .retry_policy(self.config.retry.clone())
            .escalation_policy(self.config.escalation.clone())
            .monitor(Arc::clone(&self.monitor))
            .build()
    }

    /// Start background monitoring and optimization.
    pub async fn start(&self) -> Result<()> {
        self.monitor
            .start_monitoring()
            .await
            .context("Failed to start health monitoring")?;
        self.optimizer
            .start_optimization(Arc::clone(&self.monitor))
            .await
            .context("Failed to start optimization")?;
        info!("Runtime started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.optimizer.stop_optimization().await;
        self.monitor.stop_monitoring().await;
        info!("Runtime stopped");
    }

    /// Take a fresh sample, run one optimization cycle and report both as JSON.
    pub async fn report_once(&self) -> Result<serde_json::Value> {
        self.optimizer.attach_monitor(Arc::clone(&self.monitor)).await;
        self.monitor.sample_now().await;
        let cycle = self.optimizer.force_optimization_cycle().await;

        Ok(serde_json::json!({
            "health": serde_json::to_value(self.monitor.get_system_health_summary().await)?,
            "performance": serde_json::to_value(self.monitor.get_performance_report().await)?,
            "cycle": serde_json::to_value(cycle)?,
            "optimization": serde_json::to_value(self.optimizer.get_optimization_summary().await)?,
        }))
    }
}
