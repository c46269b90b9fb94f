use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dealflow_models::health::AgentHealth;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct ExecutionRecord {
    recorded: Instant,
    finished_at: DateTime<Utc>,
    duration: Duration,
    success: bool,
}

/// Rolling per-agent execution log fed by the orchestrator.
///
/// Records older than the window are dropped on every write and whenever
/// health is computed.
pub struct AgentActivity {
    window: Duration,
    records: Mutex<HashMap<String, VecDeque<ExecutionRecord>>>,
}

impl AgentActivity {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, agent: &str, duration: Duration, success: bool) {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let log = records.entry(agent.to_string()).or_default();
        prune(log, now, self.window);
        log.push_back(ExecutionRecord {
            recorded: now,
            finished_at: Utc::now(),
            duration,
            success,
        });
    }

    /// Health for every agent with at least one execution inside the window.
    pub async fn health(&self) -> BTreeMap<String, AgentHealth> {
        let now = Instant::now();
        let mut records = self.records.lock().await;

        for log in records.values_mut() {
            prune(log, now, self.window);
        }
        records.retain(|_, log| !log.is_empty());

        records
            .iter()
            .map(|(agent, log)| (agent.clone(), summarize(agent, log, self.window)))
            .collect()
    }
}

fn prune(log: &mut VecDeque<ExecutionRecord>, now: Instant, window: Duration) {
    while log
        .front()
        .is_some_and(|r| now.duration_since(r.recorded) > window)
    {
        log.pop_front();
    }
}

fn summarize(agent: &str, log: &VecDeque<ExecutionRecord>, window: Duration) -> AgentHealth {
    let executions = log.len() as u64;
    let failures = log.iter().filter(|r| !r.success).count() as u64;
    let busy: Duration = log.iter().map(|r| r.duration).sum();
    let last = log.back();

    let error_rate = if executions > 0 {
        failures as f64 / executions as f64
    } else {
        0.0
    };
    let avg_execution_time_ms = if executions > 0 {
        busy.as_secs_f64() * 1000.0 / executions as f64
    } else {
        0.0
    };
    let utilization = if window.is_zero() {
        0.0
    } else {
        (busy.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0)
    };

    AgentHealth {
        agent_type: agent.to_string(),
        executions,
        failures,
        error_rate,
        avg_execution_time_ms,
        last_execution_time_ms: last.map(|r| r.duration.as_millis() as u64),
        last_execution_at: last.map(|r| r.finished_at),
        utilization,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summarizes_error_rate_and_timing() {
        let activity = AgentActivity::new(Duration::from_secs(10));
        activity.record("analyst", Duration::from_millis(400), true).await;
        activity.record("analyst", Duration::from_millis(600), false).await;
        activity.record("scout", Duration::from_millis(100), true).await;

        let health = activity.health().await;
        let analyst = &health["analyst"];
        assert_eq!(analyst.executions, 2);
        assert_eq!(analyst.failures, 1);
        assert!((analyst.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((analyst.avg_execution_time_ms - 500.0).abs() < 1e-6);
        assert_eq!(analyst.last_execution_time_ms, Some(600));
        assert!((analyst.utilization - 0.1).abs() < 1e-9);
        assert_eq!(health["scout"].failures, 0);
    }

    #[tokio::test]
    async fn utilization_is_capped() {
        let activity = AgentActivity::new(Duration::from_secs(1));
        activity.record("negotiator", Duration::from_secs(5), true).await;
        let health = activity.health().await;
        assert_eq!(health["negotiator"].utilization, 1.0);
    }

    #[tokio::test]
    async fn expired_records_are_dropped() {
        let activity = AgentActivity::new(Duration::from_millis(30));
        activity.record("scout", Duration::from_millis(1), true).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(activity.health().await.is_empty());
    }

    #[tokio::test]
    async fn recording_drops_expired_entries() {
        let activity = AgentActivity::new(Duration::from_millis(30));
        for _ in 0..50 {
            activity.record("analyst", Duration::from_millis(1), true).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        activity.record("analyst", Duration::from_millis(2), false).await;

        let records = activity.records.lock().await;
        let log = &records["analyst"];
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
    }
}
