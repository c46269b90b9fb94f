use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_models::config::{seconds, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::OptimizerError;

/// Reason reported when a recovery attempt is refused by an open breaker.
pub const CIRCUIT_BREAKER_OPEN: &str = "circuit_breaker_open";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    RestartComponent,
    ShedLoad,
}

impl RecoveryStrategy {
    pub fn for_error_type(error_type: &str) -> Self {
        match error_type {
            "crash" | "component_failure" | "deadlock" => RecoveryStrategy::RestartComponent,
            "memory_pressure" | "resource_exhaustion" | "overload" | "high_error_rate" => {
                RecoveryStrategy::ShedLoad
            }
            _ => RecoveryStrategy::Retry,
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::RestartComponent => "restart_component",
            RecoveryStrategy::ShedLoad => "shed_load",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub component: String,
    pub error_type: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub action: Option<RecoveryAction>,
    pub reason: Option<String>,
}

/// Breaker state for one `(component, error_type)` pair after an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub component: String,
    pub error_type: String,
    /// Errors inside the current window.
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCircuit {
    pub component: String,
    pub error_type: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub blocked_by_circuit_breaker: u64,
    pub recovery_success_rate: f64,
    pub open_circuits: Vec<OpenCircuit>,
}

/// Carries out a recovery action. Mockable for testing.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(&self, action: &RecoveryAction) -> Result<(), OptimizerError>;
}

/// Logs the chosen strategy without applying it. Callers act on the
/// broadcast action themselves, so the attempt counts as unsuccessful and
/// repeated recommendations open the breaker.
pub struct RecommendingHandler;

#[async_trait]
impl RecoveryHandler for RecommendingHandler {
    async fn recover(&self, action: &RecoveryAction) -> Result<(), OptimizerError> {
        info!(
            component = %action.component,
            error_type = %action.error_type,
            strategy = %action.strategy,
            "Recovery recommended"
        );
        Err(OptimizerError::NotApplied {
            component: action.component.clone(),
            strategy: action.strategy,
        })
    }
}

#[derive(Debug)]
struct ErrorEvent {
    at: Instant,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Breaker {
    errors: VecDeque<ErrorEvent>,
    opened: Option<(Instant, DateTime<Utc>)>,
}

impl Breaker {
    /// Drop errors outside the window and close the breaker once its
    /// cool-down has elapsed.
    fn refresh(&mut self, now: Instant, window: Duration, cooldown: Duration) {
        if let Some((opened_at, _)) = self.opened {
            if now.duration_since(opened_at) >= cooldown {
                self.opened = None;
                self.errors.clear();
            }
        }
        while self
            .errors
            .front()
            .is_some_and(|e| now.duration_since(e.at) > window)
        {
            self.errors.pop_front();
        }
    }

    fn is_open(&self) -> bool {
        self.opened.is_some()
    }
}

#[derive(Default)]
struct RecoveryState {
    breakers: HashMap<(String, String), Breaker>,
    total_errors: u64,
    recovery_attempts: u64,
    successful_recoveries: u64,
    blocked: u64,
}

/// Sliding-window error counting with one circuit breaker per
/// `(component, error_type)` pair.
pub struct ErrorRecoverySystem {
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    handler: Arc<dyn RecoveryHandler>,
    state: Mutex<RecoveryState>,
}

impl ErrorRecoverySystem {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_handler(config, Arc::new(RecommendingHandler))
    }

    pub fn with_handler(config: &CircuitBreakerConfig, handler: Arc<dyn RecoveryHandler>) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            window: seconds(config.window_seconds),
            cooldown: seconds(config.cooldown_seconds),
            handler,
            state: Mutex::new(RecoveryState::default()),
        }
    }

    pub async fn record_error(&self, error_type: &str, component: &str, details: &str) -> ErrorRecord {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.total_errors += 1;

        let breaker = state
            .breakers
            .entry((component.to_string(), error_type.to_string()))
            .or_default();
        breaker.refresh(now, self.window, self.cooldown);
        breaker.errors.push_back(ErrorEvent {
            at: now,
            timestamp: Utc::now(),
        });

        let count = breaker.errors.len() as u32;
        if !breaker.is_open() && count >= self.failure_threshold {
            breaker.opened = Some((now, Utc::now()));
            warn!(component, error_type, count, "Circuit breaker opened");
        } else {
            warn!(component, error_type, count, details, "Error recorded");
        }

        ErrorRecord {
            component: component.to_string(),
            error_type: error_type.to_string(),
            count,
            window_start: breaker
                .errors
                .front()
                .map(|e| e.timestamp)
                .unwrap_or_else(Utc::now),
            circuit_open: breaker.is_open(),
        }
    }

    pub async fn is_circuit_breaker_open(&self, component: &str, error_type: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let key = (component.to_string(), error_type.to_string());
        match state.breakers.get_mut(&key) {
            Some(breaker) => {
                let was_open = breaker.is_open();
                breaker.refresh(now, self.window, self.cooldown);
                if was_open && !breaker.is_open() {
                    info!(component, error_type, "Circuit breaker reset after cool-down");
                }
                breaker.is_open()
            }
            None => false,
        }
    }

    /// Try to recover from an error. Refused without side effects on the
    /// component while its breaker is open.
    pub async fn attempt_recovery(
        &self,
        error_type: &str,
        component: &str,
        details: &str,
    ) -> RecoveryOutcome {
        if self.is_circuit_breaker_open(component, error_type).await {
            self.state.lock().await.blocked += 1;
            let err = OptimizerError::CircuitOpen {
                component: component.to_string(),
                error_type: error_type.to_string(),
            };
            warn!(error = %err, "Recovery blocked");
            return RecoveryOutcome {
                success: false,
                action: None,
                reason: Some(CIRCUIT_BREAKER_OPEN.to_string()),
            };
        }

        self.state.lock().await.recovery_attempts += 1;
        let action = RecoveryAction {
            strategy: RecoveryStrategy::for_error_type(error_type),
            component: component.to_string(),
            error_type: error_type.to_string(),
            details: details.to_string(),
        };

        match self.handler.recover(&action).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.successful_recoveries += 1;
                state
                    .breakers
                    .remove(&(component.to_string(), error_type.to_string()));
                RecoveryOutcome {
                    success: true,
                    action: Some(action),
                    reason: None,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(component, error_type, error = %reason, "Recovery attempt failed");
                self.record_error(error_type, component, &reason).await;
                RecoveryOutcome {
                    success: false,
                    action: Some(action),
                    reason: Some(reason),
                }
            }
        }
    }

    pub async fn get_error_statistics(&self) -> ErrorStatistics {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut open_circuits = Vec::new();
        for ((component, error_type), breaker) in state.breakers.iter_mut() {
            breaker.refresh(now, self.window, self.cooldown);
            if let Some((_, opened_at)) = breaker.opened {
                open_circuits.push(OpenCircuit {
                    component: component.clone(),
                    error_type: error_type.clone(),
                    opened_at,
                });
            }
        }
        open_circuits.sort_by(|a, b| {
            (&a.component, &a.error_type).cmp(&(&b.component, &b.error_type))
        });

        let recovery_success_rate = if state.recovery_attempts > 0 {
            state.successful_recoveries as f64 / state.recovery_attempts as f64
        } else {
            0.0
        };
        ErrorStatistics {
            total_errors: state.total_errors,
            recovery_attempts: state.recovery_attempts,
            successful_recoveries: state.successful_recoveries,
            blocked_by_circuit_breaker: state.blocked,
            recovery_success_rate,
            open_circuits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingHandler;

    struct RestartingHandler;

    #[async_trait]
    impl RecoveryHandler for RestartingHandler {
        async fn recover(&self, _action: &RecoveryAction) -> Result<(), OptimizerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl RecoveryHandler for FailingHandler {
        async fn recover(&self, action: &RecoveryAction) -> Result<(), OptimizerError> {
            Err(OptimizerError::Recovery(format!("{} unreachable", action.component)))
        }
    }

    fn system() -> ErrorRecoverySystem {
        ErrorRecoverySystem::new(&CircuitBreakerConfig::default())
    }

    #[test]
    fn strategy_by_error_type() {
        assert_eq!(RecoveryStrategy::for_error_type("timeout"), RecoveryStrategy::Retry);
        assert_eq!(
            RecoveryStrategy::for_error_type("connection_failure"),
            RecoveryStrategy::Retry
        );
        assert_eq!(
            RecoveryStrategy::for_error_type("crash"),
            RecoveryStrategy::RestartComponent
        );
        assert_eq!(
            RecoveryStrategy::for_error_type("memory_pressure"),
            RecoveryStrategy::ShedLoad
        );
        assert_eq!(RecoveryStrategy::for_error_type("mystery"), RecoveryStrategy::Retry);
    }

    #[tokio::test]
    async fn threshold_errors_open_the_breaker() {
        let recovery = system();
        for i in 1..=4 {
            let record = recovery
                .record_error("connection_failure", "X", "refused")
                .await;
            assert_eq!(record.count, i);
            assert!(!record.circuit_open);
        }
        let record = recovery
            .record_error("connection_failure", "X", "refused")
            .await;
        assert!(record.circuit_open);
        assert!(recovery.is_circuit_breaker_open("X", "connection_failure").await);

        let outcome = recovery
            .attempt_recovery("connection_failure", "X", "refused")
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some(CIRCUIT_BREAKER_OPEN));
        assert!(outcome.action.is_none());

        let stats = recovery.get_error_statistics().await;
        assert_eq!(stats.recovery_attempts, 0);
        assert_eq!(stats.blocked_by_circuit_breaker, 1);
        assert_eq!(stats.open_circuits.len(), 1);
    }

    #[tokio::test]
    async fn breakers_are_independent_per_pair() {
        let recovery = system();
        for _ in 0..5 {
            recovery.record_error("timeout", "analyst", "slow").await;
        }
        assert!(recovery.is_circuit_breaker_open("analyst", "timeout").await);
        assert!(!recovery.is_circuit_breaker_open("analyst", "crash").await);
        assert!(!recovery.is_circuit_breaker_open("scout", "timeout").await);
    }

    #[tokio::test]
    async fn successful_recovery_resets_counts() {
        let recovery =
            ErrorRecoverySystem::with_handler(&CircuitBreakerConfig::default(), Arc::new(RestartingHandler));
        for _ in 0..3 {
            recovery.record_error("timeout", "scout", "slow").await;
        }
        let outcome = recovery.attempt_recovery("timeout", "scout", "slow").await;
        assert!(outcome.success);
        assert_eq!(outcome.action.unwrap().strategy, RecoveryStrategy::Retry);

        let record = recovery.record_error("timeout", "scout", "slow").await;
        assert_eq!(record.count, 1);

        let stats = recovery.get_error_statistics().await;
        assert_eq!(stats.total_errors, 4);
        assert_eq!(stats.recovery_attempts, 1);
        assert_eq!(stats.recovery_success_rate, 1.0);
    }

    #[tokio::test]
    async fn failed_recovery_counts_toward_the_breaker() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let recovery = ErrorRecoverySystem::with_handler(&config, Arc::new(FailingHandler));
        recovery.record_error("crash", "negotiator", "panic").await;

        let outcome = recovery.attempt_recovery("crash", "negotiator", "panic").await;
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("negotiator unreachable"));
        assert!(recovery.is_circuit_breaker_open("negotiator", "crash").await);

        let stats = recovery.get_error_statistics().await;
        assert_eq!(stats.recovery_attempts, 1);
        assert_eq!(stats.successful_recoveries, 0);
        assert_eq!(stats.recovery_success_rate, 0.0);
    }

    #[tokio::test]
    async fn recommendations_alone_open_the_breaker() {
        let recovery = system();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            recovery.record_error("high_error_rate", "analyst", "100%").await;
            outcomes.push(recovery.attempt_recovery("high_error_rate", "analyst", "100%").await);
        }

        let first = &outcomes[0];
        assert!(!first.success);
        assert_eq!(first.action.as_ref().unwrap().strategy, RecoveryStrategy::ShedLoad);
        assert!(first.reason.as_deref().unwrap().contains("not applied"));
        assert_eq!(outcomes[2].reason.as_deref(), Some(CIRCUIT_BREAKER_OPEN));
        assert!(recovery.is_circuit_breaker_open("analyst", "high_error_rate").await);

        let stats = recovery.get_error_statistics().await;
        assert_eq!(stats.recovery_attempts, 2);
        assert_eq!(stats.successful_recoveries, 0);
        assert_eq!(stats.recovery_success_rate, 0.0);
        assert_eq!(stats.blocked_by_circuit_breaker, 1);
    }

    #[tokio::test]
    async fn breaker_closes_after_cooldown() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            window_seconds: 60.0,
            cooldown_seconds: 0.05,
        };
        let recovery = ErrorRecoverySystem::with_handler(&config, Arc::new(RestartingHandler));
        recovery.record_error("timeout", "scout", "slow").await;
        assert!(recovery.is_circuit_breaker_open("scout", "timeout").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!recovery.is_circuit_breaker_open("scout", "timeout").await);
        assert!(recovery.attempt_recovery("timeout", "scout", "slow").await.success);
    }

    #[tokio::test]
    async fn errors_outside_the_window_do_not_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            window_seconds: 0.05,
            cooldown_seconds: 60.0,
        };
        let recovery = ErrorRecoverySystem::new(&config);
        recovery.record_error("timeout", "scout", "slow").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = recovery.record_error("timeout", "scout", "slow").await;
        assert_eq!(record.count, 1);
        assert!(!record.circuit_open);
    }
}
