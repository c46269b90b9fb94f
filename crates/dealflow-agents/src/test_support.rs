//! Scripted agents and fixtures for exercising the orchestrator without real
//! collaborators.
//!
//! A [`ScriptedAgent`] can be told to fail its first N attempts, hang, sleep,
//! report a confidence (fixed or derived from the request) and return a
//! context delta. A shared [`ConcurrencyProbe`] records how many agent calls
//! were in flight at once.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealflow_models::context::{ContextDelta, Deal, DealUpdate, ExecutionContext, StrategyInputs};
use dealflow_models::task::{AgentKind, TaskRequest, TaskResult};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::agent::{AgentRegistry, DealAgent};
use crate::error::WorkflowError;

type ConfidenceFn = dyn Fn(&TaskRequest) -> Option<f64> + Send + Sync;
type DeltaFn = dyn Fn(&TaskRequest, &ExecutionContext) -> ContextDelta + Send + Sync;

/// Tracks in-flight agent calls across any number of agents.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ProbeGuard<'a>(Option<&'a ConcurrencyProbe>);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let Some(probe) = self.0 {
            probe.exit();
        }
    }
}

/// Behavior-scripted [`DealAgent`].
pub struct ScriptedAgent {
    kind: AgentKind,
    name: String,
    confidence: Option<Arc<ConfidenceFn>>,
    delta: Option<Arc<DeltaFn>>,
    delay: Duration,
    hang: bool,
    fail_remaining: AtomicU32,
    always_fail: bool,
    probe: Option<ConcurrencyProbe>,
    calls: AtomicU32,
    requests: Mutex<Vec<TaskRequest>>,
}

impl ScriptedAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            name: kind.as_str().to_string(),
            confidence: None,
            delta: None,
            delay: Duration::ZERO,
            hang: false,
            fail_remaining: AtomicU32::new(0),
            always_fail: false,
            probe: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_confidence(self, confidence: f64) -> Self {
        self.with_confidence_fn(move |_| Some(confidence))
    }

    pub fn with_confidence_fn(
        mut self,
        f: impl Fn(&TaskRequest) -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        self.confidence = Some(Arc::new(f));
        self
    }

    pub fn with_delta(
        mut self,
        f: impl Fn(&TaskRequest, &ExecutionContext) -> ContextDelta + Send + Sync + 'static,
    ) -> Self {
        self.delta = Some(Arc::new(f));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never return; only the orchestrator's deadline ends the call.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn failing_first(self, attempts: u32) -> Self {
        self.fail_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Scout that discovers `count` new deals on every call.
    pub fn discovering(count: usize) -> Self {
        Self::new(AgentKind::Scout).with_delta(move |_, _| ContextDelta {
            new_deals: (0..count)
                .map(|i| sample_deal(&format!("{} Discovery Rd", 100 + i)))
                .collect(),
            ..Default::default()
        })
    }

    /// Analyst that scores the deal and estimates a profit of 10% of the asking price.
    pub fn scoring(score: f64) -> Self {
        Self::new(AgentKind::Analyst).with_delta(move |request, context| {
            let Some(deal_id) = request.deal_id else {
                return ContextDelta::default();
            };
            let profit = context
                .deal(deal_id)
                .and_then(|d| d.asking_price)
                .map(|p| p / Decimal::from(10));
            let mut update = DealUpdate::new(deal_id);
            update.score = Some(score);
            update.estimated_profit = profit;
            ContextDelta {
                deal_updates: vec![update],
                ..Default::default()
            }
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<TaskRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl DealAgent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_task(
        &self,
        request: &TaskRequest,
        context: &ExecutionContext,
    ) -> Result<TaskResult, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        if let Some(probe) = &self.probe {
            probe.enter();
        }
        let _guard = ProbeGuard(self.probe.as_ref());

        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted_failure = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.always_fail || scripted_failure {
            return Ok(TaskResult::failed(format!(
                "{} scripted failure on attempt {}",
                self.name, request.attempt
            )));
        }

        let mut result = TaskResult::ok().with_execution_time(self.delay.as_secs_f64());
        if let Some(confidence) = self.confidence.as_ref().and_then(|f| f(request)) {
            result = result.with_confidence(confidence);
        }
        if let Some(delta) = &self.delta {
            result = result.with_delta(delta(request, context));
        }
        Ok(result)
    }
}

/// One scripted agent per kind, all succeeding immediately.
pub fn full_registry() -> AgentRegistry {
    [
        AgentKind::Scout,
        AgentKind::Analyst,
        AgentKind::Negotiator,
        AgentKind::ContractManager,
        AgentKind::PortfolioManager,
    ]
    .into_iter()
    .fold(AgentRegistry::new(), |registry, kind| {
        registry.with(Arc::new(ScriptedAgent::new(kind)))
    })
}

pub fn sample_deal(address: &str) -> Deal {
    Deal::new(address).with_asking_price(Decimal::from(250_000))
}

/// Context seeded with `deals` properties and a value-add strategy.
pub fn sample_context(deals: usize) -> ExecutionContext {
    let strategy = StrategyInputs {
        investment_strategy: "value_add".to_string(),
        available_capital: Decimal::from(2_000_000),
        target_markets: vec!["Austin, TX".to_string(), "Denver, CO".to_string()],
        parameters: serde_json::Map::new(),
    };
    ExecutionContext::new(strategy).with_deals(
        (0..deals)
            .map(|i| sample_deal(&format!("{} Main St", 10 + i)))
            .collect(),
    )
}
