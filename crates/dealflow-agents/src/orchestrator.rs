use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dealflow_models::config::{EscalationPolicy, RetryPolicy, WorkflowConfiguration};
use dealflow_models::context::{priority, ExecutionContext};
use dealflow_models::health::{Alert, AlertSeverity};
use dealflow_models::task::{TaskRequest, TaskResult};
use dealflow_models::workflow::{
    HumanDecision, Phase, WorkflowEvent, WorkflowEventKind, WorkflowMetrics, WorkflowStatus,
};
use dealflow_monitor::SystemHealthMonitor;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentRegistry, DealAgent};
use crate::control::{ControlChange, PendingEscalation, RunControl};
use crate::error::WorkflowError;
use crate::outreach::{OutreachDecision, OutreachLimiter};
use crate::store::ContextStore;

const MAX_ALERTS: usize = 100;
/// Share of the agent timeout after which a successful call is reported as slow.
const SLOW_CALL_RATIO: f64 = 0.8;
const ORCHESTRATOR: &str = "orchestrator";
pub const OUTREACH_DEFERRED: &str = "outreach_deferred";

/// Counts a running deal pipeline until dropped, including when its task is
/// aborted mid-phase.
struct ActivePipeline<'a> {
    active: &'a AtomicUsize,
    count: usize,
}

impl<'a> ActivePipeline<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        Self { active, count }
    }
}

impl Drop for ActivePipeline<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How one phase ended for the pipeline that ran it.
#[derive(Debug, Clone, PartialEq)]
enum PhaseOutcome {
    Completed,
    Skipped,
    Deferred,
    Failed,
}

enum Attempts {
    Succeeded(TaskResult),
    Skipped,
    Deferred,
    Exhausted { attempts: u32, last_error: String },
}

/// Builder for [`WorkflowOrchestrator`].
pub struct OrchestratorBuilder {
    config: WorkflowConfiguration,
    registry: AgentRegistry,
    retry: RetryPolicy,
    escalation: EscalationPolicy,
    monitor: Option<Arc<SystemHealthMonitor>>,
}

impl OrchestratorBuilder {
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn escalation_policy(mut self, escalation: EscalationPolicy) -> Self {
        self.escalation = escalation;
        self
    }

    /// Report agent executions and run metrics to `monitor`.
    pub fn monitor(mut self, monitor: Arc<SystemHealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> WorkflowOrchestrator {
        let (metrics, _) = watch::channel(WorkflowMetrics::default());
        WorkflowOrchestrator {
            inner: Arc::new(Inner {
                outreach: OutreachLimiter::new(&self.config),
                config: self.config,
                retry: self.retry,
                escalation: self.escalation,
                registry: self.registry,
                monitor: self.monitor,
                workflow_id: OnceLock::new(),
                store: ContextStore::new(ExecutionContext::default()),
                control: RunControl::new(),
                metrics,
                history: RwLock::new(Vec::new()),
                alerts: RwLock::new(VecDeque::new()),
                cancel: CancellationToken::new(),
                active: AtomicUsize::new(0),
                degraded: AtomicBool::new(false),
            }),
            driver: Mutex::new(None),
        }
    }
}

/// Drives one deal-pipeline run through its phases.
///
/// Discovery runs once for the whole run; every deal then gets its own
/// pipeline through analysis, negotiation, contract and portfolio
/// integration. Pipelines run concurrently up to `max_concurrent_deals`
/// (one at a time without parallel processing), each strictly in phase order.
/// An orchestrator runs a single workflow.
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: WorkflowConfiguration,
    retry: RetryPolicy,
    escalation: EscalationPolicy,
    registry: AgentRegistry,
    monitor: Option<Arc<SystemHealthMonitor>>,
    workflow_id: OnceLock<Uuid>,
    store: ContextStore,
    control: RunControl,
    metrics: watch::Sender<WorkflowMetrics>,
    history: RwLock<Vec<WorkflowEvent>>,
    alerts: RwLock<VecDeque<Alert>>,
    outreach: OutreachLimiter,
    cancel: CancellationToken,
    active: AtomicUsize,
    degraded: AtomicBool,
}

impl WorkflowOrchestrator {
    pub fn new(config: WorkflowConfiguration, registry: AgentRegistry) -> Self {
        Self::builder(config, registry).build()
    }

    pub fn builder(config: WorkflowConfiguration, registry: AgentRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            registry,
            retry: RetryPolicy::default(),
            escalation: EscalationPolicy::default(),
            monitor: None,
        }
    }

    pub fn config(&self) -> &WorkflowConfiguration {
        &self.inner.config
    }

    pub fn workflow_id(&self) -> Option<Uuid> {
        self.inner.workflow_id.get().copied()
    }

    /// Validate configuration, adopt `initial` as the run's context and start
    /// executing phases in the background.
    pub async fn start_workflow(&self, initial: ExecutionContext) -> Result<Uuid, WorkflowError> {
        let inner = &self.inner;
        inner.config.validate()?;
        inner.retry.validate()?;
        inner.escalation.validate()?;

        let mut driver = self.driver.lock().await;
        let status = inner.control.status();
        if driver.is_some() || status != WorkflowStatus::Initializing {
            return Err(WorkflowError::InvalidState {
                status,
                operation: "start_workflow",
            });
        }

        let workflow_id = Uuid::new_v4();
        if inner.workflow_id.set(workflow_id).is_err() {
            return Err(WorkflowError::InvalidState {
                status,
                operation: "start_workflow",
            });
        }

        let mut context = initial;
        context.workflow_id = Some(workflow_id);
        context.status = WorkflowStatus::Initializing;
        context.current_phase = None;
        context.human_approval_required = false;
        let deals = context.deals.len();
        inner.store.replace(context).await;

        inner.metrics.send_modify(|m| {
            m.workflow_id = Some(workflow_id);
            m.started_at = Some(chrono::Utc::now());
        });

        if inner.config.enable_real_time_monitoring {
            if let Some(monitor) = &inner.monitor {
                monitor
                    .register_workflow(workflow_id, inner.metrics.subscribe())
                    .await;
            }
        }

        info!(
            %workflow_id,
            deals,
            max_concurrent = inner.config.pipeline_permits(),
            "Starting workflow"
        );
        inner.set_status(WorkflowStatus::Running, "workflow started").await;

        let run = Arc::clone(inner);
        *driver = Some(tokio::spawn(async move { run.drive().await }));
        Ok(workflow_id)
    }

    /// Withhold the next phase of every pipeline. In-flight agent calls finish.
    /// While escalated, the pause takes effect once the escalations resolve.
    pub async fn pause_workflow(&self) -> bool {
        let inner = &self.inner;
        let mut escalations = inner.control.escalations().await;
        match escalations.pause() {
            ControlChange::Moved(from) => {
                inner
                    .after_transition(Some(from), WorkflowStatus::Paused, "pause requested")
                    .await
            }
            ControlChange::Deferred => {
                info!(workflow_id = %inner.id(), "Pause will apply once escalations resolve");
                true
            }
            ControlChange::Ignored => {
                debug!(status = %escalations.status(), "Pause ignored");
                false
            }
        }
    }

    pub async fn resume_workflow(&self) -> bool {
        let inner = &self.inner;
        let mut escalations = inner.control.escalations().await;
        match escalations.resume() {
            ControlChange::Moved(from) => {
                inner
                    .after_transition(Some(from), WorkflowStatus::Running, "resume requested")
                    .await
            }
            ControlChange::Deferred => {
                info!(workflow_id = %inner.id(), "Pending pause withdrawn");
                true
            }
            ControlChange::Ignored => {
                debug!(status = %escalations.status(), "Resume ignored");
                false
            }
        }
    }

    /// Stop the run for good. Safe to call any number of times; returns the
    /// final status.
    pub async fn stop_workflow(&self) -> WorkflowStatus {
        self.inner
            .halt(WorkflowStatus::Stopped, "stop requested")
            .await;
        self.join_driver().await;
        self.inner.release_monitoring().await;
        self.inner.control.status()
    }

    /// Answer the oldest pending escalation.
    pub async fn continue_workflow(
        &self,
        decision: HumanDecision,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let inner = &self.inner;
        let mut escalations = inner.control.escalations().await;
        let status = escalations.status();
        if status != WorkflowStatus::HumanEscalation {
            return Err(WorkflowError::InvalidState {
                status,
                operation: "continue_workflow",
            });
        }
        let pending = escalations
            .take_next()
            .ok_or(WorkflowError::NoPendingEscalation)?;

        info!(
            workflow_id = %inner.id(),
            phase = %pending.phase,
            decision = decision.as_str(),
            "Human decision received"
        );
        inner
            .record(
                WorkflowEventKind::DecisionReceived {
                    decision: decision.as_str().to_string(),
                },
                pending.deal_id,
                format!("decision on {}", pending.phase),
            )
            .await;

        let reject = matches!(decision, HumanDecision::Reject);
        // The waiting pipeline may already be gone
        let _ = pending.responder.send(decision);

        if reject {
            drop(escalations);
            inner
                .halt(WorkflowStatus::Stopped, "escalation rejected")
                .await;
            self.join_driver().await;
            inner.release_monitoring().await;
        } else if let Some((from, to)) = escalations.settle() {
            inner
                .store
                .commit(|ctx| ctx.human_approval_required = false)
                .await;
            inner
                .after_transition(Some(from), to, "escalations resolved")
                .await;
        }
        Ok(inner.control.status())
    }

    pub fn status(&self) -> WorkflowStatus {
        self.inner.control.status()
    }

    pub fn status_receiver(&self) -> watch::Receiver<WorkflowStatus> {
        self.inner.control.subscribe()
    }

    /// Wait for a terminal status and for the run's background work to wind
    /// down. Returns immediately if the run was never started.
    pub async fn wait_for_completion(&self) -> WorkflowStatus {
        if self.driver.lock().await.is_none() && !self.status().is_terminal() {
            return self.status();
        }
        let mut rx = self.inner.control.subscribe();
        // The sender lives as long as `inner`
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.join_driver().await;
        self.status()
    }

    pub async fn get_workflow_state(&self) -> ExecutionContext {
        (*self.inner.store.snapshot().await).clone()
    }

    pub fn get_workflow_metrics(&self) -> WorkflowMetrics {
        self.inner.metrics.borrow().clone()
    }

    pub async fn get_performance_alerts(&self) -> Vec<Alert> {
        self.inner.alerts.read().await.iter().cloned().collect()
    }

    pub async fn get_workflow_history(&self) -> Vec<WorkflowEvent> {
        self.inner.history.read().await.clone()
    }

    /// Deal pipelines currently between their first and last phase.
    pub fn active_pipelines(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether any deal pipeline ended early on a non-required failure or deferral.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    async fn join_driver(&self) {
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Workflow driver task failed");
            }
        }
    }
}

impl Inner {
    fn id(&self) -> Uuid {
        self.workflow_id.get().copied().unwrap_or_default()
    }

    async fn drive(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let budget = self.config.max_execution_time();

        tokio::select! {
            result = self.run_phases(&cancel) => match result {
                Ok(()) | Err(WorkflowError::Cancelled) | Err(WorkflowError::Rejected) => {}
                Err(e) => self.fail(&e).await,
            },
            _ = tokio::time::sleep(budget) => {
                let e = WorkflowError::WorkflowTimeout {
                    minutes: self.config.max_execution_time_minutes,
                };
                self.fail(&e).await;
            }
            _ = cancel.cancelled() => {}
            _ = self.report_metrics() => {}
        }

        self.finish().await;
    }

    async fn run_phases(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), WorkflowError> {
        self.bookkeeping(Phase::Initialization).await;

        self.run_phase(Phase::DealDiscovery, None, cancel).await?;

        let deal_ids: Vec<Uuid> = self
            .store
            .snapshot()
            .await
            .deals
            .iter()
            .map(|d| d.id)
            .collect();
        self.run_pipelines(deal_ids, cancel).await?;

        self.control.wait_until_runnable(cancel).await?;
        self.bookkeeping(Phase::Completion).await;
        self.set_status(WorkflowStatus::Completed, "all deal pipelines finished")
            .await;
        Ok(())
    }

    async fn run_pipelines(
        self: &Arc<Self>,
        deal_ids: Vec<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        let semaphore = Arc::new(Semaphore::new(self.config.pipeline_permits()));
        let mut pipelines = JoinSet::new();

        for deal_id in deal_ids {
            let inner = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            pipelines.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkflowError::Cancelled)?;
                inner.run_deal_pipeline(deal_id, &cancel).await
            });
        }

        let mut failure = None;
        while let Some(joined) = pipelines.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(WorkflowError::Cancelled)) | Ok(Err(WorkflowError::Rejected)) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        pipelines.abort_all();
                        failure = Some(e);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Deal pipeline panicked"),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_deal_pipeline(
        &self,
        deal_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        let slot = ActivePipeline::enter(&self.active);
        self.metrics.send_modify(|m| {
            m.peak_active_pipelines = m.peak_active_pipelines.max(slot.count);
        });

        let result = self.advance_deal(deal_id, cancel).await;

        drop(slot);
        if result.is_ok() {
            self.metrics.send_modify(|m| m.deals_processed += 1);
        }
        result
    }

    async fn advance_deal(&self, deal_id: Uuid, cancel: &CancellationToken) -> Result<(), WorkflowError> {
        for phase in Phase::DEAL_PHASES {
            match self.run_phase(phase, Some(deal_id), cancel).await? {
                PhaseOutcome::Completed | PhaseOutcome::Skipped => {}
                PhaseOutcome::Deferred => {
                    self.end_pipeline_early(deal_id, phase, OUTREACH_DEFERRED.to_string())
                        .await;
                    break;
                }
                PhaseOutcome::Failed => {
                    self.end_pipeline_early(deal_id, phase, format!("{phase}_failed"))
                        .await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn end_pipeline_early(&self, deal_id: Uuid, phase: Phase, flag: String) {
        self.degraded.store(true, Ordering::SeqCst);
        warn!(
            workflow_id = %self.id(),
            %deal_id,
            %phase,
            flag = %flag,
            "Deal pipeline ended early, continuing in degraded mode"
        );
        self.store
            .commit(|ctx| {
                if let Some(deal) = ctx.deal_mut(deal_id) {
                    deal.flag(flag);
                }
            })
            .await;
    }

    /// Run one phase to an outcome, including any human escalation it raises.
    /// Exhausted retries on a required phase are an error.
    async fn run_phase(
        &self,
        phase: Phase,
        deal_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, WorkflowError> {
        let mut params = Map::new();
        loop {
            let result = match self.attempt_phase(phase, deal_id, &params, cancel).await? {
                Attempts::Succeeded(result) => result,
                Attempts::Skipped => return Ok(PhaseOutcome::Skipped),
                Attempts::Deferred => return Ok(PhaseOutcome::Deferred),
                Attempts::Exhausted {
                    attempts,
                    last_error,
                } => {
                    if phase.is_required() {
                        return Err(WorkflowError::RetriesExhausted {
                            phase,
                            attempts,
                            last_error,
                        });
                    }
                    return Ok(PhaseOutcome::Failed);
                }
            };

            // Non-finite confidence always escalates
            let below_threshold = result
                .confidence
                .filter(|c| !c.is_finite() || *c < self.config.human_escalation_threshold);
            let Some(confidence) = below_threshold else {
                self.commit_result(phase, deal_id, result, false).await;
                return Ok(PhaseOutcome::Completed);
            };

            match self.escalate(phase, deal_id, confidence, cancel).await? {
                HumanDecision::Approve => {
                    self.commit_result(phase, deal_id, result, true).await;
                    return Ok(PhaseOutcome::Completed);
                }
                HumanDecision::Modify { params: adjusted } => {
                    info!(workflow_id = %self.id(), %phase, "Re-running phase with adjusted parameters");
                    params.extend(adjusted);
                }
                HumanDecision::Reject => return Err(WorkflowError::Rejected),
            }
        }
    }

    /// Call the phase's agent under its deadline, retrying with backoff.
    async fn attempt_phase(
        &self,
        phase: Phase,
        deal_id: Option<Uuid>,
        params: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Attempts, WorkflowError> {
        self.control.wait_until_runnable(cancel).await?;

        let Some(agent) = phase.agent_kind().and_then(|kind| self.registry.get(kind)) else {
            info!(workflow_id = %self.id(), %phase, "No agent registered, skipping phase");
            self.record(
                WorkflowEventKind::PhaseSkipped { phase },
                deal_id,
                "no agent registered",
            )
            .await;
            return Ok(Attempts::Skipped);
        };

        if phase.sends_communications() {
            match self.outreach.acquire().await {
                OutreachDecision::Granted(wait) if !wait.is_zero() => {
                    debug!(workflow_id = %self.id(), wait_ms = wait.as_millis() as u64, "Pacing outreach");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                OutreachDecision::Granted(_) => {}
                OutreachDecision::Deferred => {
                    self.store
                        .commit(|ctx| {
                            ctx.append_message(
                                ORCHESTRATOR,
                                format!(
                                    "{phase} deferred: hourly outreach limit of {} reached",
                                    self.config.max_outreach_per_hour
                                ),
                                priority::ELEVATED,
                            )
                        })
                        .await;
                    self.record(
                        WorkflowEventKind::PhaseSkipped { phase },
                        deal_id,
                        "outreach limit reached",
                    )
                    .await;
                    return Ok(Attempts::Deferred);
                }
            }
        }

        self.store.commit(|ctx| ctx.current_phase = Some(phase)).await;
        self.record(
            WorkflowEventKind::PhaseStarted { phase },
            deal_id,
            agent.name().to_string(),
        )
        .await;

        let total = self.config.max_retries_per_agent + 1;
        let phase_started = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=total {
            let request = TaskRequest {
                request_id: Uuid::new_v4(),
                workflow_id: self.id(),
                task_name: phase.task_name().to_string(),
                phase,
                deal_id,
                params: params.clone(),
                attempt,
            };

            match self.call_agent(agent.as_ref(), &request, cancel).await? {
                Ok(result) => {
                    let elapsed = phase_started.elapsed();
                    self.metrics
                        .send_modify(|m| m.record_phase_time(phase, elapsed.as_secs_f64()));
                    self.record(
                        WorkflowEventKind::PhaseCompleted {
                            phase,
                            elapsed_ms: elapsed.as_millis() as u64,
                        },
                        deal_id,
                        format!("attempt {attempt}"),
                    )
                    .await;
                    return Ok(Attempts::Succeeded(result));
                }
                Err(error) => {
                    warn!(
                        workflow_id = %self.id(),
                        %phase,
                        agent = agent.name(),
                        attempt,
                        attempts = total,
                        error = %error,
                        "Agent attempt failed"
                    );
                    self.metrics.send_modify(|m| m.agent_failures += 1);
                    self.store
                        .commit(|ctx| {
                            ctx.append_message(
                                agent.name(),
                                format!("{phase} attempt {attempt}/{total} failed: {error}"),
                                priority::HIGH,
                            )
                        })
                        .await;
                    last_error = error;
                }
            }

            if attempt < total {
                self.metrics.send_modify(|m| m.retries += 1);
                let backoff = self.retry.backoff_for(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        let elapsed = phase_started.elapsed();
        self.metrics
            .send_modify(|m| m.record_phase_time(phase, elapsed.as_secs_f64()));
        self.store
            .commit(|ctx| {
                ctx.append_message(
                    ORCHESTRATOR,
                    format!("{phase} failed after {total} attempts: {last_error}"),
                    priority::CRITICAL,
                )
            })
            .await;
        self.record(
            WorkflowEventKind::PhaseFailed {
                phase,
                attempts: total,
            },
            deal_id,
            last_error.clone(),
        )
        .await;
        let severity = if phase.is_required() {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        self.alert(
            severity,
            agent.name(),
            format!("{phase} retries exhausted after {total} attempts: {last_error}"),
        )
        .await;

        Ok(Attempts::Exhausted {
            attempts: total,
            last_error,
        })
    }

    /// One deadline-bounded agent call. The inner result is the attempt's
    /// outcome, with failures rendered as text.
    async fn call_agent(
        &self,
        agent: &dyn DealAgent,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<Result<TaskResult, String>, WorkflowError> {
        let timeout = self.config.agent_timeout();
        let snapshot = self.store.snapshot().await;
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            outcome = tokio::time::timeout(timeout, agent.execute_task(request, &snapshot)) => outcome,
        };
        let elapsed = started.elapsed();

        let attempt = match outcome {
            Ok(Ok(result)) if result.success => Ok(result),
            Ok(Ok(result)) => Err(WorkflowError::AgentExecution {
                agent: agent.name().to_string(),
                message: result
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            }
            .to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(WorkflowError::AgentTimeout {
                agent: agent.name().to_string(),
                seconds: self.config.agent_timeout_seconds,
            }
            .to_string()),
        };

        if let Some(monitor) = &self.monitor {
            monitor
                .record_agent_execution(agent.kind().as_str(), elapsed, attempt.is_ok())
                .await;
        }

        if attempt.is_ok() && elapsed.as_secs_f64() >= timeout.as_secs_f64() * SLOW_CALL_RATIO {
            self.alert(
                AlertSeverity::Warning,
                agent.name(),
                format!(
                    "{} took {:.1}s of its {:.1}s budget",
                    request.task_name,
                    elapsed.as_secs_f64(),
                    timeout.as_secs_f64()
                ),
            )
            .await;
        }

        debug!(
            workflow_id = %self.id(),
            agent = agent.name(),
            attempt = request.attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            success = attempt.is_ok(),
            "Agent call finished"
        );
        Ok(attempt)
    }

    async fn commit_result(
        &self,
        phase: Phase,
        deal_id: Option<Uuid>,
        result: TaskResult,
        human_approved: bool,
    ) {
        let agent = phase.agent_kind().map(|k| k.as_str()).unwrap_or(ORCHESTRATOR);
        let auto_approve = self.config.auto_approve_threshold;
        let confident = result
            .confidence
            .is_some_and(|c| c.is_finite() && c >= auto_approve);
        let communications = result.delta.communications_sent;
        let delta = result.delta;

        let (added, newly_approved, analyzed) = self
            .store
            .commit(|ctx| {
                let added = ctx.apply_delta(agent, delta);
                let mut newly_approved = false;
                let mut analyzed = None;
                if let Some(deal) = deal_id.and_then(|id| ctx.deal_mut(id)) {
                    if phase == Phase::PropertyAnalysis {
                        deal.analyzed = true;
                        analyzed = Some((
                            deal.asking_price.unwrap_or_default(),
                            deal.estimated_profit.unwrap_or_default(),
                        ));
                    }
                    let approve = human_approved || (phase == Phase::PropertyAnalysis && confident);
                    if approve && !deal.approved {
                        deal.approved = true;
                        newly_approved = true;
                    }
                }
                (added, newly_approved, analyzed)
            })
            .await;

        self.metrics.send_modify(|m| {
            m.messages_sent += u64::from(communications);
            if phase != Phase::PortfolioIntegration {
                m.cross_agent_handoffs += 1;
            }
            if newly_approved {
                m.deals_approved += 1;
            }
            if let Some((investment, profit)) = analyzed {
                m.total_investment_analyzed += investment;
                m.total_profit_identified += profit;
            }
        });

        if added > 0 {
            info!(workflow_id = %self.id(), added, "New deals added to the pipeline");
        }
        if newly_approved {
            info!(workflow_id = %self.id(), deal_id = ?deal_id, human_approved, "Deal approved");
        }
    }

    /// Suspend until a human answers, or the escalation SLA runs out.
    async fn escalate(
        &self,
        phase: Phase,
        deal_id: Option<Uuid>,
        confidence: f64,
        cancel: &CancellationToken,
    ) -> Result<HumanDecision, WorkflowError> {
        let (responder, answer) = oneshot::channel();
        let id = Uuid::new_v4();
        let reason = WorkflowError::EscalationRequired { phase, confidence };
        {
            let mut escalations = self.control.escalations().await;
            if escalations.status().is_terminal() {
                return Err(WorkflowError::Cancelled);
            }
            warn!(workflow_id = %self.id(), deal_id = ?deal_id, "{reason}");
            self.metrics.send_modify(|m| m.escalations += 1);
            // Context reflects the escalation before the status is published
            self.store
                .commit(|ctx| {
                    ctx.human_approval_required = true;
                    ctx.status = WorkflowStatus::HumanEscalation;
                    ctx.append_message(ORCHESTRATOR, reason.to_string(), priority::ELEVATED);
                })
                .await;
            let previous = escalations.raise(PendingEscalation {
                id,
                phase,
                deal_id,
                confidence,
                responder,
            });
            self.record(
                WorkflowEventKind::EscalationRaised { phase, confidence },
                deal_id,
                format!(
                    "confidence below {:.2}",
                    self.config.human_escalation_threshold
                ),
            )
            .await;
            self.after_transition(
                previous,
                WorkflowStatus::HumanEscalation,
                "awaiting human decision",
            )
            .await;
        }

        let sla = self.escalation.timeout();
        tokio::select! {
            _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
            decision = answer => decision.map_err(|_| WorkflowError::Cancelled),
            _ = sla_expiry(sla) => {
                self.expire_escalation(id, phase, deal_id).await;
                Err(WorkflowError::Rejected)
            }
        }
    }

    async fn expire_escalation(&self, id: Uuid, phase: Phase, deal_id: Option<Uuid>) {
        if self.control.remove_escalation(id).await.is_none() {
            return;
        }
        let waited = self.escalation.timeout_seconds.unwrap_or_default();
        self.alert(
            AlertSeverity::Critical,
            ORCHESTRATOR,
            format!("Escalation on {phase} unanswered after {waited:.0}s, rejecting"),
        )
        .await;
        self.record(
            WorkflowEventKind::DecisionReceived {
                decision: HumanDecision::Reject.as_str().to_string(),
            },
            deal_id,
            "escalation timed out",
        )
        .await;
        self.halt(WorkflowStatus::Stopped, "escalation timed out").await;
    }

    async fn bookkeeping(&self, phase: Phase) {
        self.store.commit(|ctx| ctx.current_phase = Some(phase)).await;
        self.record(WorkflowEventKind::PhaseStarted { phase }, None, "")
            .await;
        self.record(
            WorkflowEventKind::PhaseCompleted {
                phase,
                elapsed_ms: 0,
            },
            None,
            "",
        )
        .await;
    }

    async fn set_status(&self, to: WorkflowStatus, reason: &str) -> bool {
        let previous = self.control.transition(to);
        self.after_transition(previous, to, reason).await
    }

    async fn after_transition(
        &self,
        previous: Option<WorkflowStatus>,
        to: WorkflowStatus,
        reason: &str,
    ) -> bool {
        let Some(from) = previous else {
            return false;
        };
        self.store.commit(|ctx| ctx.status = to).await;
        self.record(WorkflowEventKind::StatusChanged { from, to }, None, reason)
            .await;
        info!(workflow_id = %self.id(), %from, %to, reason, "Workflow status changed");
        true
    }

    /// Move to a terminal status and cancel outstanding work.
    async fn halt(&self, to: WorkflowStatus, reason: &str) {
        self.set_status(to, reason).await;
        self.control.clear_escalations().await;
        self.store
            .commit(|ctx| ctx.human_approval_required = false)
            .await;
        self.cancel.cancel();
    }

    async fn fail(&self, e: &WorkflowError) {
        error!(workflow_id = %self.id(), error = %e, "Workflow failed");
        self.alert(AlertSeverity::Critical, ORCHESTRATOR, e.to_string())
            .await;
        self.halt(WorkflowStatus::Error, &e.to_string()).await;
    }

    async fn finish(&self) {
        self.metrics.send_modify(|m| {
            if m.completed_at.is_none() {
                m.completed_at = Some(chrono::Utc::now());
            }
        });
        self.release_monitoring().await;

        let metrics = self.metrics.borrow().clone();
        info!(
            workflow_id = %self.id(),
            status = %self.control.status(),
            deals_processed = metrics.deals_processed,
            deals_approved = metrics.deals_approved,
            agent_failures = metrics.agent_failures,
            degraded = self.degraded.load(Ordering::SeqCst),
            "Workflow finished"
        );
    }

    async fn release_monitoring(&self) {
        if let (Some(monitor), Some(id)) = (&self.monitor, self.workflow_id.get()) {
            monitor.unregister_workflow(*id).await;
        }
    }

    /// Log a metrics summary every collection interval. Never returns.
    async fn report_metrics(&self) {
        let interval = self.config.metrics_interval();
        loop {
            tokio::time::sleep(interval).await;
            let metrics = self.metrics.borrow().clone();
            info!(
                workflow_id = %self.id(),
                status = %self.control.status(),
                active_pipelines = self.active.load(Ordering::SeqCst),
                deals_processed = metrics.deals_processed,
                deals_approved = metrics.deals_approved,
                messages_sent = metrics.messages_sent,
                retries = metrics.retries,
                "Workflow metrics"
            );
        }
    }

    async fn record(&self, kind: WorkflowEventKind, deal_id: Option<Uuid>, detail: impl Into<String>) {
        self.history
            .write()
            .await
            .push(WorkflowEvent::new(kind, deal_id, detail));
    }

    async fn alert(&self, severity: AlertSeverity, component: &str, message: String) {
        warn!(workflow_id = %self.id(), component, severity = ?severity, "{message}");
        let mut alerts = self.alerts.write().await;
        alerts.push_back(Alert::new(severity, component, message));
        while alerts.len() > MAX_ALERTS {
            alerts.pop_front();
        }
    }
}

async fn sla_expiry(sla: Option<Duration>) {
    match sla {
        Some(sla) => tokio::time::sleep(sla).await,
        None => std::future::pending().await,
    }
}
