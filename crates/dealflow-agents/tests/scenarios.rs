//! End-to-end runs of the orchestrator against scripted agents.
//!
//! Each test wires a registry of `ScriptedAgent`s with specific behaviors
//! (slow, hanging, failing, low confidence), starts a workflow and checks the
//! resulting status, context and metrics.

use std::sync::Arc;
use std::time::Duration;

use dealflow_agents::test_support::{
    full_registry, sample_context, ConcurrencyProbe, ScriptedAgent,
};
use dealflow_agents::{AgentRegistry, WorkflowOrchestrator, OUTREACH_DEFERRED};
use dealflow_models::{
    AgentKind, AlertSeverity, EscalationPolicy, HumanDecision, MonitorConfig, Phase, RetryPolicy,
    WorkflowConfiguration, WorkflowEventKind, WorkflowStatus,
};
use dealflow_monitor::{FixedSampler, SystemHealthMonitor};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff_seconds: 0.01,
        multiplier: 2.0,
        max_backoff_seconds: 0.02,
    }
}

fn config() -> WorkflowConfiguration {
    WorkflowConfiguration {
        agent_timeout_seconds: 2.0,
        ..Default::default()
    }
}

async fn wait_for_status(orchestrator: &WorkflowOrchestrator, status: WorkflowStatus) {
    let mut rx = orchestrator.status_receiver();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .expect("status not reached in time")
        .expect("status channel closed");
}

async fn started_phases(orchestrator: &WorkflowOrchestrator, phase: Phase) -> usize {
    orchestrator
        .get_workflow_history()
        .await
        .iter()
        .filter(|e| e.kind == WorkflowEventKind::PhaseStarted { phase })
        .count()
}

#[tokio::test]
async fn pipelines_respect_concurrency_limit() {
    let probe = ConcurrencyProbe::new();
    let analyst = ScriptedAgent::new(AgentKind::Analyst)
        .with_delay(Duration::from_millis(50))
        .with_probe(probe.clone());
    let registry = full_registry().with(Arc::new(analyst));

    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(8)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    assert_eq!(probe.max(), 5);
    assert_eq!(probe.current(), 0);

    let metrics = orchestrator.get_workflow_metrics();
    assert_eq!(metrics.deals_processed, 8);
    assert_eq!(metrics.peak_active_pipelines, 5);
}

#[tokio::test]
async fn sequential_mode_runs_one_pipeline_at_a_time() {
    let probe = ConcurrencyProbe::new();
    let analyst = ScriptedAgent::new(AgentKind::Analyst)
        .with_delay(Duration::from_millis(20))
        .with_probe(probe.clone());
    let registry = full_registry().with(Arc::new(analyst));
    let config = WorkflowConfiguration {
        enable_parallel_processing: false,
        ..config()
    };

    let orchestrator = WorkflowOrchestrator::new(config, registry);
    orchestrator.start_workflow(sample_context(3)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    assert_eq!(probe.max(), 1);
    assert_eq!(orchestrator.get_workflow_metrics().peak_active_pipelines, 1);
}

#[tokio::test]
async fn discovered_deals_get_their_own_pipelines() {
    let analyst = Arc::new(ScriptedAgent::scoring(0.8));
    let registry = full_registry()
        .with(Arc::new(ScriptedAgent::discovering(3)))
        .with(analyst.clone());

    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(0)).await.unwrap();
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);

    let state = orchestrator.get_workflow_state().await;
    assert_eq!(state.deals.len(), 3);
    assert!(state.deals.iter().all(|d| d.analyzed && d.score == Some(0.8)));
    assert_eq!(analyst.calls(), 3);
    assert_eq!(orchestrator.get_workflow_metrics().deals_processed, 3);
}

/// 0.87 clears the default auto-approve bar of 0.85 but sits under the
/// escalation threshold, so a human still has to sign off.
#[tokio::test]
async fn low_confidence_escalates_until_approved() {
    let registry = full_registry()
        .with(Arc::new(ScriptedAgent::scoring(0.4).with_confidence(0.87)))
        .with(Arc::new(
            ScriptedAgent::new(AgentKind::Negotiator).with_delay(Duration::from_millis(200)),
        ));

    let config = WorkflowConfiguration {
        human_escalation_threshold: 0.9,
        ..config()
    };
    assert!(config.validate().is_ok());

    let orchestrator = WorkflowOrchestrator::new(config, registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;

    let state = orchestrator.get_workflow_state().await;
    assert!(state.human_approval_required);
    assert_eq!(state.status, WorkflowStatus::HumanEscalation);
    assert!(!state.deals[0].analyzed);
    assert!(!state.deals[0].approved);

    let status = orchestrator
        .continue_workflow(HumanDecision::Approve)
        .await
        .unwrap();
    assert_eq!(status, WorkflowStatus::Running);
    assert!(!orchestrator.get_workflow_state().await.human_approval_required);

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    let state = orchestrator.get_workflow_state().await;
    assert!(state.deals[0].approved);
    assert_eq!(state.deals[0].score, Some(0.4));

    let metrics = orchestrator.get_workflow_metrics();
    assert_eq!(metrics.escalations, 1);
    assert_eq!(metrics.deals_approved, 1);

    let history = orchestrator.get_workflow_history().await;
    assert!(history.iter().any(|e| matches!(
        &e.kind,
        WorkflowEventKind::DecisionReceived { decision } if decision == "approve"
    )));
}

#[tokio::test]
async fn non_finite_confidence_escalates() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::scoring(0.7).with_confidence(f64::NAN),
    ));
    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;
    assert!(!orchestrator.get_workflow_state().await.deals[0].approved);

    orchestrator
        .continue_workflow(HumanDecision::Approve)
        .await
        .unwrap();
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    assert_eq!(orchestrator.get_workflow_metrics().escalations, 1);
}

/// A pause issued while the analyst is still working outlives the
/// escalation that analyst raises.
#[tokio::test]
async fn pause_survives_an_escalation() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst)
            .with_delay(Duration::from_millis(100))
            .with_confidence(0.2),
    ));
    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(orchestrator.pause_workflow().await);
    wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;

    let status = orchestrator
        .continue_workflow(HumanDecision::Approve)
        .await
        .unwrap();
    assert_eq!(status, WorkflowStatus::Paused);
    assert!(!orchestrator.get_workflow_state().await.human_approval_required);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.status(), WorkflowStatus::Paused);
    assert_eq!(started_phases(&orchestrator, Phase::Negotiation).await, 0);

    assert!(orchestrator.resume_workflow().await);
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    assert!(orchestrator.get_workflow_state().await.deals[0].approved);
}

#[tokio::test]
async fn pause_requested_while_escalated_applies_on_approval() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).with_confidence(0.2),
    ));
    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;

    assert!(orchestrator.pause_workflow().await);
    assert_eq!(orchestrator.status(), WorkflowStatus::HumanEscalation);
    assert_eq!(
        orchestrator
            .continue_workflow(HumanDecision::Approve)
            .await
            .unwrap(),
        WorkflowStatus::Paused
    );
    assert!(orchestrator.resume_workflow().await);
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
}

/// Several deals escalate at once; approving them one by one keeps the run
/// held until the last decision, and every waiting pipeline is released.
#[tokio::test]
async fn concurrent_escalations_all_resolve() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).with_confidence(0.2),
    ));
    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(3)).await.unwrap();

    let mut approvals = 0;
    while approvals < 3 {
        wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;
        let status = orchestrator
            .continue_workflow(HumanDecision::Approve)
            .await
            .unwrap();
        approvals += 1;
        if approvals == 3 {
            assert_ne!(status, WorkflowStatus::HumanEscalation);
        }
    }

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    let state = orchestrator.get_workflow_state().await;
    assert!(state.deals.iter().all(|d| d.approved));
    assert!(!state.human_approval_required);
    assert_eq!(orchestrator.get_workflow_metrics().escalations, 3);
}

#[tokio::test]
async fn rejecting_an_escalation_stops_the_run() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).with_confidence(0.2),
    ));
    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;

    let status = orchestrator
        .continue_workflow(HumanDecision::Reject)
        .await
        .unwrap();
    assert_eq!(status, WorkflowStatus::Stopped);
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Stopped);

    let state = orchestrator.get_workflow_state().await;
    assert!(!state.human_approval_required);
    assert!(!state.deals[0].approved);
    assert_eq!(started_phases(&orchestrator, Phase::Negotiation).await, 0);
}

#[tokio::test]
async fn modify_reruns_the_phase_with_adjusted_parameters() {
    let analyst = Arc::new(ScriptedAgent::new(AgentKind::Analyst).with_confidence_fn(
        |request| {
            if request.params.contains_key("max_offer") {
                Some(0.9)
            } else {
                Some(0.3)
            }
        },
    ));
    let registry = full_registry().with(analyst.clone());

    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    wait_for_status(&orchestrator, WorkflowStatus::HumanEscalation).await;

    let mut params = serde_json::Map::new();
    params.insert("max_offer".to_string(), serde_json::json!(230_000));
    let status = orchestrator
        .continue_workflow(HumanDecision::modify(params))
        .await
        .unwrap();
    assert_eq!(status, WorkflowStatus::Running);

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    let requests = analyst.requests().await;
    assert_eq!(requests.len(), 2);
    assert!(requests[0].params.is_empty());
    assert_eq!(requests[1].params["max_offer"], serde_json::json!(230_000));

    // Re-run confidence clears the auto-approve threshold
    assert!(orchestrator.get_workflow_state().await.deals[0].approved);
}

#[tokio::test]
async fn escalation_without_answer_expires() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).with_confidence(0.1),
    ));
    let orchestrator = WorkflowOrchestrator::builder(config(), registry)
        .escalation_policy(EscalationPolicy {
            timeout_seconds: Some(0.05),
        })
        .build();
    orchestrator.start_workflow(sample_context(1)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Stopped);
    let alerts = orchestrator.get_performance_alerts().await;
    assert!(alerts.iter().any(|a| a.severity == AlertSeverity::Critical));
    assert!(matches!(
        orchestrator.continue_workflow(HumanDecision::Approve).await,
        Err(dealflow_agents::WorkflowError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn hanging_agent_times_out_and_fails_the_run() {
    let scout = Arc::new(ScriptedAgent::new(AgentKind::Scout).hanging());
    let registry = full_registry().with(scout.clone());
    let config = WorkflowConfiguration {
        agent_timeout_seconds: 0.05,
        max_retries_per_agent: 2,
        ..Default::default()
    };

    let orchestrator = WorkflowOrchestrator::builder(config, registry)
        .retry_policy(fast_retry())
        .build();
    orchestrator.start_workflow(sample_context(1)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Error);
    assert_eq!(scout.calls(), 3);

    let state = orchestrator.get_workflow_state().await;
    let high = state.messages.iter().filter(|m| m.priority == 4).count();
    let critical = state.messages.iter().filter(|m| m.priority == 5).count();
    assert_eq!(high, 3);
    assert_eq!(critical, 1);
    assert!(state.messages.iter().any(|m| m.text.contains("timed out")));

    let metrics = orchestrator.get_workflow_metrics();
    assert_eq!(metrics.agent_failures, 3);
    assert_eq!(metrics.retries, 2);
    assert_eq!(started_phases(&orchestrator, Phase::PropertyAnalysis).await, 0);
}

#[tokio::test]
async fn required_analysis_failure_fails_the_run() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).always_failing(),
    ));
    let config = WorkflowConfiguration {
        max_retries_per_agent: 1,
        ..config()
    };
    let orchestrator = WorkflowOrchestrator::builder(config, registry)
        .retry_policy(fast_retry())
        .build();
    orchestrator.start_workflow(sample_context(2)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Error);
    let alerts = orchestrator.get_performance_alerts().await;
    assert!(alerts
        .iter()
        .any(|a| a.severity == AlertSeverity::Critical && a.message.contains("property_analysis")));
}

/// One deal's required analysis fails while its sibling hangs in
/// negotiation; aborting the sibling still releases its pipeline slot.
#[tokio::test]
async fn aborted_pipelines_release_their_slot() {
    let registry = full_registry()
        .with(Arc::new(ScriptedAgent::new(AgentKind::Analyst).failing_first(1)))
        .with(Arc::new(ScriptedAgent::new(AgentKind::Negotiator).hanging()));
    let config = WorkflowConfiguration {
        max_retries_per_agent: 0,
        agent_timeout_seconds: 30.0,
        ..Default::default()
    };
    let orchestrator = WorkflowOrchestrator::new(config, registry);
    orchestrator.start_workflow(sample_context(2)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Error);
    assert_eq!(orchestrator.active_pipelines(), 0);
    assert_eq!(orchestrator.get_workflow_metrics().deals_processed, 0);
}

#[tokio::test]
async fn optional_phase_failure_degrades_the_deal() {
    let portfolio = Arc::new(ScriptedAgent::new(AgentKind::PortfolioManager));
    let registry = full_registry()
        .with(Arc::new(
            ScriptedAgent::new(AgentKind::ContractManager).always_failing(),
        ))
        .with(portfolio.clone());
    let config = WorkflowConfiguration {
        max_retries_per_agent: 1,
        ..config()
    };
    let orchestrator = WorkflowOrchestrator::builder(config, registry)
        .retry_policy(fast_retry())
        .build();
    orchestrator.start_workflow(sample_context(2)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    assert!(orchestrator.is_degraded());
    assert_eq!(portfolio.calls(), 0);

    let state = orchestrator.get_workflow_state().await;
    assert!(state.deals.iter().all(|d| d.has_flag("contract_failed")));
    assert_eq!(orchestrator.get_workflow_metrics().deals_processed, 2);
}

#[tokio::test]
async fn missing_agent_skips_its_phase() {
    let registry = [
        AgentKind::Scout,
        AgentKind::Analyst,
        AgentKind::ContractManager,
        AgentKind::PortfolioManager,
    ]
    .into_iter()
    .fold(AgentRegistry::new(), |r, kind| {
        r.with(Arc::new(ScriptedAgent::new(kind)))
    });

    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);

    let history = orchestrator.get_workflow_history().await;
    assert!(history.iter().any(|e| e.kind
        == WorkflowEventKind::PhaseSkipped {
            phase: Phase::Negotiation
        }));
    assert_eq!(started_phases(&orchestrator, Phase::Contract).await, 1);
    assert!(!orchestrator.is_degraded());
}

#[tokio::test]
async fn outreach_budget_defers_extra_negotiations() {
    let negotiator = Arc::new(ScriptedAgent::new(AgentKind::Negotiator));
    let registry = full_registry().with(negotiator.clone());
    let config = WorkflowConfiguration {
        max_outreach_per_hour: 2,
        ..config()
    };

    let orchestrator = WorkflowOrchestrator::new(config, registry);
    orchestrator.start_workflow(sample_context(4)).await.unwrap();
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);

    assert_eq!(negotiator.calls(), 2);
    let state = orchestrator.get_workflow_state().await;
    let deferred = state
        .deals
        .iter()
        .filter(|d| d.has_flag(OUTREACH_DEFERRED))
        .count();
    assert_eq!(deferred, 2);
    assert!(orchestrator.is_degraded());
}

#[tokio::test]
async fn execution_budget_fails_the_run() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).hanging(),
    ));
    let config = WorkflowConfiguration {
        max_execution_time_minutes: 0.001,
        agent_timeout_seconds: 10.0,
        ..Default::default()
    };

    let orchestrator = WorkflowOrchestrator::new(config, registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Error);
    let alerts = orchestrator.get_performance_alerts().await;
    assert!(alerts.iter().any(|a| a.message.contains("execution budget")));
    assert!(orchestrator.get_workflow_metrics().completed_at.is_some());
}

#[tokio::test]
async fn pause_holds_phases_and_preserves_context() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).with_delay(Duration::from_millis(100)),
    ));
    let initial = sample_context(2);
    let strategy = initial.strategy.clone();

    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(initial).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(orchestrator.pause_workflow().await);
    assert_eq!(orchestrator.status(), WorkflowStatus::Paused);
    assert!(!orchestrator.pause_workflow().await);
    let paused = orchestrator.get_workflow_state().await;

    // In-flight analysis finishes; nothing new starts
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(orchestrator.status(), WorkflowStatus::Paused);
    assert_eq!(started_phases(&orchestrator, Phase::Negotiation).await, 0);

    assert!(orchestrator.resume_workflow().await);
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);

    let state = orchestrator.get_workflow_state().await;
    assert_eq!(state.strategy, strategy);
    let ids: Vec<_> = state.deals.iter().map(|d| d.id).collect();
    let paused_ids: Vec<_> = paused.deals.iter().map(|d| d.id).collect();
    assert_eq!(ids, paused_ids);
    assert!(state.messages.starts_with(&paused.messages));
    assert!(state.version > paused.version);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).hanging(),
    ));
    let orchestrator = WorkflowOrchestrator::new(config(), registry);
    orchestrator.start_workflow(sample_context(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(orchestrator.stop_workflow().await, WorkflowStatus::Stopped);
    assert_eq!(orchestrator.stop_workflow().await, WorkflowStatus::Stopped);
    assert!(!orchestrator.resume_workflow().await);
    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Stopped);

    let stops = orchestrator
        .get_workflow_history()
        .await
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                WorkflowEventKind::StatusChanged {
                    to: WorkflowStatus::Stopped,
                    ..
                }
            )
        })
        .count();
    assert_eq!(stops, 1);
    assert_eq!(
        orchestrator.get_workflow_state().await.status,
        WorkflowStatus::Stopped
    );
}

#[tokio::test]
async fn run_reports_to_health_monitor() {
    let monitor = Arc::new(
        SystemHealthMonitor::with_sampler(
            MonitorConfig::default(),
            FixedSampler::with_usage(10.0, 20.0),
        )
        .unwrap(),
    );
    let registry = full_registry().with(Arc::new(
        ScriptedAgent::new(AgentKind::Analyst).with_delay(Duration::from_millis(100)),
    ));

    let orchestrator = WorkflowOrchestrator::builder(config(), registry)
        .monitor(Arc::clone(&monitor))
        .build();
    let id = orchestrator.start_workflow(sample_context(1)).await.unwrap();

    assert_eq!(monitor.monitored_workflows().await, vec![id]);
    let feed = monitor.get_workflow_metrics(id).await.unwrap();
    assert_eq!(feed.workflow_id, Some(id));

    assert_eq!(orchestrator.wait_for_completion().await, WorkflowStatus::Completed);
    assert!(monitor.monitored_workflows().await.is_empty());

    let snapshot = monitor.sample_now().await;
    assert_eq!(snapshot.agent_health["analyst"].executions, 1);
    assert_eq!(snapshot.agent_health["scout"].failures, 0);
}
