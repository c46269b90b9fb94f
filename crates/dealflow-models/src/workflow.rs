use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::AgentKind;

/// One named stage of the deal workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    DealDiscovery,
    PropertyAnalysis,
    Negotiation,
    Contract,
    PortfolioIntegration,
    Completion,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Initialization,
        Phase::DealDiscovery,
        Phase::PropertyAnalysis,
        Phase::Negotiation,
        Phase::Contract,
        Phase::PortfolioIntegration,
        Phase::Completion,
    ];

    /// Phases each deal pipeline walks through, in order.
    pub const DEAL_PHASES: [Phase; 4] = [
        Phase::PropertyAnalysis,
        Phase::Negotiation,
        Phase::Contract,
        Phase::PortfolioIntegration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initialization => "initialization",
            Phase::DealDiscovery => "deal_discovery",
            Phase::PropertyAnalysis => "property_analysis",
            Phase::Negotiation => "negotiation",
            Phase::Contract => "contract",
            Phase::PortfolioIntegration => "portfolio_integration",
            Phase::Completion => "completion",
        }
    }

    /// The agent capability that executes this phase. Bookkeeping phases have none.
    pub fn agent_kind(self) -> Option<AgentKind> {
        match self {
            Phase::Initialization | Phase::Completion => None,
            Phase::DealDiscovery => Some(AgentKind::Scout),
            Phase::PropertyAnalysis => Some(AgentKind::Analyst),
            Phase::Negotiation => Some(AgentKind::Negotiator),
            Phase::Contract => Some(AgentKind::ContractManager),
            Phase::PortfolioIntegration => Some(AgentKind::PortfolioManager),
        }
    }

    pub fn task_name(self) -> &'static str {
        match self {
            Phase::Initialization => "initialize",
            Phase::DealDiscovery => "discover_deals",
            Phase::PropertyAnalysis => "analyze_property",
            Phase::Negotiation => "negotiate_deal",
            Phase::Contract => "prepare_contract",
            Phase::PortfolioIntegration => "integrate_portfolio",
            Phase::Completion => "complete",
        }
    }

    /// A failure here after all retries ends the run in `Error`.
    pub fn is_required(self) -> bool {
        matches!(self, Phase::DealDiscovery | Phase::PropertyAnalysis)
    }

    /// Phases whose agent contacts outside parties and is subject to outreach pacing.
    pub fn sends_communications(self) -> bool {
        matches!(self, Phase::Negotiation)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Initializing,
    Running,
    Paused,
    HumanEscalation,
    Completed,
    Error,
    /// Ended by `stop_workflow` or a reject decision.
    Stopped,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Error | WorkflowStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Initializing => "initializing",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::HumanEscalation => "human_escalation",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human answer to an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HumanDecision {
    Approve,
    Reject,
    /// Re-run the escalated phase with these parameters merged over the originals.
    Modify {
        #[serde(default)]
        params: serde_json::Map<String, serde_json::Value>,
    },
}

impl HumanDecision {
    pub fn modify(params: serde_json::Map<String, serde_json::Value>) -> Self {
        HumanDecision::Modify { params }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HumanDecision::Approve => "approve",
            HumanDecision::Reject => "reject",
            HumanDecision::Modify { .. } => "modify",
        }
    }
}

/// What happened at one point of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    StatusChanged {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    PhaseStarted {
        phase: Phase,
    },
    PhaseCompleted {
        phase: Phase,
        elapsed_ms: u64,
    },
    PhaseSkipped {
        phase: Phase,
    },
    PhaseFailed {
        phase: Phase,
        attempts: u32,
    },
    EscalationRaised {
        phase: Phase,
        confidence: f64,
    },
    DecisionReceived {
        decision: String,
    },
}

/// One entry of the workflow history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub timestamp: DateTime<Utc>,
    pub deal_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
    pub detail: String,
}

impl WorkflowEvent {
    pub fn new(kind: WorkflowEventKind, deal_id: Option<Uuid>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            deal_id,
            kind,
            detail: detail.into(),
        }
    }
}

/// Counters and aggregates for a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: Option<Uuid>,
    pub deals_processed: u64,
    pub deals_approved: u64,
    pub messages_sent: u64,
    pub cross_agent_handoffs: u64,
    /// Cumulative seconds spent per phase.
    pub phase_execution_times: BTreeMap<Phase, f64>,
    pub total_investment_analyzed: Decimal,
    pub total_profit_identified: Decimal,
    pub agent_failures: u64,
    pub retries: u64,
    pub escalations: u64,
    pub peak_active_pipelines: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowMetrics {
    pub fn record_phase_time(&mut self, phase: Phase, seconds: f64) {
        *self.phase_execution_times.entry(phase).or_insert(0.0) += seconds;
    }

    pub fn total_execution_seconds(&self) -> f64 {
        self.phase_execution_times.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_declared_in_execution_order() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert_eq!(Phase::ALL.first(), Some(&Phase::Initialization));
        assert_eq!(Phase::ALL.last(), Some(&Phase::Completion));
    }

    #[test]
    fn bookkeeping_phases_have_no_agent() {
        assert!(Phase::Initialization.agent_kind().is_none());
        assert!(Phase::Completion.agent_kind().is_none());
        for phase in Phase::DEAL_PHASES {
            assert!(phase.agent_kind().is_some());
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Error.is_terminal());
        assert!(WorkflowStatus::Stopped.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(!WorkflowStatus::HumanEscalation.is_terminal());
    }

    #[test]
    fn decision_wire_format() {
        let decision: HumanDecision = serde_json::from_str(r#"{"decision": "approve"}"#).unwrap();
        assert_eq!(decision, HumanDecision::Approve);

        let decision: HumanDecision =
            serde_json::from_str(r#"{"decision": "modify", "params": {"max_offer": 250000}}"#)
                .unwrap();
        match decision {
            HumanDecision::Modify { params } => assert_eq!(params["max_offer"], 250000),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn metrics_serialize_phase_keys_as_strings() {
        let mut metrics = WorkflowMetrics::default();
        metrics.record_phase_time(Phase::PropertyAnalysis, 1.5);
        metrics.record_phase_time(Phase::PropertyAnalysis, 0.5);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["phase_execution_times"]["property_analysis"], 2.0);
        assert_eq!(metrics.total_execution_seconds(), 2.0);
    }

    #[test]
    fn event_flattens_kind() {
        let event = WorkflowEvent::new(
            WorkflowEventKind::PhaseStarted {
                phase: Phase::Contract,
            },
            None,
            "starting",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "phase_started");
        assert_eq!(json["phase"], "contract");
    }
}
