use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextDelta;
use crate::workflow::Phase;

/// Capability an agent provides. Agents are looked up by kind, never by concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Scout,
    Analyst,
    Negotiator,
    ContractManager,
    PortfolioManager,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Scout => "scout",
            AgentKind::Analyst => "analyst",
            AgentKind::Negotiator => "negotiator",
            AgentKind::ContractManager => "contract_manager",
            AgentKind::PortfolioManager => "portfolio_manager",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub request_id: Uuid,
    pub workflow_id: Uuid,
    pub task_name: String,
    pub phase: Phase,
    /// The deal this task concerns; `None` for run-level phases.
    pub deal_id: Option<Uuid>,
    pub params: serde_json::Map<String, serde_json::Value>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What an agent reports back.
///
/// The orchestrator reads `success`, `error`, `execution_time`, the optional
/// `confidence` signal and the `delta`. `data` is passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds the agent spent on the task, as measured by the agent.
    #[serde(default)]
    pub execution_time: f64,
    /// 0.0 to 1.0; below the escalation threshold the run waits for a human.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub delta: ContextDelta,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            execution_time: 0.0,
            confidence: None,
            delta: ContextDelta::default(),
            data: serde_json::Value::Null,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_delta(mut self, delta: ContextDelta) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        self.execution_time = seconds;
        self
    }
}
