use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{Phase, WorkflowStatus};

/// Message priorities, 1 (lowest) to 5 (highest).
pub mod priority {
    pub const LOW: u8 = 1;
    pub const NORMAL: u8 = 2;
    pub const ELEVATED: u8 = 3;
    pub const HIGH: u8 = 4;
    pub const CRITICAL: u8 = 5;
}

/// A property-investment opportunity moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deal {
    pub id: Uuid,
    pub property_address: String,
    pub asking_price: Option<Decimal>,
    pub estimated_profit: Option<Decimal>,
    /// 0.0 to 1.0 score assigned by the analysis agent.
    pub score: Option<f64>,
    pub analyzed: bool,
    pub approved: bool,
    pub flags: Vec<String>,
    /// Domain-specific data the core never interprets.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Deal {
    pub fn new(property_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            property_address: property_address.into(),
            asking_price: None,
            estimated_profit: None,
            score: None,
            analyzed: false,
            approved: false,
            flags: Vec::new(),
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_asking_price(mut self, price: Decimal) -> Self {
        self.asking_price = Some(price);
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Add a flag once.
    pub fn flag(&mut self, flag: impl Into<String>) {
        let flag = flag.into();
        if !self.has_flag(&flag) {
            self.flags.push(flag);
        }
    }
}

/// An entry of the append-only context log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextMessage {
    pub agent: String,
    pub text: String,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
}

/// Strategy and capital inputs supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StrategyInputs {
    pub investment_strategy: String,
    pub available_capital: Decimal,
    pub target_markets: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// The shared record threaded through every phase of a run.
///
/// Agents only ever see an immutable snapshot; the orchestrator commits
/// [`ContextDelta`]s and bumps `version` on every commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionContext {
    pub workflow_id: Option<Uuid>,
    pub status: WorkflowStatus,
    pub current_phase: Option<Phase>,
    pub deals: Vec<Deal>,
    pub messages: Vec<ContextMessage>,
    pub human_approval_required: bool,
    pub strategy: StrategyInputs,
    pub version: u64,
}

impl ExecutionContext {
    pub fn new(strategy: StrategyInputs) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_deals(mut self, deals: Vec<Deal>) -> Self {
        self.deals = deals;
        self
    }

    pub fn deal(&self, id: Uuid) -> Option<&Deal> {
        self.deals.iter().find(|d| d.id == id)
    }

    pub fn deal_mut(&mut self, id: Uuid) -> Option<&mut Deal> {
        self.deals.iter_mut().find(|d| d.id == id)
    }

    pub fn append_message(&mut self, agent: impl Into<String>, text: impl Into<String>, priority: u8) {
        self.messages.push(ContextMessage {
            agent: agent.into(),
            text: text.into(),
            priority: priority.clamp(priority::LOW, priority::CRITICAL),
            timestamp: Utc::now(),
        });
    }

    /// Messages at or above the given priority.
    pub fn messages_at_least(&self, min_priority: u8) -> impl Iterator<Item = &ContextMessage> {
        self.messages.iter().filter(move |m| m.priority >= min_priority)
    }

    /// Merge an agent-returned delta. Deals already present are not re-added,
    /// updates for unknown deals are dropped. Returns the number of deals added.
    pub fn apply_delta(&mut self, agent: &str, delta: ContextDelta) -> usize {
        let mut added = 0;
        for deal in delta.new_deals {
            if self.deal(deal.id).is_none() {
                self.deals.push(deal);
                added += 1;
            }
        }

        for update in delta.deal_updates {
            if let Some(deal) = self.deal_mut(update.deal_id) {
                update.apply_to(deal);
            }
        }

        for message in delta.messages {
            self.append_message(agent, message.text, message.priority);
        }

        added
    }
}

/// Changes an agent asks the orchestrator to commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ContextDelta {
    pub new_deals: Vec<Deal>,
    pub deal_updates: Vec<DealUpdate>,
    pub messages: Vec<OutgoingMessage>,
    /// Outreach communications the agent sent while executing the task.
    pub communications_sent: u32,
}

impl ContextDelta {
    pub fn is_empty(&self) -> bool {
        self.new_deals.is_empty()
            && self.deal_updates.is_empty()
            && self.messages.is_empty()
            && self.communications_sent == 0
    }
}

/// A message an agent wants appended to the context log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingMessage {
    pub text: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>, priority: u8) -> Self {
        Self {
            text: text.into(),
            priority,
        }
    }
}

fn default_priority() -> u8 {
    priority::NORMAL
}

/// Field-level update for one deal. `None` leaves a field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealUpdate {
    pub deal_id: Uuid,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub estimated_profit: Option<Decimal>,
    #[serde(default)]
    pub asking_price: Option<Decimal>,
    #[serde(default)]
    pub add_flags: Vec<String>,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}

impl DealUpdate {
    pub fn new(deal_id: Uuid) -> Self {
        Self {
            deal_id,
            score: None,
            estimated_profit: None,
            asking_price: None,
            add_flags: Vec::new(),
            attributes: None,
        }
    }

    fn apply_to(self, deal: &mut Deal) {
        if let Some(score) = self.score {
            deal.score = Some(score);
        }
        if let Some(profit) = self.estimated_profit {
            deal.estimated_profit = Some(profit);
        }
        if let Some(price) = self.asking_price {
            deal.asking_price = Some(price);
        }
        for flag in self.add_flags {
            deal.flag(flag);
        }
        if let Some(attributes) = self.attributes {
            deal.attributes = attributes;
        }
    }
}
