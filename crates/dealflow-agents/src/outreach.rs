use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dealflow_models::config::WorkflowConfiguration;
use tokio::sync::Mutex;

const OUTREACH_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutreachDecision {
    /// Proceed after waiting this long.
    Granted(Duration),
    /// The rolling-hour budget is spent.
    Deferred,
}

struct OutreachState {
    slots: VecDeque<Instant>,
    last: Option<Instant>,
}

/// Rolling-hour budget for outreach calls, with optional spacing between
/// consecutive calls when communications are not batched.
pub struct OutreachLimiter {
    max_per_window: u32,
    window: Duration,
    spacing: Option<Duration>,
    state: Mutex<OutreachState>,
}

impl OutreachLimiter {
    pub fn new(config: &WorkflowConfiguration) -> Self {
        let spacing = (!config.batch_communications).then(|| config.communication_delay());
        Self::with_window(config.max_outreach_per_hour, OUTREACH_WINDOW, spacing)
    }

    pub fn with_window(max_per_window: u32, window: Duration, spacing: Option<Duration>) -> Self {
        Self {
            max_per_window,
            window,
            spacing,
            state: Mutex::new(OutreachState {
                slots: VecDeque::new(),
                last: None,
            }),
        }
    }

    /// Reserve a slot. Slots are handed out in call order, so concurrent
    /// callers end up spaced apart.
    pub async fn acquire(&self) -> OutreachDecision {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        while state
            .slots
            .front()
            .is_some_and(|slot| now.saturating_duration_since(*slot) >= self.window)
        {
            state.slots.pop_front();
        }
        if state.slots.len() >= self.max_per_window as usize {
            return OutreachDecision::Deferred;
        }

        let at = match (self.spacing, state.last) {
            (Some(spacing), Some(last)) => (last + spacing).max(now),
            _ => now,
        };
        state.slots.push_back(at);
        state.last = Some(at);
        OutreachDecision::Granted(at.saturating_duration_since(now))
    }

    /// Slots used in the current window.
    pub async fn used(&self) -> usize {
        self.state.lock().await.slots.len()
    }
}
