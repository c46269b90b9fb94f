use std::collections::VecDeque;

use dealflow_models::workflow::{HumanDecision, Phase, WorkflowStatus};
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WorkflowError;

/// An escalation waiting for [`HumanDecision`].
pub struct PendingEscalation {
    pub id: Uuid,
    pub phase: Phase,
    pub deal_id: Option<Uuid>,
    pub confidence: f64,
    pub responder: oneshot::Sender<HumanDecision>,
}

/// Result of a pause or resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlChange {
    /// The status changed; carries the previous status.
    Moved(WorkflowStatus),
    /// Recorded while escalated and applied once the escalations resolve.
    Deferred,
    Ignored,
}

#[derive(Default)]
struct EscalationQueue {
    pending: VecDeque<PendingEscalation>,
    /// A pause in effect when escalation began, or requested during it.
    resume_paused: bool,
}

/// Run status plus the queue of escalations awaiting a decision.
///
/// Terminal statuses are sticky: once a run is completed, stopped or in error
/// no further transition is accepted. Transitions into and out of
/// `HumanEscalation` only happen through [`Escalations`], which holds the
/// queue lock for their duration.
pub struct RunControl {
    status: watch::Sender<WorkflowStatus>,
    escalations: Mutex<EscalationQueue>,
}

/// Locked view of the escalation queue.
pub struct Escalations<'a> {
    control: &'a RunControl,
    queue: MutexGuard<'a, EscalationQueue>,
}

impl Escalations<'_> {
    pub fn status(&self) -> WorkflowStatus {
        self.control.status()
    }

    pub fn len(&self) -> usize {
        self.queue.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.pending.is_empty()
    }

    /// Queue an escalation and enter `HumanEscalation` from `Running` or
    /// `Paused`. Returns the previous status when this call moved the run.
    pub fn raise(&mut self, escalation: PendingEscalation) -> Option<WorkflowStatus> {
        self.queue.pending.push_back(escalation);
        let previous = self.control.transition_from(
            &[WorkflowStatus::Running, WorkflowStatus::Paused],
            WorkflowStatus::HumanEscalation,
        );
        if previous == Some(WorkflowStatus::Paused) {
            self.queue.resume_paused = true;
        }
        previous
    }

    /// Oldest escalation first.
    pub fn take_next(&mut self) -> Option<PendingEscalation> {
        self.queue.pending.pop_front()
    }

    /// Leave `HumanEscalation` once nothing is pending, for `Paused` if a
    /// pause is in effect and `Running` otherwise. Returns `(from, to)`.
    pub fn settle(&mut self) -> Option<(WorkflowStatus, WorkflowStatus)> {
        if !self.queue.pending.is_empty() {
            return None;
        }
        let to = if self.queue.resume_paused {
            WorkflowStatus::Paused
        } else {
            WorkflowStatus::Running
        };
        let from = self
            .control
            .transition_from(&[WorkflowStatus::HumanEscalation], to)?;
        self.queue.resume_paused = false;
        Some((from, to))
    }

    pub fn pause(&mut self) -> ControlChange {
        if self.status() == WorkflowStatus::HumanEscalation {
            if self.queue.resume_paused {
                return ControlChange::Ignored;
            }
            self.queue.resume_paused = true;
            return ControlChange::Deferred;
        }
        self.control
            .transition_from(&[WorkflowStatus::Running], WorkflowStatus::Paused)
            .map_or(ControlChange::Ignored, ControlChange::Moved)
    }

    pub fn resume(&mut self) -> ControlChange {
        if self.status() == WorkflowStatus::HumanEscalation {
            if !self.queue.resume_paused {
                return ControlChange::Ignored;
            }
            self.queue.resume_paused = false;
            return ControlChange::Deferred;
        }
        self.control
            .transition_from(&[WorkflowStatus::Paused], WorkflowStatus::Running)
            .map_or(ControlChange::Ignored, ControlChange::Moved)
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (status, _) = watch::channel(WorkflowStatus::Initializing);
        Self {
            status,
            escalations: Mutex::new(EscalationQueue::default()),
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowStatus> {
        self.status.subscribe()
    }

    /// Move to `to` from any non-terminal status. Returns the previous status
    /// when the transition happened.
    pub fn transition(&self, to: WorkflowStatus) -> Option<WorkflowStatus> {
        self.transition_where(to, |_| true)
    }

    /// Move to `to` only from one of `allowed`.
    pub fn transition_from(
        &self,
        allowed: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> Option<WorkflowStatus> {
        self.transition_where(to, |current| allowed.contains(&current))
    }

    fn transition_where(
        &self,
        to: WorkflowStatus,
        allowed: impl Fn(WorkflowStatus) -> bool,
    ) -> Option<WorkflowStatus> {
        let mut previous = None;
        self.status.send_if_modified(|current| {
            if current.is_terminal() || *current == to || !allowed(*current) {
                return false;
            }
            previous = Some(*current);
            *current = to;
            true
        });
        previous
    }

    /// Wait until phase advancement is allowed. Fails once the run is over.
    pub async fn wait_until_runnable(&self, cancel: &CancellationToken) -> Result<(), WorkflowError> {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status == WorkflowStatus::Running {
                return Ok(());
            }
            if status.is_terminal() {
                return Err(WorkflowError::Cancelled);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WorkflowError::Cancelled);
                    }
                }
            }
        }
    }

    pub async fn escalations(&self) -> Escalations<'_> {
        Escalations {
            control: self,
            queue: self.escalations.lock().await,
        }
    }

    pub async fn remove_escalation(&self, id: Uuid) -> Option<PendingEscalation> {
        let mut queue = self.escalations.lock().await;
        let index = queue.pending.iter().position(|e| e.id == id)?;
        queue.pending.remove(index)
    }

    pub async fn pending_escalations(&self) -> usize {
        self.escalations.lock().await.pending.len()
    }

    /// Drop every pending escalation; waiters observe a closed channel.
    pub async fn clear_escalations(&self) {
        let mut queue = self.escalations.lock().await;
        queue.pending.clear();
        queue.resume_paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn escalation(phase: Phase) -> (PendingEscalation, oneshot::Receiver<HumanDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingEscalation {
                id: Uuid::new_v4(),
                phase,
                deal_id: None,
                confidence: 0.4,
                responder: tx,
            },
            rx,
        )
    }

    #[test]
    fn terminal_status_is_sticky() {
        let control = RunControl::new();
        assert_eq!(control.transition(WorkflowStatus::Running), Some(WorkflowStatus::Initializing));
        assert_eq!(control.transition(WorkflowStatus::Stopped), Some(WorkflowStatus::Running));
        assert_eq!(control.transition(WorkflowStatus::Running), None);
        assert_eq!(control.transition(WorkflowStatus::Error), None);
        assert_eq!(control.status(), WorkflowStatus::Stopped);
    }

    #[test]
    fn guarded_transitions() {
        let control = RunControl::new();
        assert_eq!(
            control.transition_from(&[WorkflowStatus::Running], WorkflowStatus::Paused),
            None
        );
        control.transition(WorkflowStatus::Running);
        assert_eq!(
            control.transition_from(&[WorkflowStatus::Running], WorkflowStatus::Paused),
            Some(WorkflowStatus::Running)
        );
        // Same-state transitions are not transitions
        assert_eq!(
            control.transition_from(&[WorkflowStatus::Paused], WorkflowStatus::Paused),
            None
        );
    }

    #[tokio::test]
    async fn gate_opens_on_resume() {
        let control = Arc::new(RunControl::new());
        control.transition(WorkflowStatus::Running);
        control.transition(WorkflowStatus::Paused);

        let cancel = CancellationToken::new();
        let waiter = {
            let control = Arc::clone(&control);
            let cancel = cancel.clone();
            tokio::spawn(async move { control.wait_until_runnable(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.transition(WorkflowStatus::Running);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn gate_fails_when_run_ends() {
        let control = Arc::new(RunControl::new());
        control.transition(WorkflowStatus::Running);
        control.transition(WorkflowStatus::HumanEscalation);

        let cancel = CancellationToken::new();
        let waiter = {
            let control = Arc::clone(&control);
            let cancel = cancel.clone();
            tokio::spawn(async move { control.wait_until_runnable(&cancel).await })
        };
        control.transition(WorkflowStatus::Stopped);
        assert!(matches!(waiter.await.unwrap(), Err(WorkflowError::Cancelled)));
    }

    #[tokio::test]
    async fn escalations_resolve_in_order() {
        let control = RunControl::new();
        control.transition(WorkflowStatus::Running);
        let (first, first_rx) = escalation(Phase::PropertyAnalysis);
        let (second, _second_rx) = escalation(Phase::Negotiation);
        let second_id = second.id;
        {
            let mut queue = control.escalations().await;
            assert_eq!(queue.raise(first), Some(WorkflowStatus::Running));
            assert_eq!(queue.raise(second), None);
        }

        let next = control.escalations().await.take_next().unwrap();
        assert_eq!(next.phase, Phase::PropertyAnalysis);
        next.responder.send(HumanDecision::Approve).unwrap();
        assert_eq!(first_rx.await.unwrap(), HumanDecision::Approve);

        assert!(control.remove_escalation(second_id).await.is_some());
        assert_eq!(control.pending_escalations().await, 0);
    }

    #[tokio::test]
    async fn settles_only_when_queue_drains() {
        let control = RunControl::new();
        control.transition(WorkflowStatus::Running);
        let (first, _first_rx) = escalation(Phase::PropertyAnalysis);
        let (second, _second_rx) = escalation(Phase::PropertyAnalysis);

        let mut queue = control.escalations().await;
        queue.raise(first);
        queue.raise(second);
        queue.take_next();
        assert_eq!(queue.settle(), None);
        assert_eq!(queue.status(), WorkflowStatus::HumanEscalation);

        queue.take_next();
        assert_eq!(
            queue.settle(),
            Some((WorkflowStatus::HumanEscalation, WorkflowStatus::Running))
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn escalation_raised_after_settling_holds_the_run() {
        let control = RunControl::new();
        control.transition(WorkflowStatus::Running);
        let (first, _first_rx) = escalation(Phase::PropertyAnalysis);
        let (late, _late_rx) = escalation(Phase::Negotiation);

        control.escalations().await.raise(first);
        {
            let mut queue = control.escalations().await;
            queue.take_next();
            queue.settle();
        }
        assert_eq!(control.escalations().await.raise(late), Some(WorkflowStatus::Running));
        assert_eq!(control.status(), WorkflowStatus::HumanEscalation);
        assert_eq!(control.pending_escalations().await, 1);
    }

    #[tokio::test]
    async fn pause_survives_escalation() {
        let control = RunControl::new();
        control.transition(WorkflowStatus::Running);
        let (pending, _rx) = escalation(Phase::PropertyAnalysis);

        assert_eq!(
            control.escalations().await.pause(),
            ControlChange::Moved(WorkflowStatus::Running)
        );
        let mut queue = control.escalations().await;
        assert_eq!(queue.raise(pending), Some(WorkflowStatus::Paused));
        queue.take_next();
        assert_eq!(
            queue.settle(),
            Some((WorkflowStatus::HumanEscalation, WorkflowStatus::Paused))
        );
        assert_eq!(queue.resume(), ControlChange::Moved(WorkflowStatus::Paused));
        assert_eq!(queue.status(), WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn pause_and_resume_while_escalated_are_deferred() {
        let control = RunControl::new();
        control.transition(WorkflowStatus::Running);
        let (pending, _rx) = escalation(Phase::Contract);

        let mut queue = control.escalations().await;
        queue.raise(pending);
        assert_eq!(queue.pause(), ControlChange::Deferred);
        assert_eq!(queue.pause(), ControlChange::Ignored);
        assert_eq!(queue.resume(), ControlChange::Deferred);
        assert_eq!(queue.resume(), ControlChange::Ignored);
        queue.take_next();
        assert_eq!(
            queue.settle(),
            Some((WorkflowStatus::HumanEscalation, WorkflowStatus::Running))
        );
    }

    #[tokio::test]
    async fn clearing_closes_waiters() {
        let control = RunControl::new();
        control.transition(WorkflowStatus::Running);
        let (pending, rx) = escalation(Phase::Contract);
        control.escalations().await.raise(pending);
        control.clear_escalations().await;
        assert!(rx.await.is_err());
    }
}
