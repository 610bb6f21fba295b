//! Callback fan-out for transfer handles.
//!
//! Callbacks registered after an event already happened are invoked with
//! the current state right away, so late subscribers never miss the final
//! outcome or a failure.
//!
//! Progress reports are numbered when they are produced and delivered one
//! at a time in that order. A report that loses the race to a newer one is
//! dropped, so subscribers never see progress go backwards. Callbacks run on
//! the reporting task and must not block.

use crate::group::{GroupOutcome, RecipientFailure};
use crate::lock;
use crate::progress::AggregateProgress;
use std::sync::{Arc, Mutex};

/// Aggregate progress callback
pub type ProgressCallback = Arc<dyn Fn(AggregateProgress) + Send + Sync>;
/// Completion callback
pub type CompleteCallback = Arc<dyn Fn(&GroupOutcome) + Send + Sync>;
/// Per-recipient failure callback
pub type FailureCallback = Arc<dyn Fn(&RecipientFailure) + Send + Sync>;

#[derive(Default)]
struct HubState {
    progress: Vec<ProgressCallback>,
    complete: Vec<CompleteCallback>,
    failure: Vec<FailureCallback>,
    last_progress: Option<AggregateProgress>,
    issued: u64,
    delivered: u64,
    failures: Vec<RecipientFailure>,
    outcome: Option<GroupOutcome>,
}

/// Event fan-out shared by a handle and its orchestrator
#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
    delivery: Mutex<()>,
}

impl EventHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to aggregate progress.
    pub fn on_progress(&self, callback: ProgressCallback) {
        let replay = {
            let mut state = lock(&self.state);
            state.progress.push(Arc::clone(&callback));
            state.last_progress
        };
        if let Some(progress) = replay {
            callback(progress);
        }
    }

    /// Subscribe to completion.
    pub fn on_complete(&self, callback: CompleteCallback) {
        let replay = {
            let mut state = lock(&self.state);
            state.complete.push(Arc::clone(&callback));
            state.outcome.clone()
        };
        if let Some(outcome) = replay {
            callback(&outcome);
        }
    }

    /// Subscribe to recipient failures.
    pub fn on_recipient_failed(&self, callback: FailureCallback) {
        let replay = {
            let mut state = lock(&self.state);
            state.failure.push(Arc::clone(&callback));
            state.failures.clone()
        };
        for failure in &replay {
            callback(failure);
        }
    }

    /// Reserve the next position in the progress stream.
    ///
    /// Call while holding whatever lock orders report production.
    pub(crate) fn progress_ticket(&self) -> u64 {
        let mut state = lock(&self.state);
        state.issued += 1;
        state.issued
    }

    pub(crate) fn emit_progress(&self, ticket: u64, progress: AggregateProgress) {
        let _delivery = lock(&self.delivery);
        let callbacks = {
            let mut state = lock(&self.state);
            if ticket <= state.delivered {
                return;
            }
            state.delivered = ticket;
            state.last_progress = Some(progress);
            state.progress.clone()
        };
        for callback in callbacks {
            callback(progress);
        }
    }

    pub(crate) fn emit_failure(&self, failure: RecipientFailure) {
        let callbacks = {
            let mut state = lock(&self.state);
            state.failures.push(failure.clone());
            state.failure.clone()
        };
        for callback in callbacks {
            callback(&failure);
        }
    }

    pub(crate) fn emit_complete(&self, outcome: &GroupOutcome) {
        let callbacks = {
            let mut state = lock(&self.state);
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            state.complete.clone()
        };
        for callback in callbacks {
            callback(outcome);
        }
    }

    /// Final outcome, once known.
    #[must_use]
    pub fn outcome(&self) -> Option<GroupOutcome> {
        lock(&self.state).outcome.clone()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("EventHub")
            .field("progress_callbacks", &state.progress.len())
            .field("complete_callbacks", &state.complete.len())
            .field("failure_callbacks", &state.failure.len())
            .field("done", &state.outcome.is_some())
            .finish()
    }
}
