//! Cancellable polling
//!
//! [`Poll`] re-evaluates a check at a fixed interval until it reports a
//! terminal state, the deadline passes or the cancellation token fires.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State of a poll, also returned by each check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    /// Keep polling
    Pending,
    /// Condition met
    Succeeded,
    /// Gave up
    Failed(String),
    /// Token fired before the condition was met
    Cancelled,
}

impl PollState {
    /// Whether polling stops here
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Pending)
    }
}

/// Polling loop configuration
#[derive(Debug, Clone)]
pub struct Poll {
    interval: Duration,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl Poll {
    /// Poll every `interval` without deadline
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Fail once `deadline` elapsed
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `check` until it returns a terminal state
    pub async fn until<F>(&self, mut check: F) -> PollState
    where
        F: FnMut() -> PollState,
    {
        let started = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return PollState::Cancelled;
            }
            let state = check();
            if state.is_terminal() {
                return state;
            }
            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    return PollState::Failed(format!("deadline of {deadline:?} exceeded"));
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return PollState::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
