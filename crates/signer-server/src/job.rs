//! Send jobs and their state machine.
//!
//! ```text
//! Received → AwaitingConfirmation ─┬→ Rejected
//!                                  └→ SessionOpen → Deriving → Signing → Submitted
//!            (any non-terminal state) → Failed
//! ```
//!
//! `Rejected`, `Submitted` and `Failed` are terminal. The card session, if
//! one was opened, is closed before a job reaches any of them.

use std::fmt;

use alloy_primitives::B256;
use idcard_signer_core::{Error as CoreError, TransferIntent};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Identifies a job in logs.
pub type JobId = u64;

/// Where a send job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Accepted over HTTP and queued.
    Received,
    /// Waiting on the operator.
    AwaitingConfirmation,
    /// The operator declined.
    Rejected,
    /// A card session is open and authenticated.
    SessionOpen,
    /// The card is deriving the shared secret.
    Deriving,
    /// Building, signing and submitting the transaction.
    Signing,
    /// The node accepted the transaction.
    Submitted,
    /// Something went wrong; see the log.
    Failed,
}

impl JobState {
    /// Whether the job is finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Submitted | Self::Failed)
    }

    /// Whether `next` may follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use JobState::*;

        match (self, next) {
            (Received, AwaitingConfirmation)
            | (AwaitingConfirmation, Rejected | SessionOpen)
            | (SessionOpen, Deriving)
            | (Deriving, Signing)
            | (Signing, Submitted) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::AwaitingConfirmation => "awaiting-confirmation",
            Self::Rejected => "rejected",
            Self::SessionOpen => "session-open",
            Self::Deriving => "deriving",
            Self::Signing => "signing",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a job ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// The operator declined; no session was opened.
    Rejected,
    /// The node accepted the transaction with this hash.
    Submitted(B256),
    /// The job failed.
    Failed(CoreError),
}

impl JobOutcome {
    /// The terminal state matching this outcome.
    #[must_use]
    pub const fn state(&self) -> JobState {
        match self {
            Self::Rejected => JobState::Rejected,
            Self::Submitted(_) => JobState::Submitted,
            Self::Failed(_) => JobState::Failed,
        }
    }
}

/// A queued send request.
#[derive(Debug)]
pub struct SignRequest {
    /// Job id.
    pub id: JobId,
    /// Validated transfer.
    pub intent: TransferIntent,
    completion: oneshot::Sender<JobOutcome>,
}

impl SignRequest {
    /// Creates a request and the receiver of its outcome.
    #[must_use]
    pub fn new(id: JobId, intent: TransferIntent) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                id,
                intent,
                completion,
            },
            rx,
        )
    }

    /// Delivers the outcome. Nobody listening is fine.
    pub fn complete(self, outcome: JobOutcome) {
        let _ = self.completion.send(outcome);
    }
}

/// Tracks and logs one job's state.
#[derive(Debug, Clone, Copy)]
pub struct JobProgress {
    id: JobId,
    state: JobState,
}

impl JobProgress {
    /// Starts tracking a freshly received job.
    #[must_use]
    pub fn new(id: JobId) -> Self {
        info!(job = id, state = %JobState::Received, "job state");
        Self {
            id,
            state: JobState::Received,
        }
    }

    /// Job id.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Moves to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: JobState) {
        if self.state.can_transition_to(next) {
            info!(job = self.id, from = %self.state, to = %next, "job state");
            self.state = next;
        } else {
            warn!(job = self.id, from = %self.state, to = %next, "ignored illegal job transition");
        }
    }
}
