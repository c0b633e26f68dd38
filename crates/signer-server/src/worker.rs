//! The single worker that owns the card.
//!
//! Send jobs are processed strictly one at a time, in arrival order. For each
//! job the worker asks the operator first; only an approved job opens a card
//! session, and that session stays open until the node has answered the
//! submission. All blocking work (operator prompts, card calls) runs on the
//! blocking thread pool so HTTP reads stay responsive.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy_primitives::B256;
use idcard_signer_core::token::{CardSessionManager, Token};
use idcard_signer_core::{
    Address, ConfirmationGate, Error as CoreError, KeyDerivationEngine, Result as CoreResult,
    TransactionSigner, TransferIntent,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{error, info, warn};

use crate::job::{JobOutcome, JobProgress, JobState, SignRequest};

/// Card manager shared between startup, the worker and shutdown.
pub type SharedCards<T> = Arc<Mutex<CardSessionManager<T>>>;

/// Opens one session, derives the signing key and returns its address.
///
/// Used at startup to learn the account address; the key itself is dropped
/// with the session.
///
/// # Errors
///
/// Any card or derivation error.
pub fn unlock_wallet<T: Token>(
    cards: &SharedCards<T>,
    engine: &KeyDerivationEngine,
) -> CoreResult<Address> {
    let mut cards = lock_cards(cards);
    let key = cards.with_session(|session| engine.derive(session))?;
    Ok(key.address())
}

/// Locks the card manager.
///
/// A job that panicked while holding the lock has already closed its session
/// on unwind, so a poisoned manager is still usable.
pub fn lock_cards<T: Token>(cards: &SharedCards<T>) -> MutexGuard<'_, CardSessionManager<T>> {
    cards.lock().unwrap_or_else(|poisoned| {
        warn!("card manager lock was poisoned by a failed job, recovering");
        poisoned.into_inner()
    })
}

/// Processes queued [`SignRequest`]s against the card.
pub struct SigningWorker<T: Token> {
    cards: SharedCards<T>,
    engine: KeyDerivationEngine,
    signer: TransactionSigner,
    gate: Arc<dyn ConfirmationGate>,
    expected_address: Address,
    confirm_timeout: Duration,
}

impl<T: Token> std::fmt::Debug for SigningWorker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningWorker")
            .field("expected_address", &self.expected_address)
            .field("confirm_timeout", &self.confirm_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Token + 'static> SigningWorker<T> {
    /// Creates a worker.
    ///
    /// `expected_address` is the address unlocked at startup; a job whose
    /// session derives anything else fails before signing.
    pub fn new(
        cards: SharedCards<T>,
        engine: KeyDerivationEngine,
        signer: TransactionSigner,
        gate: Arc<dyn ConfirmationGate>,
        expected_address: Address,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            cards,
            engine,
            signer,
            gate,
            expected_address,
            confirm_timeout,
        }
    }

    /// Runs until every sender of `queue` is dropped and the queue is drained.
    pub async fn run(self, mut queue: mpsc::Receiver<SignRequest>) {
        info!("signing worker started");
        while let Some(request) = queue.recv().await {
            self.process(request).await;
        }
        info!("signing worker stopped");
    }

    /// Takes one request through confirmation, signing and submission.
    pub async fn process(&self, request: SignRequest) {
        let mut progress = JobProgress::new(request.id);
        progress.advance(JobState::AwaitingConfirmation);

        let outcome = match self.confirm(&request.intent).await {
            Ok(true) => self.sign_and_submit(progress, request.intent.clone()).await,
            Ok(false) => {
                progress.advance(JobState::Rejected);
                warn!(job = request.id, "operator declined transfer");
                JobOutcome::Rejected
            }
            Err(e) => {
                progress.advance(JobState::Failed);
                error!(job = request.id, error = %e, "confirmation failed");
                JobOutcome::Failed(e)
            }
        };

        request.complete(outcome);
    }

    async fn confirm(&self, intent: &TransferIntent) -> CoreResult<bool> {
        let gate = Arc::clone(&self.gate);
        let summary = intent.summary();
        info!(%summary, "awaiting operator confirmation");

        let prompt = task::spawn_blocking(move || gate.confirm(&summary));
        match tokio::time::timeout(self.confirm_timeout, prompt).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(join)) => Err(CoreError::Operator(join.to_string())),
            Err(_) => Err(CoreError::Timeout("operator confirmation")),
        }
    }

    async fn sign_and_submit(&self, progress: JobProgress, intent: TransferIntent) -> JobOutcome {
        let cards = Arc::clone(&self.cards);
        let engine = self.engine.clone();
        let signer = self.signer.clone();
        let expected = self.expected_address;
        let runtime = Handle::current();

        let card_task = task::spawn_blocking(move || {
            let mut progress = progress;
            let result = with_card(
                &cards,
                &engine,
                &signer,
                &intent,
                expected,
                &runtime,
                &mut progress,
            );
            (progress, result)
        });

        let (mut progress, result) = match card_task.await {
            Ok(done) => done,
            Err(join) => (progress, Err(CoreError::Token(join.to_string()))),
        };

        match result {
            Ok(hash) => {
                progress.advance(JobState::Submitted);
                JobOutcome::Submitted(hash)
            }
            Err(e) => {
                progress.advance(JobState::Failed);
                error!(job = progress.id(), error = %e, "send job failed");
                JobOutcome::Failed(e)
            }
        }
    }
}

/// The card-owning section of a job. The session is closed when this
/// returns, on every path.
fn with_card<T: Token>(
    cards: &SharedCards<T>,
    engine: &KeyDerivationEngine,
    signer: &TransactionSigner,
    intent: &TransferIntent,
    expected: Address,
    runtime: &Handle,
    progress: &mut JobProgress,
) -> CoreResult<B256> {
    let mut cards = lock_cards(cards);
    let session = cards.open_session()?;
    progress.advance(JobState::SessionOpen);

    progress.advance(JobState::Deriving);
    let key = engine.derive(&session)?;
    if key.address() != expected {
        return Err(CoreError::DeriveFailed(format!(
            "derived address {} does not match unlocked address {expected}",
            key.address()
        )));
    }

    progress.advance(JobState::Signing);
    let hash = runtime.block_on(signer.send_intent(&key, intent))?;

    drop(session);
    Ok(hash)
}
