//! The full confirm-then-sign flow against a simulated card and node.
//!
//! Each test starts the real router and worker on top of a [`SoftToken`]
//! and a [`MemoryLedger`], with the operator scripted from the test.

// Silence unused crate dependency warnings for test binary
use clap as _;
use serde as _;
use thiserror as _;
use tower_http as _;
use tracing as _;
use tracing_subscriber as _;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use alloy_primitives::{Address as AlloyAddress, B256, Bytes, U256, keccak256};
use alloy_rlp::{Decodable, Header};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use idcard_signer_core::token::{AuditEvent, CardSessionManager, Pin, SlotSelector, SoftToken};
use idcard_signer_core::{
    Address, ConfirmationGate, CounterpartPoint, Error as CoreError, KeyDerivationEngine,
    LedgerNode, PinEntry, Result as CoreResult, SigningKey, TransactionSigner, TransferSummary,
    ledger::MemoryLedger,
};
use idcard_signer_server::{
    AppState, CachedInfo, JobId, JobOutcome, SharedCards, SigningWorker, lock_cards, router,
    unlock_wallet,
};
use p384::SecretKey;
use p384::ecdh::diffie_hellman;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;

const PIN: &str = "0090";
const TO: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const CHAIN_ID: u64 = 11_155_111;
const ONE_ETHER: &str = "1000000000000000000";
const GAS_PRICE: &str = "20000000000";

fn card_secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 48]).unwrap()
}

/// The account a card must unlock to, computed without any token code.
fn card_account(secret: &SecretKey) -> Address {
    let counterpart = p384::PublicKey::from_sec1_bytes(CounterpartPoint::default().as_bytes()).unwrap();
    let shared = diffie_hellman(secret.to_nonzero_scalar(), counterpart.as_affine());
    SigningKey::from_derived_secret(shared.raw_secret_bytes().as_slice())
        .unwrap()
        .address()
}

fn pin_entry() -> Arc<dyn PinEntry> {
    Arc::new(|_: &str| -> CoreResult<Pin> { Ok(Pin::from(PIN)) })
}

/// Types the right PIN except on the listed prompts (counted from 1).
fn pin_entry_mistyping(mistyped: &'static [usize]) -> Arc<dyn PinEntry> {
    let prompts = AtomicUsize::new(0);
    Arc::new(move |_: &str| -> CoreResult<Pin> {
        let n = prompts.fetch_add(1, Ordering::SeqCst) + 1;
        if mistyped.contains(&n) {
            Ok(Pin::from("9999"))
        } else {
            Ok(Pin::from(PIN))
        }
    })
}

fn always(answer: bool) -> Arc<dyn ConfirmationGate> {
    Arc::new(move |_: &TransferSummary| -> CoreResult<bool> { Ok(answer) })
}

/// An operator who answers when the test says so.
struct ScriptedGate {
    asked: mpsc::UnboundedSender<String>,
    answers: Mutex<std_mpsc::Receiver<bool>>,
}

impl ConfirmationGate for ScriptedGate {
    fn confirm(&self, summary: &TransferSummary) -> CoreResult<bool> {
        let _ = self.asked.send(summary.to_string());
        let answers = self.answers.lock().unwrap();
        Ok(answers.recv().unwrap_or(false))
    }
}

struct Operator {
    asked: mpsc::UnboundedReceiver<String>,
    answers: std_mpsc::Sender<bool>,
}

impl Operator {
    fn new() -> (Self, Arc<dyn ConfirmationGate>) {
        let (asked_tx, asked) = mpsc::unbounded_channel();
        let (answers, answers_rx) = std_mpsc::channel();
        let gate = ScriptedGate {
            asked: asked_tx,
            answers: Mutex::new(answers_rx),
        };
        (Self { asked, answers }, Arc::new(gate))
    }

    async fn next_prompt(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.asked.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn answer(&self, yes: bool) {
        self.answers.send(yes).unwrap();
    }
}

/// Everything a [`Harness`] can vary.
struct Setup {
    card: SoftToken,
    ledger: MemoryLedger,
    gate: Arc<dyn ConfirmationGate>,
    pins: Arc<dyn PinEntry>,
    /// The address the worker expects jobs to derive, if not the unlocked one.
    worker_address: Option<Address>,
    queue_depth: usize,
    confirm_timeout: Duration,
}

struct Harness {
    router: Router,
    card: SoftToken,
    ledger: Arc<MemoryLedger>,
    cards: SharedCards<SoftToken>,
    address: Address,
    outcomes: mpsc::UnboundedReceiver<(JobId, JobOutcome)>,
    worker: JoinHandle<()>,
}

impl Harness {
    async fn start(
        card: SoftToken,
        ledger: MemoryLedger,
        gate: Arc<dyn ConfirmationGate>,
        queue_depth: usize,
        confirm_timeout: Duration,
    ) -> Self {
        Self::start_with(Setup {
            card,
            ledger,
            gate,
            pins: pin_entry(),
            worker_address: None,
            queue_depth,
            confirm_timeout,
        })
        .await
    }

    async fn start_with(setup: Setup) -> Self {
        let Setup {
            card,
            ledger,
            gate,
            pins,
            worker_address,
            queue_depth,
            confirm_timeout,
        } = setup;

        let engine = KeyDerivationEngine::default();
        let cards = Arc::new(Mutex::new(CardSessionManager::new(
            card.clone(),
            SlotSelector::default(),
            pins,
        )));
        let address = unlock_wallet(&cards, &engine).unwrap();

        let ledger = Arc::new(ledger);
        let node: Arc<dyn LedgerNode> = ledger.clone();
        let balance = node.balance(address).await.unwrap();

        let (queue, jobs) = mpsc::channel(queue_depth);
        let worker = SigningWorker::new(
            Arc::clone(&cards),
            engine,
            TransactionSigner::new(Arc::clone(&node)),
            gate,
            worker_address.unwrap_or(address),
            confirm_timeout,
        );
        let worker = tokio::spawn(worker.run(jobs));

        let (observer, outcomes) = mpsc::unbounded_channel();
        let state = AppState::new(Arc::new(CachedInfo::new(address, balance)), node, queue)
            .with_outcome_observer(observer);

        Self {
            router: router(state),
            card,
            ledger,
            cards,
            address,
            outcomes,
            worker,
        }
    }

    async fn with_gate(gate: Arc<dyn ConfirmationGate>) -> Self {
        let secret = card_secret(0x42);
        let ledger = MemoryLedger::new(CHAIN_ID).with_balance(
            card_account(&secret),
            U256::from(2_500_000_000_000_000_000u128),
        );
        Self::start(
            SoftToken::new(secret, PIN),
            ledger,
            gate,
            4,
            Duration::from_secs(5),
        )
        .await
    }

    async fn send(&self, to: &str, value: &str, gas_price: &str) -> Response {
        let body = format!(r#"{{"to":"{to}","value":"{value}","gasPrice":"{gas_price}"}}"#);
        self.post(body).await
    }

    async fn post(&self, body: String) -> Response {
        let request = Request::post("/api/ethsend")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn info(&self) -> Response {
        let request = Request::get("/api/info").body(Body::empty()).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn next_outcome(&mut self) -> (JobId, JobOutcome) {
        tokio::time::timeout(Duration::from_secs(5), self.outcomes.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Stops accepting requests, drains the worker and finalizes the token.
    async fn shutdown(self) {
        drop(self.router);
        self.worker.await.unwrap();
        lock_cards(&self.cards).shutdown();
    }
}

async fn json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

struct Transfer {
    nonce: u64,
    gas_price: U256,
    gas_limit: u64,
    to: AlloyAddress,
    value: U256,
    data: Bytes,
    v: u64,
}

fn decode(raw: &[u8]) -> Transfer {
    let mut buf = raw;
    let header = Header::decode(&mut buf).unwrap();
    assert!(header.list);

    let transfer = Transfer {
        nonce: u64::decode(&mut buf).unwrap(),
        gas_price: U256::decode(&mut buf).unwrap(),
        gas_limit: u64::decode(&mut buf).unwrap(),
        to: AlloyAddress::decode(&mut buf).unwrap(),
        value: U256::decode(&mut buf).unwrap(),
        data: Bytes::decode(&mut buf).unwrap(),
        v: u64::decode(&mut buf).unwrap(),
    };
    let _r = U256::decode(&mut buf).unwrap();
    let _s = U256::decode(&mut buf).unwrap();
    assert!(buf.is_empty());
    transfer
}

fn submitted(outcome: JobOutcome) -> B256 {
    match outcome {
        JobOutcome::Submitted(hash) => hash,
        other => panic!("expected a submitted transfer, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approved_transfer_is_submitted_unmodified() {
    let mut h = Harness::with_gate(always(true)).await;

    let response = h.send(TO, ONE_ETHER, GAS_PRICE).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json(response).await, serde_json::json!({ "success": true }));

    let (_, outcome) = h.next_outcome().await;
    let hash = submitted(outcome);

    let submissions = h.ledger.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(hash, keccak256(&submissions[0]));

    let tx = decode(&submissions[0]);
    assert_eq!(tx.nonce, 0);
    assert_eq!(tx.to, Address::parse_recipient(TO).unwrap().inner());
    assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000u128));
    assert_eq!(tx.gas_price, U256::from(20_000_000_000u64));
    assert_eq!(tx.gas_limit, 21_000);
    assert!(tx.data.is_empty());
    assert!(tx.v == CHAIN_ID * 2 + 35 || tx.v == CHAIN_ID * 2 + 36);

    let estimate = &h.ledger.estimates()[0];
    assert_eq!(estimate.from, h.address);
    assert_eq!(h.card.open_session_count(), 0);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_transfer_never_opens_a_session() {
    let mut h = Harness::with_gate(always(false)).await;
    let sessions_at_startup = h.card.sessions_opened();

    let response = h.send(TO, ONE_ETHER, GAS_PRICE).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let (_, outcome) = h.next_outcome().await;
    assert!(matches!(outcome, JobOutcome::Rejected));
    assert!(h.ledger.submissions().is_empty());
    assert_eq!(h.card.sessions_opened(), sessions_at_startup);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn info_answers_while_awaiting_confirmation() {
    let (mut operator, gate) = Operator::new();
    let mut h = Harness::with_gate(gate).await;

    let response = h.send(TO, ONE_ETHER, GAS_PRICE).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let prompt = operator.next_prompt().await;
    assert_eq!(
        prompt,
        "Send 1 to 0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed with gasPrice 20000000000?"
    );
    assert_eq!(h.card.open_session_count(), 0);

    let response = h.info().await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["info"]["address"], h.address.to_checksum_hex());
    assert_eq!(body["info"]["balance"], "2.5000");

    operator.answer(true);
    let (_, outcome) = h.next_outcome().await;
    submitted(outcome);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_bodies_are_refused_before_the_card() {
    let h = Harness::with_gate(always(true)).await;
    let sessions_at_startup = h.card.sessions_opened();

    let response = h.send("0xabc", ONE_ETHER, GAS_PRICE).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "invalid recipient address: 0xabc");

    let response = h.send(TO, "one ether", GAS_PRICE).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h.post(format!(r#"{{"to":"{TO}","value":"1"}}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["success"], false);

    assert_eq!(h.card.sessions_opened(), sessions_at_startup);
    assert!(h.ledger.estimates().is_empty());

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_queue_is_busy() {
    let (mut operator, gate) = Operator::new();
    let secret = card_secret(0x42);
    let mut h = Harness::start(
        SoftToken::new(secret, PIN),
        MemoryLedger::new(CHAIN_ID),
        gate,
        1,
        Duration::from_secs(5),
    )
    .await;

    // The first job leaves the queue once the operator is asked about it.
    assert_eq!(h.send(TO, "1", "1").await.status(), StatusCode::CREATED);
    operator.next_prompt().await;

    assert_eq!(h.send(TO, "2", "1").await.status(), StatusCode::CREATED);

    let response = h.send(TO, "3", "1").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "signer is busy, try again later");

    operator.answer(false);
    operator.answer(false);
    for _ in 0..2 {
        let (_, outcome) = h.next_outcome().await;
        assert!(matches!(outcome, JobOutcome::Rejected));
    }
    assert!(h.ledger.submissions().is_empty());

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_use_one_session_at_a_time() {
    let secret = card_secret(0x42);
    let card = SoftToken::new(secret, PIN).with_derive_delay(Duration::from_millis(20));
    let mut h = Harness::start(
        card,
        MemoryLedger::new(CHAIN_ID),
        always(true),
        8,
        Duration::from_secs(5),
    )
    .await;

    let requests: Vec<_> = (1..=5)
        .map(|i| {
            let router = h.router.clone();
            let body = format!(r#"{{"to":"{TO}","value":"{i}","gasPrice":"1"}}"#);
            tokio::spawn(async move {
                let request = Request::post("/api/ethsend")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap();
                router.oneshot(request).await.unwrap().status()
            })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap(), StatusCode::CREATED);
    }

    let mut ids = Vec::new();
    for _ in 0..5 {
        let (id, outcome) = h.next_outcome().await;
        submitted(outcome);
        ids.push(id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    assert_eq!(h.card.max_concurrent_sessions(), 1);
    assert_eq!(h.card.derivations(), 6);
    assert_eq!(h.card.open_session_count(), 0);

    let nonces: Vec<u64> = h.ledger.submissions().iter().map(|raw| decode(raw).nonce).collect();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4]);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_submission_fails_the_job_and_closes_the_session() {
    let secret = card_secret(0x42);
    let mut h = Harness::start(
        SoftToken::new(secret, PIN),
        MemoryLedger::new(CHAIN_ID).rejecting("insufficient funds for gas * price + value"),
        always(true),
        4,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(h.send(TO, ONE_ETHER, GAS_PRICE).await.status(), StatusCode::CREATED);

    let (_, outcome) = h.next_outcome().await;
    match outcome {
        JobOutcome::Failed(CoreError::SubmissionError(reason)) => {
            assert!(reason.contains("insufficient funds"));
        }
        other => panic!("expected a submission error, got {other:?}"),
    }

    assert_eq!(h.card.open_session_count(), 0);
    let events = h.card.events();
    assert!(matches!(
        events.as_slice(),
        [.., AuditEvent::Derived(_), AuditEvent::LoggedOut(_), AuditEvent::SessionClosed(_)]
    ));

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_deriving_another_account_never_signs() {
    let mut h = Harness::start_with(Setup {
        card: SoftToken::new(card_secret(0x42), PIN),
        ledger: MemoryLedger::new(CHAIN_ID),
        gate: always(true),
        pins: pin_entry(),
        worker_address: Some(card_account(&card_secret(0x43))),
        queue_depth: 4,
        confirm_timeout: Duration::from_secs(5),
    })
    .await;

    assert_eq!(h.send(TO, ONE_ETHER, GAS_PRICE).await.status(), StatusCode::CREATED);

    let (_, outcome) = h.next_outcome().await;
    match outcome {
        JobOutcome::Failed(CoreError::DeriveFailed(reason)) => {
            assert!(reason.contains("does not match unlocked address"));
        }
        other => panic!("expected an address mismatch, got {other:?}"),
    }

    assert!(h.ledger.estimates().is_empty());
    assert!(h.ledger.submissions().is_empty());
    assert_eq!(h.card.open_session_count(), 0);
    assert!(matches!(
        h.card.events().as_slice(),
        [.., AuditEvent::Derived(_), AuditEvent::LoggedOut(_), AuditEvent::SessionClosed(_)]
    ));

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_pin_fails_only_its_own_job() {
    // Prompt 1 unlocks at startup, prompt 2 belongs to the first job.
    let mut h = Harness::start_with(Setup {
        card: SoftToken::new(card_secret(0x42), PIN),
        ledger: MemoryLedger::new(CHAIN_ID),
        gate: always(true),
        pins: pin_entry_mistyping(&[2]),
        worker_address: None,
        queue_depth: 4,
        confirm_timeout: Duration::from_secs(5),
    })
    .await;

    assert_eq!(h.send(TO, "1", GAS_PRICE).await.status(), StatusCode::CREATED);
    let (first, outcome) = h.next_outcome().await;
    assert!(matches!(outcome, JobOutcome::Failed(CoreError::LoginFailed(_))));
    assert_eq!(h.card.open_session_count(), 0);
    assert!(h.card.events().iter().any(|e| matches!(e, AuditEvent::LoginRejected(_))));

    assert_eq!(h.send(TO, "2", GAS_PRICE).await.status(), StatusCode::CREATED);
    let (second, outcome) = h.next_outcome().await;
    assert_ne!(first, second);
    submitted(outcome);

    let submissions = h.ledger.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(decode(&submissions[0]).value, U256::from(2));
    assert_eq!(h.card.open_session_count(), 0);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unencodable_chain_id_leaves_the_card_usable() {
    let mut h = Harness::start(
        SoftToken::new(card_secret(0x42), PIN),
        MemoryLedger::new(u64::MAX),
        always(true),
        4,
        Duration::from_secs(5),
    )
    .await;

    for value in ["1", "2"] {
        assert_eq!(h.send(TO, value, GAS_PRICE).await.status(), StatusCode::CREATED);
        let (_, outcome) = h.next_outcome().await;
        assert!(
            matches!(outcome, JobOutcome::Failed(CoreError::RlpEncodingFailed(_))),
            "unexpected outcome {outcome:?}"
        );
    }

    assert!(h.ledger.submissions().is_empty());
    assert_eq!(h.card.open_session_count(), 0);
    assert!(!h.cards.is_poisoned());

    let again = unlock_wallet(&h.cards, &KeyDerivationEngine::default()).unwrap();
    assert_eq!(again, h.address);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_confirmation_times_out() {
    let (mut operator, gate) = Operator::new();
    let secret = card_secret(0x42);
    let mut h = Harness::start(
        SoftToken::new(secret, PIN),
        MemoryLedger::new(CHAIN_ID),
        gate,
        4,
        Duration::from_millis(100),
    )
    .await;
    let sessions_at_startup = h.card.sessions_opened();

    assert_eq!(h.send(TO, "1", "1").await.status(), StatusCode::CREATED);
    operator.next_prompt().await;

    let (_, outcome) = h.next_outcome().await;
    assert!(matches!(outcome, JobOutcome::Failed(CoreError::Timeout(_))));
    assert_eq!(h.card.sessions_opened(), sessions_at_startup);

    // Release the abandoned prompt thread.
    drop(operator);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn account_is_derived_from_the_card_ecdh_secret() {
    let secret = card_secret(0x42);
    let h = Harness::with_gate(always(false)).await;

    assert_eq!(h.address, card_account(&secret));

    // A second unlock on the same card lands on the same account.
    let again = unlock_wallet(&h.cards, &KeyDerivationEngine::default()).unwrap();
    assert_eq!(again, h.address);

    // Hashing the card's public key instead of the ECDH secret is a different account.
    let from_public_key = SigningKey::from_derived_secret(&h.card.public_key_sec1())
        .unwrap()
        .address();
    assert_ne!(h.address, from_public_key);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn different_cards_unlock_different_accounts() {
    let a = card_account(&card_secret(0x42));
    let b = card_account(&card_secret(0x43));
    assert_ne!(a, b);

    let h = Harness::start(
        SoftToken::new(card_secret(0x43), PIN),
        MemoryLedger::new(CHAIN_ID),
        always(false),
        1,
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(h.address, b);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_finalizes_the_token_once() {
    let h = Harness::with_gate(always(false)).await;
    let card = h.card.clone();

    h.shutdown().await;

    let finalized = card
        .events()
        .iter()
        .filter(|e| matches!(e, AuditEvent::Finalized))
        .count();
    assert_eq!(finalized, 1);
    assert_eq!(card.open_session_count(), 0);
}
