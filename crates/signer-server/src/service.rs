//! HTTP API.
//!
//! | Method | Path           | Answer                                            |
//! |--------|----------------|---------------------------------------------------|
//! | GET    | `/api/info`    | `200 { success, info: { address, balance } }`    |
//! | POST   | `/api/ethsend` | `201 { success }` once the job is queued          |
//!
//! Reads never touch the card. A send is validated, queued and acknowledged;
//! its outcome only shows up in the operator log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::U256;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use idcard_signer_core::units::format_ether_fixed4;
use idcard_signer_core::{Address, LedgerNode, TransferIntent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::job::{JobId, JobOutcome, SignRequest};

/// Wallet identity known without the card.
#[derive(Debug)]
pub struct CachedInfo {
    address: Address,
    balance: RwLock<U256>,
}

impl CachedInfo {
    /// Info for the address unlocked at startup.
    #[must_use]
    pub fn new(address: Address, balance: U256) -> Self {
        Self {
            address,
            balance: RwLock::new(balance),
        }
    }

    /// The account address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Last balance seen, in wei.
    pub async fn balance(&self) -> U256 {
        *self.balance.read().await
    }
}

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    info: Arc<CachedInfo>,
    node: Arc<dyn LedgerNode>,
    queue: mpsc::Sender<SignRequest>,
    next_id: Arc<AtomicU64>,
    outcomes: Option<mpsc::UnboundedSender<(JobId, JobOutcome)>>,
}

impl AppState {
    /// Creates handler state feeding `queue`.
    #[must_use]
    pub fn new(
        info: Arc<CachedInfo>,
        node: Arc<dyn LedgerNode>,
        queue: mpsc::Sender<SignRequest>,
    ) -> Self {
        Self {
            info,
            node,
            queue,
            next_id: Arc::new(AtomicU64::new(1)),
            outcomes: None,
        }
    }

    /// Forwards every job outcome to `observer` after it is logged.
    #[must_use]
    pub fn with_outcome_observer(
        mut self,
        observer: mpsc::UnboundedSender<(JobId, JobOutcome)>,
    ) -> Self {
        self.outcomes = Some(observer);
        self
    }
}

/// Body of `POST /api/ethsend`. All amounts are base-unit integers.
#[derive(Debug, Deserialize)]
pub struct SendBody {
    /// Recipient address.
    pub to: String,
    /// Amount in wei.
    pub value: String,
    /// Gas price in wei.
    #[serde(rename = "gasPrice")]
    pub gas_price: String,
}

#[derive(Debug, Serialize)]
struct Ack {
    success: bool,
}

#[derive(Debug, Serialize)]
struct InfoBody {
    success: bool,
    info: WalletInfo,
}

#[derive(Debug, Serialize)]
struct WalletInfo {
    address: String,
    balance: String,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(info))
        .route("/api/ethsend", post(eth_send))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn info(State(state): State<AppState>) -> ServerResult<Json<InfoBody>> {
    let address = state.info.address();
    let balance = state.node.balance(address).await?;
    *state.info.balance.write().await = balance;

    Ok(Json(InfoBody {
        success: true,
        info: WalletInfo {
            address: address.to_checksum_hex(),
            balance: format_ether_fixed4(balance),
        },
    }))
}

async fn eth_send(
    State(state): State<AppState>,
    body: Result<Json<SendBody>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<Ack>)> {
    let Json(body) = body.map_err(|rejection| ServerError::BadRequest(rejection.body_text()))?;
    let intent = TransferIntent::parse(&body.to, &body.value, &body.gas_price)?;

    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (request, completion) = SignRequest::new(id, intent);

    state.queue.try_send(request).map_err(|e| match e {
        TrySendError::Full(_) => {
            warn!(job = id, "send queue full, refusing request");
            ServerError::Busy
        }
        TrySendError::Closed(_) => ServerError::ShuttingDown,
    })?;
    info!(job = id, "send request queued");

    let observer = state.outcomes.clone();
    tokio::spawn(async move {
        let Ok(outcome) = completion.await else {
            error!(job = id, "job dropped without an outcome");
            return;
        };
        match &outcome {
            JobOutcome::Submitted(hash) => info!(job = id, %hash, "transfer sent"),
            JobOutcome::Rejected => info!(job = id, "transfer declined by operator"),
            JobOutcome::Failed(e) => error!(job = id, error = %e, "transfer failed"),
        }
        if let Some(observer) = observer {
            let _ = observer.send((id, outcome));
        }
    });

    Ok((StatusCode::CREATED, Json(Ack { success: true })))
}
