//! Local HTTP signer service backed by an ID card.
//!
//! The service unlocks the card-derived wallet once at startup, then serves
//! two endpoints: a read-only account summary and a send endpoint that
//! queues transfers for a single [`SigningWorker`]. The worker asks the
//! operator on the terminal before opening a card session for each transfer.
//!
//! ```text
//!  HTTP ──► router ──► try_send ──► mpsc queue ──► SigningWorker
//!             │                                       │
//!             └── GET /api/info ──► LedgerNode ◄──────┤ confirm → card → sign
//!                                                     ▼
//!                                              JobOutcome (log)
//! ```

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

// Only the binary installs a subscriber
use tracing_subscriber as _;

pub mod config;
pub mod error;
pub mod job;
pub mod service;
pub mod worker;

pub use config::Config;
pub use error::{ErrorBody, ServerError, ServerResult};
pub use job::{JobId, JobOutcome, JobProgress, JobState, SignRequest};
pub use service::{AppState, CachedInfo, SendBody, router};
pub use worker::{SharedCards, SigningWorker, lock_cards, unlock_wallet};
