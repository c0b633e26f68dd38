//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use idcard_signer_core::derive::{DEFAULT_COUNTERPART_POINT, DEFAULT_SECRET_LEN};
use idcard_signer_core::token::{DEFAULT_SLOT_LABEL, DEFAULT_SLOT_MANUFACTURER, SlotSelector};
use idcard_signer_core::{CounterpartPoint, KeyDerivationEngine};

use crate::error::ServerResult;

/// Local HTTP signer backed by an Estonian ID card.
#[derive(Parser, Debug, Clone)]
#[command(name = "idcard-signer")]
#[command(about = "Sign and send Ethereum transfers with a key derived from an ID card")]
#[command(version)]
pub struct Config {
    /// Path to the PKCS#11 module
    #[arg(long, env = "PKCS11_LIB_PATH")]
    pub pkcs11_lib: PathBuf,

    /// Ledger node JSON-RPC endpoint
    #[arg(long, env = "WEB3_PROVIDER")]
    pub node_url: String,

    /// Address the HTTP API listens on
    #[arg(long, env = "SIGNER_LISTEN", default_value = "127.0.0.1:8301")]
    pub listen: SocketAddr,

    /// Token manufacturer id prefix of the slot to use
    #[arg(long, env = "SIGNER_SLOT_MANUFACTURER", default_value = DEFAULT_SLOT_MANUFACTURER)]
    pub slot_manufacturer: String,

    /// Substring of the token label of the slot to use
    #[arg(long, env = "SIGNER_SLOT_LABEL", default_value = DEFAULT_SLOT_LABEL)]
    pub slot_label: String,

    /// Fixed ECDH counterpart point, SEC1 uncompressed hex
    #[arg(long, env = "SIGNER_COUNTERPART_POINT", default_value = DEFAULT_COUNTERPART_POINT)]
    pub counterpart_point: String,

    /// Length in bytes of the derived secret requested from the card
    #[arg(long, env = "SIGNER_DERIVED_SECRET_LEN", default_value_t = DEFAULT_SECRET_LEN)]
    pub derived_secret_len: usize,

    /// Seconds to wait for the operator to confirm a transfer
    #[arg(long, env = "SIGNER_CONFIRM_TIMEOUT_SECS", default_value_t = 120)]
    pub confirm_timeout_secs: u64,

    /// Seconds to wait for each ledger node response
    #[arg(long, env = "SIGNER_NODE_TIMEOUT_SECS", default_value_t = 30)]
    pub node_timeout_secs: u64,

    /// Send requests that may wait for the card before new ones are refused
    #[arg(long, env = "SIGNER_QUEUE_DEPTH", default_value_t = 8)]
    pub queue_depth: usize,
}

impl Config {
    /// Slot selection predicate.
    #[must_use]
    pub fn selector(&self) -> SlotSelector {
        SlotSelector::new(&self.slot_manufacturer, &self.slot_label)
    }

    /// Key derivation settings.
    ///
    /// # Errors
    ///
    /// Fails if the counterpart point is not valid SEC1 uncompressed hex.
    pub fn engine(&self) -> ServerResult<KeyDerivationEngine> {
        let counterpart = CounterpartPoint::from_hex(&self.counterpart_point)?;
        Ok(KeyDerivationEngine::new(counterpart, self.derived_secret_len))
    }

    /// Operator confirmation bound.
    #[must_use]
    pub const fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    /// Per-call ledger node bound.
    #[must_use]
    pub const fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}
