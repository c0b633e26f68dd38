//! Remote ledger node access.
//!
//! The signer needs five things from a node: the chain id, an account
//! balance, the next nonce, a gas estimate, and raw transaction submission.
//! [`LedgerNode`] is that capability set; [`JsonRpcLedger`] implements it
//! over Ethereum JSON-RPC.

pub mod rpc;

#[cfg(any(test, feature = "soft-token"))]
pub mod memory;

pub use rpc::JsonRpcLedger;

#[cfg(any(test, feature = "soft-token"))]
pub use memory::MemoryLedger;

use std::fmt;

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use serde::Serialize;

use crate::address::Address;
use crate::error::Result;

/// Parameters for `eth_estimateGas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Sender.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Amount in wei.
    pub value: U256,
    /// Gas price in wei.
    pub gas_price: U256,
}

/// A ledger node reachable over some RPC transport.
#[async_trait]
pub trait LedgerNode: Send + Sync + fmt::Debug {
    /// Chain id for EIP-155 replay protection.
    async fn chain_id(&self) -> Result<u64>;

    /// Latest balance of `address`, in wei.
    async fn balance(&self, address: Address) -> Result<U256>;

    /// Next nonce for `address`, counting pending transactions.
    async fn transaction_count(&self, address: Address) -> Result<u64>;

    /// Gas limit estimate for a plain transfer.
    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64>;

    /// Submits a signed transaction and returns the node-assigned hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionError`](crate::Error::SubmissionError) if the
    /// node refuses the transaction.
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256>;
}
