//! An in-memory ledger node for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::{B256, U256};
use async_trait::async_trait;

use super::{CallRequest, LedgerNode};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::transaction::transaction_hash;

/// Gas charged for a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<Address, U256>,
    submissions: Vec<Vec<u8>>,
    estimates: Vec<CallRequest>,
    reject_with: Option<String>,
}

/// Records submissions instead of executing them.
#[derive(Debug)]
pub struct MemoryLedger {
    chain_id: u64,
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    /// Creates an empty ledger on `chain_id`.
    #[must_use]
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Credits `address`.
    #[must_use]
    pub fn with_balance(self, address: Address, wei: U256) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.balances.insert(address, wei);
        }
        self
    }

    /// Refuses every submission with `reason`.
    #[must_use]
    pub fn rejecting(self, reason: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.reject_with = Some(reason.to_string());
        }
        self
    }

    /// Raw transactions accepted so far, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    /// Gas estimate requests seen so far.
    #[must_use]
    pub fn estimates(&self) -> Vec<CallRequest> {
        self.state
            .lock()
            .map(|s| s.estimates.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Node("memory ledger poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerNode for MemoryLedger {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self
            .state()?
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    // Every submission is assumed to come from the one signing account.
    async fn transaction_count(&self, _address: Address) -> Result<u64> {
        let count = self.state()?.submissions.len();
        u64::try_from(count).map_err(|e| Error::Node(e.to_string()))
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64> {
        self.state()?.estimates.push(call.clone());
        Ok(TRANSFER_GAS)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let mut state = self.state()?;
        if let Some(reason) = &state.reject_with {
            return Err(Error::SubmissionError(reason.clone()));
        }

        state.submissions.push(raw.to_vec());
        Ok(transaction_hash(raw))
    }
}
