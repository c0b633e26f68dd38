//! Transfer signing and submission.
//!
//! [`TransactionSigner`] combines a card-derived [`SigningKey`] with a
//! [`LedgerNode`]: it fills in chain id, nonce and gas limit from the node,
//! signs an EIP-155 legacy transaction and submits it. Submission is never
//! retried; a node that refuses the transaction ends the job.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use idcard_signer_core::{JsonRpcLedger, TransactionSigner, TransferIntent};
//!
//! let node = Arc::new(JsonRpcLedger::new("http://127.0.0.1:8545", timeout)?);
//! let signer = TransactionSigner::new(node);
//!
//! let intent = TransferIntent::parse(
//!     "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
//!     "1000000000000000000",
//!     "20000000000",
//! )?;
//! let hash = signer.send_intent(&key, &intent).await?;
//! ```

use std::sync::Arc;

use alloy_primitives::{B256, U256};
use tracing::{info, warn};

use crate::address::Address;
use crate::crypto::SigningKey;
use crate::error::Result;
use crate::ledger::{CallRequest, LedgerNode};
use crate::operator::TransferSummary;
use crate::transaction::{LegacyTransaction, transaction_hash};
use crate::units::parse_wei;

/// A validated transfer: recipient, amount and gas price, all in base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    /// Recipient.
    pub to: Address,
    /// Amount in wei.
    pub value: U256,
    /// Gas price in wei.
    pub gas_price: U256,
}

impl TransferIntent {
    /// Validates raw request fields.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRecipient`](crate::Error::InvalidRecipient) for a malformed `to`
    /// - [`Error::InvalidAmount`](crate::Error::InvalidAmount) for a malformed `value` or `gas_price`
    pub fn parse(to: &str, value: &str, gas_price: &str) -> Result<Self> {
        Ok(Self {
            to: Address::parse_recipient(to)?,
            value: parse_wei(value)?,
            gas_price: parse_wei(gas_price)?,
        })
    }

    /// The text shown to the operator for approval.
    #[must_use]
    pub const fn summary(&self) -> TransferSummary {
        TransferSummary::new(self.to, self.value, self.gas_price)
    }
}

/// Signs and submits transfers through a ledger node.
#[derive(Debug, Clone)]
pub struct TransactionSigner {
    node: Arc<dyn LedgerNode>,
}

impl TransactionSigner {
    /// Creates a signer backed by `node`.
    #[must_use]
    pub fn new(node: Arc<dyn LedgerNode>) -> Self {
        Self { node }
    }

    /// The account address of `key`.
    #[must_use]
    pub const fn get_address(&self, key: &SigningKey) -> Address {
        key.address()
    }

    /// Balance of `address` in wei. Needs no card.
    ///
    /// # Errors
    ///
    /// Returns the node error.
    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        self.node.balance(address).await
    }

    /// Validates the request fields, then signs and submits.
    ///
    /// Recipient validation happens before any node call.
    ///
    /// # Errors
    ///
    /// See [`TransferIntent::parse`] and [`send_intent`](Self::send_intent).
    pub async fn send(
        &self,
        key: &SigningKey,
        to: &str,
        amount: &str,
        gas_price: &str,
    ) -> Result<B256> {
        let intent = TransferIntent::parse(to, amount, gas_price)?;
        self.send_intent(key, &intent).await
    }

    /// Builds, signs and submits a legacy transfer for an already-validated
    /// intent. `value` and `gas_price` go out unmodified.
    ///
    /// # Errors
    ///
    /// - [`Error::Node`](crate::Error::Node) if the chain id, nonce or gas
    ///   estimate cannot be fetched
    /// - [`Error::RlpEncodingFailed`](crate::Error::RlpEncodingFailed) if the
    ///   node reports a chain id that cannot be EIP-155 encoded
    /// - [`Error::SubmissionError`](crate::Error::SubmissionError) if the node
    ///   refuses the signed transaction
    pub async fn send_intent(&self, key: &SigningKey, intent: &TransferIntent) -> Result<B256> {
        let from = key.address();

        let chain_id = self.node.chain_id().await?;
        let nonce = self.node.transaction_count(from).await?;
        let gas_limit = self
            .node
            .estimate_gas(&CallRequest {
                from,
                to: intent.to,
                value: intent.value,
                gas_price: intent.gas_price,
            })
            .await?;

        let tx = LegacyTransaction {
            chain_id,
            nonce,
            gas_price: intent.gas_price,
            gas_limit,
            to: intent.to,
            value: intent.value,
            data: vec![],
        };

        let signature = key.sign_hash(&tx.signing_hash())?;
        let raw = tx.signed_rlp(&signature)?;
        let local_hash = transaction_hash(&raw);

        let hash = self.node.send_raw_transaction(&raw).await?;
        if hash != local_hash {
            warn!(%hash, %local_hash, "node reported a different transaction hash");
        }
        info!(%hash, %from, to = %intent.to, nonce, "transaction submitted");

        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use alloy_rlp::{Decodable, Header};

    use super::*;
    use crate::error::Error;
    use crate::ledger::MemoryLedger;

    const TO: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    fn key() -> SigningKey {
        SigningKey::from_derived_secret(&[9u8; 48]).unwrap()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    #[test]
    fn intent_validation() {
        let intent = TransferIntent::parse(TO, "1000", "0x10").unwrap();
        assert_eq!(intent.value, U256::from(1000));
        assert_eq!(intent.gas_price, U256::from(16));

        assert!(matches!(
            TransferIntent::parse("0xabc", "1", "1"),
            Err(Error::InvalidRecipient(_))
        ));
        assert!(matches!(
            TransferIntent::parse(TO, "1.5", "1"),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            TransferIntent::parse(TO, "1", ""),
            Err(Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn send_submits_unmodified_fields() {
        let node = Arc::new(MemoryLedger::new(5));
        let signer = TransactionSigner::new(node.clone());

        let hash = runtime()
            .block_on(signer.send(&key(), TO, "1000000000000000000", "20000000000"))
            .unwrap();

        let submissions = node.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(hash, transaction_hash(&submissions[0]));

        let mut buf = submissions[0].as_slice();
        assert!(Header::decode(&mut buf).unwrap().list);
        assert_eq!(u64::decode(&mut buf).unwrap(), 0);
        assert_eq!(U256::decode(&mut buf).unwrap(), U256::from(20_000_000_000u64));
        assert_eq!(u64::decode(&mut buf).unwrap(), 21_000);
        assert_eq!(
            Address::from(alloy_primitives::Address::decode(&mut buf).unwrap()),
            Address::parse_recipient(TO).unwrap()
        );
        assert_eq!(
            U256::decode(&mut buf).unwrap(),
            U256::from(1_000_000_000_000_000_000u128)
        );

        let estimates = node.estimates();
        assert_eq!(estimates.len(), 1);
        assert_eq!(estimates[0].from, key().address());
    }

    #[test]
    fn invalid_recipient_never_reaches_node() {
        let node = Arc::new(MemoryLedger::new(1));
        let signer = TransactionSigner::new(node.clone());

        let result = runtime().block_on(signer.send(&key(), "0x1234", "1", "1"));
        assert!(matches!(result, Err(Error::InvalidRecipient(_))));
        assert!(node.estimates().is_empty());
        assert!(node.submissions().is_empty());
    }

    #[test]
    fn refused_submission_is_not_retried() {
        let node = Arc::new(MemoryLedger::new(1).rejecting("insufficient funds"));
        let signer = TransactionSigner::new(node.clone());

        let result = runtime().block_on(signer.send(&key(), TO, "1", "1"));
        assert!(matches!(result, Err(Error::SubmissionError(_))));
        assert_eq!(node.estimates().len(), 1);
    }

    #[test]
    fn unencodable_chain_id_submits_nothing() {
        let node = Arc::new(MemoryLedger::new(u64::MAX));
        let signer = TransactionSigner::new(node.clone());

        let result = runtime().block_on(signer.send(&key(), TO, "1", "1"));
        assert!(matches!(result, Err(Error::RlpEncodingFailed(_))));
        assert!(node.submissions().is_empty());
    }

    #[test]
    fn balance_needs_only_the_node() {
        let addr = key().address();
        let node = Arc::new(MemoryLedger::new(1).with_balance(addr, U256::from(42)));
        let signer = TransactionSigner::new(node);

        let balance = runtime().block_on(signer.get_balance(addr)).unwrap();
        assert_eq!(balance, U256::from(42));
        assert_eq!(signer.get_address(&key()), addr);
    }
}
