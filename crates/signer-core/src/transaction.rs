//! EIP-155 legacy transactions and their signing payload.
//!
//! Transfers requested through the service carry a caller-chosen gas price,
//! so they are sent as EIP-155 legacy transactions.
//!
//! # Signing Flow
//!
//! 1. Fill a [`LegacyTransaction`] (nonce, gas limit and chain id come from the node)
//! 2. Call [`LegacyTransaction::signing_hash`] to get the hash to sign
//! 3. Sign the hash with the card-derived [`SigningKey`](crate::SigningKey)
//! 4. Submit [`LegacyTransaction::signed_rlp`] to the node
//!
//! # Example
//!
//! ```
//! use idcard_signer_core::{Address, LegacyTransaction, U256};
//!
//! let tx = LegacyTransaction {
//!     chain_id: 1,
//!     nonce: 0,
//!     gas_price: U256::from(20_000_000_000u64),
//!     gas_limit: 21000,
//!     to: Address::zero(),
//!     value: U256::from(1_000_000_000_000_000_000u128),
//!     data: vec![],
//! };
//!
//! let hash = tx.signing_hash();
//! ```

use alloy_primitives::{B256, U256, keccak256};
use alloy_rlp::Encodable;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::signature::Signature;

/// An EIP-155 legacy transaction.
///
/// This is the traditional Ethereum transaction format with chain ID
/// replay protection as specified in [EIP-155].
///
/// [EIP-155]: https://eips.ethereum.org/EIPS/eip-155
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    /// The chain ID for replay protection.
    pub chain_id: u64,

    /// The transaction nonce.
    pub nonce: u64,

    /// The gas price in wei.
    pub gas_price: U256,

    /// The gas limit.
    pub gas_limit: u64,

    /// The recipient address.
    pub to: Address,

    /// The value to transfer in wei.
    pub value: U256,

    /// The transaction input data.
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    /// Generates the signing hash for this transaction.
    ///
    /// For EIP-155 transactions, the signing hash is:
    /// `keccak256(rlp([nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0]))`
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        let mut buf = Vec::new();

        encode_rlp_list(&mut buf, |buf| {
            self.nonce.encode(buf);
            encode_u256(&self.gas_price, buf);
            self.gas_limit.encode(buf);
            self.to.inner().encode(buf);
            encode_u256(&self.value, buf);
            self.data.as_slice().encode(buf);
            self.chain_id.encode(buf);
            0u8.encode(buf);
            0u8.encode(buf);
        });

        keccak256(&buf)
    }

    /// Creates a signed transaction by combining this transaction with a signature.
    ///
    /// # Returns
    ///
    /// The RLP-encoded signed transaction bytes, ready for `eth_sendRawTransaction`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RlpEncodingFailed`] if the chain id is too large for
    /// the EIP-155 `v` value to fit in 64 bits.
    pub fn signed_rlp(&self, signature: &Signature) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let v = eip155_v(self.chain_id, signature.v())?;

        encode_rlp_list(&mut buf, |buf| {
            self.nonce.encode(buf);
            encode_u256(&self.gas_price, buf);
            self.gas_limit.encode(buf);
            self.to.inner().encode(buf);
            encode_u256(&self.value, buf);
            self.data.as_slice().encode(buf);
            v.encode(buf);
            encode_bytes32(signature.r(), buf);
            encode_bytes32(signature.s(), buf);
        });

        Ok(buf)
    }
}

/// `chain_id * 2 + 35 + recovery_id`
fn eip155_v(chain_id: u64, recovery_id: u8) -> Result<u64> {
    chain_id
        .checked_mul(2)
        .and_then(|v| v.checked_add(35 + u64::from(recovery_id)))
        .ok_or_else(|| {
            Error::RlpEncodingFailed(format!("chain id {chain_id} is too large for EIP-155"))
        })
}

/// Returns the transaction hash of raw signed transaction bytes.
#[must_use]
pub fn transaction_hash(raw: &[u8]) -> B256 {
    keccak256(raw)
}

/// Encodes an RLP list using a closure to write elements.
fn encode_rlp_list<F>(out: &mut Vec<u8>, f: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut content = Vec::new();
    f(&mut content);

    let header = alloy_rlp::Header {
        list: true,
        payload_length: content.len(),
    };
    header.encode(out);
    out.extend_from_slice(&content);
}

/// Encodes a U256 as RLP (strips leading zeros).
fn encode_u256(value: &U256, out: &mut Vec<u8>) {
    let bytes = value.to_be_bytes::<32>();
    encode_bytes32(&bytes, out);
}

/// Encodes a 32-byte big-endian integer, stripping leading zeros.
fn encode_bytes32(bytes: &[u8; 32], out: &mut Vec<u8>) {
    match bytes.iter().position(|&b| b != 0) {
        Some(start) => bytes[start..].encode(out),
        None => out.push(0x80),
    }
}
