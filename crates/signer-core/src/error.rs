//! Error types for the ID-card EVM signer library.
//!
//! This module provides a single error type [`enum@Error`] that covers every
//! failure mode between the card reader and the ledger node.
//!
//! # Error Categories
//!
//! - **Card errors**: slot discovery, PIN login, key object lookup
//! - **Derivation errors**: the on-card key agreement and its host-side reduction
//! - **Transaction errors**: recipient/amount validation, RLP encoding, submission
//! - **Operator errors**: declined or timed-out confirmations, prompt I/O
//!
//! Every card or derivation error aborts only the job that hit it. The
//! service keeps running and the next job opens a fresh session.
//!
//! # Example
//!
//! ```
//! use idcard_signer_core::Error;
//!
//! let err = Error::SlotNotFound;
//! assert_eq!(err.to_string(), "no token slot matched the configured manufacturer and label");
//! ```

use alloy_rlp::Error as AlloyRlpError;
use core::result::Result as CoreResult;
use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// The main error type for the ID-card EVM signer library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Card Errors
    // =========================================================================
    /// No slot matched the manufacturer/label predicate.
    #[error("no token slot matched the configured manufacturer and label")]
    SlotNotFound,

    /// More than one slot matched the manufacturer/label predicate.
    #[error("{0} token slots matched the configured manufacturer and label, expected one")]
    AmbiguousSlot(usize),

    /// The token rejected the PIN.
    #[error("token login failed: {0}")]
    LoginFailed(String),

    /// The session holds no key object of the given class.
    #[error("no {0} object found on the token")]
    KeyObjectNotFound(&'static str),

    /// The session holds more than one key object of the given class.
    #[error("{1} {0} objects found on the token, expected one")]
    AmbiguousKeyObject(&'static str, usize),

    /// The card session was already closed.
    #[error("card session is closed")]
    SessionClosed,

    /// Any other failure reported by the token interface.
    #[error("token error: {0}")]
    Token(String),

    // =========================================================================
    // Derivation Errors
    // =========================================================================
    /// Key agreement on the card, or the reduction of its output, failed.
    #[error("key derivation failed: {0}")]
    DeriveFailed(String),

    /// The counterpart public point is malformed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// The recipient is not a syntactically valid address.
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),

    /// A value or gas price is not a base-unit integer.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The ledger node refused the signed transaction.
    #[error("transaction submission failed: {0}")]
    SubmissionError(String),

    /// The ledger node failed before anything was submitted.
    #[error("ledger node error: {0}")]
    Node(String),

    /// The signature is invalid or could not be produced.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Failed to RLP encode or decode a transaction.
    #[error("RLP encoding failed: {0}")]
    RlpEncodingFailed(String),

    // =========================================================================
    // Operator Errors
    // =========================================================================
    /// The operator declined the pending transfer.
    #[error("operator declined the transaction")]
    ConfirmationDeclined,

    /// A bounded wait ran out.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Reading from the operator terminal failed.
    #[error("operator prompt failed: {0}")]
    Operator(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Failed to parse hex data.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    JsonError(String),
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::HexDecodeFailed(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Error::JsonError(err.to_string())
    }
}

impl From<AlloyRlpError> for Error {
    fn from(err: AlloyRlpError) -> Self {
        Error::RlpEncodingFailed(err.to_string())
    }
}

#[cfg(feature = "pkcs11")]
impl From<cryptoki::error::Error> for Error {
    fn from(err: cryptoki::error::Error) -> Self {
        Error::Token(err.to_string())
    }
}

/// A specialized [`Result`] type for signer operations.
pub type Result<T> = CoreResult<T, Error>;
