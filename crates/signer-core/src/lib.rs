//! ID-card EVM Signer Core Library
//!
//! This crate provides the core functionality for signing Ethereum
//! transactions with a key that is re-derived, every session, from an
//! Estonian ID card (or any PKCS#11 token holding an EC key).
//!
//! # Overview
//!
//! The card never stores an Ethereum key. Instead it runs an ECDH key
//! agreement between its PIN-protected private key and a fixed counterpart
//! point; the host hashes the agreed secret with SHA-256 into a secp256k1
//! signing key. The same card always yields the same account, and no secret
//! material is ever written to disk.
//!
//! This library provides:
//!
//! - **Token Access**: a typed PKCS#11 capability interface and a session
//!   manager that guarantees teardown and one session at a time
//! - **Key Derivation**: `SHA-256(ECDH(card_key, counterpart))` to [`SigningKey`]
//! - **Transactions**: EIP-155 legacy transaction encoding and signing
//! - **Ledger Access**: JSON-RPC client for balances and submission
//! - **Operator Prompts**: PIN entry and yes/no transfer confirmation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ TransactionSigner │  LedgerNode  │  ConfirmationGate / Pin  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  KeyDerivationEngine  →  SigningKey  →  Address, Signature  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  CardSessionManager                          │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────────────┐ │
//! │  │  Slot   │  │  Login  │  │ Objects │  │  Token (trait)  │ │
//! │  │ Select  │  │  (PIN)  │  │  Find   │  │                 │ │
//! │  └─────────┘  └─────────┘  └─────────┘  └─────────────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │            PKCS#11 module (cryptoki) / SoftToken             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Parsing a Transfer
//!
//! ```rust
//! use idcard_signer_core::{TransferIntent, U256};
//!
//! let intent = TransferIntent::parse(
//!     "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
//!     "1000000000000000000",
//!     "20000000000",
//! )
//! .unwrap();
//!
//! assert_eq!(intent.value, U256::from(1_000_000_000_000_000_000u128));
//! assert_eq!(
//!     intent.summary().to_string(),
//!     "Send 1 to 0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed with gasPrice 20000000000?"
//! );
//! ```
//!
//! ## Deriving the Signing Key
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use idcard_signer_core::{KeyDerivationEngine, Terminal};
//! use idcard_signer_core::token::{CardSessionManager, Pkcs11Token, SlotSelector};
//!
//! let token = Pkcs11Token::load(lib_path)?;
//! let terminal = Arc::new(Terminal::new(Duration::from_secs(120))?);
//! let mut cards = CardSessionManager::new(token, SlotSelector::default(), terminal);
//! let engine = KeyDerivationEngine::default();
//!
//! let key = cards.with_session(|session| engine.derive(session))?;
//! println!("Address: {}", key.address());
//! ```
//!
//! # Feature Flags
//!
//! - `pkcs11`: [`token::Pkcs11Token`], native token access through `cryptoki`
//! - `soft-token`: [`token::SoftToken`] and [`ledger::MemoryLedger`], in-process
//!   card and node simulators for tests
//!
//! # Security Considerations
//!
//! - The card's private key never leaves the card
//! - The PIN, the derived secret and the signing key are zeroized on drop
//!   and never logged
//! - Signatures are produced in low-S form

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

// Modules
pub mod address;
pub mod crypto;
pub mod derive;
pub mod error;
pub mod ledger;
pub mod operator;
pub mod signature;
pub mod signer;
pub mod token;
pub mod transaction;
pub mod units;

// Re-exports for convenience
pub use address::Address;
pub use crypto::SigningKey;
pub use derive::{CounterpartPoint, KeyDerivationEngine};
pub use error::{Error, Result};
pub use ledger::{CallRequest, JsonRpcLedger, LedgerNode};
pub use operator::{ConfirmationGate, PinEntry, Terminal, TransferSummary};
pub use signature::Signature;
pub use signer::{TransactionSigner, TransferIntent};
pub use transaction::LegacyTransaction;

// Re-export commonly used alloy types
pub use alloy_primitives::{B256, U256};
