//! Host-side key material for secp256k1 signing.
//!
//! The card never holds an Ethereum key. Instead it performs an ECDH key
//! agreement between its private key and a fixed counterpart point, and the
//! host reduces the shared secret to a secp256k1 scalar:
//!
//! ```text
//! signing_key = SHA-256(ECDH(card_private_key, counterpart_point))
//! ```
//!
//! The same card and counterpart always produce the same key, so the
//! account address is stable across sessions and restarts.
//!
//! # Example
//!
//! ```
//! use idcard_signer_core::SigningKey;
//!
//! let key = SigningKey::from_derived_secret(&[0x42; 48]).unwrap();
//! let again = SigningKey::from_derived_secret(&[0x42; 48]).unwrap();
//! assert_eq!(key.address(), again.address());
//! ```

use std::fmt;

use alloy_primitives::B256;
use k256::ecdsa::SigningKey as K256SigningKey;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::signature::Signature;

/// A secp256k1 signing key reduced from a card-derived shared secret.
///
/// The key lives only for the duration of one signing job; its scalar is
/// wiped on drop by `k256`.
#[derive(Clone)]
pub struct SigningKey {
    inner: K256SigningKey,
    address: Address,
}

impl SigningKey {
    /// Reduces a derived shared secret to a signing key with SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeriveFailed`] if the secret is empty or its digest is
    /// not a valid secp256k1 scalar (zero or not below the group order).
    pub fn from_derived_secret(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::DeriveFailed("derived secret is empty".to_string()));
        }

        let mut digest = Zeroizing::new([0u8; 32]);
        digest.copy_from_slice(&Sha256::digest(secret));
        let inner = K256SigningKey::from_slice(digest.as_slice())
            .map_err(|_| Error::DeriveFailed("digest is not a valid secp256k1 scalar".to_string()))?;
        let address = Address::from_public_key(inner.verifying_key());

        Ok(Self { inner, address })
    }

    /// Returns the account address controlled by this key.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte prehash and returns a recoverable low-S signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSignature`] if signing fails.
    pub fn sign_hash(&self, hash: &B256) -> Result<Signature> {
        let (signature, recovery_id) = self
            .inner
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| Error::InvalidSignature(e.to_string()))?;

        Signature::from_recoverable(&signature, recovery_id)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
