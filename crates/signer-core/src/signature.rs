//! Recoverable secp256k1 signature type.
//!
//! Ethereum signatures consist of three components:
//!
//! - `r`: The x-coordinate of the ephemeral public key (32 bytes)
//! - `s`: The signature scalar (32 bytes), always in low-S form
//! - `v`: The recovery parameter (`0` or `1`)
//!
//! Legacy transactions fold `v` into the EIP-155 value
//! `chain_id * 2 + 35 + v`; see [`LegacyTransaction::signed_rlp`](crate::LegacyTransaction::signed_rlp).

use k256::ecdsa::{RecoveryId, Signature as K256Signature};

use crate::error::{Error, Result};

/// A recoverable ECDSA signature over secp256k1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    r: [u8; 32],
    s: [u8; 32],
    v: u8,
}

impl Signature {
    /// Creates a new signature from raw components.
    #[must_use]
    pub const fn new(r: [u8; 32], s: [u8; 32], v: u8) -> Self {
        Self { r, s, v }
    }

    /// Builds a signature from a `k256` signature and its recovery id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSignature`] if the signature is in high-S form;
    /// Ethereum rejects those.
    pub fn from_recoverable(signature: &K256Signature, recovery_id: RecoveryId) -> Result<Self> {
        if signature.normalize_s().is_some() {
            return Err(Error::InvalidSignature("signature is not low-S".to_string()));
        }

        let (r_bytes, s_bytes) = signature.split_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&r_bytes);
        s.copy_from_slice(&s_bytes);

        Ok(Self::new(r, s, recovery_id.to_byte()))
    }

    /// Returns the R component of the signature.
    #[must_use]
    pub const fn r(&self) -> &[u8; 32] {
        &self.r
    }

    /// Returns the S component of the signature.
    #[must_use]
    pub const fn s(&self) -> &[u8; 32] {
        &self.s
    }

    /// Returns the recovery parameter (v).
    #[must_use]
    pub const fn v(&self) -> u8 {
        self.v
    }
}
