//! Ethereum address derivation and recipient validation.
//!
//! The account address is computed from the secp256k1 public key of the
//! card-derived [`SigningKey`](crate::SigningKey) the standard way:
//!
//! 1. Take the uncompressed public key (65 bytes: `0x04 || x || y`)
//! 2. Remove the `0x04` prefix to get 64 bytes (`x || y`)
//! 3. Compute the Keccak-256 hash of the 64 bytes
//! 4. Take the last 20 bytes of the hash as the address
//!
//! Because the signing key is a pure function of the card's private key and
//! a fixed counterpart point, the address is stable across sessions.
//!
//! # Example
//!
//! ```
//! use idcard_signer_core::Address;
//!
//! let addr = Address::parse_recipient("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
//! assert_eq!(addr.to_checksum_hex(), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
//! ```

use std::fmt;

use alloy_primitives::{Address as AlloyAddress, keccak256};
use k256::ecdsa::VerifyingKey;
use serde::Serialize;

use crate::error::{Error, Result};

/// An Ethereum address (20 bytes).
///
/// This is a wrapper around [`alloy_primitives::Address`] that adds
/// derivation from secp256k1 public keys and strict recipient parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Address(AlloyAddress);

impl Address {
    /// The length of an Ethereum address in bytes.
    pub const BYTE_LEN: usize = 20;

    /// Creates a new address from a 20-byte array.
    #[must_use]
    pub const fn new(bytes: [u8; Self::BYTE_LEN]) -> Self {
        Self(AlloyAddress::new(bytes))
    }

    /// Returns the zero address (`0x0000...0000`).
    #[must_use]
    pub const fn zero() -> Self {
        Self(AlloyAddress::ZERO)
    }

    /// Derives an Ethereum address from a secp256k1 public key.
    ///
    /// # Arguments
    ///
    /// * `public_key` - A reference to a secp256k1 verifying key
    ///
    /// # Returns
    ///
    /// The derived Ethereum [`Address`].
    #[must_use]
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let encoded = public_key.to_encoded_point(false);
        let uncompressed = encoded.as_bytes();

        // Drop the 0x04 tag, hash x || y
        let hash = keccak256(&uncompressed[1..]);

        let mut address_bytes = [0u8; Self::BYTE_LEN];
        address_bytes.copy_from_slice(&hash[12..]);

        Self::new(address_bytes)
    }

    /// Parses a transfer recipient.
    ///
    /// Accepts 40 hex digits with an optional `0x` or `0X` prefix. All-lowercase and
    /// all-uppercase inputs are accepted as-is; mixed-case input must carry a
    /// valid EIP-55 checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecipient`] if the input is not a valid address.
    ///
    /// # Example
    ///
    /// ```
    /// use idcard_signer_core::{Address, Error};
    ///
    /// assert!(Address::parse_recipient("0xabc").is_err());
    /// assert!(matches!(
    ///     Address::parse_recipient("0x5aaeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
    ///     Err(Error::InvalidRecipient(_))
    /// ));
    /// ```
    pub fn parse_recipient(input: &str) -> Result<Self> {
        let digits = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .unwrap_or(input);

        if digits.len() != Self::BYTE_LEN * 2 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidRecipient(input.to_string()));
        }

        let bytes =
            hex::decode(digits).map_err(|_| Error::InvalidRecipient(input.to_string()))?;
        let mut address_bytes = [0u8; Self::BYTE_LEN];
        address_bytes.copy_from_slice(&bytes);
        let address = Self::new(address_bytes);

        let has_lower = digits.bytes().any(|b| b.is_ascii_lowercase());
        let has_upper = digits.bytes().any(|b| b.is_ascii_uppercase());
        if has_lower && has_upper && address.to_checksum_hex()[2..] != *digits {
            return Err(Error::InvalidRecipient(input.to_string()));
        }

        Ok(address)
    }

    /// Returns the [`Address`] as an EIP-55 checksummed hex string.
    #[must_use]
    pub fn to_checksum_hex(&self) -> String {
        self.0.to_checksum(None)
    }

    /// Returns the inner [`alloy_primitives::Address`].
    #[must_use]
    pub const fn inner(&self) -> AlloyAddress {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_checksum_hex())
    }
}

impl From<AlloyAddress> for Address {
    fn from(addr: AlloyAddress) -> Self {
        Self(addr)
    }
}

impl From<Address> for AlloyAddress {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self::new(bytes)
    }
}
