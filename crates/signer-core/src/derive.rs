//! Card-side key agreement and its reduction to a signing key.
//!
//! [`KeyDerivationEngine::derive`] asks the card to run ECDH between its
//! private key and a fixed [`CounterpartPoint`], reads the raw agreed value
//! back, and hashes it into a [`SigningKey`]. The card's public key value is
//! never part of the computation.

use std::fmt;

use tracing::debug;

use crate::crypto::SigningKey;
use crate::error::{Error, Result};
use crate::token::{CardSession, Token};

/// The counterpart point used in production, a secp384r1 point in SEC1
/// uncompressed form.
pub const DEFAULT_COUNTERPART_POINT: &str = "04E99F8F25F1AFD4BD18AAF4CD2B1770586640636E14707477825662E6FAD5CB0C8E27C5B19A9E718C0503B9CE90005102082B2E148BBEF53B7C88AF3CD75EE667BD502A8FB2BF3F40F919F60E2672B3C8CED895070285079C9A20961F44F10A77";

/// [`DEFAULT_COUNTERPART_POINT`] as bytes.
const DEFAULT_COUNTERPART_BYTES: [u8; 97] = [
    0x04,
    0xe9, 0x9f, 0x8f, 0x25, 0xf1, 0xaf, 0xd4, 0xbd, 0x18, 0xaa, 0xf4, 0xcd,
    0x2b, 0x17, 0x70, 0x58, 0x66, 0x40, 0x63, 0x6e, 0x14, 0x70, 0x74, 0x77,
    0x82, 0x56, 0x62, 0xe6, 0xfa, 0xd5, 0xcb, 0x0c, 0x8e, 0x27, 0xc5, 0xb1,
    0x9a, 0x9e, 0x71, 0x8c, 0x05, 0x03, 0xb9, 0xce, 0x90, 0x00, 0x51, 0x02,
    0x08, 0x2b, 0x2e, 0x14, 0x8b, 0xbe, 0xf5, 0x3b, 0x7c, 0x88, 0xaf, 0x3c,
    0xd7, 0x5e, 0xe6, 0x67, 0xbd, 0x50, 0x2a, 0x8f, 0xb2, 0xbf, 0x3f, 0x40,
    0xf9, 0x19, 0xf6, 0x0e, 0x26, 0x72, 0xb3, 0xc8, 0xce, 0xd8, 0x95, 0x07,
    0x02, 0x85, 0x07, 0x9c, 0x9a, 0x20, 0x96, 0x1f, 0x44, 0xf1, 0x0a, 0x77,
];

/// Length of the raw secp384r1 ECDH output.
pub const DEFAULT_SECRET_LEN: usize = 48;

/// A fixed public point in SEC1 uncompressed encoding (`0x04 || x || y`).
#[derive(Clone, PartialEq, Eq)]
pub struct CounterpartPoint(Vec<u8>);

impl CounterpartPoint {
    /// Wraps SEC1 uncompressed bytes.
    ///
    /// Only the encoding is checked here; whether the point lies on the
    /// card's curve is the card's call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] if the bytes are not an
    /// uncompressed point.
    pub fn from_sec1(bytes: Vec<u8>) -> Result<Self> {
        if bytes.first() != Some(&0x04) {
            return Err(Error::InvalidPublicKey(
                "counterpart point must be SEC1 uncompressed (0x04 prefix)".to_string(),
            ));
        }
        if bytes.len() < 3 || (bytes.len() - 1) % 2 != 0 {
            return Err(Error::InvalidPublicKey(format!(
                "counterpart point has odd coordinate length ({} bytes)",
                bytes.len()
            )));
        }

        Ok(Self(bytes))
    }

    /// Parses a hex-encoded point, with or without `0x`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HexDecodeFailed`] or [`Error::InvalidPublicKey`].
    pub fn from_hex(input: &str) -> Result<Self> {
        let digits = input.trim().trim_start_matches("0x");
        Self::from_sec1(hex::decode(digits)?)
    }

    /// The encoded point.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for CounterpartPoint {
    fn default() -> Self {
        Self(DEFAULT_COUNTERPART_BYTES.to_vec())
    }
}

impl fmt::Debug for CounterpartPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CounterpartPoint(0x{})", hex::encode(&self.0))
    }
}

/// Turns an authenticated card session into a [`SigningKey`].
#[derive(Debug, Clone)]
pub struct KeyDerivationEngine {
    counterpart: CounterpartPoint,
    secret_len: usize,
}

impl Default for KeyDerivationEngine {
    fn default() -> Self {
        Self::new(CounterpartPoint::default(), DEFAULT_SECRET_LEN)
    }
}

impl KeyDerivationEngine {
    /// Creates an engine for a counterpart point and secret length.
    #[must_use]
    pub const fn new(counterpart: CounterpartPoint, secret_len: usize) -> Self {
        Self {
            counterpart,
            secret_len,
        }
    }

    /// The counterpart point.
    #[must_use]
    pub const fn counterpart(&self) -> &CounterpartPoint {
        &self.counterpart
    }

    /// Computes `SHA-256(ECDH(card_private_key, counterpart))`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeriveFailed`] if the card refuses the derivation or
    /// returns a secret of the wrong length, or [`Error::SessionClosed`] if
    /// the session is not authenticated.
    pub fn derive<T: Token>(&self, session: &CardSession<'_, T>) -> Result<SigningKey> {
        let secret = session.derive_shared_secret(self.counterpart.as_bytes(), self.secret_len)?;

        if secret.len() != self.secret_len {
            return Err(Error::DeriveFailed(format!(
                "card returned {} secret bytes, expected {}",
                secret.len(),
                self.secret_len
            )));
        }

        let key = SigningKey::from_derived_secret(&secret)?;
        debug!(address = %key.address(), "derived signing key");
        Ok(key)
    }
}
