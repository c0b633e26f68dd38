//! Cryptographic token access.
//!
//! The signer talks to the ID card through a PKCS#11-shaped interface. This
//! module defines that interface as the [`Token`] trait, plus the pieces
//! every implementation shares:
//!
//! - [`SlotSelector`]: picks the one slot carrying the authentication key
//! - [`Pin`]: a zeroized PIN buffer
//! - [`CardSessionManager`]: open/login/find/close lifecycle with a
//!   single-session guarantee
//!
//! # Implementations
//!
//! - [`Pkcs11Token`] (feature `pkcs11`): a vendor PKCS#11 module via `cryptoki`
//! - [`SoftToken`] (feature `soft-token`): an in-process card with a P-384 key
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use idcard_signer_core::token::{CardSessionManager, Pkcs11Token, SlotSelector};
//!
//! let token = Pkcs11Token::load("/usr/lib/opensc-pkcs11.so")?;
//! let pins = Arc::new(|_: &str| -> Result<Pin> { Ok(Pin::from("1234")) });
//! let mut cards = CardSessionManager::new(token, SlotSelector::default(), pins);
//! let session = cards.open_session()?;
//! ```

pub mod session;

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

#[cfg(any(test, feature = "soft-token"))]
pub mod soft;

pub use session::{CardSession, CardSessionManager, SessionState};

#[cfg(feature = "pkcs11")]
pub use pkcs11::Pkcs11Token;

#[cfg(any(test, feature = "soft-token"))]
pub use soft::{AuditEvent, SoftToken};

use std::fmt;

use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Manufacturer prefix of the Estonian ID card PKCS#11 slots.
pub const DEFAULT_SLOT_MANUFACTURER: &str = "AS Sertifitseerimiskeskus";

/// Label fragment of the authentication slot.
pub const DEFAULT_SLOT_LABEL: &str = "PIN1";

/// Key object classes the signer looks up on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// The card's EC public key.
    PublicKey,
    /// The card's EC private key, used as the ECDH base key.
    PrivateKey,
}

impl ObjectClass {
    /// Human-readable class name used in errors and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PublicKey => "public key",
            Self::PrivateKey => "private key",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A slot reported by the token, with its token info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo<S> {
    /// Implementation-specific slot handle.
    pub handle: S,
    /// Token manufacturer id, trimmed.
    pub manufacturer: String,
    /// Token label, trimmed.
    pub label: String,
}

/// Chooses the slot to open by manufacturer prefix and label substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSelector {
    /// The manufacturer id must start with this.
    pub manufacturer_prefix: String,
    /// The label must contain this.
    pub label_contains: String,
}

impl Default for SlotSelector {
    fn default() -> Self {
        Self {
            manufacturer_prefix: DEFAULT_SLOT_MANUFACTURER.to_string(),
            label_contains: DEFAULT_SLOT_LABEL.to_string(),
        }
    }
}

impl SlotSelector {
    /// Creates a selector.
    #[must_use]
    pub fn new(manufacturer_prefix: impl Into<String>, label_contains: impl Into<String>) -> Self {
        Self {
            manufacturer_prefix: manufacturer_prefix.into(),
            label_contains: label_contains.into(),
        }
    }

    /// Whether a slot satisfies this selector.
    #[must_use]
    pub fn matches<S>(&self, slot: &SlotInfo<S>) -> bool {
        slot.manufacturer.starts_with(&self.manufacturer_prefix)
            && slot.label.contains(&self.label_contains)
    }

    /// Picks the single matching slot.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotNotFound`] if no slot matches
    /// - [`Error::AmbiguousSlot`] if more than one slot matches
    pub fn select<S>(&self, slots: Vec<SlotInfo<S>>) -> Result<SlotInfo<S>> {
        let mut matching: Vec<_> = slots.into_iter().filter(|s| self.matches(s)).collect();

        match matching.len() {
            0 => Err(Error::SlotNotFound),
            1 => matching.pop().ok_or(Error::SlotNotFound),
            n => Err(Error::AmbiguousSlot(n)),
        }
    }
}

/// A token PIN, wiped from memory on drop.
#[derive(Clone)]
pub struct Pin(Zeroizing<String>);

impl Pin {
    /// Wraps a PIN.
    #[must_use]
    pub fn new(pin: String) -> Self {
        Self(Zeroizing::new(pin))
    }

    /// Returns the PIN characters.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

impl From<&str> for Pin {
    fn from(pin: &str) -> Self {
        Self::new(pin.to_string())
    }
}

/// A PKCS#11-shaped cryptographic token.
///
/// Implementations wrap a loaded token library (or a simulation of one).
/// Callers must not hold two sessions at once; [`CardSessionManager`]
/// enforces that.
pub trait Token: Send {
    /// Slot handle.
    type Slot: Copy + Send + fmt::Debug;
    /// Open session handle.
    type Session: Send;
    /// Object handle.
    type Object: Copy + Send + fmt::Debug;

    /// Lists slots that currently hold a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token library cannot enumerate slots.
    fn list_slots(&self) -> Result<Vec<SlotInfo<Self::Slot>>>;

    /// Opens a read-write session on a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened.
    fn open_session(&self, slot: Self::Slot) -> Result<Self::Session>;

    /// Authenticates the session as the normal user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoginFailed`] if the PIN is rejected.
    fn login(&self, session: &Self::Session, pin: &Pin) -> Result<()>;

    /// Finds all objects of a class visible in the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    fn find_objects(&self, session: &Self::Session, class: ObjectClass)
    -> Result<Vec<Self::Object>>;

    /// Derives a session-only generic secret by ECDH with the null KDF.
    ///
    /// # Arguments
    ///
    /// * `base` - The private key object
    /// * `public_data` - The counterpart point, SEC1 uncompressed
    /// * `value_len` - Requested secret length in bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeriveFailed`] if the token refuses the derivation.
    fn derive_key(
        &self,
        session: &Self::Session,
        base: Self::Object,
        public_data: &[u8],
        value_len: usize,
    ) -> Result<Self::Object>;

    /// Reads an object's value attribute (`CKA_VALUE`).
    ///
    /// # Errors
    ///
    /// Returns an error if the attribute is missing or not extractable.
    fn get_attribute_value(
        &self,
        session: &Self::Session,
        object: Self::Object,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Ends the authenticated state of the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the token rejects the logout.
    fn logout(&self, session: &Self::Session) -> Result<()>;

    /// Closes a session.
    fn close_session(&self, session: Self::Session);

    /// Releases the token library. Called once, at shutdown.
    fn finalize(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(manufacturer: &str, label: &str, handle: usize) -> SlotInfo<usize> {
        SlotInfo {
            handle,
            manufacturer: manufacturer.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn selector_picks_auth_slot() {
        let selector = SlotSelector::default();
        let chosen = selector
            .select(vec![
                slot("AS Sertifitseerimiskeskus", "MARI-LIIS MÄNNIK (PIN2)", 0),
                slot("AS Sertifitseerimiskeskus", "MARI-LIIS MÄNNIK (PIN1)", 1),
                slot("Yubico", "PIN1", 2),
            ])
            .unwrap();
        assert_eq!(chosen.handle, 1);
    }

    #[test]
    fn selector_zero_matches() {
        let selector = SlotSelector::default();
        let result = selector.select(vec![slot("Yubico", "PIN1", 0)]);
        assert!(matches!(result, Err(Error::SlotNotFound)));
    }

    #[test]
    fn selector_many_matches() {
        let selector = SlotSelector::default();
        let result = selector.select(vec![
            slot(DEFAULT_SLOT_MANUFACTURER, "A (PIN1)", 0),
            slot(DEFAULT_SLOT_MANUFACTURER, "B (PIN1)", 1),
        ]);
        assert!(matches!(result, Err(Error::AmbiguousSlot(2))));
    }

    #[test]
    fn pin_debug_is_redacted() {
        let pin = Pin::from("1234");
        assert_eq!(format!("{pin:?}"), "Pin(<redacted>)");
        assert_eq!(pin.expose(), "1234");
    }
}
