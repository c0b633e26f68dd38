//! Card session lifecycle.
//!
//! [`CardSessionManager`] owns the token for the life of the process and
//! hands out at most one [`CardSession`] at a time. Opening a session runs
//! the whole bring-up sequence:
//!
//! 1. Enumerate slots and select the unique one matching the [`SlotSelector`]
//! 2. Open a read-write session
//! 3. Prompt for the PIN and log in
//! 4. Locate exactly one public and one private key object
//!
//! A [`CardSession`] logs out and closes itself when dropped, so every exit
//! path (success, error, panic unwinding) releases the card. The token
//! library itself is finalized once, when the manager shuts down.
//!
//! # Example
//!
//! ```ignore
//! let secret = cards.with_session(|session| {
//!     session.derive_shared_secret(&counterpart, 48)
//! })?;
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ObjectClass, SlotSelector, Token};
use crate::error::{Error, Result};
use crate::operator::PinEntry;

/// Authentication state of a [`CardSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, PIN not yet accepted.
    Unauthenticated,
    /// Logged in as the normal user.
    Authenticated,
    /// Logged out and released.
    Closed,
}

/// Owns a token and serializes access to it.
pub struct CardSessionManager<T: Token> {
    token: T,
    selector: SlotSelector,
    pin_entry: Arc<dyn PinEntry>,
    finalized: bool,
}

impl<T: Token> fmt::Debug for CardSessionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSessionManager")
            .field("selector", &self.selector)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl<T: Token> CardSessionManager<T> {
    /// Creates a manager over an initialized token.
    pub fn new(token: T, selector: SlotSelector, pin_entry: Arc<dyn PinEntry>) -> Self {
        Self {
            token,
            selector,
            pin_entry,
            finalized: false,
        }
    }

    /// Returns the slot selector.
    #[must_use]
    pub const fn selector(&self) -> &SlotSelector {
        &self.selector
    }

    /// Opens and authenticates a session on the selected slot.
    ///
    /// The returned session borrows the manager mutably, so a second session
    /// cannot be opened until the first is dropped.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] if the manager has been shut down
    /// - [`Error::SlotNotFound`] / [`Error::AmbiguousSlot`] from slot selection
    /// - [`Error::LoginFailed`] if the PIN is rejected
    /// - [`Error::KeyObjectNotFound`] / [`Error::AmbiguousKeyObject`] from key lookup
    pub fn open_session(&mut self) -> Result<CardSession<'_, T>> {
        if self.finalized {
            return Err(Error::SessionClosed);
        }

        let slot = self.selector.select(self.token.list_slots()?)?;
        debug!(label = %slot.label, manufacturer = %slot.manufacturer, "selected token slot");

        let handle = self.token.open_session(slot.handle)?;
        let mut session = CardSession {
            token: &self.token,
            handle: Some(handle),
            state: SessionState::Unauthenticated,
            slot_label: slot.label,
            public_key: None,
            private_key: None,
        };
        debug!("card session opened");

        // Any early return below drops `session`, which closes it.
        let pin = self.pin_entry.read_pin(&session.slot_label)?;
        session.login(&pin)?;
        drop(pin);

        session.public_key = Some(session.find_unique(ObjectClass::PublicKey)?);
        session.private_key = Some(session.find_unique(ObjectClass::PrivateKey)?);

        Ok(session)
    }

    /// Runs `f` inside a fresh session, closing it on every exit path.
    ///
    /// # Errors
    ///
    /// Returns any [`open_session`](Self::open_session) error, or `f`'s error.
    pub fn with_session<R>(
        &mut self,
        f: impl FnOnce(&mut CardSession<'_, T>) -> Result<R>,
    ) -> Result<R> {
        let mut session = self.open_session()?;
        let result = f(&mut session);
        session.close();
        result
    }

    /// Finalizes the token library. Later calls are no-ops.
    pub fn shutdown(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.token.finalize();
            info!("token library finalized");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl<T: Token> Drop for CardSessionManager<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One open connection to the card.
pub struct CardSession<'a, T: Token> {
    token: &'a T,
    handle: Option<T::Session>,
    state: SessionState,
    slot_label: String,
    public_key: Option<T::Object>,
    private_key: Option<T::Object>,
}

impl<T: Token> fmt::Debug for CardSession<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSession")
            .field("state", &self.state)
            .field("slot_label", &self.slot_label)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key)
            .finish_non_exhaustive()
    }
}

impl<T: Token> CardSession<'_, T> {
    /// Current authentication state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Label of the slot this session runs on.
    #[must_use]
    pub fn slot_label(&self) -> &str {
        &self.slot_label
    }

    /// The card's public key object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] after [`close`](Self::close).
    pub fn public_key(&self) -> Result<T::Object> {
        self.public_key.ok_or(Error::SessionClosed)
    }

    /// The card's private key object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] after [`close`](Self::close).
    pub fn private_key(&self) -> Result<T::Object> {
        self.private_key.ok_or(Error::SessionClosed)
    }

    /// Runs ECDH between the card's private key and `public_data`, then
    /// reads back the raw agreed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session is not authenticated,
    /// or [`Error::DeriveFailed`] if the card refuses.
    pub fn derive_shared_secret(
        &self,
        public_data: &[u8],
        value_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let handle = self.authenticated_handle()?;
        let base = self.private_key()?;

        let secret = self
            .token
            .derive_key(handle, base, public_data, value_len)?;
        debug!("derived secret object on card");

        self.token
            .get_attribute_value(handle, secret)
            .map_err(|e| Error::DeriveFailed(format!("reading derived secret: {e}")))
    }

    /// Logs out and releases the session. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if self.state == SessionState::Authenticated
            && let Err(e) = self.token.logout(&handle)
        {
            warn!(error = %e, "token logout failed");
        }

        self.token.close_session(handle);
        self.state = SessionState::Closed;
        self.public_key = None;
        self.private_key = None;
        debug!("card session closed");
    }

    fn login(&mut self, pin: &super::Pin) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(Error::SessionClosed)?;
        self.token.login(handle, pin)?;
        self.state = SessionState::Authenticated;
        debug!("card session authenticated");
        Ok(())
    }

    fn find_unique(&self, class: ObjectClass) -> Result<T::Object> {
        let handle = self.authenticated_handle()?;
        let mut found = self.token.find_objects(handle, class)?;

        match found.len() {
            0 => Err(Error::KeyObjectNotFound(class.name())),
            1 => found.pop().ok_or(Error::KeyObjectNotFound(class.name())),
            n => Err(Error::AmbiguousKeyObject(class.name(), n)),
        }
    }

    fn authenticated_handle(&self) -> Result<&T::Session> {
        match (&self.handle, self.state) {
            (Some(handle), SessionState::Authenticated) => Ok(handle),
            _ => Err(Error::SessionClosed),
        }
    }
}

impl<T: Token> Drop for CardSession<'_, T> {
    fn drop(&mut self) {
        self.close();
    }
}
