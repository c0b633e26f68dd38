//! An in-process token with a secp384r1 key, for tests.
//!
//! [`SoftToken`] behaves like an ID card behind a PKCS#11 module: two slots
//! (authentication and signing), a PIN-gated private key and a public key
//! object, ECDH derivation with the null KDF. Every call that changes
//! session state is appended to an audit log, which tests use to check that
//! sessions never overlap and always close.
//!
//! Clones share the same card state, so a test can keep one handle for
//! inspection while the other is owned by a
//! [`CardSessionManager`](super::CardSessionManager).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use p384::SecretKey;
use p384::ecdh::diffie_hellman;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use zeroize::Zeroizing;

use super::{DEFAULT_SLOT_MANUFACTURER, ObjectClass, Pin, SlotInfo, Token};
use crate::error::{Error, Result};

const PUBLIC_KEY_OBJECT: u64 = 1;
const PRIVATE_KEY_OBJECT: u64 = 2;
const FIRST_DERIVED_OBJECT: u64 = 100;

/// Byte length of a secp384r1 ECDH output.
pub const P384_SECRET_LEN: usize = 48;

/// A state change recorded by [`SoftToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    /// A session was opened.
    SessionOpened(u64),
    /// A login succeeded.
    LoggedIn(u64),
    /// A login was refused.
    LoginRejected(u64),
    /// A secret was derived.
    Derived(u64),
    /// A session was logged out.
    LoggedOut(u64),
    /// A session was closed.
    SessionClosed(u64),
    /// The library was finalized.
    Finalized,
}

#[derive(Clone)]
struct SoftCard {
    secret: SecretKey,
    pin: String,
    slots: Vec<(String, String)>,
    has_private_key: bool,
    derive_delay: Option<Duration>,
}

#[derive(Default)]
struct SoftState {
    next_session: u64,
    next_object: u64,
    open: HashSet<u64>,
    authenticated: HashSet<u64>,
    derived: HashMap<u64, (u64, Zeroizing<Vec<u8>>)>,
    events: Vec<AuditEvent>,
    max_concurrent: usize,
    finalized: bool,
}

/// A simulated ID card.
#[derive(Clone)]
pub struct SoftToken {
    card: Arc<SoftCard>,
    state: Arc<Mutex<SoftState>>,
}

impl std::fmt::Debug for SoftToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftToken")
            .field("slots", &self.card.slots)
            .finish_non_exhaustive()
    }
}

impl SoftToken {
    /// Creates a card holding `secret`, unlocked by `pin`.
    #[must_use]
    pub fn new(secret: SecretKey, pin: &str) -> Self {
        let slots = vec![
            (
                DEFAULT_SLOT_MANUFACTURER.to_string(),
                "MARI-LIIS MÄNNIK (PIN1)".to_string(),
            ),
            (
                DEFAULT_SLOT_MANUFACTURER.to_string(),
                "MARI-LIIS MÄNNIK (PIN2)".to_string(),
            ),
        ];

        Self {
            card: Arc::new(SoftCard {
                secret,
                pin: pin.to_string(),
                slots,
                has_private_key: true,
                derive_delay: None,
            }),
            state: Arc::new(Mutex::new(SoftState {
                next_session: 1,
                next_object: FIRST_DERIVED_OBJECT,
                ..SoftState::default()
            })),
        }
    }

    /// Adds another slot.
    #[must_use]
    pub fn with_slot(mut self, manufacturer: &str, label: &str) -> Self {
        Arc::make_mut(&mut self.card)
            .slots
            .push((manufacturer.to_string(), label.to_string()));
        self
    }

    /// Hides the private key object.
    #[must_use]
    pub fn without_private_key(mut self) -> Self {
        Arc::make_mut(&mut self.card).has_private_key = false;
        self
    }

    /// Makes every derivation take at least `delay`.
    #[must_use]
    pub fn with_derive_delay(mut self, delay: Duration) -> Self {
        Arc::make_mut(&mut self.card).derive_delay = Some(delay);
        self
    }

    /// The card's public key, SEC1 uncompressed.
    #[must_use]
    pub fn public_key_sec1(&self) -> Vec<u8> {
        self.card
            .secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// A copy of the audit log.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Number of sessions ever opened.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.count(|e| matches!(e, AuditEvent::SessionOpened(_)))
    }

    /// Number of derivations performed.
    #[must_use]
    pub fn derivations(&self) -> usize {
        self.count(|e| matches!(e, AuditEvent::Derived(_)))
    }

    /// Sessions open right now.
    #[must_use]
    pub fn open_session_count(&self) -> usize {
        self.state.lock().map(|s| s.open.len()).unwrap_or_default()
    }

    /// The most sessions that were ever open at the same time.
    #[must_use]
    pub fn max_concurrent_sessions(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.max_concurrent)
            .unwrap_or_default()
    }

    fn count(&self, pred: impl Fn(&AuditEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    fn state(&self) -> Result<MutexGuard<'_, SoftState>> {
        self.state
            .lock()
            .map_err(|_| Error::Token("soft token state poisoned".to_string()))
    }

    fn require_open(state: &SoftState, session: u64) -> Result<()> {
        if state.finalized {
            return Err(Error::Token("CKR_CRYPTOKI_NOT_INITIALIZED".to_string()));
        }
        if !state.open.contains(&session) {
            return Err(Error::Token("CKR_SESSION_HANDLE_INVALID".to_string()));
        }
        Ok(())
    }
}

impl Token for SoftToken {
    type Slot = usize;
    type Session = u64;
    type Object = u64;

    fn list_slots(&self) -> Result<Vec<SlotInfo<usize>>> {
        Ok(self
            .card
            .slots
            .iter()
            .enumerate()
            .map(|(handle, (manufacturer, label))| SlotInfo {
                handle,
                manufacturer: manufacturer.clone(),
                label: label.clone(),
            })
            .collect())
    }

    fn open_session(&self, slot: usize) -> Result<u64> {
        if slot >= self.card.slots.len() {
            return Err(Error::Token("CKR_SLOT_ID_INVALID".to_string()));
        }

        let mut state = self.state()?;
        if state.finalized {
            return Err(Error::Token("CKR_CRYPTOKI_NOT_INITIALIZED".to_string()));
        }

        let id = state.next_session;
        state.next_session += 1;
        state.open.insert(id);
        state.max_concurrent = state.max_concurrent.max(state.open.len());
        state.events.push(AuditEvent::SessionOpened(id));
        Ok(id)
    }

    fn login(&self, session: &u64, pin: &Pin) -> Result<()> {
        let mut state = self.state()?;
        Self::require_open(&state, *session)?;

        if pin.expose() != self.card.pin {
            state.events.push(AuditEvent::LoginRejected(*session));
            return Err(Error::LoginFailed("CKR_PIN_INCORRECT".to_string()));
        }

        state.authenticated.insert(*session);
        state.events.push(AuditEvent::LoggedIn(*session));
        Ok(())
    }

    fn find_objects(&self, session: &u64, class: ObjectClass) -> Result<Vec<u64>> {
        let state = self.state()?;
        Self::require_open(&state, *session)?;

        Ok(match class {
            ObjectClass::PublicKey => vec![PUBLIC_KEY_OBJECT],
            // Private objects are only visible after login.
            ObjectClass::PrivateKey
                if self.card.has_private_key && state.authenticated.contains(session) =>
            {
                vec![PRIVATE_KEY_OBJECT]
            }
            ObjectClass::PrivateKey => vec![],
        })
    }

    fn derive_key(
        &self,
        session: &u64,
        base: u64,
        public_data: &[u8],
        value_len: usize,
    ) -> Result<u64> {
        {
            let state = self.state()?;
            Self::require_open(&state, *session)?;
            if !state.authenticated.contains(session) {
                return Err(Error::DeriveFailed("CKR_USER_NOT_LOGGED_IN".to_string()));
            }
        }

        if base != PRIVATE_KEY_OBJECT || !self.card.has_private_key {
            return Err(Error::DeriveFailed("CKR_KEY_HANDLE_INVALID".to_string()));
        }
        if value_len == 0 || value_len > P384_SECRET_LEN {
            return Err(Error::DeriveFailed("CKR_TEMPLATE_INCONSISTENT".to_string()));
        }

        let peer = p384::PublicKey::from_sec1_bytes(public_data)
            .map_err(|_| Error::DeriveFailed("CKR_DOMAIN_PARAMS_INVALID".to_string()))?;

        if let Some(delay) = self.card.derive_delay {
            thread::sleep(delay);
        }

        let shared = diffie_hellman(self.card.secret.to_nonzero_scalar(), peer.as_affine());
        let value = Zeroizing::new(shared.raw_secret_bytes()[..value_len].to_vec());

        let mut state = self.state()?;
        Self::require_open(&state, *session)?;
        let id = state.next_object;
        state.next_object += 1;
        state.derived.insert(id, (*session, value));
        state.events.push(AuditEvent::Derived(*session));
        Ok(id)
    }

    fn get_attribute_value(&self, session: &u64, object: u64) -> Result<Zeroizing<Vec<u8>>> {
        let state = self.state()?;
        Self::require_open(&state, *session)?;

        match object {
            PUBLIC_KEY_OBJECT => Ok(Zeroizing::new(self.public_key_sec1())),
            PRIVATE_KEY_OBJECT => Err(Error::Token("CKR_ATTRIBUTE_SENSITIVE".to_string())),
            id => state
                .derived
                .get(&id)
                .filter(|(owner, _)| owner == session)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Error::Token("CKR_OBJECT_HANDLE_INVALID".to_string())),
        }
    }

    fn logout(&self, session: &u64) -> Result<()> {
        let mut state = self.state()?;
        Self::require_open(&state, *session)?;

        if !state.authenticated.remove(session) {
            return Err(Error::Token("CKR_USER_NOT_LOGGED_IN".to_string()));
        }
        state.events.push(AuditEvent::LoggedOut(*session));
        Ok(())
    }

    fn close_session(&self, session: u64) {
        if let Ok(mut state) = self.state.lock()
            && state.open.remove(&session)
        {
            state.authenticated.remove(&session);
            // Session objects die with their session.
            state.derived.retain(|_, (owner, _)| *owner != session);
            state.events.push(AuditEvent::SessionClosed(session));
        }
    }

    fn finalize(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.open.clear();
            state.authenticated.clear();
            state.derived.clear();
            state.finalized = true;
            state.events.push(AuditEvent::Finalized);
        }
    }
}
