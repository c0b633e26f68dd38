//! PKCS#11 token adapter for native card access.
//!
//! This module provides a [`Token`] implementation over a vendor PKCS#11
//! module (for Estonian ID cards, the OpenSC or `opensc-pkcs11.so` library)
//! loaded at runtime through `cryptoki`.
//!
//! # Example
//!
//! ```ignore
//! use idcard_signer_core::token::Pkcs11Token;
//!
//! let token = Pkcs11Token::load("/usr/lib/x86_64-linux-gnu/opensc-pkcs11.so")?;
//! for slot in token.list_slots()? {
//!     println!("{} / {}", slot.manufacturer, slot.label);
//! }
//! ```

use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::mechanism::elliptic_curve::{EcKdf, Ecdh1DeriveParams};
use cryptoki::object::{
    Attribute, AttributeType, KeyType, ObjectClass as CkObjectClass, ObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use tracing::debug;
use zeroize::Zeroizing;

use super::{ObjectClass, Pin, SlotInfo, Token};
use crate::error::{Error, Result};

/// A loaded and initialized PKCS#11 module.
pub struct Pkcs11Token {
    /// `None` once finalized.
    ctx: Option<Pkcs11>,
}

impl std::fmt::Debug for Pkcs11Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Token")
            .field("initialized", &self.ctx.is_some())
            .finish_non_exhaustive()
    }
}

impl Pkcs11Token {
    /// Loads the module at `path` and calls `C_Initialize`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Token`] if the library cannot be loaded or initialized.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ctx = Pkcs11::new(path)
            .map_err(|e| Error::Token(format!("loading {}: {e}", path.display())))?;
        ctx.initialize(CInitializeArgs::OsThreads)?;
        debug!(library = %path.display(), "PKCS#11 module initialized");

        Ok(Self { ctx: Some(ctx) })
    }

    fn ctx(&self) -> Result<&Pkcs11> {
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::Token("PKCS#11 module already finalized".to_string()))
    }
}

impl Token for Pkcs11Token {
    type Slot = Slot;
    type Session = Session;
    type Object = ObjectHandle;

    fn list_slots(&self) -> Result<Vec<SlotInfo<Slot>>> {
        let ctx = self.ctx()?;

        ctx.get_slots_with_token()?
            .into_iter()
            .map(|slot| -> Result<SlotInfo<Slot>> {
                let info = ctx.get_token_info(slot)?;
                debug!(
                    ?slot,
                    manufacturer = info.manufacturer_id(),
                    label = info.label(),
                    "found slot"
                );
                Ok(SlotInfo {
                    handle: slot,
                    manufacturer: info.manufacturer_id().trim().to_string(),
                    label: info.label().trim().to_string(),
                })
            })
            .collect()
    }

    fn open_session(&self, slot: Slot) -> Result<Session> {
        Ok(self.ctx()?.open_rw_session(slot)?)
    }

    fn login(&self, session: &Session, pin: &Pin) -> Result<()> {
        let pin = AuthPin::new(pin.expose().to_owned());
        session
            .login(UserType::User, Some(&pin))
            .map_err(|e| Error::LoginFailed(e.to_string()))
    }

    fn find_objects(&self, session: &Session, class: ObjectClass) -> Result<Vec<ObjectHandle>> {
        let class = match class {
            ObjectClass::PublicKey => CkObjectClass::PUBLIC_KEY,
            ObjectClass::PrivateKey => CkObjectClass::PRIVATE_KEY,
        };

        Ok(session.find_objects(&[Attribute::Class(class)])?)
    }

    fn derive_key(
        &self,
        session: &Session,
        base: ObjectHandle,
        public_data: &[u8],
        value_len: usize,
    ) -> Result<ObjectHandle> {
        let value_len = u64::try_from(value_len)
            .map_err(|_| Error::DeriveFailed(format!("secret length {value_len} out of range")))?;

        let params = Ecdh1DeriveParams::new(EcKdf::null(), public_data);
        let mechanism = Mechanism::Ecdh1Derive(params);

        // Session-only, extractable generic secret.
        let template = [
            Attribute::Token(false),
            Attribute::Class(CkObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::GENERIC_SECRET),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
            Attribute::Encrypt(true),
            Attribute::Decrypt(true),
            Attribute::Unwrap(true),
            Attribute::Wrap(true),
            Attribute::ValueLen(value_len.into()),
        ];

        session
            .derive_key(&mechanism, base, &template)
            .map_err(|e| Error::DeriveFailed(e.to_string()))
    }

    fn get_attribute_value(
        &self,
        session: &Session,
        object: ObjectHandle,
    ) -> Result<Zeroizing<Vec<u8>>> {
        session
            .get_attributes(object, &[AttributeType::Value])?
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::Value(value) => Some(Zeroizing::new(value)),
                _ => None,
            })
            .ok_or_else(|| Error::Token("object has no value attribute".to_string()))
    }

    fn logout(&self, session: &Session) -> Result<()> {
        Ok(session.logout()?)
    }

    fn close_session(&self, session: Session) {
        // C_CloseSession runs on drop.
        drop(session);
    }

    fn finalize(&mut self) {
        // C_Finalize runs once the last context handle drops.
        drop(self.ctx.take());
    }
}
