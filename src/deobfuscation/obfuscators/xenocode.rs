//! Xenocode string encryption.
//!
//! The decrypter lives in a field-less type with at most three methods. Its
//! non-constructor methods are all `String(String,Int32)`; the last one is the decrypter
//! and references the key step constant. Calls take the encoded string and a per-site magic and are inlined in
//! process with [`codecs::xenocode_decode`].

use crate::{
    deobfuscation::{
        codecs::{self, XENOCODE_KEY_STEP},
        context::Session,
        fingerprint,
        inliner::StaticStringInliner,
        obfuscators::other_methods,
        rpc::Value,
    },
    metadata::{module::Module, token::Token},
    Result,
};

/// A detected Xenocode string decrypter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xenocode {
    /// Type holding the decrypter
    pub decrypter_type: Token,
    /// `String(String,Int32)` decrypter
    pub decrypter: Token,
}

impl Xenocode {
    /// Find the decrypter type.
    ///
    /// # Errors
    /// Never fails; the signature is kept uniform with the other families.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        for ty in module.types() {
            let Some(def) = module.type_def(ty) else {
                continue;
            };
            if !def.fields.is_empty()
                || !(1..=3).contains(&def.methods.len())
                || !def.properties.is_empty()
                || !def.events.is_empty()
            {
                continue;
            }

            // the last String(String,Int32); any other method disqualifies the type
            let mut found = None;
            for method in other_methods(module, ty) {
                if module
                    .method(method)
                    .is_some_and(|m| m.is_method("System.String", &["System.String", "System.Int32"]))
                {
                    found = Some(method);
                } else {
                    found = None;
                    break;
                }
            }
            let Some(method) = found else {
                continue;
            };
            if module.method(method).is_none_or(|m| m.body.is_none())
                || !fingerprint::has_int(module, method, XENOCODE_KEY_STEP)
            {
                continue;
            }

            return Ok(Some(Xenocode {
                decrypter_type: ty,
                decrypter: method,
            }));
        }
        Ok(None)
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(Xenocode {
            decrypter_type: new.rebind_type(old, self.decrypter_type)?,
            decrypter: new.rebind_method(old, self.decrypter)?,
        })
    }

    /// Inline every decrypter call. Returns the number of strings inlined.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        if !session.config.decrypt_strings {
            return Ok(0);
        }
        let mut inliner = StaticStringInliner::new();
        inliner.add(self.decrypter, |args| match args {
            [Value::String(encrypted), Value::Int32(magic)] => {
                Ok(codecs::xenocode_decode(encrypted, *magic))
            }
            _ => Err(decode_error!("Unexpected Xenocode decrypter arguments")),
        });
        inliner.inline(module, session)
    }
}
