//! CryptoObfuscator string decrypter.

use crate::{
    deobfuscation::{
        codecs,
        context::Session,
        fingerprint,
        inliner::StaticStringInliner,
        obfuscators::{assembly_simple_name, decrypt_resource, other_methods, Family},
        payload::{self, PayloadSource},
        rpc::Value,
    },
    metadata::{module::Module, token::Token},
    Result,
};

use super::{decode_name, decrypt_resource_name};

/// The `String(Int32)` decrypter and its resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDecrypter {
    /// Decrypter type
    pub decrypter_type: Token,
    /// `String(Int32)` decrypter
    pub decrypter: Token,
    /// Decrypted resource, filled by [`StringDecrypter::initialize`]
    pub data: Option<Vec<u8>>,
}

impl StringDecrypter {
    /// Find the decrypter type: non-public, one or two fields including a `Byte[]`, two
    /// or three methods and no nested types. The decrypter is the last `String(Int32)`
    /// method before the first other non-constructor method.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        module.types().into_iter().find_map(|ty| {
            let def = module.type_def(ty)?;
            if def.is_public()
                || !(1..=2).contains(&def.fields.len())
                || fingerprint::find_field(module, ty, "System.Byte[]").is_none()
                || !(2..=3).contains(&def.methods.len())
                || !def.nested_types.is_empty()
            {
                return None;
            }

            let mut decrypter = None;
            for method in other_methods(module, ty) {
                if module
                    .method(method)
                    .is_some_and(|m| m.is_method("System.String", &["System.Int32"]))
                {
                    decrypter = Some(method);
                } else {
                    break;
                }
            }
            Some(StringDecrypter {
                decrypter_type: ty,
                decrypter: decrypter?,
                data: None,
            })
        })
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(StringDecrypter {
            decrypter_type: new.rebind_type(old, self.decrypter_type)?,
            decrypter: new.rebind_method(old, self.decrypter)?,
            data: self.data.clone(),
        })
    }

    /// The resource name the `.cctor` spells out, either as is or base64 encoded, or
    /// computes at run time, or the doubled assembly name.
    #[must_use]
    pub fn resource_name(&self, module: &Module) -> String {
        let default = {
            let name = assembly_simple_name(module);
            format!("{name}{name}")
        };
        let Some(cctor) = module.type_cctor(self.decrypter_type) else {
            return default;
        };
        for s in fingerprint::code_strings(module, cctor) {
            if module.resource(&s).is_some() {
                return s;
            }
            if let Some(decoded) = decode_name(&s) {
                return decoded;
            }
            if let Some(decoded) =
                decrypt_resource_name(module, cctor).and_then(|computed| decode_name(&computed))
            {
                return decoded;
            }
        }
        default
    }

    /// Locate and decrypt the string resource.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if the resource or the resource
    /// decrypter is missing.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let name = self.resource_name(module);
        let found = payload::locate(module, &[PayloadSource::Resource(name)])?;
        deob_verbose!(
            session.logger,
            "Adding string decrypter. Resource: {:?}",
            found.resource_name().unwrap_or_default()
        );
        self.data = Some(decrypt_resource(session, Family::CryptoObfuscator, &found.data)?);
        Ok(())
    }

    /// Inline all decrypter calls.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let Some(data) = &self.data else {
            return Ok(0);
        };
        let mut inliner = StaticStringInliner::new();
        inliner.add(self.decrypter, |args| match args {
            [Value::Int32(offset)] => {
                let offset = usize::try_from(*offset)
                    .map_err(|_| decode_error!("Negative string offset {}", offset))?;
                codecs::read_varint_utf16_string(data, offset)
            }
            _ => Err(decode_error!("Expected one Int32 offset")),
        });
        inliner.inline(module, session)
    }
}
