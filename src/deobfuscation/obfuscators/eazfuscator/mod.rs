//! Eazfuscator.NET.
//!
//! Strings go through a static `String(Int32)` decrypter whose implementation changed
//! with nearly every release, so they are decrypted by the dynamic worker. The release
//! is still identified from the decrypter's shape (see [`version`]). Resources may live
//! in embedded satellite assemblies served by a [`ResourceResolver`].

mod dynocode;
mod resources;
mod version;

pub use dynocode::{
    DynocodeIterator, CALL_GET_CURRENT, CALL_MOVE_NEXT, CREATE_ENUMERABLE, CREATE_ENUMERATOR,
    DYNOCODE_SERVICE, WRITE_ENUMERABLE_FIELD,
};
pub use resources::ResourceResolver;
pub use version::detect_version;

use crate::{
    deobfuscation::{context::Session, fingerprint, inliner::DynamicStringInliner},
    metadata::{module::Module, token::Token},
    Result,
};

/// The string decrypter and its release range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDecrypter {
    /// Decrypter class
    pub decrypter_type: Token,
    /// Static `String(Int32)` decrypter
    pub decrypter: Token,
    /// 5.x: the method the decrypter stub forwards to
    pub real_method: Option<Token>,
    /// Detected release range
    pub version: &'static str,
}

impl StringDecrypter {
    /// The first decrypter candidate whose release can be identified.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        module.types().into_iter().find_map(|ty| {
            module.type_cctor(ty)?;
            if fingerprint::find_field(module, ty, "System.Byte[]").is_none() {
                return None;
            }
            fingerprint::find_methods(module, ty, "System.String", &["System.Int32"])
                .into_iter()
                .filter(|&m| module.method(m).is_some_and(|m| m.is_static()))
                .find_map(|decrypter| {
                    let real_method = find_real_method(module, ty, decrypter);
                    let version = detect_version(module, decrypter, real_method)?;
                    Some(StringDecrypter {
                        decrypter_type: ty,
                        decrypter,
                        real_method,
                        version,
                    })
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
            real_method: self
                .real_method
                .map(|m| new.rebind_method(old, m))
                .transpose()?,
            version: self.version,
        })
    }
}

/// A static `String` method of the same class that the decrypter calls.
fn find_real_method(module: &Module, ty: Token, decrypter: Token) -> Option<Token> {
    fingerprint::called_methods(module, decrypter)
        .into_iter()
        .find(|&m| {
            m != decrypter
                && module.method(m).is_some_and(|def| {
                    def.declaring_type == ty
                        && def.is_static()
                        && def.signature.return_type == "System.String"
                })
        })
}

/// A detected Eazfuscator.NET module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eazfuscator {
    /// String decrypter
    pub strings: Option<StringDecrypter>,
    /// Satellite resource resolver
    pub resources: Option<ResourceResolver>,
}

impl Eazfuscator {
    /// Find the string decrypter and the resource resolver.
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let found = Eazfuscator {
            strings: StringDecrypter::find(module),
            resources: ResourceResolver::find(module),
        };
        Ok((found.strings.is_some() || found.resources.is_some()).then_some(found))
    }

    /// The release range, when the string decrypter was identified.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.strings.as_ref().map(|s| s.version.to_string())
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(Eazfuscator {
            strings: self.strings.as_ref().map(|s| s.rebind(old, new)).transpose()?,
            resources: self.resources.as_ref().map(|r| r.rebind(old, new)).transpose()?,
        })
    }

    /// Read the satellite list if its strings are already plain.
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        if let Some(strings) = &self.strings {
            deob_verbose!(
                session.logger,
                "Eazfuscator.NET {} string decrypter {:08X}",
                strings.version,
                strings.decrypter.value()
            );
        }
        if let Some(resources) = &mut self.resources {
            if resources.initialize(module) {
                deob_verbose!(session.logger, "Satellite assemblies: {}", resources.resource_infos.join(", "));
            }
        }
        Ok(())
    }

    /// Decrypt strings through the worker, then merge the satellite resources.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] without a worker or resource
    /// decrypter, [`crate::Error::Invariant`] when the satellite list cannot be read, and
    /// any worker error.
    pub fn apply(&self, module: &mut Module, session: &mut Session) -> Result<usize> {
        let mut total = 0;
        if session.config.decrypt_strings {
            if let Some(strings) = &self.strings {
                total += DynamicStringInliner::new(vec![strings.decrypter]).inline(module, session)?;
            }
        }
        if session.config.decrypt_resources {
            if let Some(resources) = &self.resources {
                let mut resources = resources.clone();
                if resources.resource_infos.is_empty() && !resources.initialize(module) {
                    return Err(crate::Error::Invariant(
                        "Could not initialize resource decrypter".to_string(),
                    ));
                }
                total += resources.merge_resources(module, session)?;
            }
        }
        Ok(total)
    }
}
