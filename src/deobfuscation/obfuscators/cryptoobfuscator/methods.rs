//! CryptoObfuscator encrypted method bodies.
//!
//! The decrypted resource starts with a count followed by `(delegate type token, code
//! offset)` pairs. Each delegate type's `.cctor` calls the decrypt method with
//! `ldc.i4 delegate; ldc.i4 method; ldc.i4 declaring type`, which names the method whose
//! stub body is replaced by the standard method body found at the code offset.

use std::collections::BTreeSet;

use crate::{
    assembly::parse_method_body,
    deobfuscation::{
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
        obfuscators::{decrypt_resource, Family},
        payload::{self, PayloadSource},
    },
    file::parser::Parser,
    metadata::{module::Module, token::Token},
    Error, Result,
};

use super::resource_candidates;

const REQUIRED_FIELDS: TypeList<'static> = TypeList::all(&[
    "System.Byte[]",
    "System.Collections.Generic.Dictionary`2<System.Int32,System.Int32>",
    "System.ModuleHandle",
]);

const REQUIRED_LOCALS: TypeList<'static> = TypeList::all(&[
    "System.Delegate",
    "System.ModuleHandle",
    "System.Reflection.Emit.DynamicILInfo",
    "System.Reflection.Emit.DynamicMethod",
    "System.Reflection.FieldInfo",
    "System.Reflection.FieldInfo[]",
    "System.Reflection.MethodBase",
    "System.Reflection.MethodBody",
    "System.Type",
    "System.Type[]",
]);

/// The method body decrypter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodsDecrypter {
    /// Decrypter type
    pub decrypter_type: Token,
    /// The type's `.cctor`, which names the resource
    pub cctor: Token,
    /// `Void(Int32,Int32,Int32)` decrypt method
    pub decrypt_method: Token,
    /// Decrypted resource, filled by [`MethodsDecrypter::initialize`]
    pub data: Option<Vec<u8>>,
}

impl MethodsDecrypter {
    /// Find a type with one nested type, exactly three fields of the required types, a
    /// `.cctor` and the decrypt method.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        module.types().into_iter().find_map(|ty| {
            let def = module.type_def(ty)?;
            if def.nested_types.len() != 1
                || def.fields.len() != 3
                || !REQUIRED_FIELDS.matches(&fingerprint::field_types(module, ty))
            {
                return None;
            }
            let cctor = module.type_cctor(ty)?;
            let decrypt_method = def.methods.iter().copied().find(|&m| {
                module.method(m).is_some_and(|def| {
                    def.is_static()
                        && def.body.is_some()
                        && REQUIRED_LOCALS.matches(fingerprint::local_types(module, m))
                        && def.is_method(
                            "System.Void",
                            &["System.Int32", "System.Int32", "System.Int32"],
                        )
                })
            })?;
            Some(MethodsDecrypter {
                decrypter_type: ty,
                cctor,
                decrypt_method,
                data: None,
            })
        })
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(MethodsDecrypter {
            decrypter_type: new.rebind_type(old, self.decrypter_type)?,
            cctor: new.rebind_method(old, self.cctor)?,
            decrypt_method: new.rebind_method(old, self.decrypt_method)?,
            data: self.data.clone(),
        })
    }

    /// Locate the resource named in the `.cctor` and decrypt it.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if the resource or the resource
    /// decrypter is missing.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let sources: Vec<PayloadSource> = resource_candidates(module, self.cctor)
            .into_iter()
            .map(PayloadSource::Resource)
            .collect();
        let found = payload::locate(module, &sources)?;
        self.data = Some(decrypt_resource(session, Family::CryptoObfuscator, &found.data)?);
        Ok(())
    }

    /// Restore every encrypted body. Returns the number of methods restored.
    ///
    /// The restored methods and every method referencing one of them are marked
    /// modified.
    ///
    /// # Errors
    /// Returns [`crate::Error::Decode`] for tokens that do not resolve or do not match
    /// the delegate's `.cctor`, and bounds or decode errors for a corrupt resource.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let Some(data) = &self.data else {
            return Ok(0);
        };
        let logger = session.logger;

        let entries = entries(data)?;
        deob_verbose!(logger, "Restoring {} encrypted methods", entries.len());
        logger.indent();
        let result: Result<BTreeSet<Token>> = entries
            .iter()
            .map(|&(delegate_type, code_offset)| {
                let blob = data.get(code_offset..).ok_or_else(|| {
                    decode_error!("Code offset {} outside of payload", code_offset)
                })?;
                self.restore(module, session, delegate_type, blob)
            })
            .collect();
        logger.deindent();
        let restored = result?;

        let callers: Vec<Token> = module
            .methods()
            .into_iter()
            .filter(|caller| !restored.contains(caller))
            .filter(|&caller| {
                fingerprint::instructions(module, caller)
                    .iter()
                    .any(|i| i.token_operand().is_some_and(|t| restored.contains(&t)))
            })
            .collect();
        for caller in callers {
            module.mark_modified(caller);
        }
        Ok(entries.len())
    }

    /// The delegate types listed in the decrypted resource, one per encrypted method.
    ///
    /// # Errors
    /// Returns bounds or decode errors for a corrupt resource.
    pub fn delegate_types(&self) -> Result<Vec<Token>> {
        let Some(data) = &self.data else {
            return Ok(Vec::new());
        };
        Ok(entries(data)?
            .into_iter()
            .map(|(delegate, _)| token_of(delegate))
            .collect())
    }

    fn restore(&self, module: &mut Module, session: &Session, delegate_token: i32, blob: &[u8]) -> Result<Token> {
        let delegate_type = token_of(delegate_token);
        if module.type_def(delegate_type).is_none() {
            return Err(decode_error!("Couldn't find delegate type"));
        }
        let (del, method, declaring) = self
            .delegate_tokens(module, delegate_type)
            .ok_or_else(|| decode_error!("Could not find encrypted method tokens"))?;
        if del != delegate_token {
            return Err(decode_error!("Invalid delegate type token"));
        }
        if module.type_name(token_of(declaring)).is_none() {
            return Err(decode_error!("Invalid declaring type token"));
        }
        let method = token_of(method);
        if module.method(method).is_none() {
            return Err(decode_error!("Invalid encrypted method token"));
        }

        let body = parse_method_body(blob, |sig| {
            module
                .local_signature(sig)
                .map(<[String]>::to_vec)
                .ok_or(Error::TypeNotFound(sig))
        })?;
        deob_verbose!(
            session.logger,
            "Restored method {} ({:08X}). Instrs:{}, Locals:{}, Exceptions:{}",
            module.method_full_name(method).unwrap_or_default(),
            method.value(),
            body.instructions.len(),
            body.locals.len(),
            body.exception_handlers.len()
        );

        if let Some(def) = module.method_mut(method) {
            def.body = Some(body);
        }
        module.mark_modified(method);
        session
            .reporter()
            .record(EventKind::MethodBodyDecrypted)
            .method(method);
        Ok(method)
    }

    /// The `(delegate, method, declaring type)` constants a delegate's `.cctor` passes to
    /// the decrypt method.
    fn delegate_tokens(&self, module: &Module, delegate_type: Token) -> Option<(i32, i32, i32)> {
        let cctor = module.type_cctor(delegate_type)?;
        fingerprint::instructions(module, cctor)
            .windows(4)
            .find_map(|w| {
                if !w[3].is(0x28) || w[3].token_operand() != Some(self.decrypt_method) {
                    return None;
                }
                Some((w[0].ldc_i4_value()?, w[1].ldc_i4_value()?, w[2].ldc_i4_value()?))
            })
    }
}

/// The `(delegate type token, code offset)` pairs after the leading count.
fn entries(data: &[u8]) -> Result<Vec<(i32, usize)>> {
    let mut parser = Parser::new(data);
    let count = parser.read_le::<i32>()?;
    let count = usize::try_from(count).map_err(|_| decode_error!("Negative method count {}", count))?;
    (0..count)
        .map(|_| Ok((parser.read_le::<i32>()?, parser.read_le::<u32>()? as usize)))
        .collect()
}

#[allow(clippy::cast_sign_loss)]
fn token_of(value: i32) -> Token {
    Token::new(value as u32)
}
