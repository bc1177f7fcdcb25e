//! CryptoObfuscator constant decrypter.
//!
//! Numbers are read little-endian at a byte offset into the decrypted resource. Arrays
//! are created as `ldc.i4 size; newarr T; dup; ldc.i4 offset; call InitArray`, where the
//! data at `offset` is a 7-bit length followed by the raw element bytes.

use crate::{
    deobfuscation::{
        codecs::{self, primitive_size},
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
        inliner::{ConstantInliner, Literal},
        obfuscators::{decrypt_resource, Family},
        payload::{self, PayloadSource},
        rewriter::{apply_windows, collect_windows, initialized_array, CallSiteWindow},
    },
    metadata::{module::Module, token::Token},
    Result,
};

use super::resource_candidates;

const REQUIRED_FIELDS: TypeList<'static> =
    TypeList::all(&["System.Byte[]", "System.Int32", "System.Int32"]);

/// The typed accessors of the constants type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantsDecrypter {
    /// Constants type
    pub decrypter_type: Token,
    /// `Int32(Int32)`
    pub int32: Token,
    /// `Int64(Int32)`
    pub int64: Token,
    /// `Single(Int32)`
    pub single: Token,
    /// `Double(Int32)`
    pub double: Token,
    /// `Void(System.Array,System.Int32)` array initializer
    pub array: Token,
    /// Decrypted resource, filled by [`ConstantsDecrypter::initialize`]
    pub data: Option<Vec<u8>>,
}

impl ConstantsDecrypter {
    /// Find a type with exactly seven methods, one to three fields including `Byte[]`,
    /// `Int32`, `Int32`, and all five accessors.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        module.types().into_iter().find_map(|ty| {
            let def = module.type_def(ty)?;
            if def.methods.len() != 7
                || !(1..=3).contains(&def.fields.len())
                || !REQUIRED_FIELDS.matches(&fingerprint::field_types(module, ty))
            {
                return None;
            }
            let accessor = |ret: &str| fingerprint::find_method(module, ty, ret, &["System.Int32"]);
            Some(ConstantsDecrypter {
                decrypter_type: ty,
                int32: accessor("System.Int32")?,
                int64: accessor("System.Int64")?,
                single: accessor("System.Single")?,
                double: accessor("System.Double")?,
                array: fingerprint::find_method(
                    module,
                    ty,
                    "System.Void",
                    &["System.Array", "System.Int32"],
                )?,
                data: None,
            })
        })
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(ConstantsDecrypter {
            decrypter_type: new.rebind_type(old, self.decrypter_type)?,
            int32: new.rebind_method(old, self.int32)?,
            int64: new.rebind_method(old, self.int64)?,
            single: new.rebind_method(old, self.single)?,
            double: new.rebind_method(old, self.double)?,
            array: new.rebind_method(old, self.array)?,
            data: self.data.clone(),
        })
    }

    /// Locate the resource named (plainly, base64 encoded or computed) in the `.cctor`
    /// and decrypt it.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if the resource or the resource
    /// decrypter is missing.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let sources: Vec<PayloadSource> = module
            .type_cctor(self.decrypter_type)
            .map(|cctor| resource_candidates(module, cctor))
            .unwrap_or_default()
            .into_iter()
            .map(PayloadSource::Resource)
            .collect();
        let found = payload::locate(module, &sources)?;
        self.data = Some(decrypt_resource(session, Family::CryptoObfuscator, &found.data)?);
        Ok(())
    }

    /// Inline numeric accessors and array initializers.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let Some(data) = &self.data else {
            return Ok(0);
        };
        let offset = |index: i32| {
            usize::try_from(index).map_err(|_| decode_error!("Negative constant offset {}", index))
        };

        let mut inliner = ConstantInliner::new();
        inliner.add_indexed(self.int32, |i| Ok(Literal::Int32(codecs::read_value_at(data, offset(i)?)?)));
        inliner.add_indexed(self.int64, |i| Ok(Literal::Int64(codecs::read_value_at(data, offset(i)?)?)));
        inliner.add_indexed(self.single, |i| Ok(Literal::Single(codecs::read_value_at(data, offset(i)?)?)));
        inliner.add_indexed(self.double, |i| Ok(Literal::Double(codecs::read_value_at(data, offset(i)?)?)));
        let mut total = inliner.inline(module, session)?;

        if session.decrypter_allowed(module, self.array) {
            total += self.inline_arrays(module, session, data)?;
        }
        Ok(total)
    }

    fn inline_arrays(&self, module: &mut Module, session: &Session, data: &[u8]) -> Result<usize> {
        let reporter = session.reporter();
        let mut total = 0;
        for method in module.methods() {
            let windows = collect_windows(module, method, |block, i| {
                let [size, newarr, dup, index, call] = block.get(i..i + 5)? else {
                    return None;
                };
                let matched = size.is_ldc_i4()
                    && newarr.is(0x8D)
                    && dup.is(0x25)
                    && index.is_ldc_i4()
                    && call.is_call()
                    && call.token_operand() == Some(self.array);
                if !matched {
                    return None;
                }
                let element = newarr.token_operand().and_then(|t| module.type_name(t))?;
                if primitive_size(&element).is_none() {
                    deob_warn!(
                        reporter.logger,
                        "Can't decrypt non-primitive type array in method {:08X}",
                        method.value()
                    );
                    return None;
                }
                Some(CallSiteWindow::removal(i, 5))
            });
            if windows.is_empty() {
                continue;
            }

            let mut ready = Vec::with_capacity(windows.len());
            for mut window in windows {
                let code = &fingerprint::instructions(module, method)[window.range()];
                let (Some(size), Some(index)) = (code[0].ldc_i4_value(), code[3].ldc_i4_value())
                else {
                    continue;
                };
                let Some(element) = code[1].token_operand().and_then(|t| module.type_name(t)) else {
                    continue;
                };
                let element_size = primitive_size(&element).unwrap_or(1);

                let decrypted = usize::try_from(size)
                    .ok()
                    .zip(usize::try_from(index).ok())
                    .ok_or_else(|| decode_error!("Negative array size {} or offset {}", size, index))
                    .and_then(|(size, index)| {
                        codecs::read_varint_array(data, index, size * element_size)
                    });
                let decrypted = match decrypted {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        deob_warn!(reporter.logger, "Could not decrypt array: {}", error);
                        continue;
                    }
                };
                deob_verbose!(
                    reporter.logger,
                    "Decrypted {}[] array: {} elements",
                    element,
                    decrypted.len() / element_size
                );
                reporter.record(EventKind::ArrayDecrypted).at(method, window.start);
                window.replacement = initialized_array(module, &element, decrypted)?;
                ready.push(window);
            }
            total += apply_windows(module, method, ready)?;
        }
        Ok(total)
    }
}
