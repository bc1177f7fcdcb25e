//! Babel.NET constant encryption.
//!
//! Numbers live in four reverse-filled typed tables in an encrypted resource and are
//! fetched by index. Arrays are stored as encrypted field initializers and rebuilt at run
//! time with `InitializeArray` followed by the array decrypter and a cast to the real
//! array type.

use crate::{
    deobfuscation::{
        codecs::{self, primitive_size, TypedTables},
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
        inliner::{ConstantInliner, Literal},
        obfuscators::{decrypt_resource, Family},
        payload::{self, PayloadSource},
        rewriter::{
            apply_windows, collect_windows, initialized_array, is_initialize_array_call,
            CallSiteWindow,
        },
    },
    metadata::{module::Module, token::Token},
    Error, Result,
};

const NESTED_FIELDS: TypeList<'static> = TypeList::all(&[
    "System.Int32[]",
    "System.Int64[]",
    "System.Single[]",
    "System.Double[]",
]);

/// The typed accessors and the loaded constant tables.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantsDecrypter {
    /// Constants type
    pub decrypter_type: Token,
    /// The nested type holding the tables
    pub nested_type: Token,
    /// `Int32(Int32)`
    pub int32: Token,
    /// `Int64(Int32)`
    pub int64: Token,
    /// `Single(Int32)`
    pub single: Token,
    /// `Double(Int32)`
    pub double: Token,
    /// `System.Array(System.Byte[])`
    pub array: Token,
    /// Decrypted tables, filled by [`ConstantsDecrypter::initialize`]
    pub tables: Option<TypedTables>,
}

impl ConstantsDecrypter {
    /// Find a type without events whose single nested type holds the four tables and a
    /// field of its own type, and which has all five accessors.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        module.types().into_iter().find_map(|ty| {
            let def = module.type_def(ty)?;
            let [nested] = def.nested_types.as_slice() else {
                return None;
            };
            if !def.events.is_empty() || !check_nested_fields(module, *nested) {
                return None;
            }
            let accessor = |ret: &str| fingerprint::find_method(module, ty, ret, &["System.Int32"]);
            Some(ConstantsDecrypter {
                decrypter_type: ty,
                nested_type: *nested,
                int32: accessor("System.Int32")?,
                int64: accessor("System.Int64")?,
                single: accessor("System.Single")?,
                double: accessor("System.Double")?,
                array: fingerprint::find_method(module, ty, "System.Array", &["System.Byte[]"])?,
                tables: None,
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
            nested_type: new.rebind_type(old, self.nested_type)?,
            int32: new.rebind_method(old, self.int32)?,
            int64: new.rebind_method(old, self.int64)?,
            single: new.rebind_method(old, self.single)?,
            double: new.rebind_method(old, self.double)?,
            array: new.rebind_method(old, self.array)?,
            tables: self.tables.clone(),
        })
    }

    /// Find the resource named in the constants code, decrypt it and read the tables.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if the resource or the resource
    /// decrypter is missing, and decode errors for a corrupt table.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let mut methods = Vec::new();
        for ty in [self.decrypter_type, self.nested_type] {
            if let Some(def) = module.type_def(ty) {
                methods.extend_from_slice(&def.methods);
            }
        }
        let sources: Vec<PayloadSource> = payload::resource_from_code_strings(module, &methods)
            .map(PayloadSource::Resource)
            .into_iter()
            .collect();
        let found = payload::locate(module, &sources)?;
        let decrypted = decrypt_resource(session, Family::BabelNet, &found.data)?;
        let tables = codecs::read_typed_tables(&decrypted, true)?;
        deob_verbose!(
            session.logger,
            "Loaded constants: {} ints, {} longs, {} floats, {} doubles",
            tables.ints.len(),
            tables.longs.len(),
            tables.floats.len(),
            tables.doubles.len()
        );
        self.tables = Some(tables);
        Ok(())
    }

    /// Inline the numeric accessors, then the array windows.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let Some(tables) = &self.tables else {
            return Ok(0);
        };

        let mut inliner = ConstantInliner::new();
        inliner.add_indexed(self.int32, |i| lookup(&tables.ints, i).map(Literal::Int32));
        inliner.add_indexed(self.int64, |i| lookup(&tables.longs, i).map(Literal::Int64));
        inliner.add_indexed(self.single, |i| lookup(&tables.floats, i).map(Literal::Single));
        inliner.add_indexed(self.double, |i| lookup(&tables.doubles, i).map(Literal::Double));
        let mut total = inliner.inline(module, session)?;

        if session.decrypter_allowed(module, self.array) {
            total += self.inline_arrays(module, session)?;
        }
        Ok(total)
    }

    fn inline_arrays(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let reporter = session.reporter();
        let mut total = 0;
        for method in module.methods() {
            let windows = collect_windows(module, method, |block, i| {
                let [size, newarr, dup, ldtoken, init, call, cast] = block.get(i..i + 7)? else {
                    return None;
                };
                let matched = size.is_ldc_i4()
                    && newarr.is(0x8D)
                    && newarr.token_operand().and_then(|t| module.type_name(t)).as_deref()
                        == Some("System.Byte")
                    && dup.is(0x25)
                    && ldtoken.is(0xD0)
                    && ldtoken.token_operand().is_some_and(|t| module.field(t).is_some())
                    && is_initialize_array_call(module, init)
                    && call.is_call()
                    && call.token_operand() == Some(self.array)
                    && cast.is(0x74);
                if !matched {
                    return None;
                }
                let element = cast_element(module, cast)?;
                if primitive_size(&element).is_none() {
                    deob_warn!(
                        reporter.logger,
                        "Can't decrypt non-primitive type array in method {:08X}",
                        method.value()
                    );
                    return None;
                }
                Some(CallSiteWindow::removal(i, 7))
            });
            if windows.is_empty() {
                continue;
            }

            let mut ready = Vec::with_capacity(windows.len());
            for mut window in windows {
                let code = &fingerprint::instructions(module, method)[window.range()];
                let (Some(element), Some(field)) =
                    (cast_element(module, &code[6]), code[3].token_operand())
                else {
                    continue;
                };
                let encrypted = match payload::locate(module, &[PayloadSource::RvaField(field)]) {
                    Ok(payload) => payload.data,
                    Err(error) => {
                        deob_warn!(reporter.logger, "Could not read array data: {}", error);
                        continue;
                    }
                };
                let decrypted = match decrypt_array(session, &encrypted) {
                    Ok(bytes) => bytes,
                    Err(error @ Error::PayloadUnavailable(_)) => return Err(error),
                    Err(error) => {
                        deob_warn!(reporter.logger, "Could not decrypt array: {}", error);
                        continue;
                    }
                };
                let element_size = primitive_size(&element).unwrap_or(1);
                deob_verbose!(
                    reporter.logger,
                    "Decrypted {} array: {} elements",
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

fn check_nested_fields(module: &Module, nested: Token) -> bool {
    if !NESTED_FIELDS.matches(&fingerprint::field_types(module, nested)) {
        return false;
    }
    let Some(own_name) = module.type_name(nested) else {
        return false;
    };
    fingerprint::find_field(module, nested, &own_name).is_some()
}

fn lookup<T: Copy>(table: &[T], index: i32) -> Result<T> {
    usize::try_from(index)
        .ok()
        .and_then(|i| table.get(i).copied())
        .ok_or_else(|| decode_error!("Constant index {} outside of a {} entry table", index, table.len()))
}

/// Element type of a `castclass T[]`.
fn cast_element(module: &Module, cast: &crate::assembly::Instruction) -> Option<String> {
    let name = module.type_name(cast.token_operand()?)?;
    name.strip_suffix("[]").map(str::to_string)
}

/// Decrypt an array initializer, then unwrap the serialized primitive array.
fn decrypt_array(session: &Session, encrypted: &[u8]) -> Result<Vec<u8>> {
    let decrypted = decrypt_resource(session, Family::BabelNet, encrypted)?;
    Ok(codecs::read_primitive_array_graph(&decrypted)?.data)
}
