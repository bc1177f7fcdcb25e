//! SmartAssembly string encryption.
//!
//! The strings encoding class exposes a static `String(Int32)` decrypter. Its version is
//! read from the class layout:
//!
//! | Version | Shape |
//! |---------|-------|
//! | V1 | no `.cctor`, strings in the `{MVID}` resource |
//! | V2 | fields exactly `Stream, Int32` |
//! | V3 | `.cctor`, fields exactly `Byte[], Int32` |
//! | V4 | `.cctor` parsing the string offset from a static string field |
//! | V5 | V4 plus an `ldc.i4; xor` key in the decrypter |
//!
//! The string table is compressed with SimpleZip and optionally encrypted, so strings are
//! decrypted by the dynamic worker. The static analysis here recovers everything the
//! worker and the cleanup need: the offset, the xor key, the resource and the delegate
//! initializer whose calls are removed afterwards.

use std::fmt;

use crate::{
    deobfuscation::{
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
        inliner::DynamicStringInliner,
        obfuscators::{partial, Family},
        payload::{self, PayloadSource},
        rewriter::{apply_windows, collect_windows, CallSiteWindow},
    },
    metadata::{module::Module, token::Token},
    Result,
};

const FIELDS_V2: TypeList<'static> = TypeList::distinct(&["System.IO.Stream", "System.Int32"]);
const FIELDS_V3: TypeList<'static> = TypeList::distinct(&["System.Byte[]", "System.Int32"]);

const GET_PUBLIC_KEY_TOKEN: &str = "System.Byte[] System.Reflection.AssemblyName::GetPublicKeyToken()";
const GET_TYPE_FROM_HANDLE: &str = "System.Type System.Type::GetTypeFromHandle(System.RuntimeTypeHandle)";
const CREATE_DELEGATE: &str = "System.Delegate::CreateDelegate";

/// String decrypter generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StringDecrypterVersion {
    /// No static constructor
    V1,
    /// `Stream, Int32` fields
    V2,
    /// `Byte[], Int32` fields
    V3,
    /// Offset stored as a string
    V4,
    /// Offset stored as a string, xor key in the decrypter
    V5,
    /// Not classified
    Unknown,
}

impl fmt::Display for StringDecrypterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StringDecrypterVersion::V1 => "V1",
            StringDecrypterVersion::V2 => "V2",
            StringDecrypterVersion::V3 => "V3",
            StringDecrypterVersion::V4 => "V4",
            StringDecrypterVersion::V5 => "V5",
            StringDecrypterVersion::Unknown => "unknown",
        })
    }
}

/// How calls to the delegate initializer look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCallShape {
    /// `call Create()`
    Call,
    /// `ldtoken <own type>; call GetTypeFromHandle; call Create(Type)`
    TypeHandle,
}

/// Everything recovered about the string decrypter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDecrypterInfo {
    /// The strings encoding class
    pub encoding_class: Token,
    /// Static `String(Int32)` decrypter
    pub decrypter: Token,
    /// Classified version
    pub version: StringDecrypterVersion,
    /// Offset subtracted from every string index
    pub string_offset: i32,
    /// V5 xor key
    pub xor_value: Option<i32>,
    /// `Byte[](Byte[])` SimpleZip decompressor, present when the strings are compressed
    pub simple_zip: Option<Token>,
    /// Resource holding the string table, filled by [`SmartAssembly::initialize`]
    pub resource: Option<String>,
}

impl StringDecrypterInfo {
    /// Returns true if the string table is compressed (and possibly encrypted).
    #[must_use]
    pub fn strings_encrypted(&self) -> bool {
        self.simple_zip.is_some()
    }
}

/// A detected SmartAssembly module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartAssembly {
    /// The string decrypter
    pub strings: StringDecrypterInfo,
    /// Static method creating the string delegates, with its call shape
    pub create_delegate: Option<(Token, InitCallShape)>,
}

impl SmartAssembly {
    /// Find the strings encoding class.
    ///
    /// # Errors
    /// Returns [`crate::Error::PartialDetection`] for a V4 class without a decrypter
    /// method or string offset.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        for ty in module.types() {
            if let Some(strings) = classify(module, ty)? {
                return Ok(Some(SmartAssembly {
                    strings,
                    create_delegate: find_create_delegate(module),
                }));
            }
        }
        Ok(None)
    }

    /// The decrypter version.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        Some(self.strings.version.to_string())
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        let strings = &self.strings;
        Ok(SmartAssembly {
            strings: StringDecrypterInfo {
                encoding_class: new.rebind_type(old, strings.encoding_class)?,
                decrypter: new.rebind_method(old, strings.decrypter)?,
                simple_zip: strings
                    .simple_zip
                    .map(|m| new.rebind_method(old, m))
                    .transpose()?,
                ..strings.clone()
            },
            create_delegate: self
                .create_delegate
                .map(|(m, shape)| new.rebind_method(old, m).map(|m| (m, shape)))
                .transpose()?,
        })
    }

    /// Find the string resource.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if no resource can be found.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let info = &self.strings;
        let cctor = module.type_cctor(info.encoding_class);
        let mut sources = Vec::new();
        if info.version <= StringDecrypterVersion::V3 {
            sources.push(PayloadSource::DefaultResource(mvid_resource_name(module)));
        }
        let init_methods: Vec<Token> = cctor.into_iter().chain([info.decrypter]).collect();
        if let Some(name) = payload::resource_from_code_strings(module, &init_methods) {
            sources.push(PayloadSource::Resource(name));
        }

        let found = payload::locate(module, &sources)?;
        let name = found.resource_name().map(str::to_string);
        deob_verbose!(
            session.logger,
            "String decrypter {}: resource {:?}, offset {}, xor {:?}",
            info.version,
            name.as_deref().unwrap_or_default(),
            info.string_offset,
            info.xor_value
        );
        self.strings.resource = name;
        Ok(())
    }

    /// Decrypt strings through the worker, then remove the delegate initializer calls.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] without a worker and any worker
    /// error.
    pub fn apply(&self, module: &mut Module, session: &mut Session) -> Result<usize> {
        let mut total = 0;
        if session.config.decrypt_strings {
            total += DynamicStringInliner::new(vec![self.strings.decrypter]).inline(module, session)?;
        }
        if session.config.remove_init_calls {
            if let Some((create, shape)) = self.create_delegate {
                total += remove_init_code(module, session, create, shape)?;
            }
        }
        Ok(total)
    }
}

fn classify(module: &Module, ty: Token) -> Result<Option<StringDecrypterInfo>> {
    let Some(def) = module.type_def(ty) else {
        return Ok(None);
    };
    let fields = fingerprint::field_types(module, ty);
    let cctor = module.type_cctor(ty);
    let decrypter = fingerprint::find_static_method(module, ty, "System.String", &["System.Int32"]);

    let guess = if FIELDS_V2.matches(&fields) {
        StringDecrypterVersion::V2
    } else if cctor.is_none() {
        StringDecrypterVersion::V1
    } else if FIELDS_V3.matches(&fields) {
        StringDecrypterVersion::V3
    } else {
        StringDecrypterVersion::Unknown
    };

    let mut info = StringDecrypterInfo {
        encoding_class: ty,
        decrypter: Token::new(0),
        version: guess,
        string_offset: 0,
        xor_value: None,
        simple_zip: None,
        resource: None,
    };

    match guess {
        StringDecrypterVersion::V1 => {
            let Some(decrypter) = decrypter else {
                return Ok(None);
            };
            if module.resource(&mvid_resource_name(module)).is_none() {
                return Ok(None);
            }
            info.decrypter = decrypter;
        }
        StringDecrypterVersion::V2 | StringDecrypterVersion::V3 => {
            let Some(decrypter) = decrypter else {
                return Ok(None);
            };
            info.decrypter = decrypter;
            let init = match guess {
                StringDecrypterVersion::V3 => cctor.unwrap_or(decrypter),
                _ => decrypter,
            };
            info.string_offset = legacy_offset(module, init, decrypter);
        }
        _ => {
            let Some(cctor) = cctor else {
                return Ok(None);
            };
            let Some(offset_field) = find_offset_field(module, ty, cctor) else {
                return Ok(None);
            };
            let decrypter = decrypter
                .ok_or_else(|| partial(Family::SmartAssembly, "Could not find string decrypter method"))?;
            info.decrypter = decrypter;
            info.string_offset = find_offset_value(module, cctor, offset_field)
                .ok_or_else(|| partial(Family::SmartAssembly, "Could not find string offset"))?;
            info.xor_value = find_xor_value(module, decrypter, !def.nested_types.is_empty());
            info.version = if info.xor_value.is_some() {
                StringDecrypterVersion::V5
            } else {
                StringDecrypterVersion::V4
            };
        }
    }

    info.simple_zip = cctor
        .and_then(|c| find_simple_zip(module, ty, c))
        .or_else(|| find_simple_zip(module, ty, info.decrypter));
    Ok(Some(info))
}

/// The module MVID in registry format, e.g. `{01234567-89ab-cdef-0123-456789abcdef}`.
fn mvid_resource_name(module: &Module) -> String {
    format!("{{{}}}", module.mvid)
}

/// String offset of V2 and V3 decrypters, derived from the public key token and the
/// decrypter's own token.
fn legacy_offset(module: &Module, init: Token, decrypter: Token) -> i32 {
    let mut offset = 0;
    if fingerprint::calls_method(module, init, GET_PUBLIC_KEY_TOKEN) {
        if let Some(token) = module.public_key_token.as_deref().filter(|t| !t.is_empty()) {
            for pair in token.chunks_exact(2) {
                offset ^= (i32::from(pair[0]) << 8) + i32::from(pair[1]);
            }
        }
    }
    if fingerprint::has_int(module, init, 0x00FF_FFFF) && fingerprint::has_int(module, init, 0xFFFF) {
        #[allow(clippy::cast_possible_wrap)]
        let row = (decrypter.value() & 0x00FF_FFFF) as i32;
        offset ^= (row - 1) % 0xFFFF;
    }
    offset
}

/// `ldsfld <string field of ty>; call Int32(String)` in the `.cctor`.
fn find_offset_field(module: &Module, ty: Token, cctor: Token) -> Option<Token> {
    fingerprint::instructions(module, cctor).windows(2).find_map(|pair| {
        let field = pair[0].token_operand().filter(|_| pair[0].is(0x7E))?;
        let def = module.field(field)?;
        if def.field_type != "System.String" || def.declaring_type != ty {
            return None;
        }
        let callee = pair[1].token_operand().filter(|_| pair[1].is(0x28))?;
        module
            .method_sig(callee)
            .is_some_and(|sig| sig.matches("System.Int32", &["System.String"]))
            .then_some(field)
    })
}

/// `ldstr "<int>"; stsfld <offset field>`.
fn find_offset_value(module: &Module, cctor: Token, offset_field: Token) -> Option<i32> {
    fingerprint::instructions(module, cctor).windows(2).find_map(|pair| {
        if !pair[1].is(0x80) || pair[1].token_operand() != Some(offset_field) {
            return None;
        }
        module.ldstr_value(&pair[0])?.parse().ok()
    })
}

/// `ldc.i4 <key>; xor` in the decrypter, or in the first method it calls when the class
/// has nested types.
fn find_xor_value(module: &Module, decrypter: Token, has_nested: bool) -> Option<i32> {
    let method = if has_nested {
        fingerprint::called_methods(module, decrypter).into_iter().next()?
    } else {
        decrypter
    };
    fingerprint::instructions(module, method)
        .windows(2)
        .find_map(|pair| {
            if pair[0].is(0x20) && pair[1].is(0x61) {
                pair[0].ldc_i4_value()
            } else {
                None
            }
        })
}

/// `call Byte[](Byte[]); stsfld Byte[] <field of ty>`.
fn find_simple_zip(module: &Module, ty: Token, method: Token) -> Option<Token> {
    fingerprint::instructions(module, method).windows(2).find_map(|pair| {
        let callee = pair[0].token_operand().filter(|_| pair[0].is(0x28))?;
        if !module
            .method(callee)
            .is_some_and(|m| m.is_method("System.Byte[]", &["System.Byte[]"]))
        {
            return None;
        }
        let field = pair[1].token_operand().filter(|_| pair[1].is(0x80))?;
        module
            .field(field)
            .is_some_and(|f| f.field_type == "System.Byte[]" && f.declaring_type == ty)
            .then_some(callee)
    })
}

/// A static `Void()` or `Void(System.Type)` method that calls `Delegate.CreateDelegate`.
fn find_create_delegate(module: &Module) -> Option<(Token, InitCallShape)> {
    module.methods().into_iter().find_map(|m| {
        let def = module.method(m)?;
        if !def.is_static() {
            return None;
        }
        let shape = if def.is_method("System.Void", &[]) {
            InitCallShape::Call
        } else if def.is_method("System.Void", &["System.Type"]) {
            InitCallShape::TypeHandle
        } else {
            return None;
        };
        fingerprint::instructions(module, m)
            .iter()
            .filter(|i| i.is_call())
            .filter_map(|i| i.token_operand())
            .any(|callee| {
                module
                    .method_full_name(callee)
                    .is_some_and(|name| name.contains(CREATE_DELEGATE))
            })
            .then_some((m, shape))
    })
}

fn remove_init_code(
    module: &mut Module,
    session: &Session,
    create: Token,
    shape: InitCallShape,
) -> Result<usize> {
    let reporter = session.reporter();
    let mut removed = 0;
    for method in module.methods() {
        let Some(own_type) = module.method(method).map(|m| m.declaring_type) else {
            continue;
        };
        let windows = collect_windows(module, method, |block, i| match shape {
            InitCallShape::Call => (block[i].is(0x28) && block[i].token_operand() == Some(create))
                .then(|| CallSiteWindow::removal(i, 1)),
            InitCallShape::TypeHandle => {
                let [ldtoken, get_type, call] = block.get(i..i + 3)? else {
                    return None;
                };
                let matched = ldtoken.is(0xD0)
                    && ldtoken.token_operand() == Some(own_type)
                    && get_type.is(0x28)
                    && get_type
                        .token_operand()
                        .and_then(|t| module.method_full_name(t))
                        .as_deref()
                        == Some(GET_TYPE_FROM_HANDLE)
                    && call.is(0x28)
                    && call.token_operand() == Some(create);
                matched.then(|| CallSiteWindow::removal(i, 3))
            }
        });
        for window in &windows {
            reporter.record(EventKind::ArtifactRemoved).at(method, window.start);
        }
        removed += apply_windows(module, method, windows)?;
    }
    if removed > 0 {
        deob_verbose!(session.logger, "Removed {} string delegate init calls", removed);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        deobfuscation::{config::DeobConfig, events::EventLog, logger::Logger, rpc::Value},
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            module::Resource,
            typesystem::TypeDef,
        },
        test::factories::ScriptedClient,
        Error,
    };

    fn decrypter(module: &mut Module, ty: Token, body: &mut BodyBuilder) -> Token {
        module
            .add_method(
                ty,
                MethodDef::new("d", MethodSig::new("System.String", &["System.Int32"]))
                    .with_body(body.build().unwrap()),
            )
            .unwrap()
    }

    fn session_parts() -> (DeobConfig, Logger, EventLog) {
        (DeobConfig::default(), Logger::new(), EventLog::new())
    }

    #[test]
    fn v2_offset_from_public_key_token() {
        let mut module = Module::new("a.exe");
        module.public_key_token = Some(vec![0x12, 0x34, 0x00, 0x01]);
        let ty = module.add_type(TypeDef::new("", "Strings"));
        module.add_field(ty, FieldDef::new("s", "System.IO.Stream")).unwrap();
        module.add_field(ty, FieldDef::new("o", "System.Int32")).unwrap();
        let pkt = module.add_member_ref(
            "System.Reflection.AssemblyName",
            "GetPublicKeyToken",
            MethodSig::instance("System.Byte[]", &[]),
        );
        decrypter(&mut module, ty, BodyBuilder::new().op("ldnull").call(pkt).op("pop").ret());

        let (config, logger, events) = session_parts();
        let session = Session::new(&config, &logger, &events);
        let found = SmartAssembly::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.strings.version, StringDecrypterVersion::V2);
        assert_eq!(found.strings.string_offset, 0x1234 ^ 0x0001);
        assert_eq!(found.version().as_deref(), Some("V2"));
    }

    fn v4_module(with_xor: bool) -> (Module, Token, Token) {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "Strings"));
        let offset = module.add_field(ty, FieldDef::new("off", "System.String")).unwrap();
        module.add_field(ty, FieldDef::new("data", "System.Byte[]")).unwrap();
        module.add_field(ty, FieldDef::new("other", "System.Int64")).unwrap();
        let parse = module.add_member_ref("System.Int32", "Parse", MethodSig::new("System.Int32", &["System.String"]));
        module
            .add_method(
                ty,
                MethodDef::cctor().with_body(
                    BodyBuilder::new()
                        .ldstr("strings.res")
                        .op("pop")
                        .ldstr("42")
                        .op_token("stsfld", offset)
                        .op_token("ldsfld", offset)
                        .call(parse)
                        .op("pop")
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        let mut body = BodyBuilder::new();
        if with_xor {
            body.op("ldarg.0").ldc_i4(0x5555).op("xor").op("pop");
        }
        let d = decrypter(&mut module, ty, body.op("ldnull").ret());
        (module, ty, d)
    }

    #[test]
    fn v4_and_v5_offsets() {
        let (config, logger, events) = session_parts();
        let session = Session::new(&config, &logger, &events);

        let (module, ty, d) = v4_module(false);
        let found = SmartAssembly::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.strings.encoding_class, ty);
        assert_eq!(found.strings.decrypter, d);
        assert_eq!(found.strings.version, StringDecrypterVersion::V4);
        assert_eq!(found.strings.string_offset, 42);

        let (module, _, _) = v4_module(true);
        let found = SmartAssembly::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.strings.version, StringDecrypterVersion::V5);
        assert_eq!(found.strings.xor_value, Some(0x5555));
    }

    #[test]
    fn v4_without_decrypter_is_partial() {
        let (mut module, ty, d) = v4_module(false);
        let def = module.type_def_mut(ty).unwrap();
        def.methods.retain(|&m| m != d);
        let (config, logger, events) = session_parts();
        let session = Session::new(&config, &logger, &events);
        assert!(matches!(
            SmartAssembly::detect(&module, &session),
            Err(Error::PartialDetection { family: Family::SmartAssembly, .. })
        ));
    }

    #[test]
    fn v1_requires_mvid_resource() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "Strings"));
        decrypter(&mut module, ty, BodyBuilder::new().op("ldnull").ret());
        let (config, logger, events) = session_parts();
        let session = Session::new(&config, &logger, &events);
        assert!(SmartAssembly::detect(&module, &session).unwrap().is_none());

        let name = mvid_resource_name(&module);
        module.add_resource(Resource::new(&name, vec![1, 2, 3]));
        let mut found = SmartAssembly::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.strings.version, StringDecrypterVersion::V1);
        found.initialize(&module, &session).unwrap();
        assert_eq!(found.strings.resource.as_deref(), Some(name.as_str()));
    }

    #[test]
    fn strings_through_worker_and_init_removed() {
        let (mut module, ty, d) = v4_module(false);
        module.add_resource(Resource::new("strings.res", vec![0; 4]));
        let ctor_ref = module.add_member_ref(
            "System.Delegate",
            "CreateDelegate",
            MethodSig::new("System.Delegate", &["System.Type", "System.Reflection.MethodInfo"]),
        );
        let create = module
            .add_method(
                ty,
                MethodDef::new("Create", MethodSig::new("System.Void", &["System.Type"])).with_body(
                    BodyBuilder::new()
                        .op("ldnull")
                        .op("ldnull")
                        .call(ctor_ref)
                        .op("pop")
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        let get_type = module.add_member_ref(
            "System.Type",
            "GetTypeFromHandle",
            MethodSig::new("System.Type", &["System.RuntimeTypeHandle"]),
        );
        let app = module.add_type(TypeDef::new("App", "P"));
        let main = module
            .add_method(
                app,
                MethodDef::cctor().with_body(
                    BodyBuilder::new()
                        .op_token("ldtoken", app)
                        .call(get_type)
                        .call(create)
                        .ldc_i4(7)
                        .call(d)
                        .op("pop")
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();

        let (config, logger, events) = session_parts();
        let mut client = ScriptedClient::new(vec![
            Value::Int32(1),
            Value::Array(vec![Value::String("hello".into())]),
        ]);
        let mut session = Session::new(&config, &logger, &events).with_dynamic(&mut client);
        let mut found = SmartAssembly::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.create_delegate, Some((create, InitCallShape::TypeHandle)));
        found.initialize(&module, &session).unwrap();
        assert_eq!(found.strings.resource.as_deref(), Some("strings.res"));
        assert_eq!(found.apply(&mut module, &mut session).unwrap(), 2);

        let code = fingerprint::instructions(&module, main);
        assert_eq!(code.len(), 3);
        assert_eq!(code[0], Instruction::ldstr("hello"));
        assert_eq!(code[2], Instruction::ret());
        assert_eq!(events.count_kind(EventKind::ArtifactRemoved), 1);
    }
}
