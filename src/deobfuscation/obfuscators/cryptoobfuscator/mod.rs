//! CryptoObfuscator.
//!
//! Three independent protections are recognized, each by its own helper type:
//!
//! - [`StringDecrypter`] - `String(Int32)` over a UTF-16 string table
//! - [`ConstantsDecrypter`] - typed numeric accessors and array initializers
//! - [`MethodsDecrypter`] - encrypted method bodies restored from a resource
//!
//! All three resources are encrypted with the obfuscator's resource cipher, which is
//! supplied by the caller's [`crate::deobfuscation::payload::ResourceDecrypter`].

mod constants;
mod methods;
mod strings;

pub use constants::ConstantsDecrypter;
pub use methods::MethodsDecrypter;
pub use strings::StringDecrypter;

use base64::Engine;

use crate::{
    deobfuscation::{context::Session, fingerprint},
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// The CryptoObfuscator protections found in a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoObfuscator {
    /// String encryption
    pub strings: Option<StringDecrypter>,
    /// Constant encryption
    pub constants: Option<ConstantsDecrypter>,
    /// Method body encryption
    pub methods: Option<MethodsDecrypter>,
}

impl CryptoObfuscator {
    /// Detected when any of the three protections is found.
    ///
    /// # Errors
    /// Never fails; the signature is kept uniform with the other families.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let found = CryptoObfuscator {
            strings: StringDecrypter::find(module),
            constants: ConstantsDecrypter::find(module),
            methods: MethodsDecrypter::find(module),
        };
        let any = found.strings.is_some() || found.constants.is_some() || found.methods.is_some();
        Ok(any.then_some(found))
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(CryptoObfuscator {
            strings: self.strings.as_ref().map(|s| s.rebind(old, new)).transpose()?,
            constants: self.constants.as_ref().map(|c| c.rebind(old, new)).transpose()?,
            methods: self.methods.as_ref().map(|m| m.rebind(old, new)).transpose()?,
        })
    }

    /// Load the payload of every found protection. A protection whose payload is missing
    /// is skipped with a warning.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if no protection could be loaded, and
    /// any other error as is.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let config = session.config;
        let mut loaded = 0;
        let mut missing = Vec::new();
        let mut step = |name: &str, result: Result<()>| -> Result<()> {
            match result {
                Ok(()) => loaded += 1,
                Err(Error::PayloadUnavailable(reason)) => {
                    deob_warn!(session.logger, "Could not load {} payload: {}", name, reason);
                    missing.push(reason);
                }
                Err(other) => return Err(other),
            }
            Ok(())
        };

        if let Some(strings) = self.strings.as_mut().filter(|_| config.decrypt_strings) {
            step("string", strings.initialize(module, session))?;
        }
        if let Some(constants) = self.constants.as_mut().filter(|_| config.decrypt_constants) {
            step("constants", constants.initialize(module, session))?;
        }
        if let Some(methods) = self.methods.as_mut().filter(|_| config.decrypt_methods) {
            step("method", methods.initialize(module, session))?;
        }

        if loaded == 0 && !missing.is_empty() {
            return Err(Error::PayloadUnavailable(missing.join(", ")));
        }
        Ok(())
    }

    /// Restore method bodies first, then inline strings and constants. Returns the total
    /// number of rewrites.
    ///
    /// # Errors
    /// Propagates the first failing step.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let mut total = 0;
        if let Some(methods) = &self.methods {
            total += methods.apply(module, session)?;
        }
        if let Some(strings) = &self.strings {
            total += strings.apply(module, session)?;
        }
        if let Some(constants) = &self.constants {
            total += constants.apply(module, session)?;
        }
        Ok(total)
    }
}

/// Base64-decode `s` and read the bytes as UTF-8, replacing invalid sequences.
fn decode_name(s: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// The resource name that `cctor` computes at run time instead of loading as a literal.
///
/// The encoded name is passed as `ldstr S; ldc.i4 K; call String(String, Int32)` to a
/// static helper that xors every UTF-16 unit of `S` with `K`. The result is the base64
/// form of the name, as the plain literal would be.
fn decrypt_resource_name(module: &Module, cctor: Token) -> Option<String> {
    let code = fingerprint::instructions(module, cctor);
    code.windows(3).find_map(|w| {
        let encoded = module.ldstr_value(&w[0])?;
        let key = w[1].ldc_i4_value()?;
        let helper = w[2].token_operand().filter(|_| w[2].is_call())?;
        if !module.method(helper).is_some_and(|m| {
            m.is_static() && m.is_method("System.String", &["System.String", "System.Int32"])
        }) {
            return None;
        }
        // ldc.i4 carries the key as int; the helper truncates it to a char
        let key = key as u16;
        let units: Vec<u16> = encoded.encode_utf16().map(|u| u ^ key).collect();
        String::from_utf16(&units).ok()
    })
}

/// Candidate names for the resource the protection's `cctor` refers to: every code
/// string as is, then its base64-decoded form, then the run-time computed name.
fn resource_candidates(module: &Module, cctor: Token) -> Vec<String> {
    let mut names = Vec::new();
    for s in fingerprint::code_strings(module, cctor) {
        let decoded = decode_name(&s);
        names.push(s);
        names.extend(decoded);
    }
    if let Some(computed) = decrypt_resource_name(module, cctor) {
        let decoded = decode_name(&computed);
        names.push(computed);
        names.extend(decoded);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        deobfuscation::{
            codecs::encoders,
            config::DeobConfig,
            events::{EventKind, EventLog},
            fingerprint,
            logger::Logger,
            obfuscators::Family,
            payload::ResourceDecrypter,
        },
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            module::Resource,
            token::Token,
            typesystem::{TypeAttributes, TypeDef},
        },
    };

    /// Resource cipher stand-in: xor with 0x5A.
    struct XorDecrypter;

    impl ResourceDecrypter for XorDecrypter {
        fn decrypt(&self, family: Family, data: &[u8]) -> Result<Vec<u8>> {
            assert_eq!(family, Family::CryptoObfuscator);
            Ok(data.iter().map(|b| b ^ 0x5A).collect())
        }
    }

    fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ 0x5A).collect()
    }

    fn method(module: &mut Module, ty: Token, name: &str, sig: MethodSig, body: &mut BodyBuilder) -> Token {
        module
            .add_method(ty, MethodDef::new(name, sig).with_body(body.build().unwrap()))
            .unwrap()
    }

    fn string_module(cctor_string: &str) -> (Module, Token) {
        let mut module = Module::new("Target.exe");
        module.assembly_name = Some("Target".into());
        let ty = module.add_type(TypeDef::new("", "c").with_flags(TypeAttributes::NOT_PUBLIC));
        module.add_field(ty, FieldDef::new("a", "System.Byte[]")).unwrap();
        module
            .add_method(
                ty,
                MethodDef::cctor().with_body(
                    BodyBuilder::new().ldstr(cctor_string).op("pop").ret().build().unwrap(),
                ),
            )
            .unwrap();
        let decrypter = method(
            &mut module,
            ty,
            "d",
            MethodSig::new("System.String", &["System.Int32"]),
            BodyBuilder::new().op("ldnull").ret(),
        );
        (module, decrypter)
    }

    #[test]
    fn strings_end_to_end() {
        let (mut module, decrypter) = string_module("names.res");
        let mut table = vec![0u8];
        encoders::utf16_string("first", &mut table);
        let second = table.len();
        encoders::utf16_string("second", &mut table);
        module.add_resource(Resource::new("names.res", xor(&table)));

        let app = module.add_type(TypeDef::new("App", "P"));
        let caller = method(
            &mut module,
            app,
            "Main",
            MethodSig::new("System.Void", &[]),
            BodyBuilder::new()
                .ldc_i4(1)
                .call(decrypter)
                .op("pop")
                .ldc_i4(i32::try_from(second).unwrap())
                .call(decrypter)
                .op("pop")
                .ret(),
        );

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let resources = XorDecrypter;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&resources);
        let mut found = CryptoObfuscator::detect(&module, &session).unwrap().unwrap();
        assert!(found.constants.is_none() && found.methods.is_none());
        found.initialize(&module, &session).unwrap();
        assert_eq!(found.apply(&mut module, &session).unwrap(), 2);

        let literals: Vec<&str> = fingerprint::instructions(&module, caller)
            .iter()
            .filter_map(Instruction::string_operand)
            .collect();
        assert_eq!(literals, vec!["first", "second"]);
    }

    #[test]
    fn string_resource_names() {
        let (module, _) = string_module("not a resource");
        let strings = StringDecrypter::find(&module).unwrap();
        assert_eq!(strings.resource_name(&module), "TargetTarget");

        // "cmVz" is base64 for "res"
        let (module, _) = string_module("cmVz");
        let strings = StringDecrypter::find(&module).unwrap();
        assert_eq!(strings.resource_name(&module), "res");
    }

    #[test]
    fn invalid_utf8_name_is_replaced() {
        // ff 72 65 73
        let (module, _) = string_module("/3Jlcw==");
        let strings = StringDecrypter::find(&module).unwrap();
        assert_eq!(strings.resource_name(&module), "\u{FFFD}res");
    }

    /// `.cctor` computing `name` as `Decode("<base64 of name> ^ key", key)`.
    fn computed_name_module(name: &str, key: i32) -> (Module, Token) {
        let (mut module, decrypter) = string_module("unused");
        let helpers = module.add_type(TypeDef::new("", "h"));
        let helper = method(
            &mut module,
            helpers,
            "x",
            MethodSig::new("System.String", &["System.String", "System.Int32"]),
            BodyBuilder::new().op("ldarg.0").ret(),
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(name);
        let hidden: String = encoded
            .encode_utf16()
            .map(|u| char::from_u32(u32::from(u ^ key as u16)).unwrap())
            .collect();
        let owner = module.method(decrypter).unwrap().declaring_type;
        let cctor = module.type_cctor(owner).unwrap();
        module.method_mut(cctor).unwrap().body = Some(
            BodyBuilder::new()
                .ldstr(&hidden)
                .ldc_i4(key)
                .call(helper)
                .op("pop")
                .ret()
                .build()
                .unwrap(),
        );
        (module, cctor)
    }

    #[test]
    fn computed_resource_names() {
        let (module, cctor) = computed_name_module("names.res", 0x100);
        let strings = StringDecrypter::find(&module).unwrap();
        assert_eq!(strings.resource_name(&module), "names.res");

        let candidates = resource_candidates(&module, cctor);
        assert_eq!(candidates.last().map(String::as_str), Some("names.res"));
    }

    #[test]
    fn decrypter_kept_before_other_methods() {
        let (mut module, decrypter) = string_module("names.res");
        let ty = module.method(decrypter).unwrap().declaring_type;
        method(
            &mut module,
            ty,
            "other",
            MethodSig::new("System.Void", &[]),
            BodyBuilder::new().ret(),
        );
        assert_eq!(StringDecrypter::find(&module).unwrap().decrypter, decrypter);
    }

    #[test]
    fn missing_collaborator_is_unavailable() {
        let (mut module, _) = string_module("names.res");
        module.add_resource(Resource::new("names.res", vec![1]));
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        let mut found = CryptoObfuscator::detect(&module, &session).unwrap().unwrap();
        assert!(matches!(
            found.initialize(&module, &session),
            Err(Error::PayloadUnavailable(_))
        ));
    }

    fn constants_module() -> (Module, Token, ConstantsDecrypter) {
        let mut module = Module::new("Target.exe");
        let ty = module.add_type(TypeDef::new("", "k"));
        for (name, ty_name) in [("a", "System.Byte[]"), ("b", "System.Int32"), ("c", "System.Int32")] {
            module.add_field(ty, FieldDef::new(name, ty_name)).unwrap();
        }
        module
            .add_method(
                ty,
                MethodDef::cctor().with_body(
                    BodyBuilder::new().ldstr("consts").op("pop").ret().build().unwrap(),
                ),
            )
            .unwrap();
        module
            .add_method(ty, MethodDef::ctor(&[]).with_body(BodyBuilder::new().ret().build().unwrap()))
            .unwrap();
        for ret in ["System.Int32", "System.Int64", "System.Single", "System.Double"] {
            method(
                &mut module,
                ty,
                "get",
                MethodSig::new(ret, &["System.Int32"]),
                BodyBuilder::new().op("ldnull").ret(),
            );
        }
        method(
            &mut module,
            ty,
            "init",
            MethodSig::new("System.Void", &["System.Array", "System.Int32"]),
            BodyBuilder::new().ret(),
        );
        let found = ConstantsDecrypter::find(&module).unwrap();
        (module, ty, found)
    }

    #[test]
    fn constants_and_arrays() {
        let (mut module, _, found) = constants_module();
        let mut data = Vec::new();
        data.extend_from_slice(&1234i32.to_le_bytes());
        data.extend_from_slice(&(-5i64).to_le_bytes());
        data.extend_from_slice(&2.5f64.to_le_bytes());
        let array_offset = data.len();
        encoders::varint(8, &mut data);
        data.extend_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0]);
        module.add_resource(Resource::new("consts", xor(&data)));

        let int32 = module.import_type("System.Int32");
        let app = module.add_type(TypeDef::new("App", "P"));
        let caller = method(
            &mut module,
            app,
            "Main",
            MethodSig::new("System.Void", &[]),
            BodyBuilder::new()
                .ldc_i4(0)
                .call(found.int32)
                .op("pop")
                .ldc_i4(4)
                .call(found.int64)
                .op("pop")
                .ldc_i4(12)
                .call(found.double)
                .op("pop")
                .ldc_i4(3)
                .op_token("newarr", int32)
                .op("dup")
                .ldc_i4(i32::try_from(array_offset).unwrap())
                .call(found.array)
                .op("pop")
                .ret(),
        );

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let resources = XorDecrypter;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&resources);
        let mut family = CryptoObfuscator::detect(&module, &session).unwrap().unwrap();
        family.initialize(&module, &session).unwrap();
        assert_eq!(family.apply(&mut module, &session).unwrap(), 4);

        let code = fingerprint::instructions(&module, caller);
        assert_eq!(code[0], Instruction::ldc_i4(1234));
        assert_eq!(code[2], Instruction::ldc_i8(-5));
        assert_eq!(code[4], Instruction::ldc_r8(2.5));
        assert_eq!(code[6], Instruction::ldc_i4(3));
        assert!(code[8].is(0x25));
        let field = code[9].token_operand().unwrap();
        assert_eq!(
            module.field(field).unwrap().initial_value.as_deref(),
            Some(&[1u8, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0][..])
        );
        assert_eq!(events.count_kind(EventKind::ArrayDecrypted), 1);
        assert_eq!(events.count_kind(EventKind::ConstantDecrypted), 3);
    }

    fn methods_module() -> (Module, Token, Token) {
        let mut module = Module::new("Target.exe");
        let ty = module.add_type(TypeDef::new("", "m"));
        module.add_nested_type(ty, TypeDef::new("", "n")).unwrap();
        for (name, ty_name) in [
            ("a", "System.Byte[]"),
            ("b", "System.Collections.Generic.Dictionary`2<System.Int32,System.Int32>"),
            ("c", "System.ModuleHandle"),
        ] {
            module.add_field(ty, FieldDef::new(name, ty_name)).unwrap();
        }
        module
            .add_method(
                ty,
                MethodDef::cctor().with_body(
                    BodyBuilder::new().ldstr("bodies").op("pop").ret().build().unwrap(),
                ),
            )
            .unwrap();
        let decrypt = method(
            &mut module,
            ty,
            "decrypt",
            MethodSig::new("System.Void", &["System.Int32", "System.Int32", "System.Int32"]),
            BodyBuilder::new().locals(REQUIRED_LOCALS_FOR_TEST).ret(),
        );

        let app = module.add_type(TypeDef::new("App", "P"));
        let stub = method(
            &mut module,
            app,
            "Hidden",
            MethodSig::new("System.Int32", &[]),
            BodyBuilder::new().op("ldnull").op("throw"),
        );
        let delegate = module.add_type(TypeDef::new("", "del").with_base("System.MulticastDelegate"));
        module
            .add_method(
                delegate,
                MethodDef::cctor().with_body(
                    BodyBuilder::new()
                        .ldc_i4(delegate.value() as i32)
                        .ldc_i4(stub.value() as i32)
                        .ldc_i4(app.value() as i32)
                        .call(decrypt)
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        (module, delegate, stub)
    }

    const REQUIRED_LOCALS_FOR_TEST: &[&str] = &[
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
    ];

    #[test]
    fn method_bodies_restored() {
        let (mut module, delegate, stub) = methods_module();
        let mut data = Vec::new();
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&(delegate.value() as i32).to_le_bytes());
        data.extend_from_slice(&12u32.to_le_bytes());
        // tiny header, ldc.i4.7; ret
        data.extend_from_slice(&[0x0A, 0x1D, 0x2A]);
        module.add_resource(Resource::new("bodies", xor(&data)));
        let users = module.add_type(TypeDef::new("App", "Users"));
        let caller = method(
            &mut module,
            users,
            "Run",
            MethodSig::new("System.Void", &[]),
            BodyBuilder::new().call(stub).op("pop").ret(),
        );
        let bystander = method(
            &mut module,
            users,
            "Idle",
            MethodSig::new("System.Void", &[]),
            BodyBuilder::new().ret(),
        );

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let resources = XorDecrypter;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&resources);
        let mut family = CryptoObfuscator::detect(&module, &session).unwrap().unwrap();
        assert!(family.methods.is_some());
        family.initialize(&module, &session).unwrap();
        assert_eq!(
            family.methods.as_ref().unwrap().delegate_types().unwrap(),
            vec![delegate]
        );
        assert_eq!(family.apply(&mut module, &session).unwrap(), 1);

        assert_eq!(
            fingerprint::instructions(&module, stub),
            &[Instruction::ldc_i4(7), Instruction::ret()]
        );
        assert!(module.modified_methods().contains(&stub));
        assert!(module.modified_methods().contains(&caller));
        assert!(!module.modified_methods().contains(&bystander));
        assert_eq!(events.count_kind(EventKind::MethodBodyDecrypted), 1);
    }

    #[test]
    fn wrong_delegate_token_is_rejected() {
        let (mut module, delegate, _) = methods_module();
        let mut data = Vec::new();
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&((delegate.value() + 1) as i32).to_le_bytes());
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&[0x0A, 0x1D, 0x2A]);
        module.add_resource(Resource::new("bodies", xor(&data)));

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let resources = XorDecrypter;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&resources);
        let mut family = CryptoObfuscator::detect(&module, &session).unwrap().unwrap();
        family.initialize(&module, &session).unwrap();
        assert!(matches!(
            family.apply(&mut module, &session),
            Err(Error::Decode(message)) if message.contains("delegate type")
        ));
    }
}
