//! Babel.NET.
//!
//! Two protections are handled: constant encryption ([`ConstantsDecrypter`]) and embedded
//! assemblies served by an `AssemblyResolve` handler ([`AssemblyResolver`]). Both keep
//! their data in resources encrypted with Babel's resource cipher, which is provided by
//! the session's resource decrypter.
//!
//! Unpacked assemblies are not merged into the module. They are left in
//! [`AssemblyResolver::assemblies`] for the caller to save or load.

mod constants;
mod resolver;

pub use constants::ConstantsDecrypter;
pub use resolver::{AssemblyResolver, EmbeddedAssembly};

use crate::{
    deobfuscation::context::Session,
    metadata::module::Module,
    Error, Result,
};

/// The Babel.NET protections found in a module.
#[derive(Debug, Clone, PartialEq)]
pub struct BabelNet {
    /// Constant encryption
    pub constants: Option<ConstantsDecrypter>,
    /// Embedded assembly resolver
    pub resolver: Option<AssemblyResolver>,
}

impl BabelNet {
    /// Detected when either protection is found.
    ///
    /// # Errors
    /// Returns [`crate::Error::PartialDetection`] for a resolver type without its decrypt
    /// method.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let found = BabelNet {
            constants: ConstantsDecrypter::find(module),
            resolver: AssemblyResolver::find(module)?,
        };
        Ok((found.constants.is_some() || found.resolver.is_some()).then_some(found))
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(BabelNet {
            constants: self.constants.as_ref().map(|c| c.rebind(old, new)).transpose()?,
            resolver: self.resolver.as_ref().map(|r| r.rebind(old, new)).transpose()?,
        })
    }

    /// Load the constant tables and unpack the embedded assemblies.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if nothing could be loaded.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let mut loaded = false;
        let mut missing = Vec::new();

        if let Some(constants) = self.constants.as_mut().filter(|_| session.config.decrypt_constants) {
            match constants.initialize(module, session) {
                Ok(()) => loaded = true,
                Err(Error::PayloadUnavailable(reason)) => {
                    deob_warn!(session.logger, "Could not find encrypted constants resource");
                    missing.push(reason);
                }
                Err(other) => return Err(other),
            }
        }
        if let Some(resolver) = self.resolver.as_mut().filter(|_| session.config.decrypt_resources) {
            match resolver.initialize(module, session) {
                Ok(()) => loaded = true,
                Err(Error::PayloadUnavailable(reason)) => {
                    deob_warn!(session.logger, "Could not find embedded assemblies resource");
                    missing.push(reason);
                }
                Err(other) => return Err(other),
            }
        }

        if !loaded && !missing.is_empty() {
            return Err(Error::PayloadUnavailable(missing.join(", ")));
        }
        Ok(())
    }

    /// Inline constants. Returns the number of rewrites.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        match &self.constants {
            Some(constants) => constants.apply(module, session),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        deobfuscation::{
            codecs::{encoders, PrimitiveType, TypedTables},
            config::DeobConfig,
            events::{EventKind, EventLog},
            fingerprint,
            logger::Logger,
            obfuscators::Family,
            payload::ResourceDecrypter,
            rewriter::RUNTIME_HELPERS,
        },
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            module::Resource,
            token::Token,
            typesystem::TypeDef,
        },
    };

    /// Babel's resource cipher stand-in: bytes reversed.
    struct Reverse;

    impl ResourceDecrypter for Reverse {
        fn decrypt(&self, family: Family, data: &[u8]) -> Result<Vec<u8>> {
            assert_eq!(family, Family::BabelNet);
            Ok(data.iter().rev().copied().collect())
        }
    }

    fn reversed(data: &[u8]) -> Vec<u8> {
        data.iter().rev().copied().collect()
    }

    fn accessor(module: &mut Module, ty: Token, ret: &str, param: &str) -> Token {
        module
            .add_method(
                ty,
                MethodDef::new("get", MethodSig::new(ret, &[param]))
                    .with_body(BodyBuilder::new().op("ldnull").ret().build().unwrap()),
            )
            .unwrap()
    }

    fn constants_module() -> (Module, ConstantsDecrypter) {
        let mut module = Module::new("Target.exe");
        let ty = module.add_type(TypeDef::new("", "Consts"));
        let nested = module.add_nested_type(ty, TypeDef::new("", "Tables")).unwrap();
        let own = module.type_name(nested).unwrap();
        for (name, field_type) in [
            ("i", "System.Int32[]"),
            ("l", "System.Int64[]"),
            ("f", "System.Single[]"),
            ("d", "System.Double[]"),
            ("instance", own.as_str()),
        ] {
            module.add_field(nested, FieldDef::new(name, field_type)).unwrap();
        }
        module
            .add_method(
                nested,
                MethodDef::ctor(&[]).with_body(
                    BodyBuilder::new().ldstr("consts.bin").op("pop").ret().build().unwrap(),
                ),
            )
            .unwrap();
        for ret in ["System.Int32", "System.Int64", "System.Single", "System.Double"] {
            accessor(&mut module, ty, ret, "System.Int32");
        }
        accessor(&mut module, ty, "System.Array", "System.Byte[]");
        let found = ConstantsDecrypter::find(&module).unwrap();
        (module, found)
    }

    #[test]
    fn constants_and_arrays_inlined() {
        let (mut module, found) = constants_module();
        let tables = TypedTables {
            ints: vec![10, 20, 30],
            longs: vec![-1],
            floats: vec![0.5],
            doubles: vec![],
        };
        module.add_resource(Resource::new(
            "consts.bin",
            reversed(&encoders::typed_tables(&tables, true)),
        ));

        let values: Vec<u8> = [7i32, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
        let graph = encoders::primitive_array_graph(PrimitiveType::Int32, 2, &values);
        let holder = module.add_type(TypeDef::new("", "<Data>"));
        let encrypted = module
            .add_field(holder, FieldDef::new("blob", "System.Byte[]").with_rva(0x2000, reversed(&graph)))
            .unwrap();

        let byte = module.import_type("System.Byte");
        let int_array = module.import_type("System.Int32[]");
        let init = module.add_member_ref(
            RUNTIME_HELPERS,
            "InitializeArray",
            MethodSig::new("System.Void", &["System.Array", "System.RuntimeFieldHandle"]),
        );
        let app = module.add_type(TypeDef::new("App", "P"));
        let main = module
            .add_method(
                app,
                MethodDef::new("Main", MethodSig::new("System.Void", &[])).with_body(
                    BodyBuilder::new()
                        .ldc_i4(2)
                        .call(found.int32)
                        .op("pop")
                        .ldc_i4(0)
                        .call(found.single)
                        .op("pop")
                        .ldc_i4(i32::try_from(graph.len()).unwrap())
                        .op_token("newarr", byte)
                        .op("dup")
                        .op_token("ldtoken", encrypted)
                        .call(init)
                        .call(found.array)
                        .op_token("castclass", int_array)
                        .op("pop")
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let cipher = Reverse;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&cipher);
        let mut babel = BabelNet::detect(&module, &session).unwrap().unwrap();
        assert!(babel.resolver.is_none());
        babel.initialize(&module, &session).unwrap();
        assert_eq!(babel.apply(&mut module, &session).unwrap(), 3);

        let code = fingerprint::instructions(&module, main);
        assert_eq!(code[0], Instruction::ldc_i4(30));
        assert_eq!(code[2], Instruction::ldc_r4(0.5));
        assert_eq!(code[4], Instruction::ldc_i4(2));
        let data = code[7].token_operand().and_then(|f| module.field(f)).unwrap();
        assert_eq!(data.initial_value.as_deref(), Some(values.as_slice()));
        assert_eq!(events.count_kind(EventKind::ArrayDecrypted), 1);
    }

    #[test]
    fn bad_index_leaves_call() {
        let (mut module, found) = constants_module();
        let tables = TypedTables {
            ints: vec![1],
            ..TypedTables::default()
        };
        module.add_resource(Resource::new(
            "consts.bin",
            reversed(&encoders::typed_tables(&tables, true)),
        ));
        let app = module.add_type(TypeDef::new("App", "P"));
        let main = module
            .add_method(
                app,
                MethodDef::new("Main", MethodSig::new("System.Void", &[])).with_body(
                    BodyBuilder::new().ldc_i4(5).call(found.int32).op("pop").ret().build().unwrap(),
                ),
            )
            .unwrap();

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let cipher = Reverse;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&cipher);
        let mut babel = BabelNet::detect(&module, &session).unwrap().unwrap();
        babel.initialize(&module, &session).unwrap();
        assert_eq!(babel.apply(&mut module, &session).unwrap(), 0);
        assert_eq!(fingerprint::instructions(&module, main).len(), 4);
    }

    fn resolver_module(with_decrypt: bool) -> Module {
        let mut module = Module::new("Target.exe");
        let ty = module.add_type(TypeDef::new("", "Resolver"));
        for (name, field_type) in [
            ("a", "System.Object"),
            ("b", "System.Int32"),
            ("c", "System.Collections.Hashtable"),
        ] {
            module.add_field(ty, FieldDef::new(name, field_type)).unwrap();
        }
        let handler = module
            .add_method(
                ty,
                MethodDef::new(
                    "Resolve",
                    MethodSig::new("System.Reflection.Assembly", &["System.Object", "System.ResolveEventArgs"]),
                ),
            )
            .unwrap();
        let ctor = module.add_member_ref(
            "System.ResolveEventHandler",
            ".ctor",
            MethodSig::instance("System.Void", &["System.Object", "System.IntPtr"]),
        );
        module
            .add_method(
                ty,
                MethodDef::new("Register", MethodSig::new("System.Void", &[])).with_body(
                    BodyBuilder::new()
                        .op("ldnull")
                        .op_token("ldftn", handler)
                        .op_token("newobj", ctor)
                        .op("pop")
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        if with_decrypt {
            module
                .add_method(
                    ty,
                    MethodDef::new("Decrypt", MethodSig::new("System.Void", &["System.IO.Stream"]))
                        .with_body(BodyBuilder::new().ldstr("asm.bin").op("pop").ret().build().unwrap()),
                )
                .unwrap();
        }
        module
    }

    #[test]
    fn resolver_without_decrypt_is_partial() {
        let module = resolver_module(false);
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        assert!(matches!(
            BabelNet::detect(&module, &session),
            Err(Error::PartialDetection { family: Family::BabelNet, .. })
        ));
    }

    #[test]
    fn resolver_without_resource_is_unavailable() {
        let module = resolver_module(true);
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let cipher = Reverse;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&cipher);
        let mut babel = BabelNet::detect(&module, &session).unwrap().unwrap();
        assert!(babel.constants.is_none());
        assert!(matches!(
            babel.initialize(&module, &session),
            Err(Error::PayloadUnavailable(_))
        ));
        assert!(logger
            .history()
            .iter()
            .any(|line| line.contains("Could not find embedded assemblies resource")));
    }
}
