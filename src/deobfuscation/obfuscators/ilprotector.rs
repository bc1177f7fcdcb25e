//! ILProtector runtime loader.
//!
//! The module `.cctor` loads a native runtime through two `Protect` (later `P0`)
//! imports and stores an invoker delegate in a field of `<Module>`. The native side is
//! not handled; detection records the imports and cleanup empties the `.cctor`.

use crate::{
    assembly::Instruction,
    deobfuscation::{
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
    },
    metadata::{body::MethodBody, method::PInvokeInfo, module::Module, token::Token},
    Result,
};

const LOCALS_V1: TypeList<'static> =
    TypeList::distinct(&["System.Boolean", "System.IntPtr", "System.Object[]"]);
const LOCALS_V2: TypeList<'static> = TypeList::distinct(&["System.IntPtr"]);

/// A detected ILProtector loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IlProtector {
    /// Type holding the loader, `<Module>`
    pub main_type: Token,
    /// Field holding the invoker delegate
    pub invoker_field: Token,
    /// The delegate type of [`IlProtector::invoker_field`]
    pub invoker_delegate: Token,
    /// The two runtime imports
    pub runtime_files: Vec<PInvokeInfo>,
    /// Runtime generation, from the loader's locals
    pub generation: u8,
}

impl IlProtector {
    /// Inspect the module `.cctor`.
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let Some(cctor) = module.module_type_cctor() else {
            return Ok(None);
        };
        let locals = fingerprint::local_types(module, cctor);
        let generation = if LOCALS_V1.matches(locals) {
            1
        } else if LOCALS_V2.matches(locals) {
            2
        } else {
            return Ok(None);
        };
        let Some(main_type) = module.method(cctor).map(|m| m.declaring_type) else {
            return Ok(None);
        };

        let mut imports = fingerprint::get_pinvoke_methods(module, main_type, "Protect");
        if imports.is_empty() {
            imports = fingerprint::get_pinvoke_methods(module, main_type, "P0");
        }
        if imports.len() != 2 {
            return Ok(None);
        }
        let Some(def) = module.type_def(main_type) else {
            return Ok(None);
        };
        if !(1..=2).contains(&def.fields.len()) {
            return Ok(None);
        }
        let Some((invoker_field, invoker_delegate)) = def.fields.iter().find_map(|&f| {
            let field_type = module.find_type(&module.field(f)?.field_type)?;
            module
                .type_def(field_type)?
                .is_delegate()
                .then_some((f, field_type))
        }) else {
            return Ok(None);
        };

        Ok(Some(IlProtector {
            main_type,
            invoker_field,
            invoker_delegate,
            runtime_files: imports
                .iter()
                .filter_map(|&m| module.method(m)?.pinvoke.clone())
                .collect(),
            generation,
        }))
    }

    /// Runtime generation as `1.x` or `2.x`.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        Some(format!("{}.x", self.generation))
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(IlProtector {
            main_type: new.rebind_type(old, self.main_type)?,
            invoker_field: new.rebind_field(old, self.invoker_field)?,
            invoker_delegate: new.rebind_type(old, self.invoker_delegate)?,
            runtime_files: self.runtime_files.clone(),
            generation: self.generation,
        })
    }

    /// Replace the module `.cctor` body with a bare `ret`.
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        if !session.config.remove_init_calls {
            return Ok(0);
        }
        let Some(cctor) = module.module_type_cctor() else {
            return Ok(0);
        };
        let Some(def) = module.method_mut(cctor) else {
            return Ok(0);
        };
        let mut body = MethodBody::new(vec![Instruction::ret()]);
        body.init_locals = false;
        def.body = Some(body);
        module.mark_modified(cctor);
        session
            .reporter()
            .record(EventKind::ArtifactRemoved)
            .method(cctor)
            .message("ILProtector loader");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deobfuscation::{config::DeobConfig, events::EventLog, logger::Logger},
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            typesystem::TypeDef,
        },
    };

    fn loader(entry: &str, imports: usize) -> Module {
        let mut module = Module::new("a.exe");
        let global = module.find_type("<Module>").unwrap();
        module.add_type(TypeDef::new("", "Invoker").with_base("System.MulticastDelegate"));
        module.add_field(global, FieldDef::new("invoker", "Invoker")).unwrap();
        for i in 0..imports {
            module
                .add_method(
                    global,
                    MethodDef::new(&format!("p{i}"), MethodSig::new("System.IntPtr", &["System.Int32"]))
                        .with_pinvoke(if i == 0 { "Protect32.dll" } else { "Protect64.dll" }, entry),
                )
                .unwrap();
        }
        module
            .add_method(
                global,
                MethodDef::cctor().with_body(
                    BodyBuilder::new()
                        .locals(&["System.IntPtr"])
                        .op("nop")
                        .ret()
                        .build()
                        .unwrap(),
                ),
            )
            .unwrap();
        module
    }

    #[test]
    fn loader_detected_and_emptied() {
        let mut module = loader("P0", 2);
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);

        let found = IlProtector::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.generation, 2);
        assert_eq!(found.runtime_files[1].module, "Protect64.dll");
        assert_eq!(found.apply(&mut module, &session).unwrap(), 1);

        let cctor = module.module_type_cctor().unwrap();
        assert_eq!(fingerprint::instructions(&module, cctor), &[Instruction::ret()]);
        assert!(fingerprint::local_types(&module, cctor).is_empty());
        assert!(module.modified_methods().contains(&cctor));
    }

    #[test]
    fn needs_two_imports() {
        let module = loader("Protect", 1);
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        assert!(IlProtector::detect(&module, &session).unwrap().is_none());
    }
}
