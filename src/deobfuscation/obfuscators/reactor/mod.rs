//! .NET Reactor 3.x.
//!
//! Two parts are handled. In application mode the real assembly is stored AES-encrypted
//! in a resource and loaded by a resolver class that also imports
//! `kernel32!CloseHandle`; the key and IV are byte arrays initialized in the decrypt
//! method. The native runtime may be embedded as a resource and written to disk by
//! [`NativeLibSaver`], called from the module `.cctor`.
//!
//! The unpacked assembly is not merged. It is left in [`ApplicationMode::assembly`].

mod decrypter;
mod native;

pub use decrypter::ReactorDecrypter;
pub use native::{NativeLibSaver, NATIVE_LIB_TYPE};

use crate::{
    deobfuscation::{
        context::Session, events::EventKind, fingerprint, payload::resource_from_code_strings,
        rewriter::remove_calls,
    },
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// The application-mode loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMode {
    /// Resolver class importing `CloseHandle`
    pub resolver_type: Token,
    /// Its decrypt method and key material
    pub decrypter: ReactorDecrypter,
    /// Resource holding the encrypted assembly
    pub resource: Option<String>,
    /// The decrypted assembly, after [`DotNetReactor::initialize`]
    pub assembly: Option<Vec<u8>>,
}

impl ApplicationMode {
    /// Find a class importing `kernel32!CloseHandle` with a decrypt method.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        module.types().into_iter().find_map(|ty| {
            let imports_close_handle = fingerprint::get_pinvoke_methods(module, ty, "CloseHandle")
                .into_iter()
                .filter_map(|m| module.method(m)?.pinvoke.as_ref())
                .any(|p| p.module.trim_end_matches(".dll").eq_ignore_ascii_case("kernel32"));
            if !imports_close_handle {
                return None;
            }
            let methods = module.type_def(ty)?.methods.clone();
            let decrypter = methods.iter().find_map(|&m| {
                if !ReactorDecrypter::could_be_decrypt_method(module, m, &[]) {
                    return None;
                }
                ReactorDecrypter::from_method(module, m)
            })?;
            Some(ApplicationMode {
                resolver_type: ty,
                decrypter,
                resource: resource_from_code_strings(module, &methods),
                assembly: None,
            })
        })
    }

    fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(ApplicationMode {
            resolver_type: new.rebind_type(old, self.resolver_type)?,
            decrypter: self.decrypter.rebind(old, new)?,
            resource: self.resource.clone(),
            assembly: self.assembly.clone(),
        })
    }
}

/// The .NET Reactor protections found in a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotNetReactor {
    /// Application-mode loader
    pub application_mode: Option<ApplicationMode>,
    /// Native runtime saver
    pub native_lib: Option<NativeLibSaver>,
}

impl DotNetReactor {
    /// Detected when either part is found.
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let found = DotNetReactor {
            application_mode: ApplicationMode::find(module),
            native_lib: NativeLibSaver::find(module),
        };
        Ok((found.application_mode.is_some() || found.native_lib.is_some()).then_some(found))
    }

    /// Only 3.x layouts are recognized.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        Some("3.x".to_string())
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(DotNetReactor {
            application_mode: self
                .application_mode
                .as_ref()
                .map(|a| a.rebind(old, new))
                .transpose()?,
            native_lib: self.native_lib.as_ref().map(|n| n.rebind(old, new)).transpose()?,
        })
    }

    /// Decrypt the application-mode assembly.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] when the encrypted resource is
    /// missing, and [`crate::Error::Crypto`] when it does not decrypt.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let Some(app) = self.application_mode.as_mut().filter(|_| session.config.decrypt_resources) else {
            return Ok(());
        };
        let data = app
            .resource
            .as_deref()
            .and_then(|name| module.resource(name))
            .map(|r| r.data.as_slice())
            .ok_or_else(|| Error::PayloadUnavailable("application mode assembly resource".to_string()))?;
        let assembly = app.decrypter.decrypt(data)?;
        deob_verbose!(session.logger, "Decrypted application mode assembly ({} bytes)", assembly.len());
        session
            .reporter()
            .record(EventKind::ResourceDecrypted)
            .message(app.resource.clone().unwrap_or_default());
        app.assembly = Some(assembly);
        Ok(())
    }

    /// Remove the native lib saver's init call and its resource.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let Some(saver) = self.native_lib.as_ref().filter(|_| session.config.remove_init_calls) else {
            return Ok(0);
        };
        let reporter = session.reporter();
        let mut total = remove_calls(module, saver.init_method)?;
        if total > 0 {
            reporter
                .record(EventKind::ArtifactRemoved)
                .method(saver.init_method)
                .message("native lib saver call");
        }
        if let Some(name) = &saver.resource {
            if module.remove_resource(name).is_some() {
                deob_verbose!(session.logger, "Removed native lib resource {}", name);
                reporter.record(EventKind::ArtifactRemoved).message(name.clone());
                total += 1;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::{decrypter::tests::decrypt_method, *};
    use crate::{
        assembly::Instruction,
        deobfuscation::{config::DeobConfig, events::EventLog, logger::Logger},
        metadata::{
            builder::BodyBuilder,
            method::{MethodDef, MethodSig},
            module::Resource,
            typesystem::TypeDef,
        },
        utils::crypto,
    };

    #[test]
    fn application_mode_assembly() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "Loader"));
        module
            .add_method(
                ty,
                MethodDef::new("CloseHandle", MethodSig::new("System.Boolean", &["System.IntPtr"]))
                    .with_pinvoke("kernel32.dll", "CloseHandle"),
            )
            .unwrap();
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        decrypt_method(&mut module, ty, &key, &iv);
        module
            .add_method(
                ty,
                MethodDef::new("Resolve", MethodSig::new("System.Void", &[]))
                    .with_body(BodyBuilder::new().ldstr("app.bin").op("pop").ret().build().unwrap()),
            )
            .unwrap();
        module.add_resource(Resource::new(
            "app.bin",
            crypto::aes_cbc_encrypt(&key, &iv, b"MZ real assembly").unwrap(),
        ));

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        let mut found = DotNetReactor::detect(&module, &session).unwrap().unwrap();
        assert!(found.native_lib.is_none());
        assert_eq!(found.version().as_deref(), Some("3.x"));
        found.initialize(&module, &session).unwrap();
        let app = found.application_mode.unwrap();
        assert_eq!(app.assembly.as_deref(), Some(&b"MZ real assembly"[..]));
    }

    #[test]
    fn native_lib_saver_removed() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", NATIVE_LIB_TYPE));
        let save = module
            .add_method(
                ty,
                MethodDef::new("Save", MethodSig::new("System.Void", &[]))
                    .with_body(BodyBuilder::new().ldstr("native.dll").op("pop").ret().build().unwrap()),
            )
            .unwrap();
        let global = module.find_type("<Module>").unwrap();
        module
            .add_method(
                global,
                MethodDef::cctor().with_body(BodyBuilder::new().call(save).ret().build().unwrap()),
            )
            .unwrap();
        module.add_resource(Resource::new("native.dll", vec![0x4D, 0x5A]));

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        let found = DotNetReactor::detect(&module, &session).unwrap().unwrap();
        assert_eq!(found.native_lib.as_ref().unwrap().resource.as_deref(), Some("native.dll"));
        assert_eq!(found.apply(&mut module, &session).unwrap(), 2);
        assert!(module.resource("native.dll").is_none());
        let cctor = module.module_type_cctor().unwrap();
        assert_eq!(fingerprint::instructions(&module, cctor), &[Instruction::ret()]);
    }
}
