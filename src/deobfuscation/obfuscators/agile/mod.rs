//! Agile.NET (formerly CliSecure).
//!
//! Strings go through a `String(String)` decrypter of the runtime class and are
//! restored by the dynamic worker. Resources are packed into one DES-encrypted assembly
//! that the session's resource decrypter opens. The VM handler classes of the code
//! virtualization are described by [`CsVmHandler`]; devirtualization itself is not done.

mod clisecure;
mod resources;
mod vm;

pub use clisecure::CliSecureRt;
pub use resources::{decrypt_resource, ResourceDecrypter};
pub use vm::CsVmHandler;

use crate::{
    deobfuscation::{
        context::Session, events::EventKind, inliner::DynamicStringInliner, rewriter::remove_calls,
    },
    metadata::{module::Module, token::Token},
    Result,
};

/// The Agile.NET protections found in a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgileNet {
    /// CliSecure runtime and string decrypters
    pub runtime: Option<CliSecureRt>,
    /// Resource encryption
    pub resources: Option<ResourceDecrypter>,
}

impl AgileNet {
    /// Detected when the runtime or the resource resolver is found.
    ///
    /// # Errors
    /// Propagates runtime search errors.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let found = AgileNet {
            runtime: CliSecureRt::find(module)?,
            resources: ResourceDecrypter::find(module),
        };
        Ok((found.runtime.is_some() || found.resources.is_some()).then_some(found))
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(AgileNet {
            runtime: self.runtime.as_ref().map(|r| r.rebind(old, new)).transpose()?,
            resources: self.resources.as_ref().map(|r| r.rebind(old, new)).transpose()?,
        })
    }

    /// Report what the runtime looks like. The payloads are read in [`AgileNet::apply`].
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        if let Some(runtime) = &self.runtime {
            if runtime.found_signature && runtime.rt_type.is_none() {
                deob_warn!(session.logger, "Only the native CliSecure runtime was found");
            } else if runtime.is_at_least_v50(module) {
                deob_verbose!(session.logger, "CliSecure runtime 5.0 or later");
            }
        }
        Ok(())
    }

    /// Decrypt strings and resources, then drop the runtime's init calls.
    ///
    /// # Errors
    /// Returns worker, decryption and rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &mut Session) -> Result<usize> {
        let mut total = 0;
        if let Some(runtime) = &self.runtime {
            if session.config.decrypt_strings && !runtime.string_decrypters.is_empty() {
                total += DynamicStringInliner::new(runtime.string_decrypters.clone()).inline(module, session)?;
            }
        }

        let mut init_calls: Vec<Token> = Vec::new();
        if let Some(resources) = self.resources.as_ref().filter(|_| session.config.decrypt_resources) {
            let added = resources.merge_resources(module, session)?;
            total += added;
            if added > 0 {
                init_calls.push(resources.init_method);
            }
        }
        if let Some(runtime) = &self.runtime {
            init_calls.extend(runtime.initialize_method);
            init_calls.extend(runtime.post_initialize_method);
        }

        if session.config.remove_init_calls {
            for target in init_calls {
                if !module.method(target).is_some_and(|m| m.is_method("System.Void", &[])) {
                    continue;
                }
                let removed = remove_calls(module, target)?;
                if removed > 0 {
                    session
                        .reporter()
                        .record(EventKind::ArtifactRemoved)
                        .method(target)
                        .message(format!("{removed} init call(s)"));
                }
                total += removed;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        deobfuscation::{
            config::DeobConfig, events::EventLog, fingerprint, logger::Logger, rpc::Value,
        },
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            typesystem::TypeDef,
        },
        test::factories::ScriptedClient,
    };

    fn protected() -> (Module, Token, Token) {
        let mut module = Module::new("a.exe");
        let rt = module.add_type(TypeDef::new("", "<AgileDotNetRT>"));
        module.add_field(rt, FieldDef::new("done", "System.Boolean")).unwrap();
        module
            .add_method(
                rt,
                MethodDef::new("_Initialize64", MethodSig::new("System.Int32", &["System.IntPtr"]))
                    .with_pinvoke("AgileDotNetRT64.dll", "_Initialize64"),
            )
            .unwrap();
        let init = module
            .add_method(
                rt,
                MethodDef::new("Initialize", MethodSig::new("System.Void", &[]))
                    .with_body(BodyBuilder::new().ret().build().unwrap()),
            )
            .unwrap();
        let cs = module
            .add_method(
                rt,
                MethodDef::new("cs", MethodSig::new("System.String", &["System.String"]))
                    .with_body(BodyBuilder::new().op("ldarg.0").ret().build().unwrap()),
            )
            .unwrap();
        let global = module.find_type("<Module>").unwrap();
        module
            .add_method(
                global,
                MethodDef::cctor().with_body(BodyBuilder::new().call(init).ret().build().unwrap()),
            )
            .unwrap();
        let app = module.add_type(TypeDef::new("App", "Program"));
        let main = module
            .add_method(
                app,
                MethodDef::new("Main", MethodSig::new("System.Void", &[])).with_body(
                    BodyBuilder::new().ldstr("xq9").call(cs).op("pop").ret().build().unwrap(),
                ),
            )
            .unwrap();
        (module, main, init)
    }

    #[test]
    fn strings_and_init_call() {
        let (mut module, main, _) = protected();
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let mut client = ScriptedClient::new(vec![
            Value::Int32(1),
            Value::Array(vec![Value::String("plain".into())]),
        ]);
        let mut session = Session::new(&config, &logger, &events).with_dynamic(&mut client);

        let mut agile = AgileNet::detect(&module, &session).unwrap().unwrap();
        assert!(agile.resources.is_none());
        agile.initialize(&module, &session).unwrap();
        assert_eq!(agile.apply(&mut module, &mut session).unwrap(), 2);

        assert_eq!(fingerprint::instructions(&module, main)[0], Instruction::ldstr("plain"));
        let cctor = module.module_type_cctor().unwrap();
        assert_eq!(fingerprint::instructions(&module, cctor), &[Instruction::ret()]);
        assert_eq!(events.count_kind(EventKind::ArtifactRemoved), 1);
    }

    #[test]
    fn init_call_kept_when_disabled() {
        let (mut module, _, init) = protected();
        let config = DeobConfig {
            decrypt_strings: false,
            remove_init_calls: false,
            ..DeobConfig::default()
        };
        let (logger, events) = (Logger::new(), EventLog::new());
        let mut session = Session::new(&config, &logger, &events);
        let agile = AgileNet::detect(&module, &session).unwrap().unwrap();
        assert_eq!(agile.apply(&mut module, &mut session).unwrap(), 0);
        let cctor = module.module_type_cctor().unwrap();
        assert!(fingerprint::called_methods(&module, cctor).contains(&init));
    }
}
