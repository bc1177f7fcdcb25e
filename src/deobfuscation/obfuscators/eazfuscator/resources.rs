//! Eazfuscator.NET resource resolver.
//!
//! Resources are moved into satellite assemblies embedded in the main module. An init
//! method called from the module `.cctor` installs a `ResourceResolve` handler, and an
//! info method lists the satellites as `name|flags:name|flags`.

use crate::{
    deobfuscation::{context::Session, events::EventKind, fingerprint},
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// The resolver class and the satellite assemblies it lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResolver {
    /// Resolver class
    pub resolver_type: Token,
    /// Static `Void()` installing the handler
    pub init_method: Token,
    /// The installed resolve handler
    pub handler: Token,
    /// Satellite names, filled by [`ResourceResolver::initialize`]
    pub resource_infos: Vec<String>,
}

impl ResourceResolver {
    /// Find the init method among the calls of the module `.cctor`.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        let cctor = module.module_type_cctor()?;
        fingerprint::instructions(module, cctor)
            .iter()
            .filter(|i| i.is(0x28))
            .filter_map(|i| i.token_operand())
            .find_map(|m| check_init_method(module, m))
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(ResourceResolver {
            resolver_type: new.rebind_type(old, self.resolver_type)?,
            init_method: new.rebind_method(old, self.init_method)?,
            handler: new.rebind_method(old, self.handler)?,
            resource_infos: self.resource_infos.clone(),
        })
    }

    /// Read the satellite names from the info method. Returns false while no info method
    /// carries a plain string, which is the case until its strings are decrypted.
    pub fn initialize(&mut self, module: &Module) -> bool {
        let Some(def) = module.type_def(self.resolver_type) else {
            return false;
        };
        for &method in &def.methods {
            let is_info = module
                .method(method)
                .is_some_and(|m| m.is_static() && m.is_method("System.Void", &[]))
                && fingerprint::has_int(module, method, i32::from(b':'))
                && fingerprint::has_int(module, method, i32::from(b'|'));
            if !is_info {
                continue;
            }
            let Some(info) = fingerprint::code_strings(module, method)
                .into_iter()
                .find(|s| !s.is_empty())
            else {
                continue;
            };
            self.resource_infos = parse_infos(&info);
            return true;
        }
        false
    }

    /// Decrypt each listed satellite and add its resources to `module`. Returns the
    /// number of resources added.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] for a satellite missing from the
    /// module or when no resource decrypter is attached, and any decrypter error.
    pub fn merge_resources(&mut self, module: &mut Module, session: &Session) -> Result<usize> {
        let decrypter = session
            .resource_decrypter()
            .ok_or_else(|| Error::PayloadUnavailable("no resource decrypter for Eazfuscator.NET".to_string()))?;
        let reporter = session.reporter();
        let mut added = 0;
        for name in std::mem::take(&mut self.resource_infos) {
            let data = module
                .resource(&name)
                .map(|r| r.data.clone())
                .ok_or_else(|| Error::PayloadUnavailable(format!("Could not find resource assembly {name:?}")))?;
            for resource in decrypter.extract_resources(&data)? {
                deob_verbose!(session.logger, "Adding resource {} from {}", resource.name, name);
                reporter.record(EventKind::ResourceDecrypted).message(resource.name.clone());
                module.add_resource(resource);
                added += 1;
            }
            module.remove_resource(&name);
        }
        Ok(added)
    }
}

fn check_init_method(module: &Module, method: Token) -> Option<ResourceResolver> {
    let def = module.method(method)?;
    if !def.is_static() || def.body.is_none() || !def.is_method("System.Void", &[]) {
        return None;
    }
    let ty = def.declaring_type;
    let type_def = module.type_def(ty)?;
    if type_def.nested_types.len() != 1 {
        return None;
    }
    fingerprint::find_field(module, ty, "System.Reflection.Assembly")?;
    let handler = fingerprint::get_resolve_method(module, method)?;
    Some(ResourceResolver {
        resolver_type: ty,
        init_method: method,
        handler,
        resource_infos: Vec::new(),
    })
}

/// `a|1:b|0` lists `a` and `b`.
fn parse_infos(info: &str) -> Vec<String> {
    info.split(':')
        .map(|part| part.split('|').next().unwrap_or_default().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infos_are_cut_at_the_pipe() {
        assert_eq!(parse_infos("Sat.A|1:Sat.B|0"), vec!["Sat.A", "Sat.B"]);
        assert_eq!(parse_infos("Plain"), vec!["Plain"]);
    }
}
