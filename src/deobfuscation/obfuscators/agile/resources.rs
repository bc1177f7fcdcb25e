//! Agile.NET resource encryption.
//!
//! All manifest resources are packed into one assembly stored as an encrypted resource.
//! The resource starts with a serialized key string; the rest is DES-CBC with the ASCII
//! key as both key and IV.

use crate::{
    deobfuscation::{
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
    },
    file::Parser,
    metadata::{module::Module, token::Token},
    utils::crypto,
    Error, Result,
};

const FIELDS: TypeList<'static> =
    TypeList::exact_unordered(&["System.Reflection.Assembly", "System.String[]"]);
const FIELDS_CACHED: TypeList<'static> = TypeList::exact_unordered(&[
    "System.Reflection.Assembly",
    "System.String[]",
    "System.Collections.Hashtable",
]);

/// The resource resolver class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDecrypter {
    /// Resolver class
    pub resource_type: Token,
    /// Static `Void()` called from the module `.cctor`
    pub init_method: Token,
    /// Static `Assembly(Object, ResolveEventArgs)` handler naming the resource
    pub resolve_handler: Token,
}

impl ResourceDecrypter {
    /// Find the resolver among the calls of the module `.cctor`.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        let cctor = module.module_type_cctor()?;
        fingerprint::called_methods(module, cctor)
            .into_iter()
            .find_map(|called| {
                let def = module.method(called)?;
                if !def.is_static() || def.body.is_none() || !def.is_method("System.Void", &[]) {
                    return None;
                }
                let ty = def.declaring_type;
                let fields = fingerprint::field_types(module, ty);
                if !FIELDS.matches(&fields) && !FIELDS_CACHED.matches(&fields) {
                    return None;
                }
                let resolve_handler = fingerprint::find_static_method(
                    module,
                    ty,
                    "System.Reflection.Assembly",
                    &["System.Object", "System.ResolveEventArgs"],
                )?;
                fingerprint::find_static_method(module, ty, "System.Byte[]", &["System.IO.Stream"])?;
                Some(ResourceDecrypter {
                    resource_type: ty,
                    init_method: called,
                    resolve_handler,
                })
            })
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(ResourceDecrypter {
            resource_type: new.rebind_type(old, self.resource_type)?,
            init_method: new.rebind_method(old, self.init_method)?,
            resolve_handler: new.rebind_method(old, self.resolve_handler)?,
        })
    }

    /// Name of the encrypted resource, taken from the handler's strings.
    #[must_use]
    pub fn resource_name(&self, module: &Module) -> Option<String> {
        fingerprint::code_strings(module, self.resolve_handler)
            .into_iter()
            .find(|s| module.resource(s).is_some())
    }

    /// Decrypt the packed assembly and move its resources into `module`. Returns the
    /// number of resources added.
    ///
    /// Without a resource decrypter to open the packed assembly, the encrypted resource
    /// is left in place and nothing is added.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if the resource is missing, and
    /// decryption or collaborator errors.
    pub fn merge_resources(&self, module: &mut Module, session: &Session) -> Result<usize> {
        let name = self
            .resource_name(module)
            .ok_or_else(|| Error::PayloadUnavailable("Agile.NET encrypted resources".to_string()))?;
        let Some(loader) = session.resource_decrypter() else {
            deob_warn!(session.logger, "Can't load decrypted resources from {}", name);
            return Ok(0);
        };
        let data = module
            .resource(&name)
            .map(|r| r.data.clone())
            .ok_or_else(|| Error::PayloadUnavailable(name.clone()))?;
        let assembly = decrypt_resource(&data)?;

        let reporter = session.reporter();
        let mut added = 0;
        for resource in loader.extract_resources(&assembly)? {
            deob_verbose!(session.logger, "Adding resource {}", resource.name);
            reporter.record(EventKind::ResourceDecrypted).message(resource.name.clone());
            module.add_resource(resource);
            added += 1;
        }
        module.remove_resource(&name);
        Ok(added)
    }
}

/// Decrypt an encrypted resource: serialized key string, then DES-CBC data.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] for a truncated key and
/// [`crate::Error::Crypto`] for a bad key length or padding.
pub fn decrypt_resource(data: &[u8]) -> Result<Vec<u8>> {
    let mut parser = Parser::new(data);
    let key = parser.read_prefixed_string_utf8()?;
    if !key.is_ascii() {
        return Err(Error::Crypto(format!("Non-ASCII resource key {key:?}")));
    }
    let encrypted = parser.read_bytes(parser.remaining())?;
    crypto::des_cbc_decrypt(key.as_bytes(), key.as_bytes(), encrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deobfuscation::{
            config::DeobConfig, events::EventLog, logger::Logger, obfuscators::Family,
            payload::ResourceDecrypter as Collaborator,
        },
        metadata::{
            builder::BodyBuilder,
            field::FieldDef,
            method::{MethodDef, MethodSig},
            module::Resource,
            typesystem::TypeDef,
        },
    };

    /// Treats the decrypted bytes as `name=value` lines.
    struct Lines;

    impl Collaborator for Lines {
        fn decrypt(&self, _family: Family, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.to_vec())
        }

        fn extract_resources(&self, assembly: &[u8]) -> Result<Vec<Resource>> {
            Ok(String::from_utf8_lossy(assembly)
                .lines()
                .filter_map(|line| line.split_once('='))
                .map(|(name, value)| Resource::new(name, value.as_bytes().to_vec()))
                .collect())
        }
    }

    fn encrypted(key: &str, plain: &[u8]) -> Vec<u8> {
        let mut data = vec![u8::try_from(key.len()).unwrap()];
        data.extend_from_slice(key.as_bytes());
        data.extend(crypto::des_cbc_encrypt(key.as_bytes(), key.as_bytes(), plain).unwrap());
        data
    }

    fn protected() -> Module {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "<Resources>"));
        module.add_field(ty, FieldDef::new("asm", "System.Reflection.Assembly")).unwrap();
        module.add_field(ty, FieldDef::new("names", "System.String[]")).unwrap();
        let body = || BodyBuilder::new().ldstr("rsrc.bin").op("pop").op("ldnull").ret().build().unwrap();
        let init = module
            .add_method(ty, MethodDef::new("Init", MethodSig::new("System.Void", &[])).with_body(body()))
            .unwrap();
        module
            .add_method(
                ty,
                MethodDef::new(
                    "Resolve",
                    MethodSig::new("System.Reflection.Assembly", &["System.Object", "System.ResolveEventArgs"]),
                )
                .with_body(body()),
            )
            .unwrap();
        module
            .add_method(
                ty,
                MethodDef::new("Read", MethodSig::new("System.Byte[]", &["System.IO.Stream"])).with_body(body()),
            )
            .unwrap();
        let global = module.find_type("<Module>").unwrap();
        module
            .add_method(
                global,
                MethodDef::cctor().with_body(BodyBuilder::new().call(init).ret().build().unwrap()),
            )
            .unwrap();
        module
    }

    #[test]
    fn key_prefixed_des() {
        let data = encrypted("8bytekey", b"packed assembly");
        assert_eq!(decrypt_resource(&data).unwrap(), b"packed assembly");
        assert!(matches!(decrypt_resource(&encrypted("short", b"x")), Err(Error::Crypto(_))));
    }

    #[test]
    fn resources_merged() {
        let mut module = protected();
        module.add_resource(Resource::new("rsrc.bin", encrypted("A1b2C3d4", b"Strings.resources=hi\nIcon=png")));
        let found = ResourceDecrypter::find(&module).unwrap();
        assert_eq!(found.resource_name(&module).as_deref(), Some("rsrc.bin"));

        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let loader = Lines;
        let session = Session::new(&config, &logger, &events).with_resource_decrypter(&loader);
        assert_eq!(found.merge_resources(&mut module, &session).unwrap(), 2);
        assert!(module.resource("rsrc.bin").is_none());
        assert_eq!(module.resource("Icon").unwrap().data, b"png");
        assert_eq!(events.count_kind(EventKind::ResourceDecrypted), 2);
    }

    #[test]
    fn kept_without_loader() {
        let mut module = protected();
        module.add_resource(Resource::new("rsrc.bin", encrypted("A1b2C3d4", b"x=y")));
        let found = ResourceDecrypter::find(&module).unwrap();
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        assert_eq!(found.merge_resources(&mut module, &session).unwrap(), 0);
        assert!(module.resource("rsrc.bin").is_some());
    }
}
