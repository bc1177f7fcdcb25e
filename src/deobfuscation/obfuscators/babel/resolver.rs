//! Babel.NET embedded assemblies.
//!
//! The resolver type registers an `AssemblyResolve` handler that serves assemblies from an
//! encrypted resource. The decrypted resource is an `int32` count followed by, per
//! assembly, a length-prefixed name, an `int32` size and the raw image.

use crate::{
    deobfuscation::{
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
        obfuscators::{decrypt_resource, partial, Family},
        payload::{self, PayloadSource},
    },
    file::{image_extension, Parser},
    metadata::{module::Module, token::Token},
    Result,
};

const RESOLVER_FIELDS: TypeList<'static> = TypeList::distinct(&[
    "System.Object",
    "System.Int32",
    "System.Collections.Hashtable",
]);

/// An assembly unpacked from the resolver's resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedAssembly {
    /// Full assembly name as stored
    pub full_name: String,
    /// `.dll` or `.exe`
    pub extension: &'static str,
    /// Raw image
    pub data: Vec<u8>,
}

/// The assembly resolver and the assemblies it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyResolver {
    /// Resolver type
    pub resolver_type: Token,
    /// Static `Void()` registering the handler
    pub init_method: Token,
    /// `Void(System.IO.Stream)` resource decrypt method
    pub decrypt_method: Token,
    /// Unpacked assemblies, filled by [`AssemblyResolver::initialize`]
    pub assemblies: Vec<EmbeddedAssembly>,
}

impl AssemblyResolver {
    /// Find the resolver type.
    ///
    /// # Errors
    /// Returns [`crate::Error::PartialDetection`] when the resolver type is found without
    /// its decrypt method.
    pub fn find(module: &Module) -> Result<Option<Self>> {
        for ty in module.types() {
            let Some(def) = module.type_def(ty) else {
                continue;
            };
            if !def.events.is_empty()
                || !RESOLVER_FIELDS.matches(&fingerprint::field_types(module, ty))
            {
                continue;
            }
            let Some(init_method) = find_register_method(module, ty) else {
                continue;
            };
            let decrypt_method =
                fingerprint::find_method(module, ty, "System.Void", &["System.IO.Stream"])
                    .ok_or_else(|| {
                        partial(Family::BabelNet, "Couldn't find resource type decrypt method")
                    })?;
            return Ok(Some(AssemblyResolver {
                resolver_type: ty,
                init_method,
                decrypt_method,
                assemblies: Vec::new(),
            }));
        }
        Ok(None)
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(AssemblyResolver {
            resolver_type: new.rebind_type(old, self.resolver_type)?,
            init_method: new.rebind_method(old, self.init_method)?,
            decrypt_method: new.rebind_method(old, self.decrypt_method)?,
            assemblies: self.assemblies.clone(),
        })
    }

    /// Decrypt the resource and unpack every assembly.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] if the resource or the resource
    /// decrypter is missing, and decode errors for a corrupt resource.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        let methods = module
            .type_def(self.resolver_type)
            .map(|def| def.methods.clone())
            .unwrap_or_default();
        let sources: Vec<PayloadSource> = payload::resource_from_code_strings(module, &methods)
            .map(PayloadSource::Resource)
            .into_iter()
            .collect();
        let found = payload::locate(module, &sources)?;
        let decrypted = decrypt_resource(session, Family::BabelNet, &found.data)?;
        self.assemblies = read_assemblies(&decrypted)?;

        let reporter = session.reporter();
        for assembly in &self.assemblies {
            deob_verbose!(
                session.logger,
                "Found embedded assembly {} ({} bytes)",
                assembly.full_name,
                assembly.data.len()
            );
            reporter
                .record(EventKind::ResourceDecrypted)
                .message(format!("{}{}", assembly.full_name, assembly.extension));
        }
        Ok(())
    }
}

/// A static `Void()` method binding a resolve handler.
fn find_register_method(module: &Module, ty: Token) -> Option<Token> {
    let def = module.type_def(ty)?;
    def.methods.iter().copied().find(|&m| {
        module
            .method(m)
            .is_some_and(|def| def.is_static() && def.is_method("System.Void", &[]))
            && fingerprint::get_resolve_method(module, m).is_some()
    })
}

fn read_assemblies(data: &[u8]) -> Result<Vec<EmbeddedAssembly>> {
    let mut parser = Parser::new(data);
    let count = parser.read_le::<i32>()?;
    let count = usize::try_from(count)
        .map_err(|_| decode_error!("Invalid embedded assembly count {}", count))?;

    let mut assemblies = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let full_name = parser.read_prefixed_string_utf8()?;
        let size = parser.read_le::<i32>()?;
        let size = usize::try_from(size)
            .map_err(|_| decode_error!("Invalid size {} of assembly {}", size, full_name))?;
        let data = parser.read_bytes(size)?.to_vec();
        let extension = image_extension(&data)
            .map_err(|_| decode_error!("Embedded assembly {} is not a PE image", full_name))?;
        assemblies.push(EmbeddedAssembly {
            full_name,
            extension,
            data,
        });
    }
    Ok(assemblies)
}
