//! Locating encrypted payloads.
//!
//! A family names the places its payload may live as a list of [`PayloadSource`]s in
//! preference order: an embedded resource whose name the initializer code spells out, a
//! resource under a computed default name, or the data of an RVA-backed field as mapped in
//! the PE image.
//! [`locate`] returns the first one that resolves, or
//! [`crate::Error::PayloadUnavailable`], which the driver turns into the
//! `DetectedButUndecryptable` state.
//!
//! Some payloads are encrypted with the obfuscator's own resource cipher, which is not
//! replicated here. Those go through a caller supplied [`ResourceDecrypter`].

use std::fmt;

use crate::{
    deobfuscation::{fingerprint, obfuscators::Family},
    metadata::{
        module::{Module, Resource},
        token::Token,
    },
    Error, Result,
};

/// One place an encrypted payload may be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// An embedded resource whose name was found in code
    Resource(String),
    /// An embedded resource under a computed fallback name
    DefaultResource(String),
    /// The data of an RVA-backed field, read from the PE image
    RvaField(Token),
}

impl fmt::Display for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Resource(name) => write!(f, "resource {name:?}"),
            PayloadSource::DefaultResource(name) => write!(f, "default resource {name:?}"),
            PayloadSource::RvaField(token) => write!(f, "field {token}"),
        }
    }
}

/// A resolved payload and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// The source that resolved
    pub source: PayloadSource,
    /// Raw (still encrypted) bytes
    pub data: Vec<u8>,
}

impl Payload {
    /// Name of the backing resource, if the payload is one.
    #[must_use]
    pub fn resource_name(&self) -> Option<&str> {
        match &self.source {
            PayloadSource::Resource(name) | PayloadSource::DefaultResource(name) => Some(name),
            PayloadSource::RvaField(_) => None,
        }
    }
}

fn resolve(module: &Module, source: &PayloadSource) -> Result<Option<Vec<u8>>> {
    match source {
        PayloadSource::Resource(name) | PayloadSource::DefaultResource(name) => {
            Ok(module.resource(name).map(|r| r.data.clone()))
        }
        PayloadSource::RvaField(token) => module.field_data(*token),
    }
}

/// Return the first source in `sources` that resolves.
///
/// # Errors
/// Returns [`crate::Error::PayloadUnavailable`] naming every source tried when none
/// resolves, or the image read error of an RVA field whose data leaves the image.
pub fn locate(module: &Module, sources: &[PayloadSource]) -> Result<Payload> {
    for source in sources {
        if let Some(data) = resolve(module, source)? {
            return Ok(Payload {
                source: source.clone(),
                data,
            });
        }
    }

    let tried: Vec<String> = sources.iter().map(ToString::to_string).collect();
    Err(Error::PayloadUnavailable(if tried.is_empty() {
        "no payload source".to_string()
    } else {
        tried.join(", ")
    }))
}

/// The first code string of `methods` (searched in order) naming an existing resource.
#[must_use]
pub fn resource_from_code_strings(module: &Module, methods: &[Token]) -> Option<String> {
    methods
        .iter()
        .flat_map(|&m| fingerprint::code_strings(module, m))
        .find(|s| module.resource(s).is_some())
}

/// Collaborator for payload steps that need code this crate does not replicate.
///
/// Implementations usually run the obfuscator's own routine in a sandbox, or load an
/// unpacked assembly with a full metadata reader.
pub trait ResourceDecrypter {
    /// Decrypt `data` with `family`'s resource cipher.
    ///
    /// # Errors
    /// Any error aborts the calling family only.
    fn decrypt(&self, family: Family, data: &[u8]) -> Result<Vec<u8>>;

    /// Load an unpacked assembly image and return its manifest resources.
    ///
    /// # Errors
    /// The default implementation returns [`crate::Error::NotSupported`].
    fn extract_resources(&self, assembly: &[u8]) -> Result<Vec<Resource>> {
        let _ = assembly;
        Err(Error::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::pe::{PeImage, SectionHeader},
        metadata::{field::FieldDef, typesystem::TypeDef},
    };

    #[test]
    fn sources_are_tried_in_order() {
        let mut module = Module::new("a.dll");
        module.add_resource(Resource::new("fallback", vec![2]));
        let ty = module.add_type(TypeDef::new("", "Holder"));
        let field = module
            .add_field(ty, FieldDef::new("data", "System.Byte").with_rva(0x2050, vec![3, 3]))
            .unwrap();

        let payload = locate(
            &module,
            &[
                PayloadSource::Resource("named".into()),
                PayloadSource::DefaultResource("fallback".into()),
                PayloadSource::RvaField(field),
            ],
        )
        .unwrap();
        assert_eq!(payload.data, vec![2]);
        assert_eq!(payload.resource_name(), Some("fallback"));

        let payload = locate(&module, &[PayloadSource::RvaField(field)]).unwrap();
        assert_eq!(payload.data, vec![3, 3]);
        assert_eq!(payload.resource_name(), None);
    }

    #[test]
    fn rva_field_read_from_image() {
        let mut module = Module::new("a.dll");
        let mut image = vec![0u8; 0x40];
        image[0x30..0x36].copy_from_slice(b"packed");
        module.pe = Some(PeImage::new(
            image,
            vec![SectionHeader {
                name: ".sdata".to_string(),
                virtual_address: 0x6000,
                virtual_size: 0x40,
                pointer_to_raw_data: 0,
                size_of_raw_data: 0x40,
            }],
            None,
        ));
        let ty = module.add_type(TypeDef::new("", "Holder"));
        let field = module
            .add_field(ty, FieldDef::new("data", "Holder/Blob").with_image_rva(0x6030, 6))
            .unwrap();
        let unmapped = module
            .add_field(ty, FieldDef::new("gone", "Holder/Blob").with_image_rva(0x9000, 6))
            .unwrap();

        let payload = locate(&module, &[PayloadSource::RvaField(field)]).unwrap();
        assert_eq!(payload.data, b"packed");
        assert!(matches!(
            locate(&module, &[PayloadSource::RvaField(unmapped)]),
            Err(Error::PayloadUnavailable(_))
        ));
    }

    #[test]
    fn nothing_resolves() {
        let module = Module::new("a.dll");
        match locate(&module, &[PayloadSource::Resource("x".into())]) {
            Err(Error::PayloadUnavailable(message)) => assert_eq!(message, "resource \"x\""),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(locate(&module, &[]), Err(Error::PayloadUnavailable(_))));
    }
}
