//! Obfuscator families.
//!
//! Each supported obfuscator is a [`Family`]. Detecting a family produces a
//! [`Detection`], a closed enum holding that family's result struct: the tokens of every
//! member playing a role in the protection, plus the version when the family has a
//! classifier. Results hold tokens only, so [`Detection::rebind`] can re-resolve them
//! against a reloaded [`Module`].
//!
//! The driver walks each detection through the same lifecycle:
//!
//! 1. `detect` - structural fingerprinting, read only
//! 2. `initialize` - locate and decrypt the payload
//! 3. `apply` - rewrite call sites and restore bodies
//!
//! # Families
//!
//! | Family | Static decryption | Needs a collaborator |
//! |--------|-------------------|----------------------|
//! | [`BabelNet`] | constants, arrays | resource cipher |
//! | [`CryptoObfuscator`] | strings, constants, method bodies | resource cipher |
//! | [`Xenocode`] | strings | - |
//! | [`SkaterNet`] | strings (V1, V2) | - |
//! | [`SmartAssembly`] | - | dynamic worker |
//! | [`Eazfuscator`] | resources | dynamic worker for strings |
//! | [`CodeVeil`] | - | - |
//! | [`IlProtector`] | - | - |
//! | [`AgileNet`] | resources | resource loader |
//! | [`DotNetReactor`] | native lib resource | - |

mod agile;
mod babel;
mod codeveil;
mod cryptoobfuscator;
mod eazfuscator;
mod ilprotector;
mod reactor;
mod skater;
mod smartassembly;
mod xenocode;

pub use agile::{AgileNet, CliSecureRt, CsVmHandler, ResourceDecrypter as AgileResources};
pub use babel::{AssemblyResolver, BabelNet, ConstantsDecrypter as BabelConstants, EmbeddedAssembly};
pub use codeveil::{CodeVeil, CodeVeilVersion};
pub use cryptoobfuscator::{
    ConstantsDecrypter as CryptoConstants, CryptoObfuscator, MethodsDecrypter,
    StringDecrypter as CryptoStrings,
};
pub use eazfuscator::{
    DynocodeIterator, Eazfuscator, ResourceResolver as EazResources, StringDecrypter as EazStrings,
};
pub use ilprotector::IlProtector;
pub use reactor::{DotNetReactor, NativeLibSaver, ReactorDecrypter};
pub use skater::{SkaterCipher, SkaterNet};
pub use smartassembly::{InitCallShape, SmartAssembly, StringDecrypterInfo, StringDecrypterVersion};
pub use xenocode::Xenocode;

use std::path::Path;

use strum::{Display, EnumIter};

use crate::{
    deobfuscation::context::Session,
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// A supported obfuscator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum Family {
    /// Babel.NET
    #[strum(serialize = "Babel.NET")]
    BabelNet,
    /// CryptoObfuscator
    #[strum(serialize = "CryptoObfuscator")]
    CryptoObfuscator,
    /// Xenocode
    #[strum(serialize = "Xenocode")]
    Xenocode,
    /// Skater.NET
    #[strum(serialize = "Skater.NET")]
    SkaterNet,
    /// SmartAssembly
    #[strum(serialize = "SmartAssembly")]
    SmartAssembly,
    /// Eazfuscator.NET
    #[strum(serialize = "Eazfuscator.NET")]
    Eazfuscator,
    /// CodeVeil
    #[strum(serialize = "CodeVeil")]
    CodeVeil,
    /// ILProtector
    #[strum(serialize = "ILProtector")]
    ILProtector,
    /// Agile.NET (CliSecure)
    #[strum(serialize = "Agile.NET")]
    AgileNet,
    /// .NET Reactor
    #[strum(serialize = ".NET Reactor")]
    DotNetReactor,
}

impl Family {
    /// Parse a family from its display name or a loose spelling of it: case and anything
    /// but letters and digits are ignored, so `"babelnet"`, `"Babel.NET"` and
    /// `"babel-net"` all name [`Family::BabelNet`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Family> {
        use strum::IntoEnumIterator;

        let wanted = normalize(name);
        if wanted.is_empty() {
            return None;
        }
        Family::iter().find(|family| {
            normalize(&family.to_string()) == wanted || normalize(&format!("{family:?}")) == wanted
        })
    }

    /// Run this family's detector.
    ///
    /// # Errors
    /// Returns [`crate::Error::PartialDetection`] when an anchor type is found but a
    /// required companion member is not. A plain miss is `Ok(None)`.
    pub fn detect(self, module: &Module, session: &Session) -> Result<Option<Detection>> {
        Ok(match self {
            Family::BabelNet => BabelNet::detect(module, session)?.map(Detection::BabelNet),
            Family::CryptoObfuscator => {
                CryptoObfuscator::detect(module, session)?.map(Detection::CryptoObfuscator)
            }
            Family::Xenocode => Xenocode::detect(module, session)?.map(Detection::Xenocode),
            Family::SkaterNet => SkaterNet::detect(module, session)?.map(Detection::SkaterNet),
            Family::SmartAssembly => {
                SmartAssembly::detect(module, session)?.map(Detection::SmartAssembly)
            }
            Family::Eazfuscator => Eazfuscator::detect(module, session)?.map(Detection::Eazfuscator),
            Family::CodeVeil => CodeVeil::detect(module, session)?.map(Detection::CodeVeil),
            Family::ILProtector => IlProtector::detect(module, session)?.map(Detection::ILProtector),
            Family::AgileNet => AgileNet::detect(module, session)?.map(Detection::AgileNet),
            Family::DotNetReactor => {
                DotNetReactor::detect(module, session)?.map(Detection::DotNetReactor)
            }
        })
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A fully populated detection result for one family.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Babel.NET
    BabelNet(BabelNet),
    /// CryptoObfuscator
    CryptoObfuscator(CryptoObfuscator),
    /// Xenocode
    Xenocode(Xenocode),
    /// Skater.NET
    SkaterNet(SkaterNet),
    /// SmartAssembly
    SmartAssembly(SmartAssembly),
    /// Eazfuscator.NET
    Eazfuscator(Eazfuscator),
    /// CodeVeil
    CodeVeil(CodeVeil),
    /// ILProtector
    ILProtector(IlProtector),
    /// Agile.NET
    AgileNet(AgileNet),
    /// .NET Reactor
    DotNetReactor(DotNetReactor),
}

impl Detection {
    /// The family this result belongs to.
    #[must_use]
    pub fn family(&self) -> Family {
        match self {
            Detection::BabelNet(_) => Family::BabelNet,
            Detection::CryptoObfuscator(_) => Family::CryptoObfuscator,
            Detection::Xenocode(_) => Family::Xenocode,
            Detection::SkaterNet(_) => Family::SkaterNet,
            Detection::SmartAssembly(_) => Family::SmartAssembly,
            Detection::Eazfuscator(_) => Family::Eazfuscator,
            Detection::CodeVeil(_) => Family::CodeVeil,
            Detection::ILProtector(_) => Family::ILProtector,
            Detection::AgileNet(_) => Family::AgileNet,
            Detection::DotNetReactor(_) => Family::DotNetReactor,
        }
    }

    /// The detected version, `None` when the family has no classifier or the classifier
    /// found no match.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        match self {
            Detection::SkaterNet(d) => d.version(),
            Detection::SmartAssembly(d) => d.version(),
            Detection::Eazfuscator(d) => d.version(),
            Detection::CodeVeil(d) => d.version(),
            Detection::ILProtector(d) => d.version(),
            Detection::DotNetReactor(d) => d.version(),
            Detection::BabelNet(_)
            | Detection::CryptoObfuscator(_)
            | Detection::Xenocode(_)
            | Detection::AgileNet(_) => None,
        }
    }

    /// Re-resolve every held token against `new`, a reload of `old`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] for the first member that no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Detection> {
        Ok(match self {
            Detection::BabelNet(d) => Detection::BabelNet(d.rebind(old, new)?),
            Detection::CryptoObfuscator(d) => Detection::CryptoObfuscator(d.rebind(old, new)?),
            Detection::Xenocode(d) => Detection::Xenocode(d.rebind(old, new)?),
            Detection::SkaterNet(d) => Detection::SkaterNet(d.rebind(old, new)?),
            Detection::SmartAssembly(d) => Detection::SmartAssembly(d.rebind(old, new)?),
            Detection::Eazfuscator(d) => Detection::Eazfuscator(d.rebind(old, new)?),
            Detection::CodeVeil(d) => Detection::CodeVeil(d.rebind(old, new)?),
            Detection::ILProtector(d) => Detection::ILProtector(d.rebind(old, new)?),
            Detection::AgileNet(d) => Detection::AgileNet(d.rebind(old, new)?),
            Detection::DotNetReactor(d) => Detection::DotNetReactor(d.rebind(old, new)?),
        })
    }

    /// Load and decrypt the payload.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] when the payload cannot be found,
    /// decode errors for a corrupt one.
    pub fn initialize(&mut self, module: &Module, session: &Session) -> Result<()> {
        match self {
            Detection::BabelNet(d) => d.initialize(module, session),
            Detection::CryptoObfuscator(d) => d.initialize(module, session),
            Detection::SkaterNet(d) => d.initialize(module, session),
            Detection::SmartAssembly(d) => d.initialize(module, session),
            Detection::Eazfuscator(d) => d.initialize(module, session),
            Detection::AgileNet(d) => d.initialize(module, session),
            Detection::DotNetReactor(d) => d.initialize(module, session),
            Detection::Xenocode(_) | Detection::CodeVeil(_) | Detection::ILProtector(_) => Ok(()),
        }
    }

    /// Perform the rewrites. Returns the number of changes made.
    ///
    /// # Errors
    /// Returns decode, invariant or dynamic worker errors; the caller aborts only this
    /// family on error.
    pub fn apply(&self, module: &mut Module, session: &mut Session) -> Result<usize> {
        match self {
            Detection::BabelNet(d) => d.apply(module, session),
            Detection::CryptoObfuscator(d) => d.apply(module, session),
            Detection::Xenocode(d) => d.apply(module, session),
            Detection::SkaterNet(d) => d.apply(module, session),
            Detection::SmartAssembly(d) => d.apply(module, session),
            Detection::Eazfuscator(d) => d.apply(module, session),
            Detection::CodeVeil(d) => d.apply(module, session),
            Detection::ILProtector(d) => d.apply(module, session),
            Detection::AgileNet(d) => d.apply(module, session),
            Detection::DotNetReactor(d) => d.apply(module, session),
        }
    }
}

/// Methods of `ty` other than its constructors.
#[must_use]
pub fn other_methods(module: &Module, ty: Token) -> Vec<Token> {
    module
        .type_def(ty)
        .map(|def| {
            def.methods
                .iter()
                .copied()
                .filter(|&m| module.method(m).is_some_and(|m| !m.is_ctor() && !m.is_cctor()))
                .collect()
        })
        .unwrap_or_default()
}

/// The assembly's simple name, or the module file name without its extension when the
/// module has no assembly manifest.
#[must_use]
pub fn assembly_simple_name(module: &Module) -> String {
    if let Some(name) = &module.assembly_name {
        return name.clone();
    }
    Path::new(&module.name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| module.name.clone())
}

/// Decrypt `data` with `family`'s resource cipher through the session's collaborator.
///
/// # Errors
/// Returns [`crate::Error::PayloadUnavailable`] when the session has no resource
/// decrypter, and the collaborator's error otherwise.
pub fn decrypt_resource(session: &Session, family: Family, data: &[u8]) -> Result<Vec<u8>> {
    let decrypter = session.resource_decrypter().ok_or_else(|| {
        Error::PayloadUnavailable(format!("no resource decrypter for {family}"))
    })?;
    decrypter.decrypt(family, data)
}

/// Fail with [`crate::Error::PartialDetection`] for `family`.
pub(crate) fn partial(family: Family, message: impl Into<String>) -> Error {
    Error::PartialDetection {
        family,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::{
        deobfuscation::{config::DeobConfig, events::EventLog, logger::Logger},
        metadata::{method::MethodDef, method::MethodSig, typesystem::TypeDef},
    };

    #[test]
    fn family_names() {
        assert_eq!(Family::BabelNet.to_string(), "Babel.NET");
        assert_eq!(Family::DotNetReactor.to_string(), ".NET Reactor");
        assert_eq!(Family::from_name("babel-net"), Some(Family::BabelNet));
        assert_eq!(Family::from_name("Eazfuscator.NET"), Some(Family::Eazfuscator));
        assert_eq!(Family::from_name("dotnetreactor"), Some(Family::DotNetReactor));
        assert_eq!(Family::from_name("ilprotector"), Some(Family::ILProtector));
        assert_eq!(Family::from_name("confuser"), None);
        assert_eq!(Family::from_name(""), None);
        for family in Family::iter() {
            assert_eq!(Family::from_name(&family.to_string()), Some(family));
        }
    }

    #[test]
    fn empty_module_is_a_miss_everywhere() {
        let module = Module::new("clean.dll");
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        for family in Family::iter() {
            assert!(family.detect(&module, &session).unwrap().is_none(), "{family}");
        }
    }

    #[test]
    fn simple_name_fallback() {
        let mut module = Module::new("Some.App.exe");
        assert_eq!(assembly_simple_name(&module), "Some.App");
        module.assembly_name = Some("Named".into());
        assert_eq!(assembly_simple_name(&module), "Named");
    }

    #[test]
    fn other_methods_skip_constructors() {
        let mut module = Module::new("a.dll");
        let ty = module.add_type(TypeDef::new("", "T"));
        module.add_method(ty, MethodDef::cctor()).unwrap();
        module.add_method(ty, MethodDef::ctor(&[])).unwrap();
        let m = module
            .add_method(ty, MethodDef::new("M", MethodSig::new("System.Void", &[])))
            .unwrap();
        assert_eq!(other_methods(&module, ty), vec![m]);
    }

    #[test]
    fn missing_resource_decrypter() {
        let config = DeobConfig::default();
        let (logger, events) = (Logger::new(), EventLog::new());
        let session = Session::new(&config, &logger, &events);
        assert!(matches!(
            decrypt_resource(&session, Family::BabelNet, &[1, 2]),
            Err(Error::PayloadUnavailable(_))
        ));
    }
}
