//! The CliSecure runtime class.
//!
//! Three layouts are recognized, tried in this order:
//!
//! - a class called from an init `.cctor` that imports `_Initialize`/`_Initialize64`
//!   from the native runtime and holds a `Boolean` field
//! - a small class with a `Byte[]` key (plus a `Hashtable` cache) and a `cs` string
//!   decrypter
//! - nothing managed at all, only the native runtime stub in the image
//!
//! Modules without a runtime class may still carry the old standalone `String(String)`
//! decrypter.

use crate::{
    deobfuscation::fingerprint::{self, TypeList},
    metadata::{module::Module, token::Token},
    Result,
};

const FIELDS_RT: TypeList<'static> = TypeList::all(&["System.Boolean"]);
const FIELDS_CS: TypeList<'static> = TypeList::distinct(&["System.Byte[]"]);
const FIELDS_CS_CACHED: TypeList<'static> =
    TypeList::distinct(&["System.Byte[]", "System.Collections.Hashtable"]);

/// Number of type initializers searched for the runtime call, besides the module's.
const INIT_CCTORS: usize = 3;

/// Byte patterns of the native runtime stub, for images whose managed side is gone.
const NATIVE_SIGNATURES: &[&str] = &[
    // "AgileDotNetRT"
    "41 67 69 6C 65 44 6F 74 4E 65 74 52 54",
    // "CliSecureRT"
    "43 6C 69 53 65 63 75 72 65 52 54",
];

/// A detected CliSecure runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliSecureRt {
    /// The runtime class, when one exists
    pub rt_type: Option<Token>,
    /// Method of the runtime class called from an init `.cctor`
    pub initialize_method: Option<Token>,
    /// Static `Void PostInitialize()`
    pub post_initialize_method: Option<Token>,
    /// Static `IntPtr Load()`
    pub load_method: Option<Token>,
    /// Static `String(String)` decrypters
    pub string_decrypters: Vec<Token>,
    /// Only the native runtime stub was found
    pub found_signature: bool,
}

impl CliSecureRt {
    /// Search `module` for the runtime.
    ///
    /// # Errors
    /// Returns an error only for a malformed built-in signature pattern.
    pub fn find(module: &Module) -> Result<Option<Self>> {
        let mut found = find_runtime_class(module)
            .or_else(|| find_cs_class(module))
            .unwrap_or_default();
        if found.rt_type.is_none() {
            found.found_signature = scan_native_stub(module)?;
            if let Some((ty, decrypter)) = find_old_decrypter(module) {
                found.rt_type = Some(ty);
                found.string_decrypters.push(decrypter);
            }
        }
        Ok((found.rt_type.is_some() || found.found_signature).then_some(found))
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        let method = |m: Option<Token>| m.map(|m| new.rebind_method(old, m)).transpose();
        Ok(CliSecureRt {
            rt_type: self.rt_type.map(|t| new.rebind_type(old, t)).transpose()?,
            initialize_method: method(self.initialize_method)?,
            post_initialize_method: method(self.post_initialize_method)?,
            load_method: method(self.load_method)?,
            string_decrypters: self
                .string_decrypters
                .iter()
                .map(|&m| new.rebind_method(old, m))
                .collect::<Result<_>>()?,
            found_signature: self.found_signature,
        })
    }

    /// Runtimes from 5.0 on load the native part themselves through `LoadLibraryA`.
    #[must_use]
    pub fn is_at_least_v50(&self, module: &Module) -> bool {
        self.rt_type
            .is_some_and(|ty| !fingerprint::get_pinvoke_methods(module, ty, "LoadLibraryA").is_empty())
    }
}

/// The module `.cctor` followed by the type initializers of the first non-enum types.
pub(super) fn init_cctors(module: &Module, max: usize) -> Vec<Token> {
    let mut cctors: Vec<Token> = module.module_type_cctor().into_iter().collect();
    let global = module.find_type("<Module>");
    let mut left = max;
    for ty in module.types() {
        if left == 0 {
            break;
        }
        if Some(ty) == global {
            continue;
        }
        let Some(cctor) = module.type_cctor(ty) else {
            continue;
        };
        cctors.push(cctor);
        if !module.type_def(ty).is_some_and(|def| def.is_enum()) {
            left -= 1;
        }
    }
    cctors
}

fn find_runtime_class(module: &Module) -> Option<CliSecureRt> {
    for cctor in init_cctors(module, INIT_CCTORS) {
        for called in fingerprint::called_methods(module, cctor) {
            let Some(ty) = module.method(called).map(|m| m.declaring_type) else {
                continue;
            };
            if module.type_def(ty).map_or(true, |def| def.is_public()) {
                continue;
            }
            if !FIELDS_RT.matches(&fingerprint::field_types(module, ty)) {
                continue;
            }
            if !has_initialize_import(module, ty, "_Initialize")
                && !has_initialize_import(module, ty, "_Initialize64")
            {
                continue;
            }
            return Some(CliSecureRt {
                rt_type: Some(ty),
                initialize_method: Some(called),
                post_initialize_method: find_named(module, ty, "PostInitialize", "System.Void"),
                load_method: find_named(module, ty, "Load", "System.IntPtr"),
                string_decrypters: find_decrypter(module, ty).into_iter().collect(),
                found_signature: false,
            });
        }
    }
    None
}

fn find_cs_class(module: &Module) -> Option<CliSecureRt> {
    module.types().into_iter().find_map(|ty| {
        let def = module.type_def(ty)?;
        if !(1..=2).contains(&def.fields.len()) || def.methods.len() != 2 {
            return None;
        }
        let fields = fingerprint::field_types(module, ty);
        if !FIELDS_CS.matches(&fields) && !FIELDS_CS_CACHED.matches(&fields) {
            return None;
        }
        module.type_cctor(ty)?;
        let cs = module.find_method(ty, "cs")?;
        Some(CliSecureRt {
            rt_type: Some(ty),
            string_decrypters: vec![cs],
            ..CliSecureRt::default()
        })
    })
}

fn find_old_decrypter(module: &Module) -> Option<(Token, Token)> {
    module.types().into_iter().find_map(|ty| {
        let def = module.type_def(ty)?;
        let [cs] = def.methods[..] else {
            return None;
        };
        if !def.fields.is_empty() {
            return None;
        }
        let method = module.method(cs)?;
        (method.body.is_some()
            && method.is_static()
            && method.is_method("System.String", &["System.String"])
            && fingerprint::has_int(module, cs, 0xFF))
        .then_some((ty, cs))
    })
}

/// An import of `entry` taking one `IntPtr` and returning `Void` or `Int32`.
fn has_initialize_import(module: &Module, ty: Token, entry: &str) -> bool {
    fingerprint::get_pinvoke_methods(module, ty, entry)
        .first()
        .and_then(|&m| module.method(m))
        .is_some_and(|m| {
            m.signature.params.len() == 1
                && m.signature.params[0] == "System.IntPtr"
                && matches!(m.signature.return_type.as_str(), "System.Void" | "System.Int32")
        })
}

/// Static, parameterless `name` returning `return_type`, with a body.
fn find_named(module: &Module, ty: Token, name: &str, return_type: &str) -> Option<Token> {
    module.type_def(ty)?.methods.iter().copied().find(|&m| {
        module.method(m).is_some_and(|def| {
            def.name == name && def.is_static() && def.body.is_some() && def.is_method(return_type, &[])
        })
    })
}

fn find_decrypter(module: &Module, ty: Token) -> Option<Token> {
    module.type_def(ty)?.methods.iter().copied().find(|&m| {
        module.method(m).is_some_and(|def| {
            def.is_static() && def.body.is_some() && def.is_method("System.String", &["System.String"])
        })
    })
}

fn scan_native_stub(module: &Module) -> Result<bool> {
    let Some(pe) = &module.pe else {
        return Ok(false);
    };
    for pattern in NATIVE_SIGNATURES {
        let pattern = fingerprint::parse_signature(pattern)?;
        if pe
            .sections()
            .iter()
            .any(|section| fingerprint::scan_signature(pe.section_data(section), &pattern).is_some())
        {
            return Ok(true);
        }
    }
    Ok(false)
}
