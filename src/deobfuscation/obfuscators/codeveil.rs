//! CodeVeil main type.
//!
//! The module `.cctor` starts the runtime with `ldc.i4; ldc.i4; call Init(bool, bool)`.
//! The version follows from the init method: an `"E_FullTrust"` string means 4.x (4.1
//! when `user32!CallWindowProcW` is imported), `"Full Trust Required"` means 3.x, and
//! a class with nested types holding the 5.0 runtime fields means 5.0.

use std::fmt;

use crate::{
    deobfuscation::{
        context::Session,
        events::EventKind,
        fingerprint::{self, TypeList},
        rewriter::{apply_windows, collect_windows, CallSiteWindow},
    },
    metadata::{module::Module, token::Token},
    Result,
};

const FIELDS_V5: TypeList<'static> = TypeList::all(&[
    "System.Byte[]",
    "System.Collections.Generic.List`1<System.Delegate>",
    "System.Runtime.InteropServices.GCHandle",
]);

/// CodeVeil release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeVeilVersion {
    /// 3.x
    V3,
    /// 4.0
    V4_0,
    /// 4.1
    V4_1,
    /// 5.0
    V5_0,
}

impl fmt::Display for CodeVeilVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodeVeilVersion::V3 => "3.x",
            CodeVeilVersion::V4_0 => "4.0",
            CodeVeilVersion::V4_1 => "4.1",
            CodeVeilVersion::V5_0 => "5.0",
        })
    }
}

/// A detected CodeVeil runtime class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeVeil {
    /// Runtime class
    pub main_type: Token,
    /// Static `Void(Boolean,Boolean)` started by the module `.cctor`
    pub init_method: Token,
    /// Detected release
    pub version: CodeVeilVersion,
    /// RVAs of the encrypted method data, present when methods are encrypted
    pub rvas: Vec<u32>,
    /// `Void(Assembly,UInt64)` tamper check
    pub tamper_check: Option<Token>,
    /// The other static `Void()` initializers of the class
    pub other_init_methods: Vec<Token>,
}

impl CodeVeil {
    /// Find the init call in the module `.cctor`.
    ///
    /// # Errors
    /// Infallible today; the signature matches the other families.
    pub fn detect(module: &Module, _session: &Session) -> Result<Option<Self>> {
        let Some(cctor) = module.module_type_cctor() else {
            return Ok(None);
        };
        let found = fingerprint::instructions(module, cctor)
            .windows(3)
            .find_map(|w| {
                if !w[0].is_ldc_i4() || !w[1].is_ldc_i4() || !w[2].is(0x28) {
                    return None;
                }
                let init = w[2].token_operand()?;
                let version = check_init_method(module, init)?;
                Some((init, version))
            });
        let Some((init_method, version)) = found else {
            return Ok(None);
        };
        let Some(main_type) = module.method(init_method).map(|m| m.declaring_type) else {
            return Ok(None);
        };

        let rvas: Vec<u32> = rva_fields(module, main_type);
        Ok(Some(CodeVeil {
            main_type,
            init_method,
            version,
            rvas: if rvas.len() < 2 { Vec::new() } else { rvas },
            tamper_check: find_tamper_check(module, main_type),
            other_init_methods: find_other_init_methods(module, main_type),
        }))
    }

    /// The detected release.
    #[must_use]
    pub fn version(&self) -> Option<String> {
        Some(self.version.to_string())
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        Ok(CodeVeil {
            main_type: new.rebind_type(old, self.main_type)?,
            init_method: new.rebind_method(old, self.init_method)?,
            version: self.version,
            rvas: self.rvas.clone(),
            tamper_check: self
                .tamper_check
                .map(|m| new.rebind_method(old, m))
                .transpose()?,
            other_init_methods: self
                .other_init_methods
                .iter()
                .map(|&m| new.rebind_method(old, m))
                .collect::<Result<_>>()?,
        })
    }

    /// The method of the runtime class that calls `string_init`, the string decrypter's
    /// initializer.
    #[must_use]
    pub fn string_decrypter_init_caller(&self, module: &Module, string_init: Token) -> Option<Token> {
        module.type_def(self.main_type)?.methods.iter().copied().find(|&m| {
            module.method(m).is_some_and(|def| def.is_static() && def.body.is_some())
                && fingerprint::called_methods(module, m).contains(&string_init)
        })
    }

    /// Remove the first `ldc.i4; ldc.i4; call Init` from the module `.cctor`.
    ///
    /// # Errors
    /// Propagates rewriting errors.
    pub fn apply(&self, module: &mut Module, session: &Session) -> Result<usize> {
        if !session.config.remove_init_calls {
            return Ok(0);
        }
        let Some(cctor) = module.module_type_cctor() else {
            return Ok(0);
        };
        let mut windows = collect_windows(module, cctor, |block, i| {
            let [a, b, call] = block.get(i..i + 3)? else {
                return None;
            };
            (a.is_ldc_i4() && b.is_ldc_i4() && call.is(0x28) && call.token_operand() == Some(self.init_method))
                .then(|| CallSiteWindow::removal(i, 3))
        });
        windows.truncate(1);
        if let Some(window) = windows.first() {
            session
                .reporter()
                .record(EventKind::ArtifactRemoved)
                .at(cctor, window.start);
        }
        apply_windows(module, cctor, windows)
    }
}

fn check_init_method(module: &Module, init: Token) -> Option<CodeVeilVersion> {
    let def = module.method(init)?;
    if def.body.is_none() || !def.is_static() || !def.is_method("System.Void", &["System.Boolean", "System.Boolean"]) {
        return None;
    }
    let ty = def.declaring_type;
    if fingerprint::has_string(module, init, "E_FullTrust") {
        let call_window_proc = fingerprint::get_pinvoke_methods(module, ty, "CallWindowProcW")
            .into_iter()
            .any(|m| {
                module
                    .method(m)
                    .and_then(|m| m.pinvoke.as_ref())
                    .is_some_and(|p| p.module.to_ascii_lowercase().starts_with("user32"))
            });
        Some(if call_window_proc {
            CodeVeilVersion::V4_1
        } else {
            CodeVeilVersion::V4_0
        })
    } else if fingerprint::has_string(module, init, "Full Trust Required") {
        Some(CodeVeilVersion::V3)
    } else if module.type_def(ty).is_some_and(|t| !t.nested_types.is_empty())
        && FIELDS_V5.matches(&fingerprint::field_types(module, ty))
    {
        Some(CodeVeilVersion::V5_0)
    } else {
        None
    }
}

/// RVAs of the `Byte` and `UInt32` fields with data.
fn rva_fields(module: &Module, ty: Token) -> Vec<u32> {
    let Some(def) = module.type_def(ty) else {
        return Vec::new();
    };
    def.fields
        .iter()
        .filter_map(|&f| module.field(f))
        .filter(|f| matches!(f.field_type.as_str(), "System.Byte" | "System.UInt32") && f.rva != 0)
        .map(|f| f.rva)
        .collect()
}

fn find_tamper_check(module: &Module, ty: Token) -> Option<Token> {
    fingerprint::find_methods(module, ty, "System.Void", &["System.Reflection.Assembly", "System.UInt64"])
        .into_iter()
        .find(|&m| module.method(m).is_some_and(|def| def.is_static() && def.body.is_some()))
}

fn find_other_init_methods(module: &Module, ty: Token) -> Vec<Token> {
    fingerprint::find_methods(module, ty, "System.Void", &[])
        .into_iter()
        .filter(|&m| module.method(m).is_some_and(|def| def.is_static() && !def.is_cctor()))
        .collect()
}
