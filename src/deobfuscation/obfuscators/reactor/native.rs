//! The class that writes the native runtime, stored as a resource, to disk.

use crate::{
    deobfuscation::{fingerprint, payload::resource_from_code_strings},
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// Full name of the class holding the saver.
pub const NATIVE_LIB_TYPE: &str = "<PrivateImplementationDetails>{F1C5056B-0AFC-4423-9B83-D13A26B48869}";

/// A detected native lib saver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLibSaver {
    /// [`NATIVE_LIB_TYPE`]
    pub saver_type: Token,
    /// Static `Void()` called from the module `.cctor`
    pub init_method: Token,
    /// Resource holding the native lib, when it is embedded
    pub resource: Option<String>,
}

impl NativeLibSaver {
    /// Find the saver among the calls of the module `.cctor`.
    #[must_use]
    pub fn find(module: &Module) -> Option<Self> {
        let cctor = module.module_type_cctor()?;
        fingerprint::called_methods(module, cctor).into_iter().find_map(|called| {
            let def = module.method(called)?;
            if !def.is_method("System.Void", &[]) {
                return None;
            }
            let saver_type = def.declaring_type;
            if module.type_name(saver_type)? != NATIVE_LIB_TYPE {
                return None;
            }
            Some(NativeLibSaver {
                saver_type,
                init_method: called,
                resource: resource_from_code_strings(module, &[called]),
            })
        })
    }

    /// Re-resolve against a reloaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if a member no longer resolves, and
    /// [`crate::Error::PayloadUnavailable`] if the resource is gone.
    pub fn rebind(&self, old: &Module, new: &Module) -> Result<Self> {
        if let Some(name) = &self.resource {
            if new.resource(name).is_none() {
                return Err(Error::PayloadUnavailable(format!(
                    "Could not find native lib resource {name:?}"
                )));
            }
        }
        Ok(NativeLibSaver {
            saver_type: new.rebind_type(old, self.saver_type)?,
            init_method: new.rebind_method(old, self.init_method)?,
            resource: self.resource.clone(),
        })
    }
}
