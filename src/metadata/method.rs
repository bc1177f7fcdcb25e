//! Method definitions, member references and their signatures.

use bitflags::bitflags;

use crate::metadata::{body::MethodBody, token::Token};

/// Member access mask shared by [`MethodAttributes`] and field flags
pub const MEMBER_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    /// Method attribute flags (ECMA-335 II.23.1.10)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodAttributes: u32 {
        /// Accessible only by the declaring type
        const PRIVATE = 0x0001;
        /// Accessible by subtypes inside the assembly
        const FAM_AND_ASSEM = 0x0002;
        /// Accessible inside the assembly
        const ASSEMBLY = 0x0003;
        /// Accessible by subtypes
        const FAMILY = 0x0004;
        /// Accessible by subtypes and the assembly
        const FAM_OR_ASSEM = 0x0005;
        /// Accessible by everyone
        const PUBLIC = 0x0006;
        /// Defined on the type, not per instance
        const STATIC = 0x0010;
        /// Cannot be overridden
        const FINAL = 0x0020;
        /// Virtual method
        const VIRTUAL = 0x0040;
        /// Hidden by name and signature
        const HIDE_BY_SIG = 0x0080;
        /// Always gets a new vtable slot
        const NEW_SLOT = 0x0100;
        /// Abstract method
        const ABSTRACT = 0x0400;
        /// Name carries a special meaning
        const SPECIAL_NAME = 0x0800;
        /// Runtime checks the name encoding
        const RT_SPECIAL_NAME = 0x1000;
        /// Implementation forwarded through P/Invoke
        const PINVOKE_IMPL = 0x2000;
    }
}

bitflags! {
    /// Method implementation flags (ECMA-335 II.23.1.11)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodImplAttributes: u32 {
        /// Native code
        const NATIVE = 0x0001;
        /// Method cannot be inlined
        const NO_INLINING = 0x0008;
        /// Single-threaded through the body
        const SYNCHRONIZED = 0x0020;
        /// Signature is exported as declared
        const PRESERVE_SIG = 0x0080;
        /// Implemented inside the runtime
        const INTERNAL_CALL = 0x1000;
    }
}

/// A method signature with full type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Whether an implicit `this` is passed
    pub has_this: bool,
    /// Full name of the return type
    pub return_type: String,
    /// Full names of the parameter types
    pub params: Vec<String>,
}

impl MethodSig {
    /// Create a static signature.
    #[must_use]
    pub fn new(return_type: &str, params: &[&str]) -> Self {
        MethodSig {
            has_this: false,
            return_type: return_type.to_string(),
            params: params.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    /// Create an instance signature.
    #[must_use]
    pub fn instance(return_type: &str, params: &[&str]) -> Self {
        MethodSig {
            has_this: true,
            ..Self::new(return_type, params)
        }
    }

    /// Returns true if the return type and parameter types match exactly.
    #[must_use]
    pub fn matches(&self, return_type: &str, params: &[&str]) -> bool {
        self.return_type == return_type
            && self.params.len() == params.len()
            && self.params.iter().zip(params).all(|(a, b)| a == b)
    }

    /// Returns true unless the method returns `System.Void`.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.return_type != "System.Void"
    }
}

/// Module and entry point of a P/Invoke method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PInvokeInfo {
    /// Native module, e.g. `kernel32`
    pub module: String,
    /// Entry point name
    pub entry_point: String,
}

/// A method defined in the module.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Simple name
    pub name: String,
    /// Declaring type
    pub declaring_type: Token,
    /// Signature
    pub signature: MethodSig,
    /// Attribute flags
    pub flags: MethodAttributes,
    /// Implementation flags
    pub impl_flags: MethodImplAttributes,
    /// P/Invoke information for native imports
    pub pinvoke: Option<PInvokeInfo>,
    /// The body, absent for abstract, runtime and native methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Create a private static method without a body.
    #[must_use]
    pub fn new(name: &str, signature: MethodSig) -> Self {
        let mut method = MethodDef {
            name: name.to_string(),
            declaring_type: Token::new(0),
            signature,
            flags: MethodAttributes::PRIVATE | MethodAttributes::HIDE_BY_SIG,
            impl_flags: MethodImplAttributes::empty(),
            pinvoke: None,
            body: None,
        };
        if !method.signature.has_this {
            method.flags |= MethodAttributes::STATIC;
        }
        method
    }

    /// A static constructor with an empty body.
    #[must_use]
    pub fn cctor() -> Self {
        MethodDef::new(".cctor", MethodSig::new("System.Void", &[])).with_flags(
            MethodAttributes::PRIVATE
                | MethodAttributes::STATIC
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::RT_SPECIAL_NAME,
        )
    }

    /// An instance constructor taking `params`.
    #[must_use]
    pub fn ctor(params: &[&str]) -> Self {
        MethodDef::new(".ctor", MethodSig::instance("System.Void", params)).with_flags(
            MethodAttributes::PUBLIC
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::RT_SPECIAL_NAME,
        )
    }

    /// Replace the attribute flags. `STATIC` decides whether the signature has `this`.
    #[must_use]
    pub fn with_flags(mut self, flags: MethodAttributes) -> Self {
        self.flags = flags;
        self.signature.has_this = !flags.contains(MethodAttributes::STATIC);
        self
    }

    /// Replace the implementation flags.
    #[must_use]
    pub fn with_impl_flags(mut self, impl_flags: MethodImplAttributes) -> Self {
        self.impl_flags = impl_flags;
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Turn the method into a P/Invoke import.
    #[must_use]
    pub fn with_pinvoke(mut self, module: &str, entry_point: &str) -> Self {
        self.flags |= MethodAttributes::PINVOKE_IMPL;
        self.pinvoke = Some(PInvokeInfo {
            module: module.to_string(),
            entry_point: entry_point.to_string(),
        });
        self
    }

    fn access(&self) -> u32 {
        self.flags.bits() & MEMBER_ACCESS_MASK
    }

    /// Public access.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.access() == MethodAttributes::PUBLIC.bits()
    }

    /// Private access.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.access() == MethodAttributes::PRIVATE.bits()
    }

    /// Assembly (internal) access.
    #[must_use]
    pub fn is_assembly(&self) -> bool {
        self.access() == MethodAttributes::ASSEMBLY.bits()
    }

    /// Static method.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// Virtual method.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodAttributes::VIRTUAL)
    }

    /// P/Invoke import.
    #[must_use]
    pub fn is_pinvoke(&self) -> bool {
        self.pinvoke.is_some()
    }

    /// Marked `NoInlining`.
    #[must_use]
    pub fn is_no_inlining(&self) -> bool {
        self.impl_flags.contains(MethodImplAttributes::NO_INLINING)
    }

    /// Marked `Synchronized`.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.impl_flags.contains(MethodImplAttributes::SYNCHRONIZED)
    }

    /// Instance constructor.
    #[must_use]
    pub fn is_ctor(&self) -> bool {
        self.name == ".ctor"
    }

    /// Static constructor.
    #[must_use]
    pub fn is_cctor(&self) -> bool {
        self.name == ".cctor"
    }

    /// Returns true if the signature matches `return_type(params)`.
    #[must_use]
    pub fn is_method(&self, return_type: &str, params: &[&str]) -> bool {
        self.signature.matches(return_type, params)
    }
}

/// A reference to a method defined in another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// Full name of the declaring type
    pub class: String,
    /// Simple name
    pub name: String,
    /// Signature
    pub signature: MethodSig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_drive_this() {
        let method = MethodDef::new("M", MethodSig::instance("System.Void", &[]));
        assert!(!method.is_static());
        let method = method.with_flags(MethodAttributes::PUBLIC | MethodAttributes::STATIC);
        assert!(method.is_static());
        assert!(method.is_public());
        assert!(!method.signature.has_this);
    }

    #[test]
    fn access_is_a_mask_not_bits() {
        let assembly = MethodDef::new("M", MethodSig::new("System.Void", &[]))
            .with_flags(MethodAttributes::ASSEMBLY | MethodAttributes::STATIC);
        assert!(assembly.is_assembly());
        assert!(!assembly.is_private());
        assert!(!assembly.is_public());
    }

    #[test]
    fn signature_matching() {
        let method = MethodDef::new("Decrypt", MethodSig::new("System.String", &["System.Int32"]));
        assert!(method.is_method("System.String", &["System.Int32"]));
        assert!(!method.is_method("System.String", &[]));
        assert!(!method.is_method("System.Int32", &["System.Int32"]));
        assert!(MethodDef::cctor().is_cctor());
        assert!(MethodDef::ctor(&[]).signature.has_this);
    }

    #[test]
    fn pinvoke_and_impl_flags() {
        let method = MethodDef::new("Protect", MethodSig::new("System.Boolean", &[]))
            .with_pinvoke("Protect32.dll", "P0")
            .with_impl_flags(MethodImplAttributes::NO_INLINING | MethodImplAttributes::SYNCHRONIZED);
        assert!(method.is_pinvoke());
        assert!(method.is_no_inlining());
        assert!(method.is_synchronized());
        assert_eq!(method.pinvoke.unwrap().entry_point, "P0");
    }
}
