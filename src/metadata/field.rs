//! Field definitions.

use bitflags::bitflags;

use crate::metadata::{method::MEMBER_ACCESS_MASK, token::Token};

bitflags! {
    /// Field attribute flags (ECMA-335 II.23.1.5)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldAttributes: u32 {
        /// Accessible only by the declaring type
        const PRIVATE = 0x0001;
        /// Accessible inside the assembly
        const ASSEMBLY = 0x0003;
        /// Accessible by everyone
        const PUBLIC = 0x0006;
        /// Defined on the type, not per instance
        const STATIC = 0x0010;
        /// Only assigned in a constructor
        const INIT_ONLY = 0x0020;
        /// Compile-time constant
        const LITERAL = 0x0040;
        /// Backed by data at an RVA
        const HAS_FIELD_RVA = 0x0100;
    }
}

/// A field defined in the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Simple name
    pub name: String,
    /// Declaring type
    pub declaring_type: Token,
    /// Full name of the field type
    pub field_type: String,
    /// Attribute flags
    pub flags: FieldAttributes,
    /// RVA of the initial value, 0 if none
    pub rva: u32,
    /// Size in bytes of the data at `rva`, from the field type's class layout
    pub data_size: u32,
    /// Initial value bytes for RVA fields not (yet) written to the image
    pub initial_value: Option<Vec<u8>>,
}

impl FieldDef {
    /// Create a private static field.
    #[must_use]
    pub fn new(name: &str, field_type: &str) -> Self {
        FieldDef {
            name: name.to_string(),
            declaring_type: Token::new(0),
            field_type: field_type.to_string(),
            flags: FieldAttributes::PRIVATE | FieldAttributes::STATIC,
            rva: 0,
            data_size: 0,
            initial_value: None,
        }
    }

    /// Replace the attribute flags.
    #[must_use]
    pub fn with_flags(mut self, flags: FieldAttributes) -> Self {
        self.flags = flags;
        self
    }

    /// Back the field with `data`, placed at `rva`.
    #[must_use]
    pub fn with_rva(mut self, rva: u32, data: Vec<u8>) -> Self {
        self.flags |= FieldAttributes::HAS_FIELD_RVA;
        self.rva = rva;
        self.data_size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        self.initial_value = Some(data);
        self
    }

    /// Back the field with `size` bytes of the PE image at `rva`, read on demand.
    #[must_use]
    pub fn with_image_rva(mut self, rva: u32, size: u32) -> Self {
        self.flags |= FieldAttributes::HAS_FIELD_RVA;
        self.rva = rva;
        self.data_size = size;
        self.initial_value = None;
        self
    }

    /// Static field.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }

    /// Public access.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.flags.bits() & MEMBER_ACCESS_MASK == FieldAttributes::PUBLIC.bits()
    }

    /// Literal (constant) field.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.flags.contains(FieldAttributes::LITERAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rva_fields() {
        let field = FieldDef::new("data", "System.Byte[]").with_rva(0x2050, vec![1, 2]);
        assert!(field.flags.contains(FieldAttributes::HAS_FIELD_RVA));
        assert!(field.is_static());
        assert!(!field.is_public());
        assert_eq!(field.initial_value.as_deref(), Some(&[1u8, 2][..]));
    }
}
