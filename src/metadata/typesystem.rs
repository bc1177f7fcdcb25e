//! Type definitions and type references.

use bitflags::bitflags;

use crate::metadata::token::Token;

/// Visibility mask of [`TypeAttributes`]
pub const TYPE_VISIBILITY_MASK: u32 = 0x0000_0007;

bitflags! {
    /// Type attribute flags (ECMA-335 II.23.1.15)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeAttributes: u32 {
        /// Not visible outside the assembly
        const NOT_PUBLIC = 0x0000_0000;
        /// Visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Nested, public
        const NESTED_PUBLIC = 0x0000_0002;
        /// Nested, private
        const NESTED_PRIVATE = 0x0000_0003;
        /// Nested, visible to the assembly
        const NESTED_ASSEMBLY = 0x0000_0005;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type is abstract
        const ABSTRACT = 0x0000_0080;
        /// Type is sealed
        const SEALED = 0x0000_0100;
        /// Name carries a special meaning
        const SPECIAL_NAME = 0x0000_0400;
        /// Type initialiser may run before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

/// A type defined in the module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeDef {
    /// Namespace, empty for nested types and the global namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Attribute flags
    pub flags: TypeAttributes,
    /// Full name of the base type, if any
    pub base_type: Option<String>,
    /// Enclosing type for nested types
    pub declaring_type: Option<Token>,
    /// Nested types in declaration order
    pub nested_types: Vec<Token>,
    /// Fields in declaration order
    pub fields: Vec<Token>,
    /// Methods in declaration order
    pub methods: Vec<Token>,
    /// Property names
    pub properties: Vec<String>,
    /// Event names
    pub events: Vec<String>,
}

impl TypeDef {
    /// Create a non-public class deriving from `System.Object`.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        TypeDef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            base_type: Some("System.Object".to_string()),
            ..Default::default()
        }
    }

    /// Replace the attribute flags.
    #[must_use]
    pub fn with_flags(mut self, flags: TypeAttributes) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the base type.
    #[must_use]
    pub fn with_base(mut self, base_type: &str) -> Self {
        self.base_type = Some(base_type.to_string());
        self
    }

    /// Add a property name.
    #[must_use]
    pub fn with_property(mut self, name: &str) -> Self {
        self.properties.push(name.to_string());
        self
    }

    /// Add an event name.
    #[must_use]
    pub fn with_event(mut self, name: &str) -> Self {
        self.events.push(name.to_string());
        self
    }

    /// Public or nested public.
    #[must_use]
    pub fn is_public(&self) -> bool {
        matches!(self.flags.bits() & TYPE_VISIBILITY_MASK, 1 | 2)
    }

    /// Returns true if the type derives from `System.Enum`.
    #[must_use]
    pub fn is_enum(&self) -> bool {
        self.base_type.as_deref() == Some("System.Enum")
    }

    /// Returns true if the type derives from `System.MulticastDelegate`.
    #[must_use]
    pub fn is_delegate(&self) -> bool {
        self.base_type.as_deref() == Some("System.MulticastDelegate")
    }

    /// Returns true for nested types.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.declaring_type.is_some()
    }
}

/// A reference to a type defined elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// Namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
}

impl TypeRef {
    /// `Namespace.Name`, or just the name in the global namespace
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}
