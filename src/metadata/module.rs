//! The module arena.
//!
//! [`Module`] owns every definition of a loaded binary in flat tables addressed by
//! [`Token`]. Detectors never hold references into the arena, only tokens, which makes
//! re-resolution against a reloaded module an explicit lookup through
//! [`Module::rebind_type`], [`Module::rebind_method`] and [`Module::rebind_field`].
//!
//! Row 1 of the type table is always the global `<Module>` type.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotscope_deob::metadata::{
//!     method::{MethodDef, MethodSig},
//!     module::Module,
//!     typesystem::TypeDef,
//! };
//!
//! let mut module = Module::new("Sample.exe");
//! let ty = module.add_type(TypeDef::new("Sample", "Strings"));
//! let method = module.add_method(
//!     ty,
//!     MethodDef::new("Get", MethodSig::new("System.String", &["System.Int32"])),
//! )?;
//!
//! assert_eq!(
//!     module.method_full_name(method).as_deref(),
//!     Some("System.String Sample.Strings::Get(System.Int32)")
//! );
//! # Ok::<(), dotscope_deob::Error>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};

use uguid::Guid;

use crate::{
    assembly::{Instruction, Operand},
    file::pe::PeImage,
    metadata::{
        field::{FieldAttributes, FieldDef},
        method::{MemberRef, MethodDef, MethodSig},
        token::Token,
        typesystem::{TypeAttributes, TypeDef, TypeRef},
    },
    Error, Result,
};

/// Name of the global type holding module-level members
pub const MODULE_TYPE_NAME: &str = "<Module>";

/// Name of the type that owns compiler generated RVA data
pub const PRIVATE_IMPLEMENTATION_DETAILS: &str = "<PrivateImplementationDetails>";

/// Runtime flavour the module targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameworkType {
    /// The desktop .NET Framework (or its successors)
    #[default]
    Desktop,
    /// The .NET Compact Framework
    CompactFramework,
    /// Silverlight
    Silverlight,
}

/// An embedded manifest resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Resource name
    pub name: String,
    /// Raw content
    pub data: Vec<u8>,
    /// Public visibility
    pub public: bool,
}

impl Resource {
    /// Create a public resource.
    #[must_use]
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        Resource {
            name: name.to_string(),
            data,
            public: true,
        }
    }
}

/// The arena of all definitions in one loaded module.
#[derive(Debug, Clone)]
pub struct Module {
    /// Module file name
    pub name: String,
    /// Simple assembly name, if the module carries a manifest
    pub assembly_name: Option<String>,
    /// Public key token of the assembly
    pub public_key_token: Option<Vec<u8>>,
    /// Module version id
    pub mvid: Guid,
    /// Target runtime
    pub framework: FrameworkType,
    /// Raw PE image, when the loader kept it
    pub pe: Option<PeImage>,
    types: Vec<TypeDef>,
    type_refs: Vec<TypeRef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    member_refs: Vec<MemberRef>,
    local_signatures: Vec<Vec<String>>,
    user_strings: BTreeMap<u32, String>,
    next_user_string: u32,
    resources: Vec<Resource>,
    modified: BTreeSet<Token>,
    next_field_rva: u32,
}

fn row_index(token: Token, table: u8) -> Option<usize> {
    if token.is_table(table) {
        Some(token.row() as usize - 1)
    } else {
        None
    }
}

fn token_for(table: u8, index: usize) -> Token {
    // arena tables never reach 2^24 rows
    #[allow(clippy::cast_possible_truncation)]
    Token::from_parts(table, index as u32 + 1)
}

impl Module {
    /// Create an empty module holding only the `<Module>` type.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut module = Module {
            name: name.to_string(),
            assembly_name: None,
            public_key_token: None,
            mvid: Guid::ZERO,
            framework: FrameworkType::Desktop,
            pe: None,
            types: Vec::new(),
            type_refs: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            member_refs: Vec::new(),
            local_signatures: Vec::new(),
            user_strings: BTreeMap::new(),
            next_user_string: 1,
            resources: Vec::new(),
            modified: BTreeSet::new(),
            next_field_rva: 0x0001_0000,
        };
        module.add_type(TypeDef {
            name: MODULE_TYPE_NAME.to_string(),
            base_type: None,
            ..Default::default()
        });
        module
    }

    // ---- population -------------------------------------------------------------------

    /// Add a top-level type.
    pub fn add_type(&mut self, mut def: TypeDef) -> Token {
        def.declaring_type = None;
        self.types.push(def);
        token_for(Token::TYPE_DEF, self.types.len() - 1)
    }

    /// Add a type nested in `outer`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `outer` is not a type in this module.
    pub fn add_nested_type(&mut self, outer: Token, mut def: TypeDef) -> Result<Token> {
        let outer_index = row_index(outer, Token::TYPE_DEF)
            .filter(|&i| i < self.types.len())
            .ok_or(Error::TypeNotFound(outer))?;
        def.declaring_type = Some(outer);
        if def.flags.bits() & 0x7 == 0 {
            def.flags |= TypeAttributes::NESTED_PRIVATE;
        }
        def.namespace.clear();
        self.types.push(def);
        let token = token_for(Token::TYPE_DEF, self.types.len() - 1);
        self.types[outer_index].nested_types.push(token);
        Ok(token)
    }

    /// Add (or find) a reference to an external type by its full name.
    pub fn import_type(&mut self, full_name: &str) -> Token {
        let (namespace, name) = match full_name.rfind('.') {
            Some(dot) => (&full_name[..dot], &full_name[dot + 1..]),
            None => ("", full_name),
        };
        if let Some(index) = self
            .type_refs
            .iter()
            .position(|r| r.namespace == namespace && r.name == name)
        {
            return token_for(Token::TYPE_REF, index);
        }
        self.type_refs.push(TypeRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        token_for(Token::TYPE_REF, self.type_refs.len() - 1)
    }

    /// Add a field to `owner`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `owner` is not a type in this module.
    pub fn add_field(&mut self, owner: Token, mut def: FieldDef) -> Result<Token> {
        let owner_index = row_index(owner, Token::TYPE_DEF)
            .filter(|&i| i < self.types.len())
            .ok_or(Error::TypeNotFound(owner))?;
        def.declaring_type = owner;
        self.fields.push(def);
        let token = token_for(Token::FIELD, self.fields.len() - 1);
        self.types[owner_index].fields.push(token);
        Ok(token)
    }

    /// Add a method to `owner`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `owner` is not a type in this module.
    pub fn add_method(&mut self, owner: Token, mut def: MethodDef) -> Result<Token> {
        let owner_index = row_index(owner, Token::TYPE_DEF)
            .filter(|&i| i < self.types.len())
            .ok_or(Error::TypeNotFound(owner))?;
        def.declaring_type = owner;
        self.methods.push(def);
        let token = token_for(Token::METHOD_DEF, self.methods.len() - 1);
        self.types[owner_index].methods.push(token);
        Ok(token)
    }

    /// Add (or find) a reference to an external method.
    pub fn add_member_ref(&mut self, class: &str, name: &str, signature: MethodSig) -> Token {
        if let Some(index) = self
            .member_refs
            .iter()
            .position(|r| r.class == class && r.name == name && r.signature == signature)
        {
            return token_for(Token::MEMBER_REF, index);
        }
        self.member_refs.push(MemberRef {
            class: class.to_string(),
            name: name.to_string(),
            signature,
        });
        token_for(Token::MEMBER_REF, self.member_refs.len() - 1)
    }

    /// Add a local variable signature.
    pub fn add_local_signature(&mut self, locals: Vec<String>) -> Token {
        self.local_signatures.push(locals);
        token_for(Token::STANDALONE_SIG, self.local_signatures.len() - 1)
    }

    /// Add a string to the user string heap.
    pub fn add_user_string(&mut self, value: &str) -> Token {
        let offset = self.next_user_string;
        self.user_strings.insert(offset, value.to_string());
        // heap entries are length prefixed UTF-16 plus a trailing flag byte
        let size = u32::try_from(value.encode_utf16().count() * 2 + 2).unwrap_or(u32::MAX);
        self.next_user_string = self.next_user_string.saturating_add(size);
        Token::from_parts(Token::USER_STRING, offset)
    }

    /// Add an embedded resource, replacing one with the same name.
    pub fn add_resource(&mut self, resource: Resource) {
        self.remove_resource(&resource.name);
        self.resources.push(resource);
    }

    /// Remove a resource by name, returning it.
    pub fn remove_resource(&mut self, name: &str) -> Option<Resource> {
        let index = self.resources.iter().position(|r| r.name == name)?;
        Some(self.resources.remove(index))
    }

    /// Create a static RVA-backed field holding `data` under `<PrivateImplementationDetails>`.
    ///
    /// # Errors
    /// Propagates arena errors; none are expected for a well formed module.
    pub fn add_initialized_data(&mut self, data: Vec<u8>) -> Result<Token> {
        let owner = match self.find_type(PRIVATE_IMPLEMENTATION_DETAILS) {
            Some(token) => token,
            None => self.add_type(
                TypeDef::new("", PRIVATE_IMPLEMENTATION_DETAILS).with_flags(TypeAttributes::SEALED),
            ),
        };

        let index = self
            .type_def(owner)
            .map_or(0, |ty| ty.fields.len());
        let field_type = format!(
            "{PRIVATE_IMPLEMENTATION_DETAILS}/__StaticArrayInitTypeSize={}",
            data.len()
        );
        let rva = self.next_field_rva;
        let size = u32::try_from(data.len()).map_err(|_| out_of_bounds_error!())?;
        self.next_field_rva = rva.saturating_add((size + 7) & !7);

        self.add_field(
            owner,
            FieldDef::new(&format!("$$method0x{:08x}-{index}", rva), &field_type)
                .with_flags(
                    FieldAttributes::ASSEMBLY | FieldAttributes::STATIC | FieldAttributes::INIT_ONLY,
                )
                .with_rva(rva, data),
        )
    }

    /// Record that a method body was changed.
    pub fn mark_modified(&mut self, method: Token) {
        self.modified.insert(method);
    }

    /// Methods whose bodies were changed, in token order.
    #[must_use]
    pub fn modified_methods(&self) -> Vec<Token> {
        self.modified.iter().copied().collect()
    }

    // ---- lookup -----------------------------------------------------------------------

    /// Resolve a type definition.
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        row_index(token, Token::TYPE_DEF).and_then(|i| self.types.get(i))
    }

    /// Resolve a type definition mutably.
    pub fn type_def_mut(&mut self, token: Token) -> Option<&mut TypeDef> {
        row_index(token, Token::TYPE_DEF).and_then(|i| self.types.get_mut(i))
    }

    /// Resolve a method definition.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        row_index(token, Token::METHOD_DEF).and_then(|i| self.methods.get(i))
    }

    /// Resolve a method definition mutably.
    pub fn method_mut(&mut self, token: Token) -> Option<&mut MethodDef> {
        row_index(token, Token::METHOD_DEF).and_then(|i| self.methods.get_mut(i))
    }

    /// Resolve a field definition.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        row_index(token, Token::FIELD).and_then(|i| self.fields.get(i))
    }

    /// Initial data of an RVA-backed field.
    ///
    /// The bytes are read from the PE image when it maps the field's RVA. Fields added
    /// after loading (or modules without an image) fall back to the cached initial value.
    /// `Ok(None)` means the field does not exist or has no RVA data.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the data runs past the end of the image.
    pub fn field_data(&self, token: Token) -> Result<Option<Vec<u8>>> {
        let Some(field) = self.field(token) else {
            return Ok(None);
        };
        if field.rva == 0 {
            return Ok(None);
        }
        if let Some(pe) = self.pe.as_ref().filter(|pe| pe.find_section_by_rva(field.rva).is_some()) {
            return Ok(Some(pe.read_bytes(field.rva, field.data_size as usize)?.to_vec()));
        }
        Ok(field.initial_value.clone())
    }

    /// Resolve a member reference.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRef> {
        row_index(token, Token::MEMBER_REF).and_then(|i| self.member_refs.get(i))
    }

    /// Resolve a local variable signature.
    #[must_use]
    pub fn local_signature(&self, token: Token) -> Option<&[String]> {
        row_index(token, Token::STANDALONE_SIG)
            .and_then(|i| self.local_signatures.get(i))
            .map(Vec::as_slice)
    }

    /// Resolve a user string.
    #[must_use]
    pub fn user_string(&self, token: Token) -> Option<&str> {
        if token.table() != Token::USER_STRING {
            return None;
        }
        self.user_strings.get(&token.row()).map(String::as_str)
    }

    /// The string pushed by an `ldstr`, whether inline or a heap reference.
    #[must_use]
    pub fn ldstr_value<'a>(&'a self, instruction: &'a Instruction) -> Option<&'a str> {
        if !instruction.is_ldstr() {
            return None;
        }
        match &instruction.operand {
            Operand::String(s) => Some(s.as_str()),
            Operand::Token(token) => self.user_string(*token),
            _ => None,
        }
    }

    /// Find a resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// All resources in manifest order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// All type definition tokens in declaration order, `<Module>` first.
    #[must_use]
    pub fn types(&self) -> Vec<Token> {
        (0..self.types.len())
            .map(|i| token_for(Token::TYPE_DEF, i))
            .collect()
    }

    /// All method definition tokens in row order.
    #[must_use]
    pub fn methods(&self) -> Vec<Token> {
        (0..self.methods.len())
            .map(|i| token_for(Token::METHOD_DEF, i))
            .collect()
    }

    /// Full name of a type definition or reference. Nested types use `Outer/Inner`.
    #[must_use]
    pub fn type_name(&self, token: Token) -> Option<String> {
        if let Some(type_ref) = row_index(token, Token::TYPE_REF).and_then(|i| self.type_refs.get(i)) {
            return Some(type_ref.full_name());
        }

        let ty = self.type_def(token)?;
        match ty.declaring_type {
            Some(outer) => Some(format!("{}/{}", self.type_name(outer)?, ty.name)),
            None if ty.namespace.is_empty() => Some(ty.name.clone()),
            None => Some(format!("{}.{}", ty.namespace, ty.name)),
        }
    }

    /// Find a type definition by full name.
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        self.types()
            .into_iter()
            .find(|&token| self.type_name(token).as_deref() == Some(full_name))
    }

    /// The signature of a method definition or member reference.
    #[must_use]
    pub fn method_sig(&self, token: Token) -> Option<&MethodSig> {
        match token.table() {
            Token::METHOD_DEF => self.method(token).map(|m| &m.signature),
            Token::MEMBER_REF => self.member_ref(token).map(|m| &m.signature),
            _ => None,
        }
    }

    /// Full name `Ret Decl::Name(P1,P2)` of a method definition or member reference.
    #[must_use]
    pub fn method_full_name(&self, token: Token) -> Option<String> {
        let (class, name, signature) = match token.table() {
            Token::METHOD_DEF => {
                let method = self.method(token)?;
                (
                    self.type_name(method.declaring_type)?,
                    method.name.as_str(),
                    &method.signature,
                )
            }
            Token::MEMBER_REF => {
                let member = self.member_ref(token)?;
                (member.class.clone(), member.name.as_str(), &member.signature)
            }
            _ => return None,
        };
        Some(format!(
            "{} {}::{}({})",
            signature.return_type,
            class,
            name,
            signature.params.join(",")
        ))
    }

    /// Full name `Type Decl::Name` of a field definition.
    #[must_use]
    pub fn field_full_name(&self, token: Token) -> Option<String> {
        let field = self.field(token)?;
        Some(format!(
            "{} {}::{}",
            field.field_type,
            self.type_name(field.declaring_type)?,
            field.name
        ))
    }

    /// Find a method by name and signature within a type.
    #[must_use]
    pub fn find_method(&self, owner: Token, name: &str) -> Option<Token> {
        self.type_def(owner)?
            .methods
            .iter()
            .copied()
            .find(|&m| self.method(m).is_some_and(|m| m.name == name))
    }

    /// The static constructor of the `<Module>` type.
    #[must_use]
    pub fn module_type_cctor(&self) -> Option<Token> {
        self.find_method(token_for(Token::TYPE_DEF, 0), ".cctor")
    }

    /// The static constructor of `owner`.
    #[must_use]
    pub fn type_cctor(&self, owner: Token) -> Option<Token> {
        self.find_method(owner, ".cctor")
    }

    /// Net stack effect of an instruction, resolving call signatures.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if a call target does not resolve and
    /// [`crate::Error::Invariant`] for opcodes whose effect depends on the enclosing method
    /// (`ret`, `jmp`, `calli`).
    pub fn stack_delta(&self, instruction: &Instruction) -> Result<i32> {
        if !instruction.stack_behavior.variable {
            return Ok(instruction.stack_behavior.net_effect());
        }

        let signature_of = |instruction: &Instruction| -> Result<&MethodSig> {
            let token = instruction
                .token_operand()
                .ok_or_else(|| Error::Invariant(format!("{instruction} without token")))?;
            self.method_sig(token).ok_or(Error::TypeNotFound(token))
        };
        let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);

        match (instruction.prefix, instruction.opcode) {
            (0, 0x28 | 0x6F) => {
                let sig = signature_of(instruction)?;
                Ok(i32::from(sig.returns_value())
                    - count(sig.params.len())
                    - i32::from(sig.has_this))
            }
            (0, 0x73) => {
                let sig = signature_of(instruction)?;
                Ok(1 - count(sig.params.len()))
            }
            _ => Err(Error::Invariant(format!(
                "Stack effect of {} depends on its context",
                instruction.mnemonic
            ))),
        }
    }

    // ---- rebinding --------------------------------------------------------------------

    /// Re-resolve a type token taken from `old` against this module.
    ///
    /// The token is kept when it names the same type here; otherwise the type is looked up
    /// by full name.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if the type no longer exists.
    pub fn rebind_type(&self, old: &Module, token: Token) -> Result<Token> {
        let name = old.type_name(token).ok_or(Error::Rebind {
            token,
            what: "type",
        })?;
        if self.type_name(token).as_deref() == Some(name.as_str()) {
            return Ok(token);
        }
        self.find_type(&name).ok_or(Error::Rebind {
            token,
            what: "type",
        })
    }

    /// Re-resolve a method token taken from `old` against this module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if the method no longer exists.
    pub fn rebind_method(&self, old: &Module, token: Token) -> Result<Token> {
        let name = old.method_full_name(token).ok_or(Error::Rebind {
            token,
            what: "method",
        })?;
        if self.method_full_name(token).as_deref() == Some(name.as_str()) {
            return Ok(token);
        }
        self.methods()
            .into_iter()
            .find(|&m| self.method_full_name(m).as_deref() == Some(name.as_str()))
            .ok_or(Error::Rebind {
                token,
                what: "method",
            })
    }

    /// Re-resolve a field token taken from `old` against this module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] if the field no longer exists.
    pub fn rebind_field(&self, old: &Module, token: Token) -> Result<Token> {
        let name = old.field_full_name(token).ok_or(Error::Rebind {
            token,
            what: "field",
        })?;
        if self.field_full_name(token).as_deref() == Some(name.as_str()) {
            return Ok(token);
        }
        (0..self.fields.len())
            .map(|i| token_for(Token::FIELD, i))
            .find(|&f| self.field_full_name(f).as_deref() == Some(name.as_str()))
            .ok_or(Error::Rebind {
                token,
                what: "field",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file::pe::SectionHeader, metadata::method::MethodAttributes};

    fn sample() -> (Module, Token, Token, Token) {
        let mut module = Module::new("a.exe");
        let outer = module.add_type(TypeDef::new("NS", "Outer"));
        let inner = module.add_nested_type(outer, TypeDef::new("", "Inner")).unwrap();
        let method = module
            .add_method(
                inner,
                MethodDef::new("Run", MethodSig::new("System.Int32", &["System.Byte[]", "System.Int32"])),
            )
            .unwrap();
        (module, outer, inner, method)
    }

    #[test]
    fn names() {
        let (module, outer, inner, method) = sample();
        assert_eq!(module.type_name(outer).as_deref(), Some("NS.Outer"));
        assert_eq!(module.type_name(inner).as_deref(), Some("NS.Outer/Inner"));
        assert_eq!(
            module.method_full_name(method).as_deref(),
            Some("System.Int32 NS.Outer/Inner::Run(System.Byte[],System.Int32)")
        );
        assert_eq!(module.find_type("NS.Outer/Inner"), Some(inner));
        assert_eq!(module.types()[0], Token(0x0200_0001));
        assert_eq!(module.type_name(module.types()[0]).as_deref(), Some("<Module>"));
    }

    #[test]
    fn member_refs_and_type_refs_dedup() {
        let mut module = Module::new("a.exe");
        let sig = MethodSig::new("System.String", &["System.String"]);
        let a = module.add_member_ref("System.String", "Intern", sig.clone());
        let b = module.add_member_ref("System.String", "Intern", sig);
        assert_eq!(a, b);
        assert_eq!(
            module.method_full_name(a).as_deref(),
            Some("System.String System.String::Intern(System.String)")
        );

        let byte = module.import_type("System.Byte");
        assert_eq!(module.import_type("System.Byte"), byte);
        assert_eq!(module.type_name(byte).as_deref(), Some("System.Byte"));
    }

    #[test]
    fn stack_delta_uses_signatures() {
        let (mut module, _, inner, method) = sample();
        let call = Instruction::call(method);
        assert_eq!(module.stack_delta(&call).unwrap(), -1);

        let ctor = module
            .add_method(inner, MethodDef::ctor(&["System.Int32"]))
            .unwrap();
        let instance = module
            .add_method(
                inner,
                MethodDef::new("Get", MethodSig::instance("System.Void", &[]))
                    .with_flags(MethodAttributes::PUBLIC),
            )
            .unwrap();
        let newobj = Instruction::by_mnemonic("newobj", Operand::Token(ctor)).unwrap();
        assert_eq!(module.stack_delta(&newobj).unwrap(), 0);
        assert_eq!(module.stack_delta(&Instruction::call(instance)).unwrap(), -1);
        assert_eq!(module.stack_delta(&Instruction::ldc_i4(1)).unwrap(), 1);
        assert!(module.stack_delta(&Instruction::ret()).is_err());
        assert!(matches!(
            module.stack_delta(&Instruction::call(Token(0x0600_0099))),
            Err(Error::TypeNotFound(_))
        ));
    }

    #[test]
    fn user_strings_and_ldstr() {
        let mut module = Module::new("a.exe");
        let first = module.add_user_string("hello");
        let second = module.add_user_string("x");
        assert_eq!(first.row(), 1);
        assert_eq!(second.row(), 13);
        assert_eq!(module.user_string(second), Some("x"));

        let heap = Instruction::by_mnemonic("ldstr", Operand::Token(first)).unwrap();
        assert_eq!(module.ldstr_value(&heap), Some("hello"));
        assert_eq!(module.ldstr_value(&Instruction::ldstr("inline")), Some("inline"));
        assert_eq!(module.ldstr_value(&Instruction::nop()), None);
    }

    #[test]
    fn resources_and_initialized_data() {
        let mut module = Module::new("a.exe");
        module.add_resource(Resource::new("r", vec![1]));
        module.add_resource(Resource::new("r", vec![2]));
        assert_eq!(module.resources().len(), 1);
        assert_eq!(module.resource("r").unwrap().data, vec![2]);
        assert!(module.remove_resource("r").is_some());
        assert!(module.resource("r").is_none());

        let field = module.add_initialized_data(vec![9; 12]).unwrap();
        let def = module.field(field).unwrap();
        assert!(def.flags.contains(FieldAttributes::HAS_FIELD_RVA));
        assert_eq!(def.initial_value.as_deref(), Some(&[9u8; 12][..]));
        let (first_rva, owner) = (def.rva, def.declaring_type);
        let second = module.add_initialized_data(vec![1]).unwrap();
        assert_ne!(module.field(second).unwrap().rva, first_rva);
        assert_eq!(module.type_def(owner).unwrap().fields.len(), 2);
        assert_eq!(module.field_data(field).unwrap(), Some(vec![9; 12]));
    }

    #[test]
    fn field_data_reads_the_image() {
        let mut module = Module::new("a.exe");
        let mut data = vec![0u8; 0x20];
        data[0x10..0x14].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        module.pe = Some(PeImage::new(
            data,
            vec![SectionHeader {
                name: ".text".to_string(),
                virtual_address: 0x2000,
                virtual_size: 0x20,
                pointer_to_raw_data: 0,
                size_of_raw_data: 0x20,
            }],
            None,
        ));
        let ty = module.add_type(TypeDef::new("", "Holder"));
        let mapped = module
            .add_field(ty, FieldDef::new("data", "Holder/Blob").with_image_rva(0x2010, 4))
            .unwrap();
        let past_end = module
            .add_field(ty, FieldDef::new("tail", "Holder/Blob").with_image_rva(0x201C, 8))
            .unwrap();
        let plain = module.add_field(ty, FieldDef::new("plain", "System.Int32")).unwrap();

        assert!(module.field(mapped).unwrap().initial_value.is_none());
        assert_eq!(module.field_data(mapped).unwrap(), Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert!(module.field_data(past_end).is_err());
        assert_eq!(module.field_data(plain).unwrap(), None);

        // outside every section: the cached bytes are used
        let added = module.add_initialized_data(vec![5; 3]).unwrap();
        assert_eq!(module.field_data(added).unwrap(), Some(vec![5; 3]));
    }

    #[test]
    fn module_cctor_and_modified() {
        let mut module = Module::new("a.exe");
        assert!(module.module_type_cctor().is_none());
        let cctor = module
            .add_method(Token(0x0200_0001), MethodDef::cctor())
            .unwrap();
        assert_eq!(module.module_type_cctor(), Some(cctor));
        module.mark_modified(cctor);
        module.mark_modified(cctor);
        assert_eq!(module.modified_methods(), vec![cctor]);
    }

    #[test]
    fn rebind_follows_names() {
        let (old, outer, inner, method) = sample();

        // same layout: tokens are kept
        let same = old.clone();
        assert_eq!(same.rebind_type(&old, inner).unwrap(), inner);
        assert_eq!(same.rebind_method(&old, method).unwrap(), method);

        // reloaded with an extra type in front: tokens move
        let mut moved = Module::new("a.exe");
        let filler = moved.add_type(TypeDef::new("", "Filler"));
        moved
            .add_method(filler, MethodDef::new("F", MethodSig::new("System.Void", &[])))
            .unwrap();
        let outer2 = moved.add_type(TypeDef::new("NS", "Outer"));
        let inner2 = moved.add_nested_type(outer2, TypeDef::new("", "Inner")).unwrap();
        let method2 = moved
            .add_method(
                inner2,
                MethodDef::new("Run", MethodSig::new("System.Int32", &["System.Byte[]", "System.Int32"])),
            )
            .unwrap();
        assert_eq!(moved.rebind_type(&old, outer).unwrap(), outer2);
        assert_eq!(moved.rebind_method(&old, method).unwrap(), method2);

        // removed: hard failure
        let empty = Module::new("a.exe");
        assert!(matches!(
            empty.rebind_method(&old, method),
            Err(Error::Rebind { what: "method", .. })
        ));
    }
}
