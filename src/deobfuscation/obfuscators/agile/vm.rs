//! Shape of a CliSecure VM opcode handler class.
//!
//! Each virtualized opcode is a class with a virtual `Read(BinaryReader)` that decodes
//! the operand and a virtual one-parameter `Execute` that runs it. Handlers are told
//! apart by counts: methods by kind, `throw`s and calls to the VM stack's pop method in
//! `Execute`, and the fields the code actually uses.

use std::collections::BTreeSet;

use crate::{
    deobfuscation::fingerprint,
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// Counts describing one handler class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsVmHandler {
    /// Handler class
    pub handler_type: Token,
    /// Virtual `Void(BinaryReader)`
    pub read_method: Token,
    /// Virtual one-parameter `Void` method
    pub execute_method: Token,
    /// Instance constructors
    pub ctors: usize,
    /// Static methods, the `.cctor` excluded
    pub static_methods: usize,
    /// Virtual methods
    pub virtual_methods: usize,
    /// Non-virtual instance methods
    pub instance_methods: usize,
    /// `throw` instructions in the execute method
    pub execute_throws: usize,
    /// Calls to the pop method in the execute method
    pub execute_pops: usize,
    /// Fields of the class referenced by any of its methods
    pub fields: BTreeSet<Token>,
}

impl CsVmHandler {
    /// Inspect `ty`. `pop_method` is the VM stack's pop; calls to any method of the same
    /// declaring type and name count as pops.
    ///
    /// # Errors
    /// Returns [`crate::Error::Invariant`] when the read or execute method is missing or
    /// found twice.
    pub fn new(module: &Module, ty: Token, pop_method: Token) -> Result<Self> {
        let def = module.type_def(ty).ok_or(Error::TypeNotFound(ty))?;

        let (mut ctors, mut static_methods, mut virtual_methods, mut instance_methods) = (0, 0, 0, 0);
        let mut read_method = None;
        let mut execute_method = None;
        for &m in &def.methods {
            let Some(method) = module.method(m) else {
                continue;
            };
            if method.is_cctor() {
                continue;
            } else if method.is_ctor() {
                ctors += 1;
            } else if method.is_static() {
                static_methods += 1;
            } else if method.is_virtual() {
                virtual_methods += 1;
            } else {
                instance_methods += 1;
            }

            if !method.is_virtual() {
                continue;
            }
            if method.is_method("System.Void", &["System.IO.BinaryReader"]) {
                if read_method.replace(m).is_some() {
                    return Err(Error::Invariant("Found another read method".to_string()));
                }
            } else if !method.signature.returns_value() && method.signature.params.len() == 1 {
                if execute_method.replace(m).is_some() {
                    return Err(Error::Invariant("Found another execute method".to_string()));
                }
            }
        }
        let read_method = read_method.ok_or_else(|| Error::Invariant("Could not find read method".to_string()))?;
        let execute_method =
            execute_method.ok_or_else(|| Error::Invariant("Could not find execute method".to_string()))?;

        let code = fingerprint::instructions(module, execute_method);
        let pop = pop_key(module, pop_method);
        Ok(CsVmHandler {
            handler_type: ty,
            read_method,
            execute_method,
            ctors,
            static_methods,
            virtual_methods,
            instance_methods,
            execute_throws: code.iter().filter(|i| i.is(0x7A)).count(),
            execute_pops: code
                .iter()
                .filter(|i| i.is_call())
                .filter_map(|i| i.token_operand())
                .filter(|&target| pop.is_some() && pop_key(module, target) == pop)
                .count(),
            fields: used_fields(module, ty),
        })
    }

    /// Returns true if `field_types` (in any order) are the types of the used fields.
    #[must_use]
    pub fn has_same_field_types(&self, module: &Module, field_types: &[&str]) -> bool {
        let mut actual: Vec<&str> = self
            .fields
            .iter()
            .filter_map(|&f| module.field(f).map(|f| f.field_type.as_str()))
            .collect();
        let mut expected = field_types.to_vec();
        actual.sort_unstable();
        expected.sort_unstable();
        actual == expected
    }
}

/// Declaring type and name, so that a `MemberRef` and the `MethodDef` it points at
/// compare equal.
fn pop_key(module: &Module, method: Token) -> Option<String> {
    let full = module.method_full_name(method)?;
    let (_, member) = full.split_once(' ')?;
    Some(member.split('(').next().unwrap_or(member).to_string())
}

fn used_fields(module: &Module, ty: Token) -> BTreeSet<Token> {
    let Some(def) = module.type_def(ty) else {
        return BTreeSet::new();
    };
    def.methods
        .iter()
        .flat_map(|&m| fingerprint::instructions(module, m))
        .filter_map(|i| i.token_operand())
        .filter(|token| def.fields.contains(token))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        builder::BodyBuilder,
        field::FieldDef,
        method::{MethodAttributes, MethodDef, MethodSig},
        typesystem::TypeDef,
    };

    const VIRTUAL: MethodAttributes = MethodAttributes::PUBLIC.union(MethodAttributes::VIRTUAL);

    fn handler(extra_read: bool) -> (Module, Token, Token, Token) {
        let mut module = Module::new("a.exe");
        let stack = module.add_type(TypeDef::new("", "VmStack"));
        let pop = module
            .add_method(stack, MethodDef::new("Pop", MethodSig::instance("System.Object", &[])))
            .unwrap();

        let ty = module.add_type(TypeDef::new("", "Handler"));
        let value = module.add_field(ty, FieldDef::new("value", "System.Int32")).unwrap();
        module.add_field(ty, FieldDef::new("unused", "System.String")).unwrap();
        module.add_method(ty, MethodDef::ctor(&[])).unwrap();
        let reads = if extra_read { 2 } else { 1 };
        for _ in 0..reads {
            module
                .add_method(
                    ty,
                    MethodDef::new("Read", MethodSig::instance("System.Void", &["System.IO.BinaryReader"]))
                        .with_flags(VIRTUAL)
                        .with_body(
                            BodyBuilder::new()
                                .op("ldarg.0")
                                .ldc_i4(1)
                                .op_token("stfld", value)
                                .ret()
                                .build()
                                .unwrap(),
                        ),
                )
                .unwrap();
        }
        let execute = module
            .add_method(
                ty,
                MethodDef::new("Execute", MethodSig::instance("System.Void", &["System.Object"]))
                    .with_flags(VIRTUAL)
                    .with_body(
                        BodyBuilder::new()
                            .op("ldarg.1")
                            .call(pop)
                            .op("pop")
                            .op("ldarg.1")
                            .call(pop)
                            .op("pop")
                            .op("ldnull")
                            .op("throw")
                            .build()
                            .unwrap(),
                    ),
            )
            .unwrap();
        (module, ty, pop, execute)
    }

    #[test]
    fn counts() {
        let (module, ty, pop, execute) = handler(false);
        let info = CsVmHandler::new(&module, ty, pop).unwrap();
        assert_eq!(info.execute_method, execute);
        assert_eq!((info.ctors, info.static_methods, info.virtual_methods, info.instance_methods), (1, 0, 2, 0));
        assert_eq!(info.execute_throws, 1);
        assert_eq!(info.execute_pops, 2);
        assert_eq!(info.fields.len(), 1);
        assert!(info.has_same_field_types(&module, &["System.Int32"]));
        assert!(!info.has_same_field_types(&module, &["System.Int32", "System.String"]));
    }

    #[test]
    fn second_read_method() {
        let (module, ty, pop, _) = handler(true);
        assert!(matches!(CsVmHandler::new(&module, ty, pop), Err(Error::Invariant(_))));
    }

    #[test]
    fn missing_execute_method() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "Handler"));
        module
            .add_method(
                ty,
                MethodDef::new("Read", MethodSig::instance("System.Void", &["System.IO.BinaryReader"]))
                    .with_flags(VIRTUAL),
            )
            .unwrap();
        let pop = module.add_member_ref("VmStack", "Pop", MethodSig::instance("System.Object", &[]));
        assert!(matches!(CsVmHandler::new(&module, ty, pop), Err(Error::Invariant(_))));
    }
}
