//! Eazfuscator.NET version detection.
//!
//! Each release range left a recognizable string decrypter: the number of helper methods
//! and nested types, the decrypter's flags, stack size, handlers and locals, and the
//! field layout of its class. The buckets are checked in release order and the first
//! match wins. The observed shapes are reproduced as they are, there is no rule behind
//! them.

use std::ops::RangeInclusive;

use crate::{
    deobfuscation::fingerprint::{self, TypeList},
    metadata::{
        module::{FrameworkType, Module},
        token::Token,
        typesystem::TypeDef,
    },
};

const DICT: &str = "System.Collections.Generic.Dictionary`2<System.Int32,System.String>";
const INT_ENUMERATOR: &str = "System.Collections.Generic.IEnumerator`1<System.Int32>";
const HELPER_PARAMS: &[&str] = &["System.Byte[]", "System.Int32", "System.Byte[]"];

/// Locals the compact framework versions never declare.
const CF_MISSING_LOCALS: &[&str] = &["System.Diagnostics.StackFrame", "System.Diagnostics.StackTrace"];

/// A type name in a bucket, some resolved against the decrypter class.
#[derive(Debug, Clone, Copy)]
enum Name {
    Ty(&'static str),
    /// The first nested type in declaration order
    FirstNested,
    /// Nested type with exactly one nested type of its own
    NestedWithChild,
    /// Non-enum nested type without nested types
    NestedPlain,
    /// Nested enum
    NestedEnum,
    /// `IEnumerator<Int32>`-like generic local other than the BCL one
    Enumerator,
}

use Name::{Enumerator, FirstNested, NestedEnum, NestedPlain, NestedWithChild, Ty};

#[derive(Debug, Clone, Copy)]
enum Access {
    Public,
    Assembly,
}

#[derive(Debug, Clone, Copy)]
enum Handlers {
    Exactly(usize),
    OneOrTwo,
    AtLeastTwo,
}

impl Handlers {
    fn accepts(self, count: usize) -> bool {
        match self {
            Handlers::Exactly(n) => count == n,
            Handlers::OneOrTwo => count == 1 || count == 2,
            Handlers::AtLeastTwo => count >= 2,
        }
    }
}

struct Bucket {
    version: &'static str,
    nested: usize,
    /// Return type of the single private static `(Byte[], Int32, Byte[])` helper, or
    /// `None` when the class has no other methods
    helper: Option<&'static str>,
    constant_m2: Option<bool>,
    no_inlining: bool,
    access: Access,
    synchronized: bool,
    max_stack: RangeInclusive<u16>,
    handlers: Handlers,
    locals: &'static [Name],
    /// Locals must all be present rather than match exactly
    locals_subset: bool,
    fields: &'static [Name],
    /// Fields compare sorted rather than in declaration order
    fields_sorted: bool,
}

const FIELDS_11: &[Name] = &[
    Ty(DICT),
    Ty("System.IO.BinaryReader"),
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Boolean"),
];
const FIELDS_13: &[Name] = &[
    Ty(DICT),
    Ty("System.IO.BinaryReader"),
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Boolean"),
    Ty("System.Byte[]"),
];
const FIELDS_28: &[Name] = &[
    Ty(DICT),
    Ty("System.IO.BinaryReader"),
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Boolean"),
    Ty("System.Byte[]"),
    Ty("System.Boolean"),
];
const FIELDS_29: &[Name] = &[
    Ty(DICT),
    Ty("System.IO.BinaryReader"),
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Byte[]"),
];
const FIELDS_32: &[Name] = &[
    Ty(DICT),
    Ty("System.IO.BinaryReader"),
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Byte[]"),
    Ty("System.Int32"),
];
const FIELDS_33_BETA: &[Name] = &[
    Ty(DICT),
    Ty("System.IO.BinaryReader"),
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Byte[]"),
    Ty("System.Int32"),
    Ty("System.Int32"),
    FirstNested,
];
const FIELDS_33: &[Name] = &[
    NestedWithChild,
    NestedPlain,
    Ty("System.Byte[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Byte[]"),
    Ty("System.Int32"),
    Ty("System.Int32"),
    NestedEnum,
];

const LOCALS_11: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Reflection.Assembly"),
    Ty("System.String"),
];
const LOCALS_13: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Reflection.Assembly"),
    Ty("System.String"),
];
const LOCALS_24: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.String"),
];
const LOCALS_26: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty(DICT),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.String"),
];
const LOCALS_29: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty(DICT),
    Ty("System.Diagnostics.StackFrame"),
    Ty("System.Diagnostics.StackTrace"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.IO.Stream"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.Reflection.MethodBase"),
    Ty("System.String"),
    Ty("System.Type"),
];
const LOCALS_32: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty(DICT),
    Ty("System.Diagnostics.StackFrame"),
    Ty("System.Diagnostics.StackTrace"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Int64"),
    Ty("System.IO.Stream"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.Reflection.MethodBase"),
    Ty("System.String"),
    Ty("System.Type"),
];
const LOCALS_33: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    NestedWithChild,
    Ty("System.Diagnostics.StackFrame"),
    Ty("System.Diagnostics.StackTrace"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Int64"),
    Ty("System.IO.Stream"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.Reflection.MethodBase"),
    Ty("System.String"),
    Ty("System.Type"),
];
const LOCALS_33_149: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    NestedWithChild,
    Ty("System.Diagnostics.StackFrame"),
    Ty("System.Diagnostics.StackTrace"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Int64"),
    Ty("System.IO.Stream"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.Reflection.MethodBase"),
    Ty("System.String"),
    Ty("System.Text.StringBuilder"),
    Ty("System.Type"),
];
const LOCALS_35: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Ty(INT_ENUMERATOR),
    NestedWithChild,
    Ty("System.Diagnostics.StackFrame"),
    Ty("System.Diagnostics.StackTrace"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Int64"),
    Ty("System.IO.Stream"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.Reflection.MethodBase"),
    Ty("System.String"),
    Ty("System.Text.StringBuilder"),
    Ty("System.Type"),
];
const LOCALS_43: &[Name] = &[
    Ty("System.Boolean"),
    Ty("System.Byte"),
    Ty("System.Byte[]"),
    Ty("System.Char[]"),
    Enumerator,
    NestedWithChild,
    Ty("System.Diagnostics.StackFrame"),
    Ty("System.Diagnostics.StackTrace"),
    Ty("System.Int16"),
    Ty("System.Int32"),
    Ty("System.Int64"),
    Ty("System.IO.Stream"),
    Ty("System.Reflection.Assembly"),
    Ty("System.Reflection.AssemblyName"),
    Ty("System.Reflection.MethodBase"),
    Ty("System.String"),
    Ty("System.Text.StringBuilder"),
    Ty("System.Type"),
];
const LOCALS_50: &[Name] = &[Ty("System.String"), Ty("System.String")];

const BUCKETS: &[Bucket] = &[
    Bucket {
        version: "1.1 - 1.2",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: false,
        access: Access::Public,
        synchronized: true,
        max_stack: 35..=50,
        handlers: Handlers::Exactly(0),
        locals: LOCALS_11,
        locals_subset: false,
        fields: FIELDS_11,
        fields_sorted: false,
    },
    Bucket {
        version: "1.3",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: false,
        access: Access::Public,
        synchronized: true,
        max_stack: 35..=50,
        handlers: Handlers::Exactly(0),
        locals: LOCALS_13,
        locals_subset: false,
        fields: FIELDS_13,
        fields_sorted: false,
    },
    Bucket {
        version: "1.4 - 2.3",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: false,
        access: Access::Public,
        synchronized: true,
        max_stack: 150..=200,
        handlers: Handlers::Exactly(0),
        locals: LOCALS_13,
        locals_subset: false,
        fields: FIELDS_13,
        fields_sorted: false,
    },
    Bucket {
        version: "2.4 - 2.5",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: false,
        access: Access::Public,
        synchronized: true,
        max_stack: 1..=8,
        handlers: Handlers::Exactly(0),
        locals: LOCALS_24,
        locals_subset: false,
        fields: FIELDS_13,
        fields_sorted: false,
    },
    Bucket {
        version: "2.6",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: false,
        access: Access::Public,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::Exactly(1),
        locals: LOCALS_26,
        locals_subset: false,
        fields: FIELDS_13,
        fields_sorted: false,
    },
    Bucket {
        version: "2.7",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: true,
        access: Access::Public,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::Exactly(1),
        locals: LOCALS_26,
        locals_subset: false,
        fields: FIELDS_13,
        fields_sorted: false,
    },
    Bucket {
        version: "2.8",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::Exactly(1),
        locals: LOCALS_26,
        locals_subset: false,
        fields: FIELDS_28,
        fields_sorted: false,
    },
    Bucket {
        version: "2.9",
        nested: 0,
        helper: None,
        constant_m2: Some(false),
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_29,
        locals_subset: false,
        fields: FIELDS_29,
        fields_sorted: false,
    },
    Bucket {
        version: "3.0",
        nested: 0,
        helper: Some("System.Int32"),
        constant_m2: Some(false),
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_29,
        locals_subset: false,
        fields: FIELDS_29,
        fields_sorted: false,
    },
    Bucket {
        version: "3.1",
        nested: 0,
        helper: Some("System.Int32"),
        constant_m2: Some(true),
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_29,
        locals_subset: false,
        fields: FIELDS_29,
        fields_sorted: false,
    },
    Bucket {
        version: "3.2",
        nested: 0,
        helper: Some("System.Void"),
        constant_m2: Some(true),
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_32,
        locals_subset: false,
        fields: FIELDS_32,
        fields_sorted: false,
    },
    Bucket {
        version: "3.3.29 - 3.3.57 (BETA)",
        nested: 1,
        helper: Some("System.Void"),
        constant_m2: Some(true),
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_32,
        locals_subset: false,
        fields: FIELDS_33_BETA,
        fields_sorted: false,
    },
    Bucket {
        version: "3.3",
        nested: 3,
        helper: Some("System.Void"),
        constant_m2: None,
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_33,
        locals_subset: false,
        fields: FIELDS_33,
        fields_sorted: false,
    },
    Bucket {
        version: "3.3.149 - 3.4",
        nested: 3,
        helper: Some("System.Void"),
        constant_m2: None,
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::OneOrTwo,
        locals: LOCALS_33_149,
        locals_subset: false,
        fields: FIELDS_33,
        fields_sorted: true,
    },
    Bucket {
        version: "3.5 - 4.2",
        nested: 3,
        helper: Some("System.Void"),
        constant_m2: None,
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::AtLeastTwo,
        locals: LOCALS_35,
        locals_subset: true,
        fields: FIELDS_33,
        fields_sorted: true,
    },
    Bucket {
        version: "4.3 - 4.9",
        nested: 3,
        helper: Some("System.Void"),
        constant_m2: None,
        no_inlining: true,
        access: Access::Assembly,
        synchronized: false,
        max_stack: 1..=8,
        handlers: Handlers::AtLeastTwo,
        locals: LOCALS_43,
        locals_subset: true,
        fields: FIELDS_33,
        fields_sorted: true,
    },
];

/// Everything the buckets look at, gathered once.
struct Shape<'m> {
    module: &'m Module,
    ty: Token,
    decrypter: Token,
    real_method: Option<Token>,
    other_methods: Vec<Token>,
    nested: Vec<Token>,
    constant_m2: bool,
}

impl Shape<'_> {
    fn resolve(&self, name: Name, method: Token) -> Option<String> {
        let nested_where = |pred: &dyn Fn(&TypeDef) -> bool| {
            self.nested
                .iter()
                .copied()
                .find(|&t| self.module.type_def(t).is_some_and(pred))
                .and_then(|t| self.module.type_name(t))
        };
        match name {
            Ty(s) => Some(s.to_string()),
            FirstNested => self.nested.first().and_then(|&t| self.module.type_name(t)),
            NestedWithChild => nested_where(&|def| def.nested_types.len() == 1),
            NestedPlain => nested_where(&|def| !def.is_enum() && def.nested_types.is_empty()),
            NestedEnum => nested_where(&|def| def.is_enum()),
            Enumerator => enumerator_name(self.module, method),
        }
    }

    /// Resolve `names`, dropping the locals the compact framework lacks.
    fn resolve_all(&self, names: &[Name], method: Token, locals: bool) -> Option<Vec<String>> {
        let compact = self.module.framework == FrameworkType::CompactFramework;
        let mut resolved = Vec::with_capacity(names.len());
        for &name in names {
            let name = self.resolve(name, method)?;
            if locals && compact && CF_MISSING_LOCALS.contains(&name.as_str()) {
                continue;
            }
            resolved.push(name);
        }
        Some(resolved)
    }

    fn fields_match(&self, names: &[Name], sorted: bool) -> bool {
        let Some(expected) = self.resolve_all(names, self.decrypter, false) else {
            return false;
        };
        let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
        let actual = fingerprint::field_types(self.module, self.ty);
        if sorted {
            TypeList::exact_unordered(&expected).matches(&actual)
        } else {
            TypeList::exact(&expected).matches(&actual)
        }
    }

    fn locals_match(&self, method: Token, names: &[Name], subset: bool) -> bool {
        let Some(expected) = self.resolve_all(names, method, true) else {
            return false;
        };
        let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
        let actual = fingerprint::local_types(self.module, method);
        if subset {
            TypeList::all(&expected).matches(actual)
        } else {
            TypeList::distinct(&expected).matches(actual)
        }
    }

    /// The decrypter's flags, stack and handlers.
    fn method_matches(
        &self,
        method: Token,
        no_inlining: bool,
        access: Access,
        synchronized: bool,
        max_stack: &RangeInclusive<u16>,
        handlers: Handlers,
    ) -> bool {
        let Some(def) = self.module.method(method) else {
            return false;
        };
        let Some(body) = def.body.as_ref() else {
            return false;
        };
        let access_ok = match access {
            Access::Public => def.is_public(),
            Access::Assembly => def.is_assembly(),
        };
        def.is_no_inlining() == no_inlining
            && access_ok
            && def.is_synchronized() == synchronized
            && max_stack.contains(&body.max_stack)
            && handlers.accepts(body.exception_handlers.len())
    }

    /// The private static `(Byte[], Int32, Byte[])` helper with a single `Int32` local.
    fn helper_matches(&self, return_type: &str) -> bool {
        let [helper] = self.other_methods.as_slice() else {
            return false;
        };
        self.module.method(*helper).is_some_and(|def| {
            def.is_method(return_type, HELPER_PARAMS) && def.is_private() && def.is_static()
        }) && TypeList::distinct(&["System.Int32"])
            .matches(fingerprint::local_types(self.module, *helper))
    }

    fn bucket_matches(&self, bucket: &Bucket) -> bool {
        let helper_ok = match bucket.helper {
            None => self.other_methods.is_empty(),
            Some(ret) => self.helper_matches(ret),
        };
        helper_ok
            && self.nested.len() == bucket.nested
            && bucket.constant_m2.is_none_or(|m2| m2 == self.constant_m2)
            && self.method_matches(
                self.decrypter,
                bucket.no_inlining,
                bucket.access,
                bucket.synchronized,
                &bucket.max_stack,
                bucket.handlers,
            )
            && self.locals_match(self.decrypter, bucket.locals, bucket.locals_subset)
            && self.fields_match(bucket.fields, bucket.fields_sorted)
    }

    /// 5.x moved the work into a real method behind the decrypter stub.
    fn v5(&self) -> Option<&'static str> {
        let real = self.real_method?;
        if self.nested.len() != 3 {
            return None;
        }
        let helper = self.other_methods.iter().copied().find(|&m| {
            self.module
                .method(m)
                .is_some_and(|def| def.is_method("System.Void", HELPER_PARAMS))
        })?;
        if !self
            .module
            .method(helper)
            .is_some_and(|def| def.is_private() && def.is_static())
        {
            return None;
        }
        if !self.method_matches(real, true, Access::Assembly, false, &(1..=8), Handlers::Exactly(1)) {
            return None;
        }
        match self.other_methods.len() {
            2 if self.locals_match(real, LOCALS_50, true) && self.fields_match(FIELDS_33, true) => {
                if fingerprint::has_opcode(self.module, self.decrypter, "cgt.un") {
                    Some("5.1")
                } else {
                    Some("5.0")
                }
            }
            5 => Some("5.2-5.8"),
            _ => None,
        }
    }
}

/// Version range of the Eazfuscator.NET release that produced the decrypter, or `None`
/// when no bucket matches. The class must have a `.cctor`.
#[must_use]
pub fn detect_version(
    module: &Module,
    decrypter: Token,
    real_method: Option<Token>,
) -> Option<&'static str> {
    let ty = module.method(decrypter)?.declaring_type;
    let def = module.type_def(ty)?;
    let mut cctor = None;
    let mut other_methods = Vec::new();
    for &m in &def.methods {
        if m == decrypter {
            continue;
        }
        match module.method(m) {
            Some(method) if method.is_cctor() => cctor = Some(m),
            Some(_) => other_methods.push(m),
            None => {}
        }
    }
    cctor?;

    let shape = Shape {
        module,
        ty,
        decrypter,
        real_method,
        other_methods,
        nested: def.nested_types.clone(),
        constant_m2: fingerprint::has_int(module, decrypter, -2),
    };
    BUCKETS
        .iter()
        .find(|bucket| shape.bucket_matches(bucket))
        .map(|bucket| bucket.version)
        .or_else(|| shape.v5())
}

/// A generic `…<System.Int32>` local that is not the BCL `IEnumerator<Int32>`.
fn enumerator_name(module: &Module, method: Token) -> Option<String> {
    fingerprint::local_types(module, method)
        .iter()
        .find(|local| {
            local.as_str() != INT_ENUMERATOR
                && local.ends_with("`1<System.Int32>")
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        body::HandlerKind,
        builder::BodyBuilder,
        field::FieldDef,
        method::{MethodAttributes, MethodDef, MethodImplAttributes, MethodSig},
    };

    fn names(list: &[Name]) -> Vec<&'static str> {
        list.iter()
            .map(|n| match n {
                Ty(s) => *s,
                _ => panic!("static names only"),
            })
            .collect()
    }

    fn decrypter_class(
        module: &mut Module,
        fields: &[&str],
        locals: &[&str],
        flags: MethodAttributes,
        impl_flags: MethodImplAttributes,
        max_stack: u16,
        handlers: usize,
    ) -> (Token, Token) {
        let ty = module.add_type(TypeDef::new("", "Strings"));
        for (i, field) in fields.iter().enumerate() {
            module.add_field(ty, FieldDef::new(&format!("f{i}"), field)).unwrap();
        }
        module
            .add_method(ty, MethodDef::cctor().with_body(BodyBuilder::new().ret().build().unwrap()))
            .unwrap();
        let mut body = BodyBuilder::new();
        body.locals(locals).max_stack(max_stack);
        for _ in 0..handlers {
            let labels = [body.label(), body.label(), body.label(), body.label()];
            body.mark(labels[0]).op("nop").mark(labels[1]).mark(labels[2]).op("nop").mark(labels[3]);
            body.handler(HandlerKind::Finally, labels, None);
        }
        body.op("ldnull").ret();
        let decrypter = module
            .add_method(
                ty,
                MethodDef::new("d", MethodSig::new("System.String", &["System.Int32"]))
                    .with_flags(flags | MethodAttributes::STATIC)
                    .with_impl_flags(impl_flags)
                    .with_body(body.build().unwrap()),
            )
            .unwrap();
        (ty, decrypter)
    }

    #[test]
    fn early_release() {
        let mut module = Module::new("a.exe");
        let (_, d) = decrypter_class(
            &mut module,
            &names(FIELDS_11),
            &names(LOCALS_11),
            MethodAttributes::PUBLIC,
            MethodImplAttributes::SYNCHRONIZED,
            40,
            0,
        );
        assert_eq!(detect_version(&module, d, None), Some("1.1 - 1.2"));
    }

    #[test]
    fn stack_size_separates_releases() {
        let mut module = Module::new("a.exe");
        let (_, d) = decrypter_class(
            &mut module,
            &names(FIELDS_13),
            &names(LOCALS_13),
            MethodAttributes::PUBLIC,
            MethodImplAttributes::SYNCHRONIZED,
            160,
            0,
        );
        assert_eq!(detect_version(&module, d, None), Some("1.4 - 2.3"));
    }

    #[test]
    fn compact_framework_drops_stack_locals() {
        let cf_locals: Vec<&str> = names(LOCALS_29)
            .into_iter()
            .filter(|l| !CF_MISSING_LOCALS.contains(l))
            .collect();

        let mut module = Module::new("a.exe");
        module.framework = FrameworkType::CompactFramework;
        let (_, d) = decrypter_class(
            &mut module,
            &names(FIELDS_29),
            &cf_locals,
            MethodAttributes::ASSEMBLY,
            MethodImplAttributes::NO_INLINING,
            8,
            1,
        );
        assert_eq!(detect_version(&module, d, None), Some("2.9"));

        module.framework = FrameworkType::Desktop;
        assert_eq!(detect_version(&module, d, None), None);
    }

    #[test]
    fn nested_type_names_resolve() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "Strings"));
        let with_child = module.add_nested_type(ty, TypeDef::new("", "A")).unwrap();
        module.add_nested_type(with_child, TypeDef::new("", "Inner")).unwrap();
        module.add_nested_type(ty, TypeDef::new("", "B")).unwrap();
        module
            .add_nested_type(ty, TypeDef::new("", "E").with_base("System.Enum"))
            .unwrap();
        // Sorted comparison: declaration order does not matter.
        for field in ["System.Int32", "Strings/E", "System.Byte[]", "Strings/A", "System.Int16"] {
            module.add_field(ty, FieldDef::new("f", field)).unwrap();
        }
        for field in ["System.Int32", "System.Byte[]", "Strings/B", "System.Int32"] {
            module.add_field(ty, FieldDef::new("g", field)).unwrap();
        }
        module
            .add_method(ty, MethodDef::cctor().with_body(BodyBuilder::new().ret().build().unwrap()))
            .unwrap();
        module
            .add_method(
                ty,
                MethodDef::new("h", MethodSig::new("System.Void", HELPER_PARAMS))
                    .with_body(BodyBuilder::new().locals(&["System.Int32"]).ret().build().unwrap()),
            )
            .unwrap();

        let mut locals: Vec<&str> = names(&LOCALS_33_149[..4]);
        locals.push("Strings/A");
        locals.extend(names(&LOCALS_33_149[5..]));
        let mut body = BodyBuilder::new();
        body.locals(&locals);
        let labels = [body.label(), body.label(), body.label(), body.label()];
        body.mark(labels[0]).op("nop").mark(labels[1]).mark(labels[2]).op("nop").mark(labels[3]);
        body.handler(HandlerKind::Finally, labels, None).op("ldnull").ret();
        let d = module
            .add_method(
                ty,
                MethodDef::new("d", MethodSig::new("System.String", &["System.Int32"]))
                    .with_flags(MethodAttributes::ASSEMBLY | MethodAttributes::STATIC)
                    .with_impl_flags(MethodImplAttributes::NO_INLINING)
                    .with_body(body.build().unwrap()),
            )
            .unwrap();

        assert_eq!(detect_version(&module, d, None), Some("3.3.149 - 3.4"));
    }

    #[test]
    fn no_cctor_is_unknown() {
        let mut module = Module::new("a.exe");
        let ty = module.add_type(TypeDef::new("", "Strings"));
        let d = module
            .add_method(
                ty,
                MethodDef::new("d", MethodSig::new("System.String", &["System.Int32"]))
                    .with_body(BodyBuilder::new().op("ldnull").ret().build().unwrap()),
            )
            .unwrap();
        assert_eq!(detect_version(&module, d, None), None);
    }
}
