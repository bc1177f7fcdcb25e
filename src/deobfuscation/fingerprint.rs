//! Structural matching primitives shared by the family detectors.
//!
//! Detection never looks at names an obfuscator can randomize. It compares type shapes
//! (field types, local types, method signatures) and code content (integer constants,
//! strings, call targets). This module holds those comparisons:
//!
//! - [`TypeList`] compares an expected list of type names against an actual list in one
//!   of five [`MatchMode`]s
//! - field helpers return a type's field types in declaration or sorted order
//! - code queries inspect a method's instructions
//! - [`scan_signature`] searches raw bytes for a pattern with wildcards, for protectors
//!   that strip the managed side down to native stubs
//!
//! All queries treat a missing method or a method without body as "no match".

use std::collections::BTreeSet;

use crate::{
    assembly::{Instruction, Operand},
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// How a [`TypeList`] compares against actual type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Same names in the same order
    Exact,
    /// Same names, order ignored (duplicates still count)
    ExactUnordered,
    /// The set of distinct actual names equals the expected names
    Distinct,
    /// Every expected name occurs at least once
    All,
    /// At least one expected name occurs
    Any,
}

/// An expected list of type names plus the mode used to compare it.
#[derive(Debug, Clone, Copy)]
pub struct TypeList<'a> {
    mode: MatchMode,
    names: &'a [&'a str],
}

impl<'a> TypeList<'a> {
    /// Compare with `mode`.
    #[must_use]
    pub const fn new(mode: MatchMode, names: &'a [&'a str]) -> Self {
        TypeList { mode, names }
    }

    /// Ordered equality.
    #[must_use]
    pub const fn exact(names: &'a [&'a str]) -> Self {
        Self::new(MatchMode::Exact, names)
    }

    /// Sorted equality.
    #[must_use]
    pub const fn exact_unordered(names: &'a [&'a str]) -> Self {
        Self::new(MatchMode::ExactUnordered, names)
    }

    /// Distinct set equality.
    #[must_use]
    pub const fn distinct(names: &'a [&'a str]) -> Self {
        Self::new(MatchMode::Distinct, names)
    }

    /// Subset check.
    #[must_use]
    pub const fn all(names: &'a [&'a str]) -> Self {
        Self::new(MatchMode::All, names)
    }

    /// Intersection check.
    #[must_use]
    pub const fn any(names: &'a [&'a str]) -> Self {
        Self::new(MatchMode::Any, names)
    }

    /// The expected names.
    #[must_use]
    pub fn names(&self) -> &'a [&'a str] {
        self.names
    }

    /// Compare against `actual`.
    #[must_use]
    pub fn matches<S: AsRef<str>>(&self, actual: &[S]) -> bool {
        let contains = |name: &str| actual.iter().any(|a| a.as_ref() == name);
        match self.mode {
            MatchMode::Exact => {
                actual.len() == self.names.len()
                    && actual.iter().zip(self.names).all(|(a, e)| a.as_ref() == *e)
            }
            MatchMode::ExactUnordered => {
                let mut left: Vec<&str> = actual.iter().map(AsRef::as_ref).collect();
                let mut right: Vec<&str> = self.names.to_vec();
                left.sort_unstable();
                right.sort_unstable();
                left == right
            }
            MatchMode::Distinct => {
                let distinct: BTreeSet<&str> = actual.iter().map(AsRef::as_ref).collect();
                distinct.len() == self.names.len() && self.names.iter().all(|n| contains(n))
            }
            MatchMode::All => self.names.iter().all(|n| contains(n)),
            MatchMode::Any => self.names.iter().any(|n| contains(n)),
        }
    }
}

/// Field type names of `ty` in declaration order.
#[must_use]
pub fn field_types(module: &Module, ty: Token) -> Vec<String> {
    module.type_def(ty).map_or_else(Vec::new, |def| {
        def.fields
            .iter()
            .filter_map(|&f| module.field(f))
            .map(|f| f.field_type.clone())
            .collect()
    })
}

/// Field type names of `ty`, sorted.
#[must_use]
pub fn sorted_field_types(module: &Module, ty: Token) -> Vec<String> {
    let mut types = field_types(module, ty);
    types.sort_unstable();
    types
}

/// Returns true if the fields of `ty` have exactly `expected` types, in order.
#[must_use]
pub fn fields_match_ordered(module: &Module, ty: Token, expected: &[&str]) -> bool {
    TypeList::exact(expected).matches(&field_types(module, ty))
}

/// Returns true if the fields of `ty` have exactly `expected` types, in any order.
#[must_use]
pub fn fields_match_sorted(module: &Module, ty: Token, expected: &[&str]) -> bool {
    TypeList::exact_unordered(expected).matches(&field_types(module, ty))
}

/// The first field of `ty` whose type is `type_name`.
#[must_use]
pub fn find_field(module: &Module, ty: Token, type_name: &str) -> Option<Token> {
    module
        .type_def(ty)?
        .fields
        .iter()
        .copied()
        .find(|&f| module.field(f).is_some_and(|f| f.field_type == type_name))
}

/// Local variable types of `method`, empty without body.
#[must_use]
pub fn local_types(module: &Module, method: Token) -> &[String] {
    module
        .method(method)
        .and_then(|m| m.body.as_ref())
        .map_or(&[], |b| b.locals.as_slice())
}

/// The instructions of `method`, empty without body.
#[must_use]
pub fn instructions(module: &Module, method: Token) -> &[Instruction] {
    module
        .method(method)
        .and_then(|m| m.body.as_ref())
        .map_or(&[], |b| b.instructions.as_slice())
}

/// Returns true if the code of `method` loads the integer `value` with any `ldc.i4` form.
#[must_use]
pub fn has_int(module: &Module, method: Token, value: i32) -> bool {
    instructions(module, method)
        .iter()
        .any(|i| i.ldc_i4_value() == Some(value))
}

/// All strings loaded by `method`, in code order.
#[must_use]
pub fn code_strings(module: &Module, method: Token) -> Vec<String> {
    instructions(module, method)
        .iter()
        .filter_map(|i| module.ldstr_value(i))
        .map(str::to_string)
        .collect()
}

/// Returns true if `method` loads the string `value`.
#[must_use]
pub fn has_string(module: &Module, method: Token, value: &str) -> bool {
    instructions(module, method)
        .iter()
        .any(|i| module.ldstr_value(i) == Some(value))
}

/// Method definitions of this module called by `method`, in first-call order.
#[must_use]
pub fn called_methods(module: &Module, method: Token) -> Vec<Token> {
    let mut seen = BTreeSet::new();
    instructions(module, method)
        .iter()
        .filter(|i| i.is_call())
        .filter_map(Instruction::token_operand)
        .filter(|t| module.method(*t).is_some() && seen.insert(*t))
        .collect()
}

/// Number of calls in `method` whose target has the full name `full_name`.
#[must_use]
pub fn count_calls(module: &Module, method: Token, full_name: &str) -> usize {
    instructions(module, method)
        .iter()
        .filter(|i| i.is_call())
        .filter_map(Instruction::token_operand)
        .filter(|&t| module.method_full_name(t).as_deref() == Some(full_name))
        .count()
}

/// Returns true if `method` calls a method with the full name `full_name`.
#[must_use]
pub fn calls_method(module: &Module, method: Token, full_name: &str) -> bool {
    count_calls(module, method, full_name) > 0
}

/// Returns true if `method` contains an instruction with this mnemonic.
#[must_use]
pub fn has_opcode(module: &Module, method: Token, mnemonic: &str) -> bool {
    instructions(module, method)
        .iter()
        .any(|i| i.mnemonic == mnemonic)
}

/// Methods of `ty` with the given return and parameter types, in declaration order.
#[must_use]
pub fn find_methods(module: &Module, ty: Token, return_type: &str, params: &[&str]) -> Vec<Token> {
    module.type_def(ty).map_or_else(Vec::new, |def| {
        def.methods
            .iter()
            .copied()
            .filter(|&m| module.method(m).is_some_and(|m| m.is_method(return_type, params)))
            .collect()
    })
}

/// The first method of `ty` with the given return and parameter types.
#[must_use]
pub fn find_method(module: &Module, ty: Token, return_type: &str, params: &[&str]) -> Option<Token> {
    find_methods(module, ty, return_type, params).into_iter().next()
}

/// Like [`find_method`], but the method must also be static.
#[must_use]
pub fn find_static_method(
    module: &Module,
    ty: Token,
    return_type: &str,
    params: &[&str],
) -> Option<Token> {
    find_methods(module, ty, return_type, params)
        .into_iter()
        .find(|&m| module.method(m).is_some_and(|m| m.is_static()))
}

/// The `AssemblyResolve` handler that `init` installs through
/// `ldftn handler; newobj System.ResolveEventHandler::.ctor`.
#[must_use]
pub fn get_resolve_method(module: &Module, init: Token) -> Option<Token> {
    instructions(module, init).windows(2).find_map(|pair| {
        let handler = match (pair[0].prefix, pair[0].opcode, &pair[0].operand) {
            (0xFE, 0x06, Operand::Token(token)) => *token,
            _ => return None,
        };
        let ctor = pair[1].token_operand().filter(|_| pair[1].is(0x73))?;
        let name = module.method_full_name(ctor)?;
        (name.contains("System.ResolveEventHandler::.ctor") && module.method(handler).is_some())
            .then_some(handler)
    })
}

/// Pinvoke methods of `ty` importing `entry_point`.
#[must_use]
pub fn get_pinvoke_methods(module: &Module, ty: Token, entry_point: &str) -> Vec<Token> {
    module.type_def(ty).map_or_else(Vec::new, |def| {
        def.methods
            .iter()
            .copied()
            .filter(|&m| {
                module
                    .method(m)
                    .and_then(|m| m.pinvoke.as_ref())
                    .is_some_and(|p| p.entry_point == entry_point)
            })
            .collect()
    })
}

/// Returns true if any pinvoke method of the module imports `entry_point` from a dll
/// named `dll` (compared case-insensitively, with or without `.dll`).
#[must_use]
pub fn has_pinvoke(module: &Module, dll: &str, entry_point: &str) -> bool {
    let wanted = dll.trim_end_matches(".dll");
    module.methods().into_iter().any(|m| {
        module
            .method(m)
            .and_then(|m| m.pinvoke.as_ref())
            .is_some_and(|p| {
                p.entry_point == entry_point
                    && p.module
                        .trim_end_matches(".dll")
                        .eq_ignore_ascii_case(wanted)
            })
    })
}

/// Parse a byte pattern such as `"8B 45 ?? 0C"`; `??` is a wildcard.
///
/// # Errors
/// Returns [`crate::Error::Error`] if a token is neither two hex digits nor `??`.
pub fn parse_signature(pattern: &str) -> Result<Vec<Option<u8>>> {
    pattern
        .split_whitespace()
        .map(|token| {
            if token == "??" || token == "?" {
                Ok(None)
            } else {
                u8::from_str_radix(token, 16)
                    .map(Some)
                    .map_err(|_| Error::Error(format!("Invalid signature byte '{token}'")))
            }
        })
        .collect()
}

/// Offset of the first occurrence of `pattern` in `data`.
#[must_use]
pub fn scan_signature(data: &[u8], pattern: &[Option<u8>]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > data.len() {
        return None;
    }
    data.windows(pattern.len()).position(|window| {
        window
            .iter()
            .zip(pattern)
            .all(|(byte, expected)| expected.map_or(true, |e| e == *byte))
    })
}
