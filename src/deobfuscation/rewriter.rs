//! Windowed instruction rewriting.
//!
//! A [`CallSiteWindow`] is a contiguous run of instructions inside one basic block that
//! forms a single obfuscated call sequence, together with the instructions that replace
//! it. Rewriting is split into two steps so that positions stay valid:
//!
//! 1. [`collect_windows`] walks every block once and asks a matcher for windows. Matches
//!    never overlap; scanning resumes after the end of the last accepted window.
//! 2. [`apply_windows`] checks the windows against the body (inside one block, no
//!    overlap, same net stack effect as the replacement) and applies them from the last
//!    one backwards, so earlier windows keep their recorded indices.
//!
//! The stack check is what keeps a rewritten body verifiable: a window that pushed one
//! value must be replaced by instructions that push one value.

use std::ops::Range;

use crate::{
    assembly::Instruction,
    deobfuscation::{codecs::primitive_size, fingerprint},
    metadata::{method::MethodSig, module::Module, token::Token},
    Error, Result,
};

/// Declaring type of `InitializeArray`.
pub const RUNTIME_HELPERS: &str = "System.Runtime.CompilerServices.RuntimeHelpers";

/// One matched call sequence and its replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSiteWindow {
    /// Index of the first matched instruction
    pub start: usize,
    /// Number of matched instructions
    pub len: usize,
    /// Instructions inserted in place of the window
    pub replacement: Vec<Instruction>,
}

impl CallSiteWindow {
    /// Create a window.
    #[must_use]
    pub fn new(start: usize, len: usize, replacement: Vec<Instruction>) -> Self {
        CallSiteWindow {
            start,
            len,
            replacement,
        }
    }

    /// A window whose instructions are dropped without replacement.
    #[must_use]
    pub fn removal(start: usize, len: usize) -> Self {
        Self::new(start, len, Vec::new())
    }

    /// One past the last matched instruction.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// The matched index range.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Scan every block of `method` with `matcher` and collect non-overlapping windows.
///
/// The matcher gets the instructions of one block and an index into them, and returns a
/// window with block-relative indices. The window may start before `index` (for matchers
/// anchored on a trailing call) but not before the end of the previously accepted one.
/// Returned windows use method-relative indices, in ascending order.
pub fn collect_windows<F>(module: &Module, method: Token, mut matcher: F) -> Vec<CallSiteWindow>
where
    F: FnMut(&[Instruction], usize) -> Option<CallSiteWindow>,
{
    let Some(body) = module.method(method).and_then(|m| m.body.as_ref()) else {
        return Vec::new();
    };

    let mut windows = Vec::new();
    for block in body.block_ranges() {
        let instructions = &body.instructions[block.clone()];
        let mut free = 0;
        let mut index = 0;
        while index < instructions.len() {
            match matcher(instructions, index) {
                Some(window)
                    if window.start >= free
                        && window.len > 0
                        && window.end() <= instructions.len() =>
                {
                    free = window.end();
                    index = free;
                    windows.push(CallSiteWindow {
                        start: block.start + window.start,
                        ..window
                    });
                }
                _ => index += 1,
            }
        }
    }
    windows
}

fn net_effect(module: &Module, instructions: &[Instruction]) -> Result<i32> {
    instructions
        .iter()
        .try_fold(0i32, |sum, instruction| Ok(sum + module.stack_delta(instruction)?))
}

/// Check `windows` against the body of `method`.
///
/// # Errors
/// Returns [`crate::Error::Invariant`] if a window overlaps another, crosses a block
/// boundary or changes the net stack effect.
pub fn validate_windows(module: &Module, method: Token, windows: &[CallSiteWindow]) -> Result<()> {
    let body = module
        .method(method)
        .and_then(|m| m.body.as_ref())
        .ok_or_else(|| Error::Invariant(format!("Method {method} has no body to rewrite")))?;
    let blocks = body.block_ranges();

    let mut previous_end = 0;
    for window in windows {
        if window.start < previous_end {
            return Err(Error::Invariant(format!(
                "Window at {} overlaps the previous window ending at {previous_end} in {method}",
                window.start
            )));
        }
        previous_end = window.end();

        let inside_block = blocks
            .iter()
            .any(|block| block.start <= window.start && window.end() <= block.end);
        if !inside_block || window.len == 0 {
            return Err(Error::Invariant(format!(
                "Window {}..{} is not inside one block of {method}",
                window.start,
                window.end()
            )));
        }

        let before = net_effect(module, &body.instructions[window.range()])?;
        let after = net_effect(module, &window.replacement)?;
        if before != after {
            return Err(Error::Invariant(format!(
                "Window {}..{} in {method} changes the stack effect from {before} to {after}",
                window.start,
                window.end()
            )));
        }
    }
    Ok(())
}

/// Validate and apply `windows` to `method`, last window first, and mark the method
/// modified. Returns the number of windows applied.
///
/// # Errors
/// Returns the validation error of [`validate_windows`] without touching the body.
pub fn apply_windows(
    module: &mut Module,
    method: Token,
    mut windows: Vec<CallSiteWindow>,
) -> Result<usize> {
    if windows.is_empty() {
        return Ok(0);
    }
    windows.sort_by_key(|w| w.start);
    validate_windows(module, method, &windows)?;

    let body = module
        .method_mut(method)
        .and_then(|m| m.body.as_mut())
        .ok_or_else(|| Error::Invariant(format!("Method {method} has no body to rewrite")))?;
    let count = windows.len();
    for window in windows.into_iter().rev() {
        let range = window.range();
        body.replace(range, window.replacement)?;
    }
    module.mark_modified(method);
    Ok(count)
}

/// Build `ldc.i4 n; newarr T; dup; ldtoken F; call InitializeArray`, where `F` is a new
/// RVA-backed field holding `data` and `n` its element count.
///
/// # Errors
/// Returns [`crate::Error::Invariant`] if `element_type` is not a primitive type or
/// `data` is not a whole number of elements.
pub fn initialized_array(
    module: &mut Module,
    element_type: &str,
    data: Vec<u8>,
) -> Result<Vec<Instruction>> {
    let size = primitive_size(element_type)
        .ok_or_else(|| Error::Invariant(format!("{element_type} is not a primitive type")))?;
    if data.len() % size != 0 {
        return Err(Error::Invariant(format!(
            "{} bytes are not a whole number of {element_type} elements",
            data.len()
        )));
    }
    let count = i32::try_from(data.len() / size)
        .map_err(|_| Error::Invariant(format!("Array of {} bytes is too large", data.len())))?;

    let element = module.import_type(element_type);
    let field = module.add_initialized_data(data)?;
    let initialize = module.add_member_ref(
        RUNTIME_HELPERS,
        "InitializeArray",
        MethodSig::new("System.Void", &["System.Array", "System.RuntimeFieldHandle"]),
    );

    Ok(vec![
        Instruction::ldc_i4(count),
        Instruction::newarr(element),
        Instruction::dup(),
        Instruction::ldtoken(field),
        Instruction::call(initialize),
    ])
}

/// Returns true if `instruction` calls a `Void(System.Array,System.RuntimeFieldHandle)`
/// method, which is how `InitializeArray` calls are recognized.
#[must_use]
pub fn is_initialize_array_call(module: &Module, instruction: &Instruction) -> bool {
    instruction.is_call()
        && instruction
            .token_operand()
            .and_then(|t| module.method_sig(t))
            .is_some_and(|sig| {
                sig.matches("System.Void", &["System.Array", "System.RuntimeFieldHandle"])
            })
}

/// Remove every call to `target` (a `Void()` method) from the bodies of all methods.
/// Returns the number of calls removed.
///
/// # Errors
/// Propagates rewriting errors.
pub fn remove_calls(module: &mut Module, target: Token) -> Result<usize> {
    let mut removed = 0;
    for method in module.methods() {
        if !fingerprint::called_methods(module, method).contains(&target) {
            continue;
        }
        let windows = collect_windows(module, method, |block, i| {
            (block[i].is_call() && block[i].token_operand() == Some(target))
                .then(|| CallSiteWindow::removal(i, 1))
        });
        removed += apply_windows(module, method, windows)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Operand,
        metadata::{builder::BodyBuilder, method::MethodDef},
        test::factories::module_with_type,
    };

    fn setup(body: impl FnOnce(&mut BodyBuilder, Token)) -> (Module, Token, Token) {
        let (mut module, ty) = module_with_type("Ns", "Holder");
        let decrypter = module
            .add_method(ty, MethodDef::new("d", MethodSig::new("System.String", &["System.Int32"])))
            .unwrap();
        let mut builder = BodyBuilder::new();
        body(&mut builder, decrypter);
        let caller = module
            .add_method(
                ty,
                MethodDef::new("Caller", MethodSig::new("System.Void", &[]))
                    .with_body(builder.build().unwrap()),
            )
            .unwrap();
        (module, decrypter, caller)
    }

    fn decrypter_windows(module: &Module, caller: Token, decrypter: Token) -> Vec<CallSiteWindow> {
        collect_windows(module, caller, |block, i| {
            if i == 0 || block[i].token_operand() != Some(decrypter) || !block[i - 1].is_ldc_i4() {
                return None;
            }
            let value = block[i - 1].ldc_i4_value()?;
            Some(CallSiteWindow::new(i - 1, 2, vec![Instruction::ldstr(format!("s{value}"))]))
        })
    }

    #[test]
    fn windows_applied_in_reverse_order() {
        let (mut module, decrypter, caller) = setup(|b, d| {
            b.ldc_i4(1).call(d).op("pop");
            b.ldc_i4(2).call(d).op("pop");
            b.op("nop");
            b.ldc_i4(3).call(d).op("pop").ret();
        });

        let windows = decrypter_windows(&module, caller, decrypter);
        assert_eq!(
            windows.iter().map(|w| (w.start, w.len)).collect::<Vec<_>>(),
            vec![(0, 2), (3, 2), (7, 2)]
        );
        assert_eq!(apply_windows(&mut module, caller, windows).unwrap(), 3);

        let body = module.method(caller).unwrap().body.as_ref().unwrap();
        let mnemonics: Vec<&str> = body.instructions.iter().map(|i| i.mnemonic).collect();
        assert_eq!(
            mnemonics,
            vec!["ldstr", "pop", "ldstr", "pop", "nop", "ldstr", "pop", "ret"]
        );
        assert_eq!(body.instructions[5].string_operand(), Some("s3"));
        assert_eq!(module.modified_methods(), vec![caller]);
    }

    #[test]
    fn stack_effect_must_match() {
        let (mut module, decrypter, caller) = setup(|b, d| {
            b.ldc_i4(1).call(d).op("pop").ret();
        });
        let windows = vec![CallSiteWindow::new(0, 2, vec![Instruction::nop()])];
        assert!(matches!(
            apply_windows(&mut module, caller, windows),
            Err(Error::Invariant(_))
        ));
        // untouched on failure
        assert!(decrypter_windows(&module, caller, decrypter).len() == 1);
        assert!(module.modified_methods().is_empty());
    }

    #[test]
    fn overlapping_and_cross_block_windows_rejected() {
        let (mut module, _, caller) = setup(|b, d| {
            let target = b.label();
            b.ldc_i4(1).branch("brfalse.s", target);
            b.mark(target).ldc_i4(2).call(d).op("pop").ret();
        });

        let overlapping = vec![
            CallSiteWindow::new(2, 2, vec![Instruction::ldstr("a")]),
            CallSiteWindow::new(3, 1, vec![Instruction::ldstr("b")]),
        ];
        assert!(matches!(
            apply_windows(&mut module, caller, overlapping),
            Err(Error::Invariant(_))
        ));

        let crossing = vec![CallSiteWindow::new(1, 2, vec![Instruction::ldc_i4(0)])];
        assert!(matches!(
            apply_windows(&mut module, caller, crossing),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn initialized_array_literal() {
        let (mut module, _, _) = setup(|b, _| {
            b.ret();
        });
        let code = initialized_array(&mut module, "System.Int32", vec![0; 12]).unwrap();
        assert_eq!(code.len(), 5);
        assert_eq!(code[0].ldc_i4_value(), Some(3));
        assert!(is_initialize_array_call(&module, &code[4]));
        assert_eq!(net_effect(&module, &code).unwrap(), 1);

        let Operand::Token(field) = code[3].operand else {
            panic!("ldtoken without token");
        };
        assert_eq!(module.field(field).unwrap().initial_value.as_deref(), Some(&[0u8; 12][..]));

        assert!(initialized_array(&mut module, "System.String", vec![]).is_err());
        assert!(initialized_array(&mut module, "System.Int64", vec![0; 4]).is_err());
    }

    #[test]
    fn calls_removed_everywhere() {
        let (mut module, ty) = module_with_type("Ns", "Init");
        let init = module
            .add_method(ty, MethodDef::new("Init", MethodSig::new("System.Void", &[])))
            .unwrap();
        for name in ["a", "b"] {
            let body = BodyBuilder::new().call(init).op("nop").ret().build().unwrap();
            module
                .add_method(ty, MethodDef::new(name, MethodSig::new("System.Void", &[])).with_body(body))
                .unwrap();
        }
        assert_eq!(remove_calls(&mut module, init).unwrap(), 2);
        assert_eq!(module.modified_methods().len(), 2);
    }
}
