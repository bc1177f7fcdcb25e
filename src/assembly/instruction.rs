//! Instruction representation for the rewriter.
//!
//! Unlike a disassembler listing, instructions here live in a mutable list and refer to
//! each other by position: a branch operand is the index of its target inside the owning
//! [`crate::metadata::body::MethodBody`]. That keeps windows that are spliced in and out of
//! a body free of byte-offset bookkeeping; the body remaps indices on every edit.
//!
//! # Key Components
//!
//! - [`crate::assembly::Instruction`] - One decoded or synthesised instruction
//! - [`crate::assembly::Operand`] / [`crate::assembly::Immediate`] - Typed operands
//! - [`crate::assembly::FlowType`] - Control flow classification
//! - [`crate::assembly::StackBehavior`] - Fixed stack effect from the opcode table

use std::fmt;

use crate::{
    assembly::instructions::{lookup, lookup_mnemonic, CilInstruction},
    metadata::token::Token,
    Result,
};

/// Operand encoding of an opcode, as stored in the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate
    Int8,
    /// Unsigned 8-bit immediate (`unaligned.`, `no.`)
    UInt8,
    /// Signed 32-bit immediate
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit float immediate
    Float32,
    /// 64-bit float immediate
    Float64,
    /// Metadata token
    Token,
    /// User string token (`ldstr`)
    String,
    /// 8-bit relative branch
    ShortBranch,
    /// 32-bit relative branch
    Branch,
    /// Jump table
    Switch,
    /// 8-bit local index
    ShortLocal,
    /// 16-bit local index
    Local,
    /// 8-bit argument index
    ShortArgument,
    /// 16-bit argument index
    Argument,
}

/// An immediate value carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit
    Int8(i8),
    /// Unsigned 8-bit
    UInt8(u8),
    /// Signed 32-bit
    Int32(i32),
    /// Signed 64-bit
    Int64(i64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
}

/// The operand of an instruction.
///
/// Branch targets are instruction indices within the owning body.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// An immediate constant
    Immediate(Immediate),
    /// A single branch target
    Target(usize),
    /// Targets of a `switch`
    Switch(Vec<usize>),
    /// A metadata token (member, type, field or user string)
    Token(Token),
    /// An inline string literal, produced by rewriting
    String(String),
    /// A local variable index
    Local(u16),
    /// An argument index
    Argument(u16),
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// May branch or fall through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method and continues
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter block
    EndFinally,
    /// Leaves a protected region
    Leave,
}

/// Stack effect as recorded in the opcode table.
///
/// For opcodes whose effect depends on a signature (`call`, `callvirt`, `newobj`, `calli`,
/// `ret`) `variable` is set and the counts are meaningless; use
/// [`crate::metadata::module::Module::stack_delta`] for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Items popped
    pub pops: u8,
    /// Items pushed
    pub pushes: u8,
    /// True when the effect is signature dependent
    pub variable: bool,
}

impl StackBehavior {
    /// Net change of the stack depth.
    #[must_use]
    pub fn net_effect(&self) -> i32 {
        i32::from(self.pushes) - i32::from(self.pops)
    }
}

/// A single CIL instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Opcode byte (second byte for two-byte opcodes)
    pub opcode: u8,
    /// `0xFE` for two-byte opcodes, 0 otherwise
    pub prefix: u8,
    /// Mnemonic, e.g. `ldc.i4.s`
    pub mnemonic: &'static str,
    /// Control flow classification
    pub flow_type: FlowType,
    /// Stack effect from the opcode table
    pub stack_behavior: StackBehavior,
    /// The operand
    pub operand: Operand,
}

const LDC_I4_SHORT: [&str; 9] = [
    "ldc.i4.0", "ldc.i4.1", "ldc.i4.2", "ldc.i4.3", "ldc.i4.4", "ldc.i4.5", "ldc.i4.6",
    "ldc.i4.7", "ldc.i4.8",
];

impl Instruction {
    fn from_table(prefix: u8, opcode: u8, info: &CilInstruction, operand: Operand) -> Self {
        Instruction {
            opcode,
            prefix,
            mnemonic: info.mnemonic,
            flow_type: info.flow,
            stack_behavior: StackBehavior {
                pops: info.pops,
                pushes: info.pushes,
                variable: info.variable,
            },
            operand,
        }
    }

    fn fixed(opcode: u8, mnemonic: &'static str, pops: u8, pushes: u8, operand: Operand) -> Self {
        Instruction {
            opcode,
            prefix: 0,
            mnemonic,
            flow_type: FlowType::Sequential,
            stack_behavior: StackBehavior {
                pops,
                pushes,
                variable: false,
            },
            operand,
        }
    }

    /// Build an instruction from its opcode bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown or reserved opcodes.
    pub fn new(prefix: u8, opcode: u8, operand: Operand) -> Result<Self> {
        let info = lookup(prefix, opcode)?;
        Ok(Self::from_table(prefix, opcode, info, operand))
    }

    /// Build an instruction from its mnemonic.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no opcode carries that mnemonic.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotscope_deob::assembly::{Instruction, Operand};
    ///
    /// let pop = Instruction::by_mnemonic("pop", Operand::None)?;
    /// assert_eq!(pop.opcode, 0x26);
    /// assert_eq!(pop.stack_behavior.net_effect(), -1);
    /// # Ok::<(), dotscope_deob::Error>(())
    /// ```
    pub fn by_mnemonic(mnemonic: &str, operand: Operand) -> Result<Self> {
        let (prefix, opcode, info) = lookup_mnemonic(mnemonic)?;
        Ok(Self::from_table(prefix, opcode, info, operand))
    }

    /// `ldc.i4` in its shortest encoding.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        match value {
            -1 => Self::fixed(0x15, "ldc.i4.m1", 0, 1, Operand::None),
            0..=8 => {
                // value is in 0..=8 here
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let index = value as usize;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let opcode = 0x16 + value as u8;
                Self::fixed(opcode, LDC_I4_SHORT[index], 0, 1, Operand::None)
            }
            _ => match i8::try_from(value) {
                Ok(short) => Self::fixed(
                    0x1F,
                    "ldc.i4.s",
                    0,
                    1,
                    Operand::Immediate(Immediate::Int8(short)),
                ),
                Err(_) => Self::fixed(
                    0x20,
                    "ldc.i4",
                    0,
                    1,
                    Operand::Immediate(Immediate::Int32(value)),
                ),
            },
        }
    }

    /// `ldc.i8 value`
    #[must_use]
    pub fn ldc_i8(value: i64) -> Self {
        Self::fixed(0x21, "ldc.i8", 0, 1, Operand::Immediate(Immediate::Int64(value)))
    }

    /// `ldc.r4 value`
    #[must_use]
    pub fn ldc_r4(value: f32) -> Self {
        Self::fixed(0x22, "ldc.r4", 0, 1, Operand::Immediate(Immediate::Float32(value)))
    }

    /// `ldc.r8 value`
    #[must_use]
    pub fn ldc_r8(value: f64) -> Self {
        Self::fixed(0x23, "ldc.r8", 0, 1, Operand::Immediate(Immediate::Float64(value)))
    }

    /// `ldstr` with an inline literal.
    #[must_use]
    pub fn ldstr(value: impl Into<String>) -> Self {
        Self::fixed(0x72, "ldstr", 0, 1, Operand::String(value.into()))
    }

    /// `newarr element_type`
    #[must_use]
    pub fn newarr(element_type: Token) -> Self {
        Self::fixed(0x8D, "newarr", 1, 1, Operand::Token(element_type))
    }

    /// `dup`
    #[must_use]
    pub fn dup() -> Self {
        Self::fixed(0x25, "dup", 1, 2, Operand::None)
    }

    /// `ldtoken member`
    #[must_use]
    pub fn ldtoken(member: Token) -> Self {
        Self::fixed(0xD0, "ldtoken", 0, 1, Operand::Token(member))
    }

    /// `call method`
    #[must_use]
    pub fn call(method: Token) -> Self {
        Instruction {
            opcode: 0x28,
            prefix: 0,
            mnemonic: "call",
            flow_type: FlowType::Call,
            stack_behavior: StackBehavior {
                pops: 0,
                pushes: 0,
                variable: true,
            },
            operand: Operand::Token(method),
        }
    }

    /// `nop`
    #[must_use]
    pub fn nop() -> Self {
        Self::fixed(0x00, "nop", 0, 0, Operand::None)
    }

    /// `ret`
    #[must_use]
    pub fn ret() -> Self {
        Instruction {
            opcode: 0x2A,
            prefix: 0,
            mnemonic: "ret",
            flow_type: FlowType::Return,
            stack_behavior: StackBehavior {
                pops: 0,
                pushes: 0,
                variable: true,
            },
            operand: Operand::None,
        }
    }

    /// True for a one-byte opcode equal to `opcode`.
    #[must_use]
    pub fn is(&self, opcode: u8) -> bool {
        self.prefix == 0 && self.opcode == opcode
    }

    /// True for any `ldc.i4` form.
    #[must_use]
    pub fn is_ldc_i4(&self) -> bool {
        self.prefix == 0 && (0x15..=0x20).contains(&self.opcode)
    }

    /// The value pushed by an `ldc.i4` form.
    #[must_use]
    pub fn ldc_i4_value(&self) -> Option<i32> {
        if self.prefix != 0 {
            return None;
        }
        match (self.opcode, &self.operand) {
            (0x15, _) => Some(-1),
            (0x16..=0x1E, _) => Some(i32::from(self.opcode) - 0x16),
            (0x1F, Operand::Immediate(Immediate::Int8(v))) => Some(i32::from(*v)),
            (0x20, Operand::Immediate(Immediate::Int32(v))) => Some(*v),
            _ => None,
        }
    }

    /// True for `call` and `callvirt`.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.is(0x28) || self.is(0x6F)
    }

    /// True for `ldstr`, whether it still holds a user string token or an inline literal.
    #[must_use]
    pub fn is_ldstr(&self) -> bool {
        self.is(0x72)
    }

    /// The token operand, if any.
    #[must_use]
    pub fn token_operand(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// The inline string operand, if any.
    #[must_use]
    pub fn string_operand(&self) -> Option<&str> {
        match &self.operand {
            Operand::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Check if this instruction is a branch (conditional, unconditional or switch).
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Switch
        )
    }

    /// Check if this instruction ends a basic block.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Switch
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::Leave
        )
    }

    /// Instruction indices this instruction may transfer control to.
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(Immediate::Int8(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::UInt8(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Int32(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Int64(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Float32(v)) => write!(f, " {v}"),
            Operand::Immediate(Immediate::Float64(v)) => write!(f, " {v}"),
            Operand::Target(t) => write!(f, " IL_{t:04}"),
            Operand::Switch(targets) => write!(f, " switch({})", targets.len()),
            Operand::Token(t) => write!(f, " {t}"),
            Operand::String(s) => write!(f, " {s:?}"),
            Operand::Local(l) => write!(f, " V_{l}"),
            Operand::Argument(a) => write!(f, " A_{a}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ldc_i4_picks_shortest_form() {
        assert_eq!(Instruction::ldc_i4(-1).mnemonic, "ldc.i4.m1");
        assert_eq!(Instruction::ldc_i4(0).opcode, 0x16);
        assert_eq!(Instruction::ldc_i4(8).mnemonic, "ldc.i4.8");
        assert_eq!(Instruction::ldc_i4(9).mnemonic, "ldc.i4.s");
        assert_eq!(Instruction::ldc_i4(-128).mnemonic, "ldc.i4.s");
        assert_eq!(Instruction::ldc_i4(128).mnemonic, "ldc.i4");
        assert_eq!(Instruction::ldc_i4(1789).mnemonic, "ldc.i4");
    }

    #[test]
    fn ldc_i4_value_round_trips_every_form() {
        for value in [-1, 0, 5, 8, 9, -2, 127, -128, 128, 1789, i32::MIN, i32::MAX] {
            let instr = Instruction::ldc_i4(value);
            assert!(instr.is_ldc_i4());
            assert_eq!(instr.ldc_i4_value(), Some(value));
        }
        assert_eq!(Instruction::ldc_i8(1).ldc_i4_value(), None);
    }

    #[test]
    fn constructors_match_table() {
        for (built, mnemonic, operand) in [
            (Instruction::dup(), "dup", Operand::None),
            (Instruction::nop(), "nop", Operand::None),
            (Instruction::newarr(Token(0x0100_0001)), "newarr", Operand::Token(Token(0x0100_0001))),
            (Instruction::ldtoken(Token(0x0400_0001)), "ldtoken", Operand::Token(Token(0x0400_0001))),
            (Instruction::call(Token(0x0A00_0001)), "call", Operand::Token(Token(0x0A00_0001))),
            (Instruction::ret(), "ret", Operand::None),
        ] {
            let from_table = Instruction::by_mnemonic(mnemonic, operand).unwrap();
            assert_eq!(built, from_table, "{mnemonic}");
        }
    }

    #[test]
    fn flow_classification() {
        let br = Instruction::by_mnemonic("br.s", Operand::Target(3)).unwrap();
        assert!(br.is_branch());
        assert!(br.is_terminal());
        assert_eq!(br.targets(), vec![3]);

        let call = Instruction::call(Token(0x0600_0001));
        assert!(call.is_call());
        assert!(!call.is_terminal());
        assert!(Instruction::ret().is_terminal());
    }

    #[test]
    fn display_formats_operands() {
        assert_eq!(Instruction::ldc_i4(1789).to_string(), "ldc.i4 1789");
        assert_eq!(Instruction::ldstr("a").to_string(), "ldstr \"a\"");
        assert_eq!(Instruction::call(Token(0x0600_0002)).to_string(), "call 0x06000002");
    }
}
