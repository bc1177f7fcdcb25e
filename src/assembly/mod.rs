//! CIL instruction model and decoder.
//!
//! Instructions are kept as an editable list per method body. Branch operands address
//! other instructions by index, so rewriting a window never has to recompute byte offsets.
//!
//! # Key Components
//!
//! - [`crate::assembly::Instruction`] - An instruction with its operand and stack effect
//! - [`crate::assembly::decode_stream`] - Decode raw CIL bytes
//! - [`crate::assembly::parse_method_body`] - Decode a full method body blob
//! - [`crate::assembly::instructions`] - The ECMA-335 opcode table

mod decoder;
mod instruction;
pub mod instructions;

pub use decoder::{decode_stream, decode_stream_with_offsets, parse_method_body, DecodedStream};
pub use instruction::{FlowType, Immediate, Instruction, Operand, OperandType, StackBehavior};
