//! CIL decoding: instruction streams and complete method bodies.
//!
//! Decoding happens in two passes. The first pass reads every instruction and records its
//! byte offset; branch and switch operands are kept as absolute byte offsets. The second
//! pass turns those offsets into instruction indices, which is the addressing used by
//! [`crate::metadata::body::MethodBody`]. A branch into the middle of an instruction is
//! malformed.
//!
//! # Key Components
//!
//! - [`crate::assembly::decode_stream`] - Decode a raw code blob
//! - [`crate::assembly::decode_stream_with_offsets`] - Same, keeping the byte offsets
//! - [`crate::assembly::parse_method_body`] - Decode a method body including its header
//!   and exception sections
//!
//! # Usage Examples
//!
//! ```rust
//! use dotscope_deob::assembly::{decode_stream, Operand};
//!
//! // ldc.i4.0; brfalse.s +1; nop; ret
//! let code = [0x16, 0x2C, 0x01, 0x00, 0x2A];
//! let instructions = decode_stream(&code)?;
//! assert_eq!(instructions.len(), 4);
//! assert_eq!(instructions[1].operand, Operand::Target(3));
//! # Ok::<(), dotscope_deob::Error>(())
//! ```

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, Operand, OperandType},
        instructions::lookup,
    },
    file::parser::Parser,
    metadata::{
        body::{ExceptionHandler, HandlerKind, MethodBody},
        token::Token,
    },
    Result,
};

const TINY_FORMAT: u8 = 0x02;
const FAT_FORMAT: u8 = 0x03;
const FLAG_MORE_SECTS: u16 = 0x08;
const FLAG_INIT_LOCALS: u16 = 0x10;
const SECT_EH_TABLE: u8 = 0x01;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

/// A decoded code blob with the byte offset of every instruction.
#[derive(Debug, Clone)]
pub struct DecodedStream {
    /// The decoded instructions, with index-based branch targets
    pub instructions: Vec<Instruction>,
    /// Byte offset of each instruction
    pub offsets: Vec<u32>,
    /// Total code size in bytes
    pub code_size: u32,
}

impl DecodedStream {
    /// Map a byte offset to an instruction index. The code size maps to one past the end.
    #[must_use]
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        if offset == self.code_size {
            return Some(self.offsets.len());
        }
        self.offsets.binary_search(&offset).ok()
    }
}

enum RawOperand {
    Ready(Operand),
    Branch(i64),
    Switch(Vec<i64>),
}

fn decode_raw(parser: &mut Parser) -> Result<(Instruction, RawOperand)> {
    let first = parser.read_le::<u8>()?;
    let (prefix, opcode) = if first == 0xFE {
        (0xFE, parser.read_le::<u8>()?)
    } else {
        (0, first)
    };
    let info = lookup(prefix, opcode)?;

    let raw = match info.operand {
        OperandType::None => RawOperand::Ready(Operand::None),
        OperandType::Int8 => {
            RawOperand::Ready(Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)))
        }
        OperandType::UInt8 => {
            RawOperand::Ready(Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)))
        }
        OperandType::Int32 => {
            RawOperand::Ready(Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)))
        }
        OperandType::Int64 => {
            RawOperand::Ready(Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)))
        }
        OperandType::Float32 => RawOperand::Ready(Operand::Immediate(Immediate::Float32(
            parser.read_le::<f32>()?,
        ))),
        OperandType::Float64 => RawOperand::Ready(Operand::Immediate(Immediate::Float64(
            parser.read_le::<f64>()?,
        ))),
        OperandType::Token | OperandType::String => {
            RawOperand::Ready(Operand::Token(Token::new(parser.read_le::<u32>()?)))
        }
        OperandType::ShortLocal => {
            RawOperand::Ready(Operand::Local(u16::from(parser.read_le::<u8>()?)))
        }
        OperandType::Local => RawOperand::Ready(Operand::Local(parser.read_le::<u16>()?)),
        OperandType::ShortArgument => {
            RawOperand::Ready(Operand::Argument(u16::from(parser.read_le::<u8>()?)))
        }
        OperandType::Argument => RawOperand::Ready(Operand::Argument(parser.read_le::<u16>()?)),
        OperandType::ShortBranch => {
            let delta = i64::from(parser.read_le::<i8>()?);
            RawOperand::Branch(next_offset(parser) + delta)
        }
        OperandType::Branch => {
            let delta = i64::from(parser.read_le::<i32>()?);
            RawOperand::Branch(next_offset(parser) + delta)
        }
        OperandType::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count > parser.remaining() / 4 {
                return Err(malformed_error!("Switch with {} targets exceeds code", count));
            }
            let mut deltas = Vec::with_capacity(count);
            for _ in 0..count {
                deltas.push(i64::from(parser.read_le::<i32>()?));
            }
            let base = next_offset(parser);
            RawOperand::Switch(deltas.into_iter().map(|d| base + d).collect())
        }
    };

    Ok((Instruction::new(prefix, opcode, Operand::None)?, raw))
}

fn next_offset(parser: &Parser) -> i64 {
    i64::try_from(parser.pos()).unwrap_or(i64::MAX)
}

/// Decode a raw code blob into instructions, keeping the byte offset of each one.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for reserved opcodes and for branches that do not
/// land on an instruction boundary, and [`crate::Error::OutOfBounds`] for truncated operands.
pub fn decode_stream_with_offsets(code: &[u8]) -> Result<DecodedStream> {
    let code_size =
        u32::try_from(code.len()).map_err(|_| malformed_error!("Code blob too large"))?;
    let mut parser = Parser::new(code);
    let mut decoded = Vec::new();
    let mut offsets = Vec::new();

    while parser.has_more_data() {
        offsets.push(u32::try_from(parser.pos()).map_err(|_| out_of_bounds_error!())?);
        decoded.push(decode_raw(&mut parser)?);
    }

    let mut stream = DecodedStream {
        instructions: Vec::with_capacity(decoded.len()),
        offsets,
        code_size,
    };

    let resolve = |stream: &DecodedStream, target: i64| -> Result<usize> {
        u32::try_from(target)
            .ok()
            .and_then(|offset| stream.index_of(offset))
            .ok_or_else(|| malformed_error!("Branch target {} is not an instruction", target))
    };

    for (mut instruction, raw) in decoded {
        instruction.operand = match raw {
            RawOperand::Ready(operand) => operand,
            RawOperand::Branch(target) => Operand::Target(resolve(&stream, target)?),
            RawOperand::Switch(targets) => Operand::Switch(
                targets
                    .into_iter()
                    .map(|target| resolve(&stream, target))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        stream.instructions.push(instruction);
    }

    Ok(stream)
}

/// Decode a raw code blob into instructions with index-based branch targets.
///
/// # Errors
/// See [`decode_stream_with_offsets`].
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    Ok(decode_stream_with_offsets(code)?.instructions)
}

/// Parse a complete method body: header, code and exception sections.
///
/// `resolve_locals` maps the local variable signature token of a fat header to the local
/// type names. Tiny headers never carry locals.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for unknown header or section formats and for handler
/// boundaries that do not fall on instruction boundaries, [`crate::Error::OutOfBounds`] for
/// truncated input, and whatever `resolve_locals` returns.
///
/// # Examples
///
/// ```rust
/// use dotscope_deob::assembly::parse_method_body;
///
/// // tiny header, 2 bytes of code: ldc.i4.1; ret
/// let body = parse_method_body(&[0x0A, 0x17, 0x2A], |_| Ok(Vec::new()))?;
/// assert_eq!(body.instructions.len(), 2);
/// assert_eq!(body.max_stack, 8);
/// # Ok::<(), dotscope_deob::Error>(())
/// ```
pub fn parse_method_body<F>(data: &[u8], mut resolve_locals: F) -> Result<MethodBody>
where
    F: FnMut(Token) -> Result<Vec<String>>,
{
    let mut parser = Parser::new(data);
    let first = parser.peek_byte()?;

    let (max_stack, init_locals, code_size, local_sig, more_sects) = match first & 0x03 {
        TINY_FORMAT => {
            parser.advance_by(1)?;
            (8u16, false, usize::from(first >> 2), 0u32, false)
        }
        FAT_FORMAT => {
            let flags_and_size = parser.read_le::<u16>()?;
            let header_size = usize::from(flags_and_size >> 12) * 4;
            let max_stack = parser.read_le::<u16>()?;
            let code_size = parser.read_le::<u32>()? as usize;
            let local_sig = parser.read_le::<u32>()?;
            if header_size < 12 {
                return Err(malformed_error!("Fat header size {} too small", header_size));
            }
            parser.seek(header_size)?;
            (
                max_stack,
                flags_and_size & FLAG_INIT_LOCALS != 0,
                code_size,
                local_sig,
                flags_and_size & FLAG_MORE_SECTS != 0,
            )
        }
        other => return Err(malformed_error!("Invalid method header format: {}", other)),
    };

    let code_start = parser.pos();
    let code = parser.read_bytes(code_size)?;
    let stream = decode_stream_with_offsets(code)?;

    let locals = if local_sig == 0 {
        Vec::new()
    } else {
        resolve_locals(Token::new(local_sig))?
    };

    let mut exception_handlers = Vec::new();
    let mut has_more = more_sects;
    while has_more {
        let aligned = code_start + ((parser.pos() - code_start + 3) & !3);
        parser.seek(aligned)?;

        let kind = parser.read_le::<u8>()?;
        has_more = kind & SECT_MORE_SECTS != 0;
        let fat = kind & SECT_FAT_FORMAT != 0;

        let (data_size, entry_size) = if fat {
            let b0 = u32::from(parser.read_le::<u8>()?);
            let b1 = u32::from(parser.read_le::<u8>()?);
            let b2 = u32::from(parser.read_le::<u8>()?);
            ((b0 | (b1 << 8) | (b2 << 16)) as usize, 24)
        } else {
            let size = usize::from(parser.read_le::<u8>()?);
            parser.advance_by(2)?;
            (size, 12)
        };

        let count = data_size.saturating_sub(4) / entry_size;
        if kind & SECT_EH_TABLE == 0 {
            parser.advance_by(count * entry_size)?;
            continue;
        }

        for _ in 0..count {
            let (flags, try_offset, try_length, handler_offset, handler_length) = if fat {
                (
                    parser.read_le::<u32>()?,
                    parser.read_le::<u32>()?,
                    parser.read_le::<u32>()?,
                    parser.read_le::<u32>()?,
                    parser.read_le::<u32>()?,
                )
            } else {
                (
                    u32::from(parser.read_le::<u16>()?),
                    u32::from(parser.read_le::<u16>()?),
                    u32::from(parser.read_le::<u8>()?),
                    u32::from(parser.read_le::<u16>()?),
                    u32::from(parser.read_le::<u8>()?),
                )
            };
            let class_or_filter = parser.read_le::<u32>()?;
            let kind = HandlerKind::from_flags(flags)?;

            let index = |offset: u32| {
                stream
                    .index_of(offset)
                    .ok_or_else(|| malformed_error!("Handler boundary {} is not an instruction", offset))
            };

            exception_handlers.push(ExceptionHandler {
                kind,
                try_start: index(try_offset)?,
                try_end: index(try_offset.saturating_add(try_length))?,
                handler_start: index(handler_offset)?,
                handler_end: index(handler_offset.saturating_add(handler_length))?,
                filter_start: match kind {
                    HandlerKind::Filter => Some(index(class_or_filter)?),
                    _ => None,
                },
                catch_type: match kind {
                    HandlerKind::Catch => Some(Token::new(class_or_filter)),
                    _ => None,
                },
            });
        }
    }

    Ok(MethodBody {
        max_stack,
        init_locals,
        locals,
        instructions: stream.instructions,
        exception_handlers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::FlowType, Error};

    #[test]
    fn decode_operands() {
        // ldc.i4.s -3; ldc.i4 1789; ldstr 0x70000001; ldloc.s 4; ldarg 0x0102 (FE 09); ceq; ret
        let code = [
            0x1F, 0xFD, 0x20, 0xFD, 0x06, 0x00, 0x00, 0x72, 0x01, 0x00, 0x00, 0x70, 0x11, 0x04,
            0xFE, 0x09, 0x02, 0x01, 0xFE, 0x01, 0x2A,
        ];
        let instructions = decode_stream(&code).unwrap();
        assert_eq!(instructions.len(), 7);
        assert_eq!(instructions[0].ldc_i4_value(), Some(-3));
        assert_eq!(instructions[1].ldc_i4_value(), Some(1789));
        assert_eq!(instructions[2].operand, Operand::Token(Token(0x7000_0001)));
        assert_eq!(instructions[3].operand, Operand::Local(4));
        assert_eq!(instructions[4].operand, Operand::Argument(0x0102));
        assert_eq!(instructions[5].mnemonic, "ceq");
        assert_eq!(instructions[5].prefix, 0xFE);
        assert_eq!(instructions[6].flow_type, FlowType::Return);
    }

    #[test]
    fn decode_branches_to_indices() {
        // 0: br.s +2 -> offset 4   2: nop   3: nop   4: ret
        let code = [0x2B, 0x02, 0x00, 0x00, 0x2A];
        let stream = decode_stream_with_offsets(&code).unwrap();
        assert_eq!(stream.offsets, vec![0, 2, 3, 4]);
        assert_eq!(stream.instructions[0].operand, Operand::Target(3));

        // backward long branch: nop; br -6 -> offset 0
        let code = [0x00, 0x38, 0xFA, 0xFF, 0xFF, 0xFF];
        let instructions = decode_stream(&code).unwrap();
        assert_eq!(instructions[1].operand, Operand::Target(0));
    }

    #[test]
    fn decode_switch() {
        // switch (2 targets: +0, +1); nop; ret
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x2A,
        ];
        let instructions = decode_stream(&code).unwrap();
        assert_eq!(instructions[0].operand, Operand::Switch(vec![1, 2]));
    }

    #[test]
    fn decode_rejects_bad_targets_and_opcodes() {
        // br.s into the middle of ldc.i4
        let code = [0x2B, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(decode_stream(&code), Err(Error::Malformed { .. })));
        assert!(decode_stream(&[0x24]).is_err());
        assert!(matches!(decode_stream(&[0x20, 0x01]), Err(Error::OutOfBounds)));
    }

    #[test]
    fn parse_fat_body_with_small_eh() {
        // try { nop; leave.s +1 } finally { endfinally } ret
        let code = [0x00, 0xDE, 0x01, 0xDC, 0x2A];
        let mut data = vec![
            0x1B, 0x30, // fat, more sects, init locals, header size 3
            0x02, 0x00, // max stack
            0x05, 0x00, 0x00, 0x00, // code size
            0x01, 0x00, 0x00, 0x11, // local sig
        ];
        data.extend_from_slice(&code);
        data.extend_from_slice(&[0, 0, 0]); // align to 4
        data.extend_from_slice(&[0x01, 0x10, 0x00, 0x00]); // small EH, 16 bytes
        data.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x03, 0x03, 0x00, 0x01]);
        data.extend_from_slice(&[0, 0, 0, 0]);

        let body = parse_method_body(&data, |token| {
            assert_eq!(token, Token(0x1100_0001));
            Ok(vec!["System.Int32".to_string()])
        })
        .unwrap();

        assert_eq!(body.max_stack, 2);
        assert!(body.init_locals);
        assert_eq!(body.locals, vec!["System.Int32"]);
        assert_eq!(body.instructions.len(), 4);
        assert_eq!(body.instructions[1].operand, Operand::Target(3));
        let eh = &body.exception_handlers[0];
        assert_eq!(eh.kind, HandlerKind::Finally);
        assert_eq!((eh.try_start, eh.try_end), (0, 2));
        assert_eq!((eh.handler_start, eh.handler_end), (2, 3));
    }

    #[test]
    fn parse_fat_body_with_fat_eh_catch() {
        // try { nop; leave.s +2 } catch { pop; leave.s 0 } ret
        let code = [0x00, 0xDE, 0x03, 0x26, 0xDE, 0x00, 0x2A];
        let mut data = vec![
            0x0B, 0x30, 0x01, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        data.extend_from_slice(&code);
        data.push(0); // align
        data.extend_from_slice(&[0x41, 28, 0, 0]);
        for value in [0u32, 0, 3, 3, 3, 0x0100_0005] {
            data.extend_from_slice(&value.to_le_bytes());
        }

        let body = parse_method_body(&data, |_| panic!("no locals")).unwrap();
        assert!(!body.init_locals);
        let eh = &body.exception_handlers[0];
        assert_eq!(eh.kind, HandlerKind::Catch);
        assert_eq!(eh.catch_type, Some(Token(0x0100_0005)));
        assert_eq!((eh.try_start, eh.try_end, eh.handler_start, eh.handler_end), (0, 2, 2, 4));
    }

    #[test]
    fn parse_rejects_unknown_header() {
        assert!(parse_method_body(&[0x00, 0x2A], |_| Ok(Vec::new())).is_err());
        assert!(parse_method_body(&[], |_| Ok(Vec::new())).is_err());
    }
}
