//! Method bodies as editable instruction lists.
//!
//! A [`MethodBody`] owns its instructions and its exception handlers. Both refer to
//! instructions by index, so every structural edit goes through [`MethodBody::replace`],
//! which shifts branch targets, switch tables and handler boundaries past the edited range.

use std::ops::Range;

use crate::{
    assembly::{Instruction, Operand},
    metadata::token::Token,
    Error, Result,
};

/// Kind of an exception handling clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Typed catch clause
    Catch,
    /// Filter clause
    Filter,
    /// Finally clause
    Finally,
    /// Fault clause
    Fault,
}

impl HandlerKind {
    /// Map the clause flags of a method data section.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown flag values.
    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags {
            0 => Ok(HandlerKind::Catch),
            1 => Ok(HandlerKind::Filter),
            2 => Ok(HandlerKind::Finally),
            4 => Ok(HandlerKind::Fault),
            other => Err(malformed_error!("Invalid exception clause flags: {}", other)),
        }
    }
}

/// One exception handling clause with instruction-index boundaries.
///
/// All `*_end` indices are exclusive and may equal the instruction count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub kind: HandlerKind,
    /// First instruction of the protected region
    pub try_start: usize,
    /// End of the protected region
    pub try_end: usize,
    /// First instruction of the handler
    pub handler_start: usize,
    /// End of the handler
    pub handler_end: usize,
    /// First instruction of the filter, for filter clauses
    pub filter_start: Option<usize>,
    /// Caught type, for catch clauses
    pub catch_type: Option<Token>,
}

/// A method body: header values, locals, instructions and exception handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodBody {
    /// Declared maximum evaluation stack depth
    pub max_stack: u16,
    /// Whether locals are zero-initialised
    pub init_locals: bool,
    /// Local variable type names, in slot order
    pub locals: Vec<String>,
    /// The instruction list
    pub instructions: Vec<Instruction>,
    /// Exception handlers, innermost first
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Create a body holding `instructions` with a default header.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        MethodBody {
            max_stack: 8,
            init_locals: true,
            locals: Vec::new(),
            instructions,
            exception_handlers: Vec::new(),
        }
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns true if the body holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Replace the instructions in `range` with `replacement`.
    ///
    /// Branch targets and handler boundaries at or before `range.start` are kept. Those
    /// inside the replaced range move to `range.start`, those at or after `range.end` shift
    /// by the length difference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Invariant`] if the range is empty-ended or out of bounds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotscope_deob::assembly::{Instruction, Operand};
    /// use dotscope_deob::metadata::body::MethodBody;
    ///
    /// let mut body = MethodBody::new(vec![
    ///     Instruction::ldc_i4(1),
    ///     Instruction::ldc_i4(2),
    ///     Instruction::by_mnemonic("br.s", Operand::Target(3))?,
    ///     Instruction::ret(),
    /// ]);
    /// body.replace(0..2, vec![Instruction::ldc_i4(3)])?;
    /// assert_eq!(body.instructions[1].operand, Operand::Target(2));
    /// # Ok::<(), dotscope_deob::Error>(())
    /// ```
    pub fn replace(&mut self, range: Range<usize>, replacement: Vec<Instruction>) -> Result<()> {
        if range.start > range.end || range.end > self.instructions.len() {
            return Err(Error::Invariant(format!(
                "Replace range {}..{} outside of body with {} instructions",
                range.start,
                range.end,
                self.instructions.len()
            )));
        }

        let inserted = replacement.len();
        self.instructions.splice(range.clone(), replacement);

        let remap = |index: usize| -> usize {
            if index <= range.start {
                index
            } else if index < range.end {
                range.start
            } else {
                index - (range.end - range.start) + inserted
            }
        };

        let untouched = range.start..range.start + inserted;
        for (i, instruction) in self.instructions.iter_mut().enumerate() {
            if untouched.contains(&i) {
                continue;
            }
            match &mut instruction.operand {
                Operand::Target(target) => *target = remap(*target),
                Operand::Switch(targets) => {
                    for target in targets.iter_mut() {
                        *target = remap(*target);
                    }
                }
                _ => {}
            }
        }

        for handler in &mut self.exception_handlers {
            handler.try_start = remap(handler.try_start);
            handler.try_end = remap(handler.try_end);
            handler.handler_start = remap(handler.handler_start);
            handler.handler_end = remap(handler.handler_end);
            handler.filter_start = handler.filter_start.map(remap);
        }

        Ok(())
    }

    /// Remove the instruction at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Invariant`] if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        if index >= self.instructions.len() {
            return Err(Error::Invariant(format!(
                "Cannot remove instruction {index} of {}",
                self.instructions.len()
            )));
        }
        self.replace(index..index + 1, Vec::new())
    }

    /// Split the body into basic block ranges.
    ///
    /// Blocks start at index 0, at every branch target, after every terminal instruction and
    /// at every exception handler boundary.
    #[must_use]
    pub fn block_ranges(&self) -> Vec<Range<usize>> {
        let len = self.instructions.len();
        if len == 0 {
            return Vec::new();
        }

        let mut leaders = vec![0];
        for (i, instruction) in self.instructions.iter().enumerate() {
            leaders.extend(instruction.targets());
            if instruction.is_terminal() {
                leaders.push(i + 1);
            }
        }
        for handler in &self.exception_handlers {
            leaders.extend([
                handler.try_start,
                handler.try_end,
                handler.handler_start,
                handler.handler_end,
            ]);
            leaders.extend(handler.filter_start);
        }

        leaders.retain(|&leader| leader < len);
        leaders.sort_unstable();
        leaders.dedup();

        leaders
            .iter()
            .enumerate()
            .map(|(i, &start)| start..leaders.get(i + 1).copied().unwrap_or(len))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn br(mnemonic: &str, target: usize) -> Instruction {
        Instruction::by_mnemonic(mnemonic, Operand::Target(target)).unwrap()
    }

    fn sample() -> MethodBody {
        // 0: ldc.i4.1  1: brtrue.s 4  2: ldc.i4.2  3: pop  4: ldc.i4.3  5: pop  6: ret
        let mut body = MethodBody::new(vec![
            Instruction::ldc_i4(1),
            br("brtrue.s", 4),
            Instruction::ldc_i4(2),
            Instruction::by_mnemonic("pop", Operand::None).unwrap(),
            Instruction::ldc_i4(3),
            Instruction::by_mnemonic("pop", Operand::None).unwrap(),
            Instruction::ret(),
        ]);
        body.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 2,
            try_end: 4,
            handler_start: 4,
            handler_end: 6,
            filter_start: None,
            catch_type: None,
        });
        body
    }

    #[test]
    fn replace_shrinking_shifts_later_indices() {
        let mut body = sample();
        body.replace(2..4, vec![Instruction::nop()]).unwrap();

        assert_eq!(body.len(), 6);
        assert_eq!(body.instructions[1].operand, Operand::Target(3));
        let eh = &body.exception_handlers[0];
        assert_eq!((eh.try_start, eh.try_end), (2, 3));
        assert_eq!((eh.handler_start, eh.handler_end), (3, 5));
    }

    #[test]
    fn replace_growing_shifts_later_indices() {
        let mut body = sample();
        body.replace(
            0..1,
            vec![Instruction::ldc_i4(1), Instruction::nop(), Instruction::nop()],
        )
        .unwrap();
        assert_eq!(body.instructions[3].operand, Operand::Target(6));
        assert_eq!(body.exception_handlers[0].handler_end, 8);
    }

    #[test]
    fn targets_into_removed_range_collapse_to_start() {
        let mut body = MethodBody::new(vec![
            br("br.s", 2),
            Instruction::nop(),
            Instruction::nop(),
            Instruction::ret(),
        ]);
        body.replace(1..3, vec![Instruction::ldc_i4(0)]).unwrap();
        assert_eq!(body.instructions[0].operand, Operand::Target(1));
    }

    #[test]
    fn remove_and_bounds() {
        let mut body = sample();
        body.remove(6).unwrap();
        assert_eq!(body.len(), 6);
        assert!(matches!(body.remove(6), Err(Error::Invariant(_))));
        assert!(body.replace(3..9, Vec::new()).is_err());
    }

    #[test]
    fn block_ranges_split_at_leaders() {
        let body = sample();
        assert_eq!(body.block_ranges(), vec![0..2, 2..4, 4..6, 6..7]);

        let straight = MethodBody::new(vec![Instruction::nop(), Instruction::ret()]);
        assert_eq!(straight.block_ranges(), vec![0..2]);
        assert!(MethodBody::default().block_ranges().is_empty());
    }
}
