//! Fluent assembly of method bodies.
//!
//! [`BodyBuilder`] emits instructions in order and resolves forward branches through
//! labels, so callers that populate the arena (a loader, or test fixtures) never deal with
//! instruction indices directly. Errors such as an unknown mnemonic are deferred to
//! [`BodyBuilder::build`].
//!
//! # Usage Examples
//!
//! ```rust
//! use dotscope_deob::metadata::builder::BodyBuilder;
//!
//! let mut b = BodyBuilder::new();
//! let end = b.label();
//! b.ldc_i4(0).branch("brfalse.s", end).ldstr("unreachable").op("pop").mark(end).ret();
//! let body = b.build()?;
//! assert_eq!(body.instructions.len(), 5);
//! # Ok::<(), dotscope_deob::Error>(())
//! ```

use crate::{
    assembly::{Instruction, Operand},
    metadata::{
        body::{ExceptionHandler, HandlerKind, MethodBody},
        token::Token,
    },
    Error, Result,
};

/// A position in a body under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builder for [`MethodBody`] values.
#[derive(Debug, Default)]
pub struct BodyBuilder {
    instructions: Vec<Instruction>,
    branches: Vec<(usize, Label)>,
    labels: Vec<Option<usize>>,
    handlers: Vec<(HandlerKind, [Label; 4], Option<Token>)>,
    locals: Vec<String>,
    max_stack: u16,
    error: Option<Error>,
}

impl BodyBuilder {
    /// Create an empty builder with `max_stack` 8.
    #[must_use]
    pub fn new() -> Self {
        BodyBuilder {
            max_stack: 8,
            ..Default::default()
        }
    }

    /// Append a prepared instruction.
    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Append an instruction without operand.
    pub fn op(&mut self, mnemonic: &str) -> &mut Self {
        self.op_with(mnemonic, Operand::None)
    }

    /// Append an instruction with an explicit operand.
    pub fn op_with(&mut self, mnemonic: &str, operand: Operand) -> &mut Self {
        match Instruction::by_mnemonic(mnemonic, operand) {
            Ok(instruction) => self.instructions.push(instruction),
            Err(error) => {
                self.error.get_or_insert(error);
            }
        }
        self
    }

    /// Append an instruction with a token operand.
    pub fn op_token(&mut self, mnemonic: &str, token: Token) -> &mut Self {
        self.op_with(mnemonic, Operand::Token(token))
    }

    /// `ldc.i4` in its shortest form
    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.push(Instruction::ldc_i4(value))
    }

    /// `ldc.i8`
    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        self.push(Instruction::ldc_i8(value))
    }

    /// `ldstr` with an inline literal
    pub fn ldstr(&mut self, value: &str) -> &mut Self {
        self.push(Instruction::ldstr(value))
    }

    /// `call`
    pub fn call(&mut self, method: Token) -> &mut Self {
        self.push(Instruction::call(method))
    }

    /// `ret`
    pub fn ret(&mut self) -> &mut Self {
        self.push(Instruction::ret())
    }

    /// Create a label that is not yet placed.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place `label` at the next emitted instruction.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.instructions.len());
        }
        self
    }

    /// Append a branch to `label`.
    pub fn branch(&mut self, mnemonic: &str, label: Label) -> &mut Self {
        let index = self.instructions.len();
        self.op_with(mnemonic, Operand::Target(usize::MAX));
        if self.instructions.len() > index {
            self.branches.push((index, label));
        }
        self
    }

    /// Declare an exception handler from four labels: try start and end, handler start
    /// and end.
    pub fn handler(
        &mut self,
        kind: HandlerKind,
        bounds: [Label; 4],
        catch_type: Option<Token>,
    ) -> &mut Self {
        self.handlers.push((kind, bounds, catch_type));
        self
    }

    /// Declare local variable types.
    pub fn locals(&mut self, locals: &[&str]) -> &mut Self {
        self.locals = locals.iter().map(|l| (*l).to_string()).collect();
        self
    }

    /// Set the declared maximum stack depth.
    pub fn max_stack(&mut self, max_stack: u16) -> &mut Self {
        self.max_stack = max_stack;
        self
    }

    /// Produce the body.
    ///
    /// # Errors
    /// Returns the first deferred error, or [`crate::Error::Invariant`] for labels that were
    /// used but never placed.
    pub fn build(&mut self) -> Result<MethodBody> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let resolve = |labels: &[Option<usize>], label: Label| {
            labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or_else(|| Error::Invariant(format!("Label {} was never placed", label.0)))
        };

        let mut instructions = self.instructions.clone();
        for &(index, label) in &self.branches {
            instructions[index].operand = Operand::Target(resolve(&self.labels, label)?);
        }

        let mut exception_handlers = Vec::with_capacity(self.handlers.len());
        for (kind, [try_start, try_end, handler_start, handler_end], catch_type) in &self.handlers {
            exception_handlers.push(ExceptionHandler {
                kind: *kind,
                try_start: resolve(&self.labels, *try_start)?,
                try_end: resolve(&self.labels, *try_end)?,
                handler_start: resolve(&self.labels, *handler_start)?,
                handler_end: resolve(&self.labels, *handler_end)?,
                filter_start: None,
                catch_type: *catch_type,
            });
        }

        Ok(MethodBody {
            max_stack: self.max_stack,
            init_locals: true,
            locals: self.locals.clone(),
            instructions,
            exception_handlers,
        })
    }
}
