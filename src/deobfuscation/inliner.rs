//! Replacing decrypter calls with the values they return.
//!
//! All inliners share one window shape: the constant loads that supply the decrypter's
//! arguments, immediately followed by the call, inside one block. The window is replaced
//! by a single literal load.
//!
//! - [`StaticStringInliner`] computes strings in process from per-decrypter handlers and
//!   also drops a trailing `castclass System.String` and `String::Intern` call.
//! - [`ConstantInliner`] does the same for numeric constant accessors.
//! - [`DynamicStringInliner`] sends every call site of one decrypter to the decryption
//!   worker as batched `DECRYPT_STRINGS` requests and maps the answers back in call
//!   order.
//!
//! A handler failing for one call site (bad offset, cipher failure) leaves that call in
//! place and logs a warning. Structural and worker failures abort the inliner.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    assembly::{Immediate, Instruction, Operand},
    deobfuscation::{
        context::{Reporter, Session},
        events::EventKind,
        fingerprint,
        rewriter::{apply_windows, collect_windows, CallSiteWindow},
        rpc::{DecrypterService, Value},
    },
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// Full name of `String.Intern`.
pub const STRING_INTERN: &str = "System.String System.String::Intern(System.String)";

/// A literal that replaces a decrypter call.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `ldc.i4`
    Int32(i32),
    /// `ldc.i8`
    Int64(i64),
    /// `ldc.r4`
    Single(f32),
    /// `ldc.r8`
    Double(f64),
    /// `ldstr`
    String(String),
}

impl Literal {
    /// The instruction loading this literal.
    #[must_use]
    pub fn instruction(&self) -> Instruction {
        match self {
            Literal::Int32(v) => Instruction::ldc_i4(*v),
            Literal::Int64(v) => Instruction::ldc_i8(*v),
            Literal::Single(v) => Instruction::ldc_r4(*v),
            Literal::Double(v) => Instruction::ldc_r8(*v),
            Literal::String(s) => Instruction::ldstr(s.clone()),
        }
    }

    fn kind(&self) -> EventKind {
        match self {
            Literal::String(_) => EventKind::StringDecrypted,
            _ => EventKind::ConstantDecrypted,
        }
    }

    fn log(&self, reporter: Reporter<'_>) {
        match self {
            Literal::String(s) => deob_verbose!(reporter.logger, "Decrypted string: {:?}", s),
            Literal::Int32(v) => deob_verbose!(reporter.logger, "Decrypted int32: {}", v),
            Literal::Int64(v) => deob_verbose!(reporter.logger, "Decrypted int64: {}", v),
            Literal::Single(v) => deob_verbose!(reporter.logger, "Decrypted single: {}", v),
            Literal::Double(v) => deob_verbose!(reporter.logger, "Decrypted double: {}", v),
        }
    }
}

/// The value pushed by a constant load (`ldc.*` or `ldstr`), if `instruction` is one.
#[must_use]
pub fn constant_value(module: &Module, instruction: &Instruction) -> Option<Value> {
    if let Some(value) = instruction.ldc_i4_value() {
        return Some(Value::Int32(value));
    }
    if let Some(s) = module.ldstr_value(instruction) {
        return Some(Value::String(s.to_string()));
    }
    match (instruction.prefix, instruction.opcode, &instruction.operand) {
        (0, 0x21, Operand::Immediate(Immediate::Int64(v))) => Some(Value::Int64(*v)),
        (0, 0x22, Operand::Immediate(Immediate::Float32(v))) => Some(Value::Single(*v)),
        (0, 0x23, Operand::Immediate(Immediate::Float64(v))) => Some(Value::Double(*v)),
        _ => None,
    }
}

fn is_string_cast(module: &Module, instruction: &Instruction) -> bool {
    instruction.is(0x74)
        && instruction
            .token_operand()
            .and_then(|t| module.type_name(t))
            .is_some_and(|name| name == "System.String")
}

fn is_intern_call(module: &Module, instruction: &Instruction) -> bool {
    instruction.is_call()
        && instruction
            .token_operand()
            .and_then(|t| module.method_full_name(t))
            .is_some_and(|name| name == STRING_INTERN)
}

/// Windows `args...; call decrypter` in `method` for every decrypter in `targets`. With
/// `string_casts` set, a following `castclass System.String` and then a following
/// `String::Intern` call join the window.
///
/// The returned windows carry no replacement yet.
#[must_use]
pub fn call_windows(
    module: &Module,
    method: Token,
    targets: &BTreeSet<Token>,
    string_casts: bool,
) -> Vec<CallSiteWindow> {
    collect_windows(module, method, |block, i| {
        let call = &block[i];
        let target = call.token_operand().filter(|_| call.is_call())?;
        if !targets.contains(&target) {
            return None;
        }
        let sig = module.method_sig(target)?;
        if sig.has_this {
            return None;
        }
        let start = i.checked_sub(sig.params.len())?;
        if !block[start..i]
            .iter()
            .all(|instr| constant_value(module, instr).is_some())
        {
            return None;
        }

        let mut end = i + 1;
        if string_casts {
            if block.get(end).is_some_and(|instr| is_string_cast(module, instr)) {
                end += 1;
            }
            if block.get(end).is_some_and(|instr| is_intern_call(module, instr)) {
                end += 1;
            }
        }
        Some(CallSiteWindow::removal(start, end - start))
    })
}

/// The decrypter and argument values of a window found by [`call_windows`].
#[must_use]
pub fn window_call(module: &Module, method: Token, window: &CallSiteWindow) -> Option<(Token, Vec<Value>)> {
    let code = fingerprint::instructions(module, method).get(window.range())?;
    let call_index = code.iter().position(Instruction::is_call)?;
    let decrypter = code[call_index].token_operand()?;
    let args = code[..call_index]
        .iter()
        .map(|instr| constant_value(module, instr))
        .collect::<Option<Vec<_>>>()?;
    Some((decrypter, args))
}

/// Returns true for errors that concern a single decrypted item.
#[must_use]
pub fn is_item_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Decode(_)
            | Error::Crypto(_)
            | Error::OutOfBounds
            | Error::Malformed { .. }
            | Error::InvalidOffset
    )
}

fn allowed_targets(module: &Module, session: &Session, tokens: impl Iterator<Item = Token>) -> BTreeSet<Token> {
    tokens
        .filter(|&t| session.decrypter_allowed(module, t))
        .collect()
}

fn inline_with<F>(
    module: &mut Module,
    session: &Session,
    targets: &BTreeSet<Token>,
    string_casts: bool,
    mut produce: F,
) -> Result<usize>
where
    F: FnMut(Token, &[Value]) -> Result<Literal>,
{
    if targets.is_empty() {
        return Ok(0);
    }
    let reporter = session.reporter();

    let mut total = 0;
    for method in module.methods() {
        if targets.contains(&method) {
            continue;
        }
        let mut windows = call_windows(module, method, targets, string_casts);
        if windows.is_empty() {
            continue;
        }

        windows.retain_mut(|window| {
            let Some((decrypter, args)) = window_call(module, method, window) else {
                return false;
            };
            match produce(decrypter, &args) {
                Ok(literal) => {
                    literal.log(reporter);
                    reporter.record(literal.kind()).at(method, window.start);
                    window.replacement = vec![literal.instruction()];
                    true
                }
                Err(error) => {
                    deob_warn!(
                        reporter.logger,
                        "Could not decrypt call in method {:08X}: {}",
                        method.value(),
                        error
                    );
                    false
                }
            }
        });
        total += apply_windows(module, method, windows)?;
    }
    Ok(total)
}

/// A string decrypter handler: call arguments in, decrypted string out.
pub type StringHandler<'h> = Box<dyn FnMut(&[Value]) -> Result<String> + 'h>;

/// A constant accessor handler: call arguments in, literal out.
pub type ConstantHandler<'h> = Box<dyn FnMut(&[Value]) -> Result<Literal> + 'h>;

/// Inlines string decrypter calls whose results can be computed in process.
#[derive(Default)]
pub struct StaticStringInliner<'h> {
    handlers: BTreeMap<Token, StringHandler<'h>>,
}

impl<'h> StaticStringInliner<'h> {
    /// An inliner without decrypters.
    #[must_use]
    pub fn new() -> Self {
        StaticStringInliner {
            handlers: BTreeMap::new(),
        }
    }

    /// Register the handler for `decrypter`.
    pub fn add(&mut self, decrypter: Token, handler: impl FnMut(&[Value]) -> Result<String> + 'h) {
        self.handlers.insert(decrypter, Box::new(handler));
    }

    /// Registered decrypters, in token order.
    #[must_use]
    pub fn decrypters(&self) -> Vec<Token> {
        self.handlers.keys().copied().collect()
    }

    /// Rewrite all calls of the registered decrypters. Returns the number of calls
    /// replaced. Items whose handler fails with an item error are left in place.
    ///
    /// # Errors
    /// Propagates non-item handler errors and rewriting invariant violations.
    pub fn inline(&mut self, module: &mut Module, session: &Session) -> Result<usize> {
        let targets = allowed_targets(module, session, self.handlers.keys().copied());
        let handlers = &mut self.handlers;
        let mut fatal = None;
        let count = inline_with(module, session, &targets, true, |decrypter, args| {
            let handler = handlers
                .get_mut(&decrypter)
                .ok_or(Error::TypeNotFound(decrypter))?;
            match handler(args) {
                Ok(s) => Ok(Literal::String(s)),
                Err(e) if is_item_error(&e) => Err(e),
                Err(e) => {
                    let message = e.to_string();
                    fatal.get_or_insert(e);
                    Err(Error::Error(message))
                }
            }
        })?;
        match fatal {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }
}

/// Inlines numeric constant accessor calls.
#[derive(Default)]
pub struct ConstantInliner<'h> {
    handlers: BTreeMap<Token, ConstantHandler<'h>>,
}

impl<'h> ConstantInliner<'h> {
    /// An inliner without accessors.
    #[must_use]
    pub fn new() -> Self {
        ConstantInliner {
            handlers: BTreeMap::new(),
        }
    }

    /// Register the handler for `accessor`.
    pub fn add(&mut self, accessor: Token, handler: impl FnMut(&[Value]) -> Result<Literal> + 'h) {
        self.handlers.insert(accessor, Box::new(handler));
    }

    /// Register an accessor taking one `Int32` index, answered by `lookup`.
    pub fn add_indexed(&mut self, accessor: Token, mut lookup: impl FnMut(i32) -> Result<Literal> + 'h) {
        self.add(accessor, move |args| match args {
            [Value::Int32(index)] => lookup(*index),
            _ => Err(decode_error!("Expected one Int32 index argument")),
        });
    }

    /// Rewrite all calls of the registered accessors. Returns the number replaced.
    ///
    /// # Errors
    /// Propagates rewriting invariant violations.
    pub fn inline(&mut self, module: &mut Module, session: &Session) -> Result<usize> {
        let targets = allowed_targets(module, session, self.handlers.keys().copied());
        let handlers = &mut self.handlers;
        inline_with(module, session, &targets, false, |accessor, args| {
            let handler = handlers
                .get_mut(&accessor)
                .ok_or(Error::TypeNotFound(accessor))?;
            handler(args)
        })
    }
}

/// Inlines string decrypter calls through the out-of-process decryption worker.
#[derive(Debug, Clone, Default)]
pub struct DynamicStringInliner {
    decrypters: Vec<Token>,
}

impl DynamicStringInliner {
    /// An inliner for `decrypters`.
    #[must_use]
    pub fn new(decrypters: Vec<Token>) -> Self {
        DynamicStringInliner { decrypters }
    }

    /// Rewrite all calls of the decrypters, one batched request per decrypter (split by
    /// the configured batch size). Returns the number of calls replaced.
    ///
    /// # Errors
    /// Returns [`crate::Error::PayloadUnavailable`] without a worker,
    /// [`crate::Error::CountMismatch`] when a batch answer has the wrong length, and any
    /// worker or rewriting error.
    pub fn inline(&self, module: &mut Module, session: &mut Session) -> Result<usize> {
        let targets = allowed_targets(module, session, self.decrypters.iter().copied());
        if targets.is_empty() {
            return Ok(0);
        }
        let reporter = session.reporter();
        let batch_size = session.config.dynamic_batch_size.max(1);

        // decrypter -> (caller, window index, args), in call order
        let mut sites: BTreeMap<Token, Vec<(Token, usize, Vec<Value>)>> = BTreeMap::new();
        let mut windows: BTreeMap<Token, Vec<CallSiteWindow>> = BTreeMap::new();
        for method in module.methods() {
            if targets.contains(&method) {
                continue;
            }
            let found = call_windows(module, method, &targets, true);
            for (index, window) in found.iter().enumerate() {
                if let Some((decrypter, args)) = window_call(module, method, window) {
                    sites.entry(decrypter).or_default().push((method, index, args));
                }
            }
            if !found.is_empty() {
                windows.insert(method, found);
            }
        }
        if sites.is_empty() {
            return Ok(0);
        }

        let assembly = module.name.clone();
        let client = session
            .dynamic()
            .ok_or_else(|| Error::PayloadUnavailable("no dynamic decryption worker".to_string()))?;
        let mut service = DecrypterService::start(client, &assembly)?;

        let mut decrypted: BTreeMap<(Token, usize), String> = BTreeMap::new();
        for (decrypter, calls) in sites {
            let id = service.define_string_decrypter(decrypter)?;
            for chunk in calls.chunks(batch_size) {
                let args = chunk.iter().map(|(_, _, args)| args.clone()).collect();
                let strings = match service.decrypt_strings(id, args) {
                    Ok(strings) => strings,
                    Err(error @ Error::CountMismatch { .. }) => {
                        deob_error!(reporter.logger, "Invalid decrypted strings array length");
                        return Err(error);
                    }
                    Err(error) => return Err(error),
                };
                for ((method, index, _), s) in chunk.iter().zip(strings) {
                    decrypted.insert((*method, *index), s);
                }
            }
        }

        let mut total = 0;
        for (method, found) in windows {
            let mut ready = Vec::with_capacity(found.len());
            for (index, mut window) in found.into_iter().enumerate() {
                let Some(s) = decrypted.remove(&(method, index)) else {
                    continue;
                };
                let literal = Literal::String(s);
                literal.log(reporter);
                reporter.record(EventKind::StringDecrypted).at(method, window.start);
                window.replacement = vec![literal.instruction()];
                ready.push(window);
            }
            total += apply_windows(module, method, ready)?;
        }
        Ok(total)
    }
}
