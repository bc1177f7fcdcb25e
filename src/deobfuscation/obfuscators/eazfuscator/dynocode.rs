//! Eazfuscator.NET dynocode enumerators, run in the decryption worker.
//!
//! From 3.5 on the string decrypter draws its key stream from a generated
//! `IEnumerable<Int32>` class ("dynocode"). Instead of emulating the class, the worker
//! constructs it, patches its fields and steps the enumerator on request.

use crate::{
    deobfuscation::rpc::{DynamicClient, Value},
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// Service type the worker loads to answer dynocode messages.
pub const DYNOCODE_SERVICE: &str = "DynocodeService";

/// Construct the enumerable: ctor token and argument array.
pub const CREATE_ENUMERABLE: u32 = 0;
/// Store a value into a field of the enumerable: field token and value.
pub const WRITE_ENUMERABLE_FIELD: u32 = 1;
/// Call `GetEnumerator` on the enumerable.
pub const CREATE_ENUMERATOR: u32 = 2;
/// Read `Current`; answers an `Int32`.
pub const CALL_GET_CURRENT: u32 = 3;
/// Call `MoveNext`; answers a `Boolean`.
pub const CALL_MOVE_NEXT: u32 = 4;

/// A dynocode enumerator living in the worker. Iterating yields its values until
/// `MoveNext` answers false or the worker fails.
pub struct DynocodeIterator<'a> {
    client: &'a mut dyn DynamicClient,
    types: Vec<Token>,
    failed: bool,
}

impl<'a> DynocodeIterator<'a> {
    /// Load the dynocode service and the assembly into the worker.
    ///
    /// # Errors
    /// Propagates loading failures.
    pub fn start(client: &'a mut dyn DynamicClient, assembly: &str) -> Result<Self> {
        client.load_user_service(DYNOCODE_SERVICE, None)?;
        client.load_assembly(assembly)?;
        Ok(DynocodeIterator {
            client,
            types: Vec::new(),
            failed: false,
        })
    }

    /// Outermost types of every constructed enumerable, to be removed afterwards.
    #[must_use]
    pub fn types(&self) -> &[Token] {
        &self.types
    }

    /// Construct the enumerable through `ctor`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotFound`] if `ctor` is not a method of `module`, and
    /// any transport failure.
    pub fn create_enumerable(&mut self, module: &Module, ctor: Token, args: Vec<Value>) -> Result<()> {
        let mut ty = module.method(ctor).ok_or(Error::TypeNotFound(ctor))?.declaring_type;
        while let Some(outer) = module.type_def(ty).and_then(|def| def.declaring_type) {
            ty = outer;
        }
        if !self.types.contains(&ty) {
            self.types.push(ty);
        }
        self.client
            .send(CREATE_ENUMERABLE, vec![Value::token(ctor), Value::Array(args)])?;
        Ok(())
    }

    /// Overwrite a field of the enumerable.
    ///
    /// # Errors
    /// Propagates transport failures.
    pub fn write_enumerable_field(&mut self, field: Token, value: Value) -> Result<()> {
        self.client
            .send(WRITE_ENUMERABLE_FIELD, vec![Value::token(field), value])?;
        Ok(())
    }

    /// Create the enumerator the iteration steps through.
    ///
    /// # Errors
    /// Propagates transport failures.
    pub fn create_enumerator(&mut self) -> Result<()> {
        self.client.send(CREATE_ENUMERATOR, Vec::new())?;
        Ok(())
    }

    fn step(&mut self) -> Result<Option<i32>> {
        let more = self.client.send(CALL_MOVE_NEXT, Vec::new())?;
        let more = more
            .as_bool()
            .ok_or_else(|| Error::Dynamic(format!("Expected a boolean from MoveNext, got {more}")))?;
        if !more {
            return Ok(None);
        }
        let current = self.client.send(CALL_GET_CURRENT, Vec::new())?;
        current
            .as_i32()
            .map(Some)
            .ok_or_else(|| Error::Dynamic(format!("Expected an integer from Current, got {current}")))
    }
}

impl Iterator for DynocodeIterator<'_> {
    type Item = Result<i32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(value) => value.map(Ok),
            Err(error) => {
                self.failed = true;
                Some(Err(error))
            }
        }
    }
}
