//! Client side of the out-of-process decryption worker.
//!
//! Some obfuscators decrypt with code that is not worth replicating (or cannot be, when
//! it depends on runtime state). For those, the original decrypter runs inside a
//! sandboxed worker process. This module only defines the message boundary:
//!
//! - [`DynamicClient`] is the synchronous transport a caller plugs in. Each
//!   [`DynamicClient::send`] blocks until the worker answers.
//! - [`Value`] is the tagged argument and result type carried over the channel.
//! - [`DecrypterService`] speaks the string decrypter protocol on top of a client.
//!
//! Any transport error aborts only the family that issued the request.

use std::fmt;

use crate::{metadata::token::Token, Error, Result};

/// Service type the worker loads to answer [`DecrypterService`] messages.
pub const DECRYPTER_SERVICE: &str = "StringDecrypterService";

/// Register a decrypter method; answers its id as [`Value::Int32`].
pub const DEFINE_STRING_DECRYPTER: u32 = 0;
/// Decrypt a batch of call argument lists with one decrypter; answers a string array.
pub const DECRYPT_STRINGS: u32 = 1;
/// Invoke a method with arguments; answers its return value.
pub const INVOKE: u32 = 2;

/// A value passed to or returned from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value
    Null,
    /// `System.Boolean`
    Bool(bool),
    /// `System.Int32`
    Int32(i32),
    /// `System.Int64`
    Int64(i64),
    /// `System.Single`
    Single(f32),
    /// `System.Double`
    Double(f64),
    /// `System.String`
    String(String),
    /// `System.Byte[]`
    Bytes(Vec<u8>),
    /// `System.Object[]`
    Array(Vec<Value>),
}

impl Value {
    /// The integer, if this is an `Int32`.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// The boolean, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The string, if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// A token as the worker expects it.
    #[must_use]
    pub fn token(token: Token) -> Self {
        Value::Int32(token.value() as i32)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}L"),
            Value::Single(v) => write!(f, "{v}f"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "byte[{}]", b.len()),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A request/response channel to the decryption worker.
pub trait DynamicClient {
    /// Load the assembly under analysis into the worker.
    ///
    /// # Errors
    /// Returns [`crate::Error::Dynamic`] if the worker cannot load it.
    fn load_assembly(&mut self, assembly: &str) -> Result<()>;

    /// Load a service type that answers subsequent messages.
    ///
    /// # Errors
    /// Returns [`crate::Error::Dynamic`] if the service is unknown to the worker.
    fn load_user_service(&mut self, service: &str, args: Option<Value>) -> Result<()>;

    /// Send a message and block until the worker answers.
    ///
    /// # Errors
    /// Returns [`crate::Error::Dynamic`] on transport failure or a worker side exception.
    fn send(&mut self, message_id: u32, args: Vec<Value>) -> Result<Value>;
}

/// The string decrypter protocol over a [`DynamicClient`].
pub struct DecrypterService<'a> {
    client: &'a mut dyn DynamicClient,
}

impl<'a> DecrypterService<'a> {
    /// Load the service and the assembly into the worker.
    ///
    /// # Errors
    /// Propagates loading failures.
    pub fn start(client: &'a mut dyn DynamicClient, assembly: &str) -> Result<Self> {
        client.load_user_service(DECRYPTER_SERVICE, None)?;
        client.load_assembly(assembly)?;
        Ok(DecrypterService { client })
    }

    /// Register `method` as a string decrypter and return the worker's id for it.
    ///
    /// # Errors
    /// Returns [`crate::Error::Dynamic`] if the answer is not an integer.
    pub fn define_string_decrypter(&mut self, method: Token) -> Result<i32> {
        let answer = self
            .client
            .send(DEFINE_STRING_DECRYPTER, vec![Value::token(method)])?;
        answer.as_i32().ok_or_else(|| {
            Error::Dynamic(format!("Expected a decrypter id for {method}, got {answer}"))
        })
    }

    /// Decrypt one batch of call argument lists with decrypter `id`.
    ///
    /// # Errors
    /// Returns [`crate::Error::CountMismatch`] when the number of strings differs from the
    /// number of argument lists and [`crate::Error::Dynamic`] for a malformed answer.
    pub fn decrypt_strings(&mut self, id: i32, calls: Vec<Vec<Value>>) -> Result<Vec<String>> {
        let expected = calls.len();
        let args = calls.into_iter().map(Value::Array).collect();
        let answer = self
            .client
            .send(DECRYPT_STRINGS, vec![Value::Int32(id), Value::Array(args)])?;

        let Value::Array(items) = answer else {
            return Err(Error::Dynamic(format!("Expected a string array, got {answer}")));
        };
        if items.len() != expected {
            return Err(Error::CountMismatch {
                expected,
                actual: items.len(),
            });
        }
        items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(Error::Dynamic(format!("Expected a string, got {other}"))),
            })
            .collect()
    }

    /// Invoke `method` in the worker and return its result.
    ///
    /// # Errors
    /// Propagates transport failures.
    pub fn invoke(&mut self, method: Token, args: Vec<Value>) -> Result<Value> {
        self.client
            .send(INVOKE, vec![Value::token(method), Value::Array(args)])
    }
}
