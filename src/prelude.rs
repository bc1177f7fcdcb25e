//! Convenient re-exports of the most commonly used types.
//!
//! ```rust,ignore
//! use dotscope_deob::prelude::*;
//! ```

// Core error handling
pub use crate::Error;
pub use crate::Result;

// Module model
pub use crate::metadata::body::{ExceptionHandler, HandlerKind, MethodBody};
pub use crate::metadata::builder::BodyBuilder;
pub use crate::metadata::field::{FieldAttributes, FieldDef};
pub use crate::metadata::method::{MethodAttributes, MethodDef, MethodSig, PInvokeInfo};
pub use crate::metadata::module::{FrameworkType, Module, Resource};
pub use crate::metadata::token::Token;
pub use crate::metadata::typesystem::{TypeAttributes, TypeDef};

// Instructions
pub use crate::assembly::{Instruction, Operand};

// Pipeline
pub use crate::deobfuscation::{
    DeobConfig, DeobfuscationResult, Detection, DynamicClient, EventKind, EventLog, Family,
    FamilyReport, FamilyState, LogLevel, Logger, Pipeline, ResourceDecrypter, Session, Value,
};
