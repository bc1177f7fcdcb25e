//! The binary object model consumed by detection and rewriting.
//!
//! A loaded assembly is represented as a [`module::Module`] arena: flat tables of type,
//! method and field definitions, member references, user strings and resources, all
//! addressed by [`token::Token`]. Method bodies are editable instruction lists
//! ([`body::MethodBody`]).
//!
//! Parsing PE files and metadata tables is left to the caller; the arena is populated
//! through the `add_*` methods of [`module::Module`] and the [`builder`] helpers.
//!
//! # Key Components
//!
//! - [`module`] - The arena, lookups, full names, mutation and rebinding
//! - [`typesystem`] - Type definitions and references
//! - [`method`] - Method definitions, signatures and member references
//! - [`field`] - Field definitions
//! - [`body`] - Method bodies and exception handlers
//! - [`builder`] - Fluent body construction
//! - [`token`] - Stable identities of arena entries

pub mod body;
pub mod builder;
pub mod field;
pub mod method;
pub mod module;
/// Stable identities of arena entries.
pub mod token;
pub mod typesystem;
