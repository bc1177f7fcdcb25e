// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
#![deny(unsafe_code)]

//! # dotscope-deob
//!
//! A deobfuscator for .NET assemblies protected by commercial obfuscators. It recognizes
//! the runtime classes each protector injects, decrypts the strings, constants, method
//! bodies and resources they guard, and rewrites the module so the plain values are
//! back in place.
//!
//! ## Supported Obfuscators
//!
//! Babel.NET, CryptoObfuscator, Xenocode, Skater.NET, SmartAssembly, Eazfuscator.NET,
//! CodeVeil, ILProtector, Agile.NET and .NET Reactor. See
//! [`deobfuscation::obfuscators`] for what each family restores.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dotscope_deob::prelude::*;
//!
//! let mut module: Module = load_module()?;
//!
//! let config = DeobConfig::default();
//! let (logger, events) = (Logger::new(), EventLog::new());
//! let result = Pipeline::new(&config, &logger, &events).run(&mut module)?;
//!
//! for family in result.detected() {
//!     println!("{family} detected");
//! }
//! println!("{}", result.detailed_summary());
//! # Ok::<(), dotscope_deob::Error>(())
//! ```
//!
//! ## Collaborators
//!
//! Some protections cannot be reversed statically. Decrypters that must run are
//! executed by an external worker behind [`deobfuscation::DynamicClient`], and
//! resource ciphers the crate does not implement are delegated to a
//! [`deobfuscation::ResourceDecrypter`]. Both are attached to the [`prelude::Pipeline`];
//! a family whose collaborator is missing is reported as detected but undecryptable.
//!
//! ## Module Organization
//!
//! - [`metadata`] - the in-memory module model: types, fields, methods, bodies, resources
//! - [`assembly`] - CIL instruction decoding and construction
//! - [`deobfuscation`] - the pipeline, the shared engines and the families
//! - [`utils`] - symmetric ciphers and key derivation
//! - [`file`] - byte parser and PE section access
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`], with [`Error`] describing the failure.

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

pub mod prelude;

pub mod assembly;
pub mod deobfuscation;
pub mod file;
pub mod metadata;
pub mod utils;

/// `dotscope-deob` Result type.
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotscope-deob` Error type.
///
/// See [`Error`] for the failure taxonomy.
pub use error::Error;
