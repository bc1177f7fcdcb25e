//! Byte level access for payload decoding and image patching.
//!
//! # Key Components
//!
//! - [`crate::file::parser::Parser`] - Bounds-checked cursor over a byte slice
//! - [`crate::file::io`] - Little-endian primitive reading and writing
//! - [`crate::file::pe::PeImage`] - Raw PE bytes with section-aware addressing and
//!   collision-checked writes

pub mod io;
pub mod parser;
pub mod pe;

pub use parser::Parser;
pub use pe::{image_extension, DotNetLayout, PeImage, SectionHeader};
