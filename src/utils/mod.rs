//! Shared helpers that are not tied to one obfuscator family.
//!
//! - [`crypto`] - Block cipher decryption and `PasswordDeriveBytes` key derivation

pub mod crypto;
