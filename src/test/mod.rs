//! Shared helpers for the unit tests.

pub mod factories;
