//! CLI command implementations.

pub mod demo;
pub mod reset;
pub mod tokens;
