//! CLI commands.

pub mod machines;
pub mod requests;
