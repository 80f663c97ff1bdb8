//! CLI command implementations.

pub mod inspect;
pub mod patch;
pub mod patches;
