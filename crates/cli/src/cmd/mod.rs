//! CLI command implementations

pub mod config;
pub mod reset;
pub mod serve;
pub mod status;
