//! Forest health monitoring agent
//!
//! Runs single observations from the command line, or arms daily monitoring
//! of one or more sites and serves health and metrics while it waits.

pub mod api;
pub mod cli;
pub mod commands;
pub mod config;
pub mod output;

/// Agent version reported at startup and by `--version`
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
