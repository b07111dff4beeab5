//! Perpetual CLI library
//!
//! Command-line client for perpetual WebSocket channels: argument parsing,
//! layered configuration and the `listen`, `send` and `interactive` commands.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::CliAppConfig;
pub use error::{CliError, Result};
