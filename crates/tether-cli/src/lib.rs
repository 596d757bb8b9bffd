//! Tether CLI library
//!
//! Configuration, on-disk state and command handlers for the `tether` binary,
//! which runs a proximity node on the platform Bluetooth radios.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod state;

pub use app::TetherApp;
pub use cli::{Cli, Commands};
pub use config::CliAppConfig;
pub use error::{CliError, Result};
