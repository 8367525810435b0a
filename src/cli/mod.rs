//! CLI module for aerohub
//!
//! Provides command-line interface for:
//! - serve: Boot a node and serve until interrupted
//! - check-config: Validate a configuration file
//! - generate-certificate: Create a sink certificate for pull replication

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{check_config, generate_sink_certificate, run, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};
