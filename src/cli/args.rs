//! CLI argument definitions using clap
//!
//! Commands:
//! - aerohub serve --config <path>
//! - aerohub check-config --config <path>
//! - aerohub generate-certificate --subject <name>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerohub - replication coordination for a multi-tenant document database
#[derive(Parser, Debug)]
#[command(name = "aerohub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a node: replication listener and admin API
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./aerohub.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerohub.json")]
        config: PathBuf,
    },

    /// Generate a sink certificate for pull replication
    GenerateCertificate {
        /// Certificate subject
        #[arg(long)]
        subject: String,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        valid_days: u32,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_default_config() {
        let cli = Cli::try_parse_from(["aerohub", "serve"]).unwrap();
        match cli.command {
            Command::Serve { config } => assert_eq!(config, PathBuf::from("./aerohub.json")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_generate_certificate() {
        let cli = Cli::try_parse_from([
            "aerohub",
            "generate-certificate",
            "--subject",
            "sink-eu",
            "--valid-days",
            "30",
        ])
        .unwrap();
        match cli.command {
            Command::GenerateCertificate { subject, valid_days } => {
                assert_eq!(subject, "sink-eu");
                assert_eq!(valid_days, 30);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_subject_is_required() {
        assert!(Cli::try_parse_from(["aerohub", "generate-certificate"]).is_err());
    }
}
