//! CLI command implementations
//!
//! `serve` boots in a fixed order:
//! 1. Load and validate configuration
//! 2. Install logging
//! 3. Seed the cluster and build the node
//! 4. Bind the replication listener, then the admin API
//! 5. Run until Ctrl-C, then shut down in reverse

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::http_server::HttpServer;
use crate::node::{NodeConfig, ServerNode};
use crate::observability::{init_logging, Event};
use crate::replication::{TcpConnector, TcpReplicationListener};
use crate::security::generate_certificate;

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config } => serve(&config),
        Command::CheckConfig { config } => check_config(&config),
        Command::GenerateCertificate { subject, valid_days } => {
            generate_sink_certificate(&subject, valid_days)
        }
    }
}

fn load_config(config_path: &Path) -> CliResult<NodeConfig> {
    NodeConfig::load(config_path).map_err(|e| CliError::config_error(e.message))
}

/// Validate a configuration file and print it with defaults filled in.
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Print a freshly generated sink certificate as JSON.
pub fn generate_sink_certificate(subject: &str, valid_days: u32) -> CliResult<()> {
    if valid_days == 0 {
        return Err(CliError::certificate_error("valid-days must be positive"));
    }
    let generated = generate_certificate(subject, chrono::Duration::days(i64::from(valid_days)))
        .map_err(|e| CliError::certificate_error(e.message))?;
    println!("{}", serde_json::to_string_pretty(&generated)?);
    Ok(())
}

/// Start a node and serve until interrupted.
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    init_logging(&config.logging).map_err(|e| CliError::config_error(e.message().to_string()))?;
    tracing::info!(
        event = Event::ConfigLoaded.as_str(),
        path = %config_path.display(),
        node = %config.node_tag,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        tracing::info!(event = Event::BootStart.as_str(), node = %config.node_tag, "node starting");
        let node = Arc::new(ServerNode::from_config(&config, Arc::new(TcpConnector)).await?);

        let listener = TcpReplicationListener::bind(&config.replication_listen_addr).await?;
        node.start();
        node.serve_replication(listener);

        let shutdown = CancellationToken::new();
        let server = HttpServer::with_config(config.http.clone(), Arc::clone(&node));
        let mut http = tokio::spawn(server.start(shutdown.clone()));

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| CliError::io_error(format!("signal handler failed: {}", e)))?;
            }
            finished = &mut http => {
                node.shutdown().await;
                return match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(CliError::boot_failed(format!("HTTP server failed: {}", e))),
                    Err(e) => Err(CliError::boot_failed(format!("HTTP server task failed: {}", e))),
                };
            }
        }

        shutdown.cancel();
        node.shutdown().await;
        let _ = http.await;
        Ok::<(), CliError>(())
    })
}

#[cfg(test)]
mod tests {
    use super::super::errors::CliErrorCode;
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_check_config_accepts_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("aerohub.json");
        fs::write(&config_path, "{}").unwrap();

        check_config(&config_path).unwrap();
    }

    #[test]
    fn test_check_config_rejects_bad_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("aerohub.json");
        let config = json!({
            "replication": {"max_batch_size": 0}
        });
        fs::write(&config_path, config.to_string()).unwrap();

        let err = check_config(&config_path).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
        assert!(err.message().contains("max_batch_size"));
    }

    #[test]
    fn test_missing_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = check_config(&temp_dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_generate_certificate_requires_validity() {
        let err = generate_sink_certificate("sink", 0).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::CertificateError);
        assert!(generate_sink_certificate("sink", 10).is_ok());
    }
}
