//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::replication::ReplicationError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout, sockets)
    IoError,
    /// Node failed to start
    BootFailed,
    /// Certificate generation failed
    CertificateError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AEROHUB_CLI_CONFIG_ERROR",
            Self::IoError => "AEROHUB_CLI_IO_ERROR",
            Self::BootFailed => "AEROHUB_CLI_BOOT_FAILED",
            Self::CertificateError => "AEROHUB_CLI_CERTIFICATE_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    /// Boot failed
    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    /// Certificate generation failed
    pub fn certificate_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::CertificateError, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

/// Configuration problems keep their message; anything else means boot failed.
impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        if e.is_fatal() {
            Self::config_error(e.message)
        } else {
            Self::boot_failed(e.message)
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = CliError::config_error("missing node_tag");
        assert_eq!(err.to_string(), "AEROHUB_CLI_CONFIG_ERROR: missing node_tag");
    }

    #[test]
    fn test_replication_error_mapping() {
        let err = CliError::from(ReplicationError::invalid_configuration("bad"));
        assert_eq!(err.code(), &CliErrorCode::ConfigError);

        let err = CliError::from(ReplicationError::transient("bind failed"));
        assert_eq!(err.code(), &CliErrorCode::BootFailed);
    }
}
