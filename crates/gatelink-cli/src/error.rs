//! Error handling for the Gatelink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Gatelink client error: {0}")]
    Client(#[from] gatelink_core::ClientError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gateway interaction failed: {0}")]
    Gateway(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<crate::config::ConfigError> for CliError {
    fn from(err: crate::config::ConfigError) -> Self {
        CliError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Config(err.to_string())
    }
}
