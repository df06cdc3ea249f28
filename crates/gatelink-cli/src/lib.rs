//! Gatelink CLI library
//!
//! This library provides the components for the Gatelink command-line
//! interface: argument parsing, layered configuration, and the command
//! handlers that drive a [`gatelink_runtime::GatewayClient`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use error::{CliError, Result};

// Re-export commonly used types
pub use gatelink_runtime::{GatewayClient, Phase, SendReceipt, TaskBoard, WsTransport};
