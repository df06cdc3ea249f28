//! Gatelink CLI - terminal client for gateway agent sessions

use clap::Parser;
use tracing::{error, info};

use gatelink_core::FileStore;
use gatelink_runtime::{GatewayClient, WsTransport};

use gatelink_cli::{
    cli::{Cli, Commands},
    commands::CommandDispatcher,
    config::AppConfig,
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Example config needs no client and no logging
    if matches!(cli.command, Commands::ExampleConfig) {
        println!("{}", AppConfig::example_config());
        return Ok(());
    }

    // Load configuration before logging so the verbose knob applies
    let config = load_configuration(&cli)?;
    setup_logging(cli.verbose || config.cli.verbose);

    // Open persistent state
    let data_dir = config.data_dir()?;
    let store = FileStore::open(&data_dir)?;
    info!(dir = %data_dir.display(), "Using data directory");

    // Spawn the protocol engine
    let client = GatewayClient::spawn(
        WsTransport::new(),
        store,
        config.client_settings(),
        config.engine_config(),
    );

    // Execute the command
    let show_events = config.cli.show_events;
    if let Err(e) = CommandDispatcher::execute(cli, client, show_events).await {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }

    info!("Gatelink CLI exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or the layered default sources
fn load_configuration(cli: &Cli) -> Result<AppConfig> {
    let config = if let Some(config_path) = &cli.config {
        AppConfig::load_from_file(config_path)?
    } else {
        AppConfig::load_with_overrides(
            cli.gateway.clone(),
            cli.agent.clone(),
            cli.verbose.then_some(true),
            cli.data_dir.clone(),
        )?
    };
    Ok(config)
}
