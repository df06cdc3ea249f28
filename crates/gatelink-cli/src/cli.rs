//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Gateway websocket URL (overrides configuration)
    #[arg(short, long)]
    pub gateway: Option<String>,

    /// Agent session to attach to (overrides configuration)
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Data directory for state persistence
    #[arg(short, long)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect and stream session activity until interrupted
    Run,
    /// Send a single message and exit once it is handed off
    Send {
        /// Message content
        message: String,
        /// Seconds to wait for a live connection before leaving the
        /// message queued for the next run
        #[arg(short, long, default_value_t = 10)]
        wait: u64,
    },
    /// Print the current task board once connected, then exit
    Board {
        /// Keep watching for board updates instead of exiting
        #[arg(short, long)]
        watch: bool,
    },
    /// Print an example configuration file to stdout
    ExampleConfig,
}
