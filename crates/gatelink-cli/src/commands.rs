//! Command handlers for the Gatelink CLI

use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use gatelink_runtime::{GatewayClient, Phase, SendReceipt, TaskBoard};

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, client: GatewayClient, show_events: bool) -> Result<()> {
        match cli.command {
            Commands::Run => Self::handle_run_command(client, show_events).await,
            Commands::Send { message, wait } => {
                Self::handle_send_command(client, message, wait).await
            }
            Commands::Board { watch } => Self::handle_board_command(client, watch).await,
            // Handled in main before a client exists
            Commands::ExampleConfig => Ok(()),
        }
    }

    /// Handle the run command: stream session activity until Ctrl+C
    async fn handle_run_command(client: GatewayClient, show_events: bool) -> Result<()> {
        client.connect()?;
        let mut phase_rx = client.watch_phase();
        let mut board_rx = client.watch_board();
        let mut events = client.subscribe_all().await?;

        info!("Streaming session activity, press Ctrl+C to stop");
        loop {
            tokio::select! {
                changed = phase_rx.changed() => {
                    if changed.is_err() {
                        warn!("Engine stopped unexpectedly");
                        break;
                    }
                    let snapshot = phase_rx.borrow_and_update().clone();
                    match &snapshot.detail {
                        Some(detail) => println!("state: {} ({})", snapshot.phase, detail),
                        None => println!("state: {}", snapshot.phase),
                    }
                }
                changed = board_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let board = board_rx.borrow_and_update().clone();
                    print!("{}", render_board(&board));
                }
                event = events.next() => {
                    // Drain even when not printing so the channel never backs up
                    match event {
                        Some(event) if show_events => {
                            match event.payload {
                                Some(payload) => println!("event {}: {}", event.name, payload),
                                None => println!("event {}", event.name),
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, disconnecting");
                    break;
                }
            }
        }

        client.disconnect().await?;
        client.shutdown()?;
        Ok(())
    }

    /// Handle the send command
    async fn handle_send_command(client: GatewayClient, message: String, wait: u64) -> Result<()> {
        client.connect()?;

        // Give the handshake a bounded head start; a message sent while
        // offline is still accepted, it just rides the durable queue.
        let mut phase_rx = client.watch_phase();
        let connected = timeout(Duration::from_secs(wait), async {
            loop {
                if phase_rx.borrow_and_update().phase == Phase::Connected {
                    return true;
                }
                if phase_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        if !connected {
            warn!("No connection within {}s, message will be queued", wait);
        }

        match client.send_message(message).await? {
            SendReceipt::Sent => {
                println!("Message sent");
                // Wait a moment for the delivery acknowledgement so the
                // queue entry clears before we go away
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            SendReceipt::Queued => {
                println!("Message queued for delivery on the next connection");
            }
        }

        client.disconnect().await?;
        client.shutdown()?;
        Ok(())
    }

    /// Handle the board command
    async fn handle_board_command(client: GatewayClient, watch: bool) -> Result<()> {
        client.connect()?;
        let mut board_rx = client.watch_board();

        if watch {
            info!("Watching for task board updates, press Ctrl+C to stop");
            loop {
                tokio::select! {
                    changed = board_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let board = board_rx.borrow_and_update().clone();
                        print!("{}", render_board(&board));
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        } else {
            let first = timeout(Duration::from_secs(30), async {
                loop {
                    let board = board_rx.borrow_and_update().clone();
                    if board.day.is_some() || board.stats.is_some() || !board.items.is_empty() {
                        return Some(board);
                    }
                    if board_rx.changed().await.is_err() {
                        return None;
                    }
                }
            })
            .await
            .ok()
            .flatten();

            match first {
                Some(board) => print!("{}", render_board(&board)),
                None => {
                    client.disconnect().await.ok();
                    client.shutdown().ok();
                    return Err(CliError::Gateway(
                        "No task board received within 30s".to_string(),
                    ));
                }
            }
        }

        client.disconnect().await?;
        client.shutdown()?;
        Ok(())
    }
}

/// Render a task board the way the agent prints it, checklist included
fn render_board(board: &TaskBoard) -> String {
    let mut out = String::new();
    let mut header = Vec::new();

    if let Some(day) = board.day {
        header.push(format!("Day {}", day));
    }
    if let Some(stats) = &board.stats {
        header.push(format!("Streak: {}", stats.streak));
        header.push(format!("Hearts: {}", stats.hearts));
        header.push(format!("XP: {}", stats.xp));
        header.push(format!("Level: {}", stats.level));
    }
    if !header.is_empty() {
        out.push_str(&header.join(" | "));
        out.push('\n');
    }

    for item in &board.items {
        let mark = if item.completed { 'x' } else { ' ' };
        out.push_str(&format!("  [{}] {}. {}\n", mark, item.id, item.text));
    }

    out
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
