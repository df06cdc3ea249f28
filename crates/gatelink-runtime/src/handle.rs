//! Client handle.
//!
//! [`GatewayClient`] is the only way into the engine: a cheap, cloneable
//! bundle of channel endpoints. Commands go in over a channel and answers
//! come back over oneshots; the connection phase and task board are
//! observed through watch channels. No method here touches engine state
//! directly.

use crate::engine::{Engine, EngineCommand, EngineConfig, SendReceipt};
use crate::events::{GatewayEvent, SubscriptionId};
use crate::transport::Transport;
use gatelink_core::{
    ClientError, ClientSettings, PhaseSnapshot, Result, StateStore, TaskBoard,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

// ----------------------------------------------------------------------------
// Gateway Client
// ----------------------------------------------------------------------------

/// Handle to a running connection engine.
#[derive(Clone)]
pub struct GatewayClient {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    phase_rx: watch::Receiver<PhaseSnapshot>,
    board_rx: watch::Receiver<TaskBoard>,
}

impl GatewayClient {
    /// Start an engine task and return its handle.
    ///
    /// The engine stops when [`shutdown`](Self::shutdown) is called or when
    /// every handle clone has been dropped.
    pub fn spawn<T, S>(
        transport: T,
        store: S,
        settings: ClientSettings,
        config: EngineConfig,
    ) -> Self
    where
        T: Transport + 'static,
        S: StateStore + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(PhaseSnapshot::default());
        let (board_tx, board_rx) = watch::channel(TaskBoard::default());
        let engine = Engine::new(
            transport,
            Box::new(store),
            settings,
            config,
            cmd_rx,
            phase_tx,
            board_tx,
        );
        tokio::spawn(engine.run());
        Self {
            cmd_tx,
            phase_rx,
            board_rx,
        }
    }

    /// Ask the engine to establish a connection. Returns immediately; watch
    /// [`watch_phase`](Self::watch_phase) for the outcome. A no-op when a
    /// connection attempt is already active.
    pub fn connect(&self) -> Result<()> {
        self.send(EngineCommand::Connect)
    }

    /// Tear the connection down. Every pending request fails with a
    /// connection-closed error and no reconnect is scheduled. Resolves
    /// once the engine has finished doing so.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(EngineCommand::Disconnect { done })?;
        wait.await
            .map_err(|_| ClientError::channel_error("engine stopped"))
    }

    /// Send a chat message. Never waits on the network: the message is
    /// queued durably first and the receipt says whether it also went out
    /// on a live link.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<SendReceipt> {
        let (done, wait) = oneshot::channel();
        self.send(EngineCommand::SendMessage {
            text: text.into(),
            done,
        })?;
        wait.await
            .map_err(|_| ClientError::channel_error("engine stopped"))
    }

    /// Issue a request and wait for its response, the request timeout, or
    /// connection teardown, whichever comes first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (done, wait) = oneshot::channel();
        self.send(EngineCommand::Request {
            method: method.to_string(),
            params,
            done,
        })?;
        wait.await
            .map_err(|_| ClientError::channel_error("engine stopped"))?
    }

    /// Subscribe to one named gateway event.
    pub async fn subscribe(&self, event: &str) -> Result<Subscription> {
        self.subscribe_inner(Some(event.to_string())).await
    }

    /// Subscribe to every gateway event.
    pub async fn subscribe_all(&self) -> Result<Subscription> {
        self.subscribe_inner(None).await
    }

    async fn subscribe_inner(&self, name: Option<String>) -> Result<Subscription> {
        let (done, wait) = oneshot::channel();
        self.send(EngineCommand::Subscribe { name, done })?;
        let (id, rx) = wait
            .await
            .map_err(|_| ClientError::channel_error("engine stopped"))?;
        Ok(Subscription {
            id,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Current connection phase.
    pub fn phase(&self) -> PhaseSnapshot {
        self.phase_rx.borrow().clone()
    }

    /// Watch channel carrying every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<PhaseSnapshot> {
        self.phase_rx.clone()
    }

    /// Latest parsed task board.
    pub fn task_board(&self) -> TaskBoard {
        self.board_rx.borrow().clone()
    }

    /// Watch channel carrying every task board replacement.
    pub fn watch_board(&self) -> watch::Receiver<TaskBoard> {
        self.board_rx.clone()
    }

    /// Stop the engine task. Outstanding handles keep working only for
    /// already-buffered watch values after this.
    pub fn shutdown(&self) -> Result<()> {
        self.send(EngineCommand::Shutdown)
    }

    fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| ClientError::channel_error("engine stopped"))
    }
}

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

/// A live event subscription.
///
/// Dropping it unsubscribes; [`unsubscribe`](Self::unsubscribe) does the
/// same by consuming the handle.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` once unsubscribed or the engine has stopped.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Cancel this subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(EngineCommand::Unsubscribe { id: self.id });
    }
}
