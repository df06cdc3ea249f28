//! Connection engine.
//!
//! One task owns everything: the lifecycle state machine, the live socket,
//! the pending-request table, the offline queue, the task tracker, and every
//! timer. Commands arrive over a channel from [`GatewayClient`] handles and
//! answers go back over oneshots, so there is no shared mutable state and no
//! lock ordering to reason about.
//!
//! Timers are plain `Option<Instant>` fields selected on each loop turn. A
//! cancelled timer is a field set back to `None`; a timer that fires after
//! its phase ended reaches the state machine as a stale input and is
//! ignored there. Teardown therefore cannot race its own deadlines.
//!
//! [`GatewayClient`]: crate::handle::GatewayClient

use crate::events::{EventBus, GatewayEvent, SubscriptionId};
use crate::transport::{Link, SocketEvent, Transport};
use gatelink_core::{
    wire::{self, ChallengePayload},
    ClientError, ClientSettings, ConnectionEffect, ConnectionInput, ConnectionMachine,
    DeviceIdentity, ErrorShape, Frame, IdempotencyKey, OfflineQueue, Phase, PhaseSnapshot,
    QueueItem, RequestId, Result, RetryPolicy, StateStore, SystemTimeSource, TaskBoard,
    TaskTracker, TimeSource,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Tunables for the engine loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long to wait for a `connect.challenge` after the socket opens
    pub challenge_window: Duration,
    /// Upper bound on one dial attempt
    pub connect_timeout: Duration,
    /// Budget for any in-flight request, the connect handshake included
    pub request_timeout: Duration,
    /// Heartbeat ping cadence while connected
    pub ping_interval: Duration,
    /// The link is declared dead after this many silent ping intervals
    pub liveness_multiplier: u32,
    /// Reconnect backoff shape
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            challenge_window: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(30),
            liveness_multiplier: 2,
            retry: RetryPolicy::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Commands and Receipts
// ----------------------------------------------------------------------------

/// What a send attempt did with the message.
///
/// Either way the message is already on the durable queue; it leaves the
/// queue only when the gateway acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    /// Handed to the live link; the ack will clear it from the queue
    Sent,
    /// No live link right now; it will flush on the next connect
    Queued,
}

/// Commands from handles to the engine task.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    SendMessage {
        text: String,
        done: oneshot::Sender<SendReceipt>,
    },
    Request {
        method: String,
        params: Value,
        done: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        name: Option<String>,
        done: oneshot::Sender<(SubscriptionId, mpsc::UnboundedReceiver<GatewayEvent>)>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Shutdown,
}

// ----------------------------------------------------------------------------
// Pending Requests
// ----------------------------------------------------------------------------

struct PendingRequest {
    method: String,
    /// Caller waiting for the response, absent for engine-internal requests
    reply: Option<oneshot::Sender<Result<Value>>>,
    /// Queue entry to acknowledge when this request succeeds
    ack: Option<IdempotencyKey>,
    deadline: Instant,
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

pub(crate) struct Engine<T: Transport> {
    config: EngineConfig,
    settings: ClientSettings,
    store: Box<dyn StateStore>,
    /// `None` means the device keypair could not be loaded or generated;
    /// the handshake goes out unsigned and the gateway decides.
    identity: Option<DeviceIdentity>,
    machine: ConnectionMachine,
    transport: T,
    link: Option<Link>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    pending: HashMap<RequestId, PendingRequest>,
    /// Id of the in-flight connect request, tracked separately because its
    /// response drives the state machine instead of a caller
    connect_request: Option<RequestId>,
    queue: OfflineQueue,
    /// Idempotency keys sent on the current link and not yet acknowledged.
    /// Cleared on teardown, so the next session retries them.
    in_flight: HashSet<IdempotencyKey>,
    tracker: TaskTracker,
    bus: EventBus,
    clock: SystemTimeSource,
    /// Stable per-process id sent in the connect request
    instance_id: String,
    phase_tx: watch::Sender<PhaseSnapshot>,
    board_tx: watch::Sender<TaskBoard>,
    challenge_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    ping_deadline: Option<Instant>,
    liveness_deadline: Option<Instant>,
}

/// Sleep until `at`, or forever when there is no deadline.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

/// Next inbound socket event, or pending when there is no link.
async fn next_socket_event(link: &mut Option<Link>) -> Option<SocketEvent> {
    match link {
        Some(link) => link.rx.recv().await,
        None => futures::future::pending().await,
    }
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(
        transport: T,
        mut store: Box<dyn StateStore>,
        mut settings: ClientSettings,
        config: EngineConfig,
        cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        phase_tx: watch::Sender<PhaseSnapshot>,
        board_tx: watch::Sender<TaskBoard>,
    ) -> Self {
        let identity = match DeviceIdentity::load_or_generate(store.as_mut()) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(error = %e, "device identity unavailable, handshake will be unsigned");
                None
            }
        };
        let queue = match OfflineQueue::load(store.as_ref()) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(error = %e, "offline queue unreadable, starting empty");
                OfflineQueue::default()
            }
        };
        // A token adopted in an earlier run outlives the process; explicit
        // configuration still wins over the persisted copy.
        if settings.auth_token.is_none() {
            match ClientSettings::load_or_default(store.as_ref()) {
                Ok(persisted) if persisted.auth_token.is_some() => {
                    debug!("reusing persisted device token");
                    settings.auth_token = persisted.auth_token;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "persisted settings unreadable"),
            }
        }

        Self {
            config,
            settings,
            store,
            identity,
            machine: ConnectionMachine::new(),
            transport,
            link: None,
            cmd_rx,
            pending: HashMap::new(),
            connect_request: None,
            queue,
            in_flight: HashSet::new(),
            tracker: TaskTracker::new(),
            bus: EventBus::new(),
            clock: SystemTimeSource,
            instance_id: Uuid::new_v4().to_string(),
            phase_tx,
            board_tx,
            challenge_deadline: None,
            retry_deadline: None,
            ping_deadline: None,
            liveness_deadline: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(url = %self.settings.gateway_url, "gateway engine started");

        loop {
            let challenge_at = self.challenge_deadline;
            let retry_at = self.retry_deadline;
            let ping_at = self.ping_deadline;
            let liveness_at = self.liveness_deadline;
            let sweep_at = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("all client handles dropped, stopping engine");
                        break;
                    }
                },
                event = next_socket_event(&mut self.link) => {
                    self.handle_socket_event(event).await;
                }
                _ = deadline(challenge_at) => {
                    self.challenge_deadline = None;
                    self.apply(ConnectionInput::ChallengeWindowElapsed).await;
                }
                _ = deadline(retry_at) => {
                    self.retry_deadline = None;
                    self.apply(ConnectionInput::RetryDue).await;
                }
                _ = deadline(ping_at) => {
                    self.on_ping_due().await;
                }
                _ = deadline(liveness_at) => {
                    self.liveness_deadline = None;
                    self.apply(ConnectionInput::LivenessExpired).await;
                }
                _ = deadline(sweep_at) => {
                    self.sweep_request_timeouts().await;
                }
            }
        }

        self.teardown("engine stopped");
        info!("gateway engine stopped");
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) -> ControlFlow<()> {
        match cmd {
            EngineCommand::Connect => {
                self.apply(ConnectionInput::ConnectRequested).await;
            }
            EngineCommand::Disconnect { done } => {
                self.apply(ConnectionInput::DisconnectRequested).await;
                let _ = done.send(());
            }
            EngineCommand::SendMessage { text, done } => {
                let receipt = self.send_message(text);
                let _ = done.send(receipt);
            }
            EngineCommand::Request {
                method,
                params,
                done,
            } => {
                self.start_request(method, params, done);
            }
            EngineCommand::Subscribe { name, done } => {
                let _ = done.send(self.bus.subscribe(name));
            }
            EngineCommand::Unsubscribe { id } => {
                self.bus.unsubscribe(id);
            }
            EngineCommand::Shutdown => {
                self.apply(ConnectionInput::DisconnectRequested).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Queue the message durably, then try the live link.
    ///
    /// This never waits on the network: the receipt says whether the message
    /// went out now or rides the queue until the next connect.
    fn send_message(&mut self, text: String) -> SendReceipt {
        let item = QueueItem::new(text.clone(), None, self.clock.now());
        let key = item.idempotency_key.clone();
        if let Err(e) = self.queue.enqueue(self.store.as_mut(), item) {
            warn!(error = %e, "offline queue persist failed, keeping message in memory");
        }

        if self.machine.phase() != Phase::Connected {
            return SendReceipt::Queued;
        }
        let request = wire::chat_send(&self.settings.session_key(), &text, &key);
        if !self.send_frame(&request.frame) {
            return SendReceipt::Queued;
        }
        self.in_flight.insert(key.clone());
        self.pending.insert(
            request.id,
            PendingRequest {
                method: request.method,
                reply: None,
                ack: Some(key),
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
        SendReceipt::Sent
    }

    fn start_request(&mut self, method: String, params: Value, done: oneshot::Sender<Result<Value>>) {
        if self.machine.phase() != Phase::Connected {
            let _ = done.send(Err(ClientError::NotConnected));
            return;
        }
        let request = wire::request(&method, params);
        if !self.send_frame(&request.frame) {
            let _ = done.send(Err(ClientError::transport_failed("socket write failed")));
            return;
        }
        self.pending.insert(
            request.id,
            PendingRequest {
                method,
                reply: Some(done),
                ack: None,
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
    }

    // ------------------------------------------------------------------
    // Socket handling
    // ------------------------------------------------------------------

    async fn handle_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Frame(text)) => self.on_frame(&text).await,
            Some(SocketEvent::Closed { reason }) => {
                self.link = None;
                self.apply(ConnectionInput::SocketClosed { reason }).await;
            }
            None => {
                self.link = None;
                self.apply(ConnectionInput::SocketClosed {
                    reason: "socket closed".to_string(),
                })
                .await;
            }
        }
    }

    async fn on_frame(&mut self, raw: &str) {
        self.touch_liveness();
        match wire::decode(raw) {
            Ok(Frame::Response {
                id,
                ok,
                error,
                result,
            }) => self.on_response(id, ok, error, result).await,
            Ok(Frame::Event { event, payload }) => self.on_event(event, payload).await,
            Ok(Frame::Request { method, .. }) => {
                debug!(%method, "ignoring gateway-initiated request");
            }
            Err(e) => {
                let preview: String = raw.chars().take(120).collect();
                warn!(error = %e, frame = %preview, "dropping malformed frame");
            }
        }
    }

    async fn on_response(
        &mut self,
        id: RequestId,
        ok: bool,
        error: Option<ErrorShape>,
        result: Option<Value>,
    ) {
        // The connect response drives the state machine, not a caller.
        if self.connect_request.as_ref() == Some(&id) {
            self.connect_request = None;
            self.pending.remove(&id);
            if ok {
                let summary = wire::summarize_connect_result(result.as_ref());
                self.adopt_device_token(summary.device_token.as_deref());
                if let Some(tick) = summary.tick_interval_ms {
                    debug!(tick_ms = tick, "gateway advertised tick interval");
                }
                self.apply(ConnectionInput::ConnectAccepted).await;
            } else {
                let error = error.unwrap_or_else(|| ErrorShape {
                    code: "UNKNOWN".to_string(),
                    message: "connect rejected without error body".to_string(),
                    retryable: false,
                    details: None,
                });
                warn!(code = %error.code, message = %error.message, "connect rejected");
                self.apply(ConnectionInput::ConnectRejected { error }).await;
            }
            return;
        }

        let Some(entry) = self.pending.remove(&id) else {
            debug!(id = %id, "response for unknown request");
            return;
        };
        if ok {
            if let Some(key) = &entry.ack {
                self.in_flight.remove(key);
                match self.queue.acknowledge(self.store.as_mut(), key) {
                    Ok(true) => debug!(key = %key, "queued message acknowledged"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "failed to persist queue ack"),
                }
            }
            if let Some(reply) = entry.reply {
                let _ = reply.send(Ok(result.unwrap_or(Value::Null)));
            }
        } else {
            let (code, message) = error
                .map(|e| (e.code, e.message))
                .unwrap_or_else(|| ("UNKNOWN".to_string(), "request failed".to_string()));
            if entry.ack.is_some() {
                // The item stays queued and in_flight: no resend on this
                // link, retried on the next session.
                warn!(method = %entry.method, %code, %message, "queued send rejected, keeping for later");
            }
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(ClientError::request_rejected(code, message)));
            }
        }
    }

    async fn on_event(&mut self, event: String, payload: Option<Value>) {
        if event == wire::EVENT_CONNECT_CHALLENGE {
            match ChallengePayload::from_value(payload.as_ref()) {
                Ok(challenge) => {
                    self.apply(ConnectionInput::ChallengeReceived {
                        nonce: challenge.nonce,
                    })
                    .await;
                }
                // An unusable challenge is ignored; the window timer will
                // send the unsigned-nonce handshake instead.
                Err(e) => warn!(error = %e, "dropping unusable challenge event"),
            }
            return;
        }

        if let Some(board) = self.tracker.handle_event(payload.as_ref()) {
            self.board_tx.send_replace(board);
        }
        self.bus.publish(&GatewayEvent { name: event, payload });
    }

    // ------------------------------------------------------------------
    // State machine plumbing
    // ------------------------------------------------------------------

    /// Feed one input through the machine and execute the effects. Effects
    /// that produce follow-up inputs (a dial that fails, a write that hits a
    /// dead socket) are processed in the same pass.
    async fn apply(&mut self, input: ConnectionInput) {
        let mut inputs = VecDeque::new();
        inputs.push_back(input);
        while let Some(input) = inputs.pop_front() {
            for effect in self.machine.handle(input) {
                if let Some(follow_up) = self.execute(effect).await {
                    inputs.push_back(follow_up);
                }
            }
        }
        self.publish_phase();
    }

    async fn execute(&mut self, effect: ConnectionEffect) -> Option<ConnectionInput> {
        match effect {
            ConnectionEffect::OpenSocket => self.open_socket().await,
            ConnectionEffect::ArmChallengeWindow => {
                self.challenge_deadline = Some(Instant::now() + self.config.challenge_window);
                None
            }
            ConnectionEffect::SendConnectRequest { nonce } => {
                self.send_connect_request(nonce.as_deref())
            }
            ConnectionEffect::StartHeartbeat => {
                self.ping_deadline = Some(Instant::now() + self.config.ping_interval);
                self.touch_liveness();
                None
            }
            ConnectionEffect::FlushQueue => {
                self.flush_queue();
                None
            }
            ConnectionEffect::Teardown { reason } => {
                self.teardown(&reason);
                None
            }
            ConnectionEffect::ScheduleReconnect { attempt } => {
                self.schedule_reconnect(attempt);
                None
            }
        }
    }

    async fn open_socket(&mut self) -> Option<ConnectionInput> {
        let url = self.settings.gateway_url.clone();
        info!(%url, "dialing gateway");
        match tokio::time::timeout(self.config.connect_timeout, self.transport.open(&url)).await {
            Ok(Ok(link)) => {
                self.link = Some(link);
                Some(ConnectionInput::SocketOpened)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "dial failed");
                Some(ConnectionInput::SocketClosed {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("dial timed out");
                Some(ConnectionInput::SocketClosed {
                    reason: "dial timed out".to_string(),
                })
            }
        }
    }

    fn send_connect_request(&mut self, nonce: Option<&str>) -> Option<ConnectionInput> {
        self.challenge_deadline = None;
        let request = wire::connect_request(
            &self.settings,
            self.identity.as_ref(),
            nonce,
            &self.instance_id,
            self.clock.now(),
        );
        debug!(
            id = %request.id,
            signed = self.identity.is_some(),
            challenge = nonce.is_some(),
            "sending connect request"
        );
        if !self.send_frame(&request.frame) {
            return Some(ConnectionInput::SocketClosed {
                reason: "socket write failed".to_string(),
            });
        }
        self.pending.insert(
            request.id.clone(),
            PendingRequest {
                method: request.method,
                reply: None,
                ack: None,
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
        self.connect_request = Some(request.id);
        None
    }

    /// Send every queued item that is not already riding this link.
    fn flush_queue(&mut self) {
        let items = self.queue.snapshot();
        if items.is_empty() {
            return;
        }
        info!(count = items.len(), "flushing offline queue");
        let session_key = self.settings.session_key();
        for item in items {
            if self.in_flight.contains(&item.idempotency_key) {
                continue;
            }
            let request = wire::chat_send(&session_key, &item.text, &item.idempotency_key);
            if !self.send_frame(&request.frame) {
                warn!("link lost mid-flush, remaining items stay queued");
                return;
            }
            self.in_flight.insert(item.idempotency_key.clone());
            self.pending.insert(
                request.id,
                PendingRequest {
                    method: request.method,
                    reply: None,
                    ack: Some(item.idempotency_key),
                    deadline: Instant::now() + self.config.request_timeout,
                },
            );
        }
    }

    /// Drop the link and every timer, then fail all pending requests.
    /// Safe to call twice; the second call finds nothing to do.
    fn teardown(&mut self, reason: &str) {
        self.link = None;
        self.challenge_deadline = None;
        self.retry_deadline = None;
        self.ping_deadline = None;
        self.liveness_deadline = None;
        self.connect_request = None;
        self.in_flight.clear();
        self.tracker.reset();

        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), %reason, "rejecting pending requests");
            for (_, entry) in self.pending.drain() {
                if let Some(reply) = entry.reply {
                    let _ = reply.send(Err(ClientError::connection_closed(reason)));
                }
            }
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let delay = self
            .config
            .retry
            .jittered_delay(attempt, rand::random::<f64>());
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.retry_deadline = Some(Instant::now() + delay);
    }

    // ------------------------------------------------------------------
    // Heartbeat and timeouts
    // ------------------------------------------------------------------

    async fn on_ping_due(&mut self) {
        if self.machine.phase() != Phase::Connected {
            self.ping_deadline = None;
            return;
        }
        let request = wire::ping();
        if !self.send_frame(&request.frame) {
            self.ping_deadline = None;
            self.link = None;
            self.apply(ConnectionInput::SocketClosed {
                reason: "socket write failed".to_string(),
            })
            .await;
            return;
        }
        self.pending.insert(
            request.id,
            PendingRequest {
                method: request.method,
                reply: None,
                ack: None,
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
        self.ping_deadline = Some(Instant::now() + self.config.ping_interval);
    }

    /// Any inbound traffic counts as proof of life.
    fn touch_liveness(&mut self) {
        if self.machine.phase() == Phase::Connected {
            let budget = self.config.ping_interval * self.config.liveness_multiplier;
            self.liveness_deadline = Some(Instant::now() + budget);
        }
    }

    async fn sweep_request_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut connect_timed_out = false;
        for id in expired {
            let Some(entry) = self.pending.remove(&id) else {
                continue;
            };
            if self.connect_request.as_ref() == Some(&id) {
                self.connect_request = None;
                connect_timed_out = true;
                continue;
            }
            warn!(method = %entry.method, "request timed out");
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(ClientError::RequestTimeout {
                    duration_ms: self.config.request_timeout.as_millis() as u64,
                }));
            }
        }

        if connect_timed_out {
            warn!("connect request timed out");
            self.link = None;
            self.apply(ConnectionInput::SocketClosed {
                reason: "connect request timed out".to_string(),
            })
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Persist a gateway-minted device token for subsequent connects.
    fn adopt_device_token(&mut self, token: Option<&str>) {
        let Some(token) = token else { return };
        if self.settings.auth_token.as_deref() == Some(token) {
            return;
        }
        self.settings.auth_token = Some(token.to_string());
        match self.settings.save(self.store.as_mut()) {
            Ok(()) => debug!("device token stored"),
            Err(e) => warn!(error = %e, "failed to persist device token"),
        }
    }

    fn send_frame(&mut self, frame: &str) -> bool {
        match &self.link {
            Some(link) => link.tx.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    fn publish_phase(&mut self) {
        let snapshot = self.machine.snapshot();
        let changed = self.phase_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot.clone();
                true
            }
        });
        if changed {
            info!(phase = %snapshot.phase, detail = ?snapshot.detail, "connection phase changed");
        }
    }
}
