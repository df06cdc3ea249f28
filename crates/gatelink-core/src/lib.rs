//! Gatelink Core Protocol Implementation
//!
//! This crate provides the protocol machinery for a gateway chat client:
//! the connection lifecycle state machine, the signed device handshake, the
//! wire frame codec, the streamed-update parser, and the durable offline
//! queue. Everything here is deliberately free of sockets and executors so
//! the protocol races can be tested as plain function calls; the runtime
//! crate supplies the I/O.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod errors;
pub mod identity;
pub mod parser;
pub mod queue;
pub mod retry;
pub mod settings;
pub mod state;
pub mod storage;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use errors::{ClientError, FrameError, Result};
pub use identity::{AuthContext, DeviceIdentity};
pub use parser::{DeltaAccumulator, MarkerAlphabet, ParsedUpdate, TaskBoard, TaskItem, TaskStats, TaskTracker};
pub use queue::{OfflineQueue, QueueItem};
pub use retry::RetryPolicy;
pub use settings::ClientSettings;
pub use state::{ConnectionEffect, ConnectionInput, ConnectionMachine, Phase, PhaseSnapshot};
pub use storage::{FileStore, MemoryStore, StateStore};
pub use types::{IdempotencyKey, RequestId, SystemTimeSource, TimeSource, Timestamp};
pub use wire::{ConnectSummary, ErrorShape, Frame, OutboundRequest};
