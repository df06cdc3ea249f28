//! Gatelink Runtime Engine
//!
//! This crate contains the async engine for the Gatelink protocol, including:
//! - `Engine`: the single-owner task that runs the connection lifecycle
//! - `GatewayClient`: the cloneable handle used to drive it
//! - `Transport` / `WsTransport`: the socket abstraction and its WebSocket
//!   implementation
//! - `EventBus`: name-keyed fan-out of gateway events to subscribers
//!
//! This is the "engine" of Gatelink - it orchestrates the protocol logic
//! while `gatelink-core` provides the pure protocol definitions.

pub mod engine;
pub mod events;
pub mod handle;
pub mod transport;

pub use engine::{EngineConfig, SendReceipt};
pub use events::{EventBus, GatewayEvent, SubscriptionId};
pub use handle::{GatewayClient, Subscription};
pub use transport::{Link, SocketEvent, Transport, WsTransport};

// Re-export core types for convenience
pub use gatelink_core::{
    ClientError, ClientSettings, FileStore, MemoryStore, Phase, PhaseSnapshot, Result, StateStore,
    TaskBoard, TaskItem, TaskStats,
};
