//! Error types for the Gatelink client
//!
//! This module contains all error types used throughout the client core,
//! including identity errors, frame errors, storage errors, and the main
//! ClientError type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Device identity error types
///
/// Every variant here is recoverable: a client without a usable device
/// identity still connects, it just sends an unsigned handshake.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Persisted identity record is unreadable: {reason}")]
    CorruptRecord { reason: String },
    #[error("Unsupported identity record version: {version}")]
    UnsupportedVersion { version: u32 },
}

/// Wire frame error types
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {reason}")]
    NotJson { reason: String },
    #[error("Frame missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("Unknown frame discriminant: {discriminant}")]
    UnknownDiscriminant { discriminant: String },
    #[error("Payload did not match expected shape: {reason}")]
    BadPayload { reason: String },
}

/// Persistent store error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Store is not available: {reason}")]
    Unavailable { reason: String },
    #[error("Read failed for key {key}: {reason}")]
    ReadFailed { key: String, reason: String },
    #[error("Write failed for key {key}: {reason}")]
    WriteFailed { key: String, reason: String },
    #[error("Stored value for key {key} failed to decode: {reason}")]
    Decode { key: String, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Client Error
// ----------------------------------------------------------------------------

/// Core error type for the Gatelink client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Gateway answered a request with an error frame.
    #[error("Request rejected ({code}): {message}")]
    RequestRejected { code: String, message: String },

    #[error("Request timed out after {duration_ms}ms")]
    RequestTimeout { duration_ms: u64 },

    /// The connection went away while a request was outstanding. Callers
    /// must treat this as "connection closed", not as a protocol error,
    /// and may re-enqueue the action for retry.
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Not connected to a gateway")]
    NotConnected,

    #[error("Transport failed: {reason}")]
    TransportFailed { reason: String },

    /// Channel communication error (internal to the engine architecture)
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ClientError {
    /// Create a request-rejected error from a wire error code and message
    pub fn request_rejected<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        ClientError::RequestRejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        ClientError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ClientError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport failure with a reason
    pub fn transport_failed<T: Into<String>>(reason: T) -> Self {
        ClientError::TransportFailed {
            reason: reason.into(),
        }
    }

    /// Create a connection-closed error with a reason
    pub fn connection_closed<T: Into<String>>(reason: T) -> Self {
        ClientError::ConnectionClosed {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ClientError>;
