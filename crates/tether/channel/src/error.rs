//! Error types for tether-channel.

use thiserror::Error;

/// Errors raised by the channel, the protocol client and the transports.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The endpoint could not be turned into a socket URL.
    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),

    /// The transport could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The established transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A text packet could not be decoded.
    #[error("malformed packet {packet:?}: {reason}")]
    Decode { packet: String, reason: String },

    /// The channel is closed; nothing more can be sent.
    #[error("channel closed")]
    Closed,

    /// The session has not completed its handshake.
    #[error("session not open")]
    NotOpen,

    /// The remote did not complete the handshake in time.
    #[error("handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    /// The remote refused or ended the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An event name was registered twice.
    #[error("handler already registered for event {0:?}")]
    DuplicateHandler(String),

    /// A payload could not be serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
