//! Typed errors for the Live Share client runtime.

use thiserror::Error;

/// An RPC error object as returned by a JSON-RPC 2.0 peer.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Every error this crate's public surface can return.
///
/// Variants are grouped by validation, transport, protocol, RPC,
/// cancellation, and local I/O concerns. Callers are expected to match on
/// these, not on the formatted message.
#[derive(Debug, Error)]
pub enum Error {
    /// A `Connection` (or a value meant to become one) was missing a
    /// required field.
    #[error("invalid connection: field `{field}` is empty")]
    InvalidConnection { field: &'static str },

    /// Discovery failed to resolve a workspace into a `Connection`.
    #[error("discovery failed: {reason}{}", .status.map(|s| format!(" (http {s})")).unwrap_or_default())]
    Discovery {
        reason: String,
        status: Option<u16>,
    },

    /// The WebSocket handshake to the relay failed before authentication.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The relay rejected the session credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The tunnel (or a stream riding on it) is closed.
    #[error("connection closed")]
    Closed,

    /// A frame could not be parsed as the expected protocol element.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server returned a JSON-RPC error object.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A second `startSharing` call for the same `(protocol, port)` pair was
    /// attempted while the first was still outstanding.
    #[error("a startSharing call for {protocol}:{port} is already outstanding")]
    AlreadySharing { protocol: String, port: u16 },

    /// The operation was cancelled by its caller before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// A stream was reset (closed abnormally) by the peer.
    #[error("stream reset")]
    StreamReset,

    /// Binding the local TCP listener failed.
    #[error("listen failed: {0}")]
    Listen(#[source] std::io::Error),

    /// Local TCP I/O (accept, read, write) failed.
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
