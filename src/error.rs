//! Error types for gbxrpc.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server did not present the expected protocol identifier.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Protocol violation (oversized frame, broken envelope, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A reader was pointed at a node that does not have the requested shape.
    #[error("malformed response structure: {0}")]
    Structure(String),

    /// Server-reported fault, surfaced through the awaitable call path.
    #[error(transparent)]
    Fault(#[from] Fault),

    /// Operation requires a live socket.
    #[error("not connected")]
    NotConnected,

    /// The engine shut down before the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Programmer error, rejected synchronously.
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// Invalid builder configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A fault reported by the server, either for a whole multicall or for
/// one call inside an otherwise accepted batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fault {code}: {message}")]
pub struct Fault {
    /// Numeric fault code from the `faultCode` member.
    pub code: i32,
    /// Human-readable text from the `faultString` member.
    pub message: String,
}

impl Fault {
    /// Create a new fault value.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
