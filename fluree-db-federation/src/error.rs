//! Error types for federated join evaluation

use thiserror::Error;

/// Low-level transport failure classes reported by remote result streams.
///
/// The first three are the "stream already abandoned" conditions that show up
/// when a consumer closes a partially-read HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Chunked transfer encoding was cut off mid-chunk
    MalformedChunk,
    /// The wire-format parser indexed past the end of a truncated buffer
    ParserIndex,
    /// Socket reset / broken pipe
    Socket,
    /// Anything else
    Other,
}

impl TransportErrorKind {
    /// Whether this condition is expected when closing an abandoned stream
    pub fn is_abandonment(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::MalformedChunk
                | TransportErrorKind::ParserIndex
                | TransportErrorKind::Socket
        )
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::MalformedChunk => "malformed chunk",
            TransportErrorKind::ParserIndex => "parser index",
            TransportErrorKind::Socket => "socket",
            TransportErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Federated evaluation errors
#[derive(Error, Debug)]
pub enum FederationError {
    /// A remote call or remote result stream failed
    #[error("Remote evaluation failed during {operation}: {message}")]
    RemoteEvaluation { operation: String, message: String },

    /// Raw transport failure, before normalisation by `RemoteResultStream`
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// ORDER BY key or aggregate argument could not be evaluated
    #[error("Expression evaluation failed: {0}")]
    ExpressionEvaluation(String),

    /// The consumer closed the cursor before it was exhausted
    #[error("Evaluation cancelled")]
    Cancelled,

    /// No aggregate service is registered for the key
    #[error("Unknown aggregate function: {0}")]
    UnknownAggregate(String),

    /// A bound-join row carried a missing or out-of-range `__index`
    #[error("Invalid bound join row: {0}")]
    InvalidBoundJoinRow(String),

    /// Worker or producer thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// Configuration rejected by `FederationConfig::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FederationError {
    /// Build a `RemoteEvaluation` error naming the failing sub-operation
    pub fn remote(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        FederationError::RemoteEvaluation {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Build a `Transport` error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        FederationError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// True for `Cancelled`, which is never surfaced to consumers
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FederationError::Cancelled)
    }
}

/// Result type for federation operations
pub type Result<T> = std::result::Result<T, FederationError>;
