// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they occur in the pipeline and carry
//! enough context to debug a stuck replication link.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Io` | Yes | Transport errors, connection drops, timeouts |
//! | `ConnectionFailed` | Yes | Peer unreachable during `start()` |
//! | `DeliveryFailed` | Yes | One operation exhausted its retry budget |
//! | `BackpressureExceeded` | No | Outbound queue overflow |
//! | `MissingStableIdentifier` | No | Entity has no uuid property |
//! | `Handshake` | No | Credential or protocol mismatch |
//! | `Wire` | No | Malformed frame (corrupt at the source) |
//! | `NotRunning` | No | `stop()` called on an idle engine |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Retryable errors indicate transient
//! network or availability problems. Non-retryable errors indicate bad
//! data, bad credentials, or bugs in the caller.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transport I/O error.
    ///
    /// Connection drops, resets and timeouts while talking to the peer.
    /// Retryable with backoff.
    #[error("I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Peer unreachable while establishing the connection in `start()`.
    ///
    /// Fatal to that `start()` call; the engine returns to `Idle` and the
    /// operator may retry explicitly.
    #[error("connection to peer {peer_id} failed: {message}")]
    ConnectionFailed { peer_id: String, message: String },

    /// A single operation exhausted its retry budget.
    ///
    /// The dispatcher pauses further sends and reconnects; the operation
    /// is retained and resent once connectivity is restored.
    #[error("delivery failed for op seq {sequence} after {attempts} attempts")]
    DeliveryFailed { sequence: u64, attempts: usize },

    /// The bounded outbound queue overflowed.
    ///
    /// The commit path is never blocked; the event is dropped and the
    /// condition is surfaced on the engine status.
    #[error("outbound queue full (capacity {capacity})")]
    BackpressureExceeded { capacity: usize },

    /// An entity participating in replication has no stable identifier.
    ///
    /// Internal ids cannot be trusted across peers, so the operation is
    /// dropped and logged. Does not halt the stream.
    #[error("missing stable identifier on {entity}")]
    MissingStableIdentifier { entity: String },

    /// Handshake rejected: bad credentials or protocol mismatch.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed wire frame.
    ///
    /// The payload is corrupt at the source; not retryable.
    #[error("wire error: {0}")]
    Wire(String),

    /// `stop()` called while the engine is not running.
    ///
    /// Reported rather than fatal, mirroring an unguarded operator stop.
    #[error("engine is not running")]
    NotRunning,

    /// Engine state machine violation.
    ///
    /// E.g. calling `start()` on an engine that already ran its one
    /// start/stop cycle. Indicates a bug in the caller.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an I/O error with the operation that failed.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::DeliveryFailed { .. } => true,
            Self::BackpressureExceeded { .. } => false,
            Self::MissingStableIdentifier { .. } => false,
            Self::Handshake(_) => false,
            Self::Wire(_) => false,
            Self::NotRunning => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Wire(e.to_string())
    }
}
