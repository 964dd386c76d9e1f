//! Domain-specific error types for the tilewall engine.
//!
//! All fallible operations return `Result<T, WallError>`.
//! Pool exhaustion is deliberately absent: an empty pool makes the
//! caller wait, it never fails.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming engine.
#[derive(Debug, Error)]
pub enum WallError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/UDP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection in an orderly way (zero-byte read).
    #[error("peer closed the connection")]
    PeerClosed,

    /// No connection is registered under this id.
    #[error("unknown connection id {0}")]
    UnknownConnection(u64),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The streamer lost its transport and no longer accepts frames.
    #[error("stream closed")]
    StreamClosed,

    // ── Protocol Errors ──────────────────────────────────────────
    /// A group header or handshake record could not be parsed.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A group announced more blocks than the receiver can hold.
    #[error("unexpected block count: {count} (capacity {capacity})")]
    UnexpectedBlockCount { count: usize, capacity: usize },

    /// Control packet did not start with the expected magic.
    #[error("invalid magic bytes: expected TWL0")]
    InvalidMagic,

    /// The control payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Configuration Errors ─────────────────────────────────────
    /// A group or message referenced an instance nobody registered.
    #[error("unknown instance id {0}")]
    UnknownInstance(u32),

    /// Typed configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A state machine was asked for a transition it does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Timeouts ─────────────────────────────────────────────────
    /// A barrier or release message did not arrive in time.
    #[error("sync timeout after {0:?}")]
    SyncTimeout(Duration),

    /// Allocated nodes did not all report readiness in time.
    #[error("registration of instance {instance} timed out after {after:?}")]
    RegistrationTimeout { instance: u32, after: Duration },

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a control payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Task Errors ─────────────────────────────────────────────
    /// A spawned worker failed.
    #[error("task error: {0}")]
    Task(#[from] TaskError),
}

impl WallError {
    /// Whether this error ends the connection it was raised on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            WallError::Connection(_)
                | WallError::PeerClosed
                | WallError::MalformedHeader(_)
                | WallError::UnexpectedBlockCount { .. }
                | WallError::InvalidMagic
                | WallError::ChecksumMismatch
        )
    }
}

// ── TaskError ─────────────────────────────────────────────────────

/// Typed error for spawned workers.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The worker exceeded its deadline and was cancelled.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The worker was cancelled via `CancellationToken`.
    #[error("task was cancelled")]
    Cancelled,

    /// The worker's async work returned an I/O error.
    #[error("task I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic worker failure with a human-readable message.
    #[error("task failed: {0}")]
    Failed(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WallError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        WallError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for WallError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        WallError::Encoding(e.to_string())
    }
}

impl From<std::num::ParseIntError> for WallError {
    fn from(e: std::num::ParseIntError) -> Self {
        WallError::MalformedHeader(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = WallError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = WallError::UnexpectedBlockCount {
            count: 1000,
            capacity: 8,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains('8'));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: WallError = io_err.into();
        assert!(matches!(e, WallError::Connection(_)));
        assert!(e.is_fatal_to_connection());
    }

    #[test]
    fn unknown_instance_is_not_fatal() {
        assert!(!WallError::UnknownInstance(3).is_fatal_to_connection());
        assert!(WallError::PeerClosed.is_fatal_to_connection());
    }

    #[test]
    fn parse_int_maps_to_malformed_header() {
        let e: WallError = "x1".parse::<u32>().unwrap_err().into();
        assert!(matches!(e, WallError::MalformedHeader(_)));
    }
}
