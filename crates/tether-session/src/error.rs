//! Error types for the session layer.

use std::fmt;

use tether_protocol::{PacketType, ProtocolError};

/// Which way a timed-out operation was going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Errors that can occur in brokers and keepers.
///
/// Only three variants ever reach application code through the
/// [`Keeper`](crate::Keeper): `Cancelled`, `Closed` and `StartFailed`.
/// The rest are broker-level and drive the keeper's reconnect decisions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Framing, refusal or I/O failure from the protocol layer.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A read or write deadline expired. Recoverable: retried after a
    /// short backoff, never fatal to a connection on its own.
    #[error("{0} timed out")]
    Timeout(Direction),

    /// The peer closed the byte stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The handshake received the wrong kind of packet.
    #[error("expected {expected}, got {actual}")]
    UnexpectedPacket {
        expected: PacketType,
        actual: PacketType,
    },

    /// A reconnect produced a broker for a different logical connection.
    #[error("connection id mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// No HEARTBEAT_ACK arrived within one keepalive interval.
    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// The caller's cancellation token fired first.
    #[error("operation cancelled")]
    Cancelled,

    /// The keeper is closed or shutting down.
    #[error("keeper is closed")]
    Closed,

    /// The broker factory produced no broker when the keeper started.
    #[error("keeper failed to start: no broker")]
    StartFailed,
}

impl SessionError {
    /// Returns `true` for deadline expiries, the only errors the read
    /// and write loops retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
