//! Unified error type for Tether.

use tether_protocol::ProtocolError;
use tether_session::SessionError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A transport-level error (bind, accept, dial).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (framing, refused handshake).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (timeouts, keeper lifecycle).
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl TetherError {
    /// Returns `true` if the peer refused our CONNECT. Retrying with the
    /// same settings cannot succeed.
    pub fn is_refusal(&self) -> bool {
        match self {
            Self::Protocol(e) | Self::Session(SessionError::Protocol(e)) => e.is_refusal(),
            _ => false,
        }
    }
}
