//! Error types for the protocol layer.
//!
//! Each crate in Tether defines its own error enum. When you see a
//! `ProtocolError`, the problem is in how bytes were framed or what a
//! packet said, not in the socket underneath or the session above.

/// Errors that can occur while packing, unpacking, or negotiating.
///
/// Framing errors (`InvalidPacketType`, `ReadExpectedDataFailed`,
/// `MalformedRemainingLength`, `MalformedPacket`) are always fatal to the
/// connection that produced them: once the byte stream is out of step
/// there is no way to find the next packet boundary again.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The type byte of a fixed header is not one of the seven known
    /// packet types. Tag 0 (the `Invalid` sentinel) lands here too.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Fewer bytes were available than the header (or a length prefix
    /// inside the body) promised.
    #[error("read expected data failed: expected {expected} bytes, got {actual}")]
    ReadExpectedDataFailed {
        /// How many bytes the framing required.
        expected: usize,
        /// How many were actually there.
        actual: usize,
    },

    /// The remaining-length varint did not terminate within 4 bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// The packet body is too large to describe in a 4-byte varint.
    #[error("packet body of {0} bytes exceeds the remaining-length limit")]
    PacketTooLarge(usize),

    /// The body decoded but broke a structural rule (trailing bytes,
    /// oversized length prefix, ...).
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A CONNECT_ACK carried a return code outside the known table.
    #[error("invalid return code: {0}")]
    InvalidReturnCode(i32),

    /// The client identifier bytes are not valid UTF-8.
    #[error("client identifier is not valid UTF-8")]
    InvalidIdentifier,

    /// Handshake refused: the peer does not speak our protocol version.
    #[error("connection refused: bad protocol version")]
    BadProtocolVersion,

    /// Handshake refused: the client identifier is empty or too long.
    #[error("connection refused: invalid client identifier")]
    RefusedInvalidIdentifier,

    /// The underlying byte stream failed.
    ///
    /// `tokio_util`'s `Decoder`/`Encoder` require `From<io::Error>`, so
    /// reads and writes through a framed transport surface here.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Presentation-layer serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Presentation-layer deserialization failed.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}

impl ProtocolError {
    /// Returns `true` for errors that mean the byte stream lost sync.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::InvalidPacketType(_)
                | Self::ReadExpectedDataFailed { .. }
                | Self::MalformedRemainingLength
                | Self::MalformedPacket(_)
                | Self::InvalidReturnCode(_)
                | Self::InvalidIdentifier
        )
    }

    /// Returns `true` if the peer refused the handshake.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::BadProtocolVersion | Self::RefusedInvalidIdentifier)
    }
}
