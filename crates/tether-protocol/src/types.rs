//! Core protocol types for Tether's wire format.
//!
//! Every structure in this module travels on the wire. A packet is a
//! one-byte type tag, a variable-length "remaining length", and a body
//! whose layout depends on the type:
//!
//! ```text
//! +-----------+---------------------+----------------------------+
//! | type (1B) | remaining (1-4B var)| body (remaining bytes)     |
//! +-----------+---------------------+----------------------------+
//! ```
//!
//! The byte-level work lives in [`codec`](crate::codec); this module only
//! defines what the packets *are*.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// The protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: i32 = 1;

/// Longest client identifier a CONNECT may carry, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 65_535;

/// Largest value a 4-byte remaining-length varint can hold (2^28 - 1).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default cap on a received packet body: 1 MiB.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// ByteOrder
// ---------------------------------------------------------------------------

/// Byte order applied to every multi-byte field of a connection.
///
/// Both ends must agree; there is no negotiation on the wire. The
/// order is part of [`PacketCodec`](crate::PacketCodec) and of the
/// session layer's broker configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Network order, most significant byte first.
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

// ---------------------------------------------------------------------------
// PacketType
// ---------------------------------------------------------------------------

/// The seven control-packet kinds, with their stable wire tags.
///
/// Tag 0 is reserved as the `Invalid` sentinel. It has no variant here,
/// so it can never be constructed or sent; decoding it fails with
/// [`ProtocolError::InvalidPacketType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnectAck = 2,
    Heartbeat = 3,
    HeartbeatAck = 4,
    Publish = 5,
    PublishAck = 6,
    Disconnect = 7,
}

impl PacketType {
    /// The reserved tag that never appears on a well-formed stream.
    pub const INVALID_TAG: u8 = 0;

    /// The wire name, as it appears in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnectAck => "CONNECT_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::Publish => "PUBLISH",
            Self::PublishAck => "PUBLISH_ACK",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnectAck),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::HeartbeatAck),
            5 => Ok(Self::Publish),
            6 => Ok(Self::PublishAck),
            7 => Ok(Self::Disconnect),
            other => Err(ProtocolError::InvalidPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// FixedHeader
// ---------------------------------------------------------------------------

/// The mandatory leading part of every packet.
///
/// `remaining_length` is always derived from the serialized body; it is
/// never set by hand. See [`Packet::fixed_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub remaining_length: usize,
}

impl fmt::Display for FixedHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] RemainLength: {}", self.packet_type, self.remaining_length)
    }
}

// ---------------------------------------------------------------------------
// ReturnCode
// ---------------------------------------------------------------------------

/// The verdict carried by a CONNECT_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    Accepted = 0,
    RefusedBadProtocolVersion = 1,
    RefusedInvalidIdentifier = 2,
}

impl ReturnCode {
    /// Maps the code to the error a refused initiator reports.
    ///
    /// This is the fixed lookup table of the handshake: `Accepted` maps
    /// to `Ok(())`, every refusal to its own [`ProtocolError`].
    pub fn into_result(self) -> Result<(), ProtocolError> {
        match self {
            Self::Accepted => Ok(()),
            Self::RefusedBadProtocolVersion => Err(ProtocolError::BadProtocolVersion),
            Self::RefusedInvalidIdentifier => Err(ProtocolError::RefusedInvalidIdentifier),
        }
    }
}

impl TryFrom<i32> for ReturnCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::RefusedBadProtocolVersion),
            2 => Ok(Self::RefusedInvalidIdentifier),
            other => Err(ProtocolError::InvalidReturnCode(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Packet bodies
// ---------------------------------------------------------------------------

/// CONNECT: opens a logical session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_version: i32,
    /// Keepalive interval in whole seconds. 0 disables heartbeats.
    pub keepalive: i32,
    pub client_identifier: String,
}

impl Connect {
    /// Checks the client identifier.
    ///
    /// Empty identifiers and identifiers longer than
    /// [`MAX_IDENTIFIER_LEN`] bytes are refused. The protocol version is
    /// not looked at here; see [`Connect::check_version`].
    pub fn validate(&self) -> ReturnCode {
        let len = self.client_identifier.len();
        if len == 0 || len > MAX_IDENTIFIER_LEN {
            return ReturnCode::RefusedInvalidIdentifier;
        }
        ReturnCode::Accepted
    }

    /// Checks the requested version against the highest one we support.
    ///
    /// Versions are backwards compatible: any version in
    /// `1..=supported` is accepted, anything else is refused.
    pub fn check_version(&self, supported: i32) -> ReturnCode {
        if (1..=supported).contains(&self.protocol_version) {
            ReturnCode::Accepted
        } else {
            ReturnCode::RefusedBadProtocolVersion
        }
    }
}

/// CONNECT_ACK: the acceptor's answer to a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub return_code: ReturnCode,
}

/// PUBLISH: an application message. The payload is opaque here; the
/// [`presentation`](crate::presentation) layer gives it meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub message_id: u32,
    pub payload: Bytes,
}

/// PUBLISH_ACK: acknowledges a PUBLISH by message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub message_id: u32,
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One control packet of any kind.
///
/// A closed sum type: every `match` over it is checked for
/// exhaustiveness, so adding a packet kind forces every handler to
/// decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnectAck(ConnectAck),
    Heartbeat,
    HeartbeatAck,
    Publish(Publish),
    PublishAck(PublishAck),
    Disconnect,
}

impl Packet {
    /// Shorthand for a PUBLISH packet.
    pub fn publish(message_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::Publish(Publish {
            message_id,
            payload: payload.into(),
        })
    }

    /// The packet's type tag.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnectAck(_) => PacketType::ConnectAck,
            Self::Heartbeat => PacketType::Heartbeat,
            Self::HeartbeatAck => PacketType::HeartbeatAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PublishAck(_) => PacketType::PublishAck,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// Returns `true` for the packets the connection layer consumes
    /// itself and never hands to the application.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Heartbeat | Self::HeartbeatAck | Self::Disconnect)
    }

    /// The fixed header this packet would be sent with.
    pub fn fixed_header(&self) -> FixedHeader {
        FixedHeader {
            packet_type: self.packet_type(),
            remaining_length: self.body_len(),
        }
    }

    /// Exact serialized length of the body, without the fixed header.
    pub fn body_len(&self) -> usize {
        match self {
            Self::Connect(c) => 4 + 4 + 4 + c.client_identifier.len(),
            Self::ConnectAck(_) => 4,
            Self::Heartbeat | Self::HeartbeatAck | Self::Disconnect => 0,
            Self::Publish(p) => 4 + 4 + p.payload.len(),
            Self::PublishAck(_) => 4,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fixed_header())?;
        match self {
            Self::Connect(c) => write!(
                f,
                ", protocolVersion: {}, keepalive: {}, clientIdentifier: {}",
                c.protocol_version, c.keepalive, c.client_identifier
            ),
            Self::ConnectAck(a) => write!(f, ", returnCode: {}", a.return_code as i32),
            Self::Publish(p) => write!(
                f,
                ", messageID: {}, payload: {} bytes",
                p.message_id,
                p.payload.len()
            ),
            Self::PublishAck(a) => write!(f, ", messageID: {}", a.message_id),
            Self::Heartbeat | Self::HeartbeatAck | Self::Disconnect => Ok(()),
        }
    }
}
