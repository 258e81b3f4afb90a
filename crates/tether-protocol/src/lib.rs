//! Wire protocol for Tether.
//!
//! This crate defines the control packets that both ends of a Tether
//! connection exchange, and how they become bytes:
//!
//! - **Types** ([`Packet`], [`FixedHeader`], [`ReturnCode`], ...): the
//!   seven packet kinds and their fields.
//! - **Codec** ([`Packet::pack`], [`Packet::unpack`], [`PacketCodec`]):
//!   the bit-exact binary framing, including the remaining-length varint.
//! - **Presentation** ([`Presentation`], [`JsonPresentation`]): how
//!   applications put typed values into PUBLISH payloads.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! The protocol layer sits between transport (a byte stream) and session
//! (handshake, keepalive, reconnection). It knows nothing about sockets
//! or timers.
//!
//! ```text
//! Transport (bytes) → Protocol (Packet) → Session (Broker / Keeper)
//! ```

pub mod codec;
mod error;
mod presentation;
mod types;

pub use codec::PacketCodec;
pub use error::ProtocolError;
#[cfg(feature = "json")]
pub use presentation::JsonPresentation;
pub use presentation::Presentation;
pub use types::{
    ByteOrder, Connect, ConnectAck, FixedHeader, Packet, PacketType, Publish,
    PublishAck, ReturnCode, DEFAULT_MAX_PACKET_SIZE, MAX_IDENTIFIER_LEN, MAX_REMAINING_LENGTH,
    PROTOCOL_VERSION,
};
