//! Packing and unpacking control packets.
//!
//! The wire format is bit-exact and shared by both ends:
//!
//! ```text
//! byte(packetType) ++ varint(remainingLength) ++ body
//!
//! CONNECT       body = i32 version ++ i32 keepalive ++ u32 len ++ id bytes
//! CONNECT_ACK   body = i32 returnCode
//! PUBLISH       body = u32 messageID ++ u32 len ++ payload bytes
//! PUBLISH_ACK   body = u32 messageID
//! HEARTBEAT, HEARTBEAT_ACK, DISCONNECT: empty body
//! ```
//!
//! Every multi-byte field uses the connection's [`ByteOrder`].
//!
//! Unpacking is two-phase: first the fixed header (type byte plus
//! varint) is decoded, then exactly `remainingLength` bytes are sliced
//! off and handed to the body decoder. A body decoder only ever sees
//! its own slice, so it cannot read into the next packet.
//!
//! [`PacketCodec`] wraps the same logic in `tokio_util`'s
//! `Decoder`/`Encoder` traits for use with `FramedRead`/`FramedWrite`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{
    ByteOrder, Connect, ConnectAck, FixedHeader, Packet, PacketType, Publish,
    PublishAck, ReturnCode, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH,
};
use crate::ProtocolError;

/// A varint never spends more than this many bytes (28 payload bits).
const MAX_VARINT_BYTES: usize = 4;

// ---------------------------------------------------------------------------
// Remaining-length varint
// ---------------------------------------------------------------------------

/// Appends `value` as a continuation-bit varint: 7 payload bits per byte,
/// high bit set when more bytes follow.
///
/// # Errors
/// [`ProtocolError::PacketTooLarge`] if `value` needs more than 4 bytes.
pub fn encode_remaining_length(
    value: usize,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge(value));
    }
    let mut rest = value;
    loop {
        let mut digit = (rest % 128) as u8;
        rest /= 128;
        if rest > 0 {
            digit |= 0x80;
        }
        dst.put_u8(digit);
        if rest == 0 {
            return Ok(());
        }
    }
}

/// Decodes a varint from the front of `src`.
///
/// Returns `Ok(Some((value, bytes_used)))` when a terminating byte was
/// found, `Ok(None)` when `src` ends before the varint does.
///
/// # Errors
/// [`ProtocolError::MalformedRemainingLength`] if the fourth byte still
/// has its continuation bit set.
pub fn decode_remaining_length(
    src: &[u8],
) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    for (i, &byte) in src.iter().take(MAX_VARINT_BYTES).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_BYTES {
        Err(ProtocolError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// FixedHeader
// ---------------------------------------------------------------------------

impl FixedHeader {
    /// Writes the type byte and the remaining-length varint.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.remaining_length > MAX_REMAINING_LENGTH {
            return Err(ProtocolError::PacketTooLarge(self.remaining_length));
        }
        dst.put_u8(self.packet_type as u8);
        encode_remaining_length(self.remaining_length, dst)
    }

    /// Decodes a fixed header from the front of `src` without consuming it.
    ///
    /// Returns the header and its encoded size, or `Ok(None)` if more
    /// bytes are needed.
    pub fn decode(src: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };
        let Some((remaining_length, varint_len)) = decode_remaining_length(&src[1..])?
        else {
            return Ok(None);
        };
        let packet_type = PacketType::try_from(tag)?;
        Ok(Some((
            Self {
                packet_type,
                remaining_length,
            },
            1 + varint_len,
        )))
    }
}

// ---------------------------------------------------------------------------
// Byte-order aware field helpers
// ---------------------------------------------------------------------------

fn put_u32(dst: &mut BytesMut, order: ByteOrder, value: u32) {
    match order {
        ByteOrder::Big => dst.put_u32(value),
        ByteOrder::Little => dst.put_u32_le(value),
    }
}

fn put_i32(dst: &mut BytesMut, order: ByteOrder, value: i32) {
    match order {
        ByteOrder::Big => dst.put_i32(value),
        ByteOrder::Little => dst.put_i32_le(value),
    }
}

/// Length-prefixed byte field: u32 length, then the raw bytes.
fn put_bytes(
    dst: &mut BytesMut,
    order: ByteOrder,
    field: &[u8],
) -> Result<(), ProtocolError> {
    let len = u32::try_from(field.len())
        .map_err(|_| ProtocolError::PacketTooLarge(field.len()))?;
    put_u32(dst, order, len);
    dst.put_slice(field);
    Ok(())
}

fn ensure(src: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if src.remaining() < needed {
        return Err(ProtocolError::ReadExpectedDataFailed {
            expected: needed,
            actual: src.remaining(),
        });
    }
    Ok(())
}

fn get_u32(src: &mut Bytes, order: ByteOrder) -> Result<u32, ProtocolError> {
    ensure(src, 4)?;
    Ok(match order {
        ByteOrder::Big => src.get_u32(),
        ByteOrder::Little => src.get_u32_le(),
    })
}

fn get_i32(src: &mut Bytes, order: ByteOrder) -> Result<i32, ProtocolError> {
    ensure(src, 4)?;
    Ok(match order {
        ByteOrder::Big => src.get_i32(),
        ByteOrder::Little => src.get_i32_le(),
    })
}

fn get_bytes(src: &mut Bytes, order: ByteOrder) -> Result<Bytes, ProtocolError> {
    let len = get_u32(src, order)? as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

// ---------------------------------------------------------------------------
// Packet pack / unpack
// ---------------------------------------------------------------------------

impl Packet {
    /// Serializes the packet into a fresh buffer.
    pub fn pack(&self, order: ByteOrder) -> Result<Bytes, ProtocolError> {
        let mut dst = BytesMut::with_capacity(1 + MAX_VARINT_BYTES + self.body_len());
        self.encode(order, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Appends the serialized packet to `dst`.
    ///
    /// The body is written first; the header's remaining length is then
    /// taken from the body's actual size, so the two can never disagree.
    pub fn encode(&self, order: ByteOrder, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::with_capacity(self.body_len());
        self.encode_body(order, &mut body)?;

        let header = FixedHeader {
            packet_type: self.packet_type(),
            remaining_length: body.len(),
        };
        dst.reserve(1 + MAX_VARINT_BYTES + body.len());
        header.encode(dst)?;
        dst.extend_from_slice(&body);
        Ok(())
    }

    fn encode_body(&self, order: ByteOrder, body: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Self::Connect(c) => {
                put_i32(body, order, c.protocol_version);
                put_i32(body, order, c.keepalive);
                put_bytes(body, order, c.client_identifier.as_bytes())?;
            }
            Self::ConnectAck(a) => put_i32(body, order, a.return_code as i32),
            Self::Publish(p) => {
                put_u32(body, order, p.message_id);
                put_bytes(body, order, &p.payload)?;
            }
            Self::PublishAck(a) => put_u32(body, order, a.message_id),
            Self::Heartbeat | Self::HeartbeatAck | Self::Disconnect => {}
        }
        Ok(())
    }

    /// Decodes exactly one packet from the front of `src`, advancing it
    /// past the packet.
    ///
    /// # Errors
    /// - [`ProtocolError::ReadExpectedDataFailed`] if `src` holds less
    ///   than a whole packet.
    /// - [`ProtocolError::InvalidPacketType`] for an unknown type byte.
    /// - Any body-level error from [`Packet::unpack_body`].
    pub fn unpack(src: &mut Bytes, order: ByteOrder) -> Result<Self, ProtocolError> {
        let Some((header, header_len)) = FixedHeader::decode(src)? else {
            return Err(ProtocolError::ReadExpectedDataFailed {
                expected: src.len() + 1,
                actual: src.len(),
            });
        };
        let available = src.len() - header_len;
        if available < header.remaining_length {
            return Err(ProtocolError::ReadExpectedDataFailed {
                expected: header.remaining_length,
                actual: available,
            });
        }
        src.advance(header_len);
        let body = src.split_to(header.remaining_length);
        Self::unpack_body(header, body, order)
    }

    /// Decodes a body that has already been sliced to exactly
    /// `header.remaining_length` bytes.
    pub fn unpack_body(
        header: FixedHeader,
        mut body: Bytes,
        order: ByteOrder,
    ) -> Result<Self, ProtocolError> {
        if body.len() != header.remaining_length {
            return Err(ProtocolError::ReadExpectedDataFailed {
                expected: header.remaining_length,
                actual: body.len(),
            });
        }

        let packet = match header.packet_type {
            PacketType::Connect => {
                let protocol_version = get_i32(&mut body, order)?;
                let keepalive = get_i32(&mut body, order)?;
                let id = get_bytes(&mut body, order)?;
                let client_identifier = String::from_utf8(id.to_vec())
                    .map_err(|_| ProtocolError::InvalidIdentifier)?;
                Self::Connect(Connect {
                    protocol_version,
                    keepalive,
                    client_identifier,
                })
            }
            PacketType::ConnectAck => {
                let return_code = ReturnCode::try_from(get_i32(&mut body, order)?)?;
                Self::ConnectAck(ConnectAck { return_code })
            }
            PacketType::Heartbeat => Self::Heartbeat,
            PacketType::HeartbeatAck => Self::HeartbeatAck,
            PacketType::Publish => {
                let message_id = get_u32(&mut body, order)?;
                let payload = get_bytes(&mut body, order)?;
                Self::Publish(Publish { message_id, payload })
            }
            PacketType::PublishAck => Self::PublishAck(PublishAck {
                message_id: get_u32(&mut body, order)?,
            }),
            PacketType::Disconnect => Self::Disconnect,
        };

        if body.has_remaining() {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} trailing bytes after {} body",
                body.remaining(),
                header.packet_type
            )));
        }
        Ok(packet)
    }
}

// ---------------------------------------------------------------------------
// PacketCodec
// ---------------------------------------------------------------------------

/// Streaming codec for `FramedRead` / `FramedWrite`.
///
/// `decode` returns `Ok(None)` until a whole packet is buffered, so a
/// read that is interrupted (timeout, cancellation) loses nothing: the
/// partial bytes stay in the framed reader's buffer for the next call.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    byte_order: ByteOrder,
    max_packet_size: usize,
}

/// Most a single `decode` call reserves ahead of an incomplete body.
const RESERVE_CHUNK: usize = 64 * 1024;

impl PacketCodec {
    /// Creates a codec for the given byte order that accepts bodies up to
    /// [`DEFAULT_MAX_PACKET_SIZE`].
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Caps the body size this codec will buffer. Bodies above the cap
    /// fail with [`ProtocolError::PacketTooLarge`] before any allocation.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Largest body this codec will accept.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// The byte order this codec applies.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(ByteOrder::default())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        let Some((header, header_len)) = FixedHeader::decode(src)? else {
            return Ok(None);
        };
        if header.remaining_length > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge(header.remaining_length));
        }

        let frame_len = header_len + header.remaining_length;
        if src.len() < frame_len {
            // Grow with the bytes that actually arrive, not with what the
            // header claims.
            src.reserve((frame_len - src.len()).min(RESERVE_CHUNK));
            return Ok(None);
        }

        src.advance(header_len);
        let body = src.split_to(header.remaining_length).freeze();
        Packet::unpack_body(header, body, self.byte_order).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if let Some(packet) = self.decode(buf)? {
            return Ok(Some(packet));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // The stream ended in the middle of a packet.
        let expected = match FixedHeader::decode(buf)? {
            Some((header, header_len)) => header_len + header.remaining_length,
            None => buf.len() + 1,
        };
        Err(ProtocolError::ReadExpectedDataFailed {
            expected,
            actual: buf.len(),
        })
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        item.encode(self.byte_order, dst)
    }
}
