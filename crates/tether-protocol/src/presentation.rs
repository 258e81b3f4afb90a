//! Presentation layer: what a PUBLISH payload means.
//!
//! The packet codec treats a payload as opaque bytes. Applications want
//! typed messages, so this module converts between Rust values and
//! payload bytes. The connection layer never calls into it; it sits on
//! top, used by whoever builds and reads PUBLISH packets.
//!
//! [`JsonPresentation`] is the default strategy. Another format only
//! needs another [`Presentation`] impl; nothing else changes.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::types::{Packet, Publish};
use crate::ProtocolError;

/// Converts application values to payload bytes and back.
///
/// `Send + Sync + 'static` so a single instance can be shared by the
/// keeper loops and the application tasks that produce messages.
pub trait Presentation: Send + Sync + 'static {
    /// Serializes a value into payload bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value cannot be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, ProtocolError>;

    /// Deserializes payload bytes into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes don't match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Presentation`] backed by `serde_json`.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tether_protocol::{JsonPresentation, Packet, Publish};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Move { cell: u8 }
///
/// let packet = Publish::encode_with(&JsonPresentation, 1, &Move { cell: 4 }).unwrap();
/// let Packet::Publish(publish) = packet else { unreachable!() };
/// let decoded: Move = publish.decode_with(&JsonPresentation).unwrap();
/// assert_eq!(decoded, Move { cell: 4 });
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPresentation;

#[cfg(feature = "json")]
impl Presentation for JsonPresentation {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

impl Publish {
    /// Builds a PUBLISH packet whose payload is `value` rendered by
    /// `presentation`.
    pub fn encode_with<P: Presentation, T: Serialize>(
        presentation: &P,
        message_id: u32,
        value: &T,
    ) -> Result<Packet, ProtocolError> {
        Ok(Packet::publish(message_id, presentation.encode(value)?))
    }

    /// Reads the payload back as a `T`.
    pub fn decode_with<P: Presentation, T: DeserializeOwned>(
        &self,
        presentation: &P,
    ) -> Result<T, ProtocolError> {
        presentation.decode(&self.payload)
    }
}
