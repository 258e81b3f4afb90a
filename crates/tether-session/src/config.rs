//! Configuration for brokers, keepers and the session registry.
//!
//! Everything is an explicit struct passed to a constructor. There is no
//! process-wide default state: two servers in one process can run with
//! different byte orders or timeouts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tether_protocol::{ByteOrder, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH, PROTOCOL_VERSION};

/// Called with the connection id after a broker's transport is closed.
pub type CloseCallback = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

/// Per-connection settings of a [`Broker`](crate::Broker).
///
/// On the initiating side these are what the CONNECT carries. On the
/// accepting side `connection_id`, `keepalive` and `protocol_version`
/// are overwritten with the values the peer sent; `protocol_version`
/// going in is the highest version the acceptor supports.
#[derive(Clone)]
pub struct BrokerConfig {
    /// Logical connection identity. Survives reconnects.
    pub connection_id: String,

    /// Heartbeat interval. Zero disables heartbeats. Sent on the wire
    /// in whole seconds.
    pub keepalive: Duration,

    pub protocol_version: i32,

    /// Deadline for writing one packet. Zero means no deadline.
    pub write_timeout: Duration,

    /// Deadline for reading one packet. Zero means no deadline.
    pub read_timeout: Duration,

    pub byte_order: ByteOrder,

    /// Largest packet body accepted from the peer, handshake included.
    /// Larger bodies fail the read before anything is buffered for them.
    pub max_packet_size: usize,

    /// Fired at most once, after the transport closed cleanly.
    pub on_close: Option<CloseCallback>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connection_id: generate_connection_id(),
            keepalive: Duration::from_secs(10),
            protocol_version: PROTOCOL_VERSION,
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            byte_order: ByteOrder::Big,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            on_close: None,
        }
    }
}

impl BrokerConfig {
    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = id.into();
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_protocol_version(mut self, version: i32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Clamped to what a remaining-length varint can express.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Registers the close callback.
    pub fn with_on_close(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(callback));
        self
    }

    /// Keepalive as the whole seconds a CONNECT carries, saturated to
    /// the `int32` range.
    pub(crate) fn keepalive_secs(&self) -> i32 {
        i32::try_from(self.keepalive.as_secs()).unwrap_or(i32::MAX)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("connection_id", &self.connection_id)
            .field("keepalive", &self.keepalive)
            .field("protocol_version", &self.protocol_version)
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("byte_order", &self.byte_order)
            .field("max_packet_size", &self.max_packet_size)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Generates a random 32-character hex string (128 bits of entropy).
///
/// Clients that don't pick their own identity get one of these, so two
/// anonymous clients never collide in a server's session registry.
pub fn generate_connection_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// KeeperConfig
// ---------------------------------------------------------------------------

/// Settings of a [`Keeper`](crate::Keeper).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Capacity of the queue between `write_packet` and the write loop.
    pub outbound_capacity: usize,

    /// Capacity of the queue between the read loop and `read`.
    pub inbound_capacity: usize,

    /// Pause after a read or write timeout before the loop tries again.
    pub retry_backoff: Duration,

    /// Upper bound on how long `close` waits for the parting DISCONNECT.
    pub close_timeout: Duration,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            inbound_capacity: 64,
            retry_backoff: Duration::from_millis(20),
            close_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Settings of the server-side [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long (in seconds) a session whose transport dropped waits for
    /// the client to come back before its keeper is closed.
    ///
    /// Default: 30 seconds. With 0 a session ends as soon as its transport
    /// drops, unless a reconnect was already queued for it at that moment.
    pub reconnect_grace_secs: u64,

    /// How many reconnecting transports may queue for one session.
    pub handoff_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_grace_secs: 30,
            handoff_capacity: 1,
        }
    }
}

impl SessionConfig {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }
}
