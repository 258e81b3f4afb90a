//! Connection lifecycle for Tether.
//!
//! This crate turns a byte stream into a logical connection that
//! survives transport failures:
//!
//! 1. **Broker** ([`Broker`], [`connect_broker`], [`accept_broker`]):
//!    one physical connection. The CONNECT handshake, then single-packet
//!    reads and writes under deadlines.
//! 2. **Keeper** ([`Keeper`], [`BrokerFactory`]): one logical
//!    connection. Read, write and keepalive loops over a sequence of
//!    brokers, reconnecting through the factory when one fails.
//! 3. **Session registry** ([`SessionManager`]): on the server, hands a
//!    reconnecting client's new broker to the keeper it already has.
//!
//! # How it fits in the stack
//!
//! ```text
//! Application (above)  ← reads/writes packets through a Keeper
//!     ↕
//! Session Layer (this crate)  ← handshake, heartbeats, reconnection
//!     ↕
//! Protocol Layer (below)  ← Packet, PacketCodec
//!     ↕
//! Transport Layer (below)  ← Connection (TCP, in-memory)
//! ```

mod broker;
mod config;
mod error;
mod keeper;
mod manager;

#[cfg(test)]
mod testing;

pub use broker::{accept_broker, connect_broker, Broker};
pub use config::{generate_connection_id, BrokerConfig, CloseCallback, KeeperConfig, SessionConfig};
pub use error::{Direction, SessionError};
pub use keeper::{BrokerFactory, Keeper, KeeperState};
pub use manager::{Route, SessionFactory, SessionManager, SessionState};
