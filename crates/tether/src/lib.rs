//! # Tether
//!
//! Reconnecting, heartbeat-supervised connections for game servers.
//!
//! A Tether connection is a logical session identified by a connection
//! id. Underneath, it runs over a sequence of TCP connections: when one
//! dies, the client dials again, the server routes the new transport to
//! the session it already has, and the application keeps reading and
//! writing packets through the same [`Keeper`](tether_session::Keeper).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! # async fn run() -> Result<(), TetherError> {
//! tether::init_tracing();
//!
//! let keeper = tether::connect(
//!     "127.0.0.1:7000",
//!     BrokerConfig::default().with_connection_id("player-1"),
//!     KeeperConfig::default(),
//!     DialerConfig::default(),
//! )
//! .await?;
//!
//! let cancel = CancellationToken::new();
//! keeper.write_packet(&cancel, Packet::publish(1, &b"hello"[..])).await?;
//! if let Some(reply) = keeper.read().await {
//!     println!("{reply}");
//! }
//! keeper.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod server;

pub use client::{connect, DialerConfig, TcpDialer};
pub use error::TetherError;
pub use server::{TetherServer, TetherServerBuilder};

/// Installs a `tracing` subscriber that honors `RUST_LOG`, falling back
/// to `info` for Tether's crates.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tether=info,tether_session=info,tether_transport=info")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Everything an application usually needs, in one import.
pub mod prelude {
    pub use crate::{connect, DialerConfig, TcpDialer, TetherError, TetherServer};
    pub use tether_protocol::{
        ByteOrder, JsonPresentation, Packet, Presentation, Publish, PublishAck,
    };
    pub use tether_session::{
        BrokerConfig, Keeper, KeeperConfig, KeeperState, SessionConfig, SessionError,
    };
    pub use tokio_util::sync::CancellationToken;
}
