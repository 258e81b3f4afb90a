//! Transport abstraction layer for Tether.
//!
//! A Tether connection runs over any ordered, reliable byte stream. This
//! crate names that requirement ([`Connection`]) and provides the
//! listener side ([`Transport`]) plus a TCP implementation.
//!
//! Framing is not done here. The session layer wraps a [`Connection`] in
//! `tokio_util`'s `FramedRead`/`FramedWrite` with the protocol crate's
//! packet codec.

#![allow(async_fn_in_trait)]

mod error;
mod tcp;

pub use error::TransportError;
pub use tcp::{dial, TcpTransport};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Stops accepting. Later calls to [`accept`](Self::accept) fail.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// An established, bidirectional byte stream.
///
/// Anything that tokio can read from and write to qualifies. The two
/// address accessors exist for logging; their format is up to the
/// implementation.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Our end of the stream.
    fn local_addr(&self) -> String;

    /// The peer's end of the stream.
    fn remote_addr(&self) -> String;
}

impl Connection for TcpStream {
    fn local_addr(&self) -> String {
        TcpStream::local_addr(self)
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    fn remote_addr(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into())
    }
}

/// In-process pipes from [`tokio::io::duplex`]. Used heavily in tests.
impl Connection for DuplexStream {
    fn local_addr(&self) -> String {
        "memory".into()
    }

    fn remote_addr(&self) -> String {
        "memory".into()
    }
}
