//! TCP transport built on `tokio::net`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{TcpListener, TcpStream};

use crate::{Transport, TransportError};

/// A TCP [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
    shut_down: AtomicBool,
}

impl TcpTransport {
    /// Binds a new TCP listener to the given address.
    ///
    /// Use port 0 to let the OS pick one, then read it back with
    /// [`local_addr`](Self::local_addr).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self {
            listener,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

impl Transport for TcpTransport {
    type Connection = TcpStream;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<TcpStream, TransportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        // Control packets are small; don't let Nagle hold heartbeats back.
        stream
            .set_nodelay(true)
            .map_err(TransportError::AcceptFailed)?;
        tracing::debug!(%addr, "accepted TCP connection");
        Ok(stream)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::info!("TCP transport shut down");
        }
        Ok(())
    }
}

/// Opens an outbound TCP connection with `TCP_NODELAY` set.
pub async fn dial(addr: &str) -> Result<TcpStream, TransportError> {
    let connect_failed = |source: std::io::Error| TransportError::ConnectFailed {
        addr: addr.to_string(),
        source,
    };
    let stream = TcpStream::connect(addr).await.map_err(connect_failed)?;
    stream.set_nodelay(true).map_err(connect_failed)?;
    tracing::debug!(addr, "dialed TCP connection");
    Ok(stream)
}
