//! `TetherServer` builder and accept loop.
//!
//! This ties the layers together on the server side:
//! transport (TCP accept) → session (handshake, registry) → keeper.
//! Each new logical session comes out of the receiver returned by
//! [`TetherServerBuilder::build`] as a ready-to-use [`Keeper`].

use std::net::SocketAddr;
use std::sync::Arc;

use tether_session::{
    accept_broker, BrokerConfig, Keeper, KeeperConfig, Route, SessionConfig, SessionManager,
};
use tether_transport::{TcpTransport, Transport, TransportError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::TetherError;

/// Shared server state passed to each connection task.
struct ServerState {
    sessions: SessionManager<TcpStream>,
    broker_config: BrokerConfig,
    keeper_config: KeeperConfig,
    keepers: mpsc::Sender<Keeper<TcpStream>>,
}

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// # async fn run() -> Result<(), TetherError> {
/// let (server, mut sessions) = TetherServer::builder()
///     .bind("0.0.0.0:7000")
///     .build()
///     .await?;
/// tokio::spawn(server.run());
/// while let Some(keeper) = sessions.recv().await {
///     // serve `keeper` in its own task
/// #   drop(keeper);
/// }
/// # Ok(())
/// # }
/// ```
pub struct TetherServerBuilder {
    bind_addr: String,
    broker_config: BrokerConfig,
    keeper_config: KeeperConfig,
    session_config: SessionConfig,
    backlog: usize,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            broker_config: BrokerConfig::default(),
            keeper_config: KeeperConfig::default(),
            session_config: SessionConfig::default(),
            backlog: 64,
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Acceptor-side broker settings. `protocol_version` is the highest
    /// version accepted; timeouts and byte order apply to every
    /// connection.
    pub fn broker_config(mut self, config: BrokerConfig) -> Self {
        self.broker_config = config;
        self
    }

    pub fn keeper_config(mut self, config: KeeperConfig) -> Self {
        self.keeper_config = config;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// How many new sessions may wait in the receiver.
    pub fn backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    /// Binds the listener.
    ///
    /// Returns the server (call [`run`](TetherServer::run)) and the
    /// receiver of new sessions.
    pub async fn build(
        self,
    ) -> Result<(TetherServer, mpsc::Receiver<Keeper<TcpStream>>), TetherError> {
        let transport = TcpTransport::bind(&self.bind_addr).await?;
        let (keepers, sessions) = mpsc::channel(self.backlog);

        let state = Arc::new(ServerState {
            sessions: SessionManager::new(self.session_config),
            broker_config: self.broker_config,
            keeper_config: self.keeper_config,
            keepers,
        });
        Ok((TetherServer { transport, state }, sessions))
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A Tether server.
pub struct TetherServer {
    transport: TcpTransport,
    state: Arc<ServerState>,
}

impl TetherServer {
    /// Creates a new builder.
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        Ok(self.transport.local_addr()?)
    }

    /// The server's session registry.
    pub fn sessions(&self) -> &SessionManager<TcpStream> {
        &self.state.sessions
    }

    /// Runs the accept loop until the process ends.
    pub async fn run(self) -> Result<(), TetherError> {
        self.run_until(CancellationToken::new()).await
    }

    /// Runs the accept loop until `shutdown` fires.
    ///
    /// Each accepted connection is handshaken in its own task. Keepers
    /// already handed out keep running.
    pub async fn run_until(mut self, shutdown: CancellationToken) -> Result<(), TetherError> {
        tracing::info!("Tether server running");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(TransportError::Shutdown) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }

        self.transport.shutdown().await?;
        Ok(())
    }
}

/// Handshakes one connection and routes it to a session.
async fn handle_connection(conn: TcpStream, state: Arc<ServerState>) -> Result<(), TetherError> {
    let broker = accept_broker(conn, state.broker_config.clone()).await?;

    match state.sessions.route(broker) {
        Route::Fresh(factory) => {
            let keeper = Keeper::start(factory, state.keeper_config.clone()).await?;
            if state.keepers.send(keeper).await.is_err() {
                tracing::warn!("session receiver dropped, discarding new session");
            }
        }
        Route::Resumed => {}
        Route::Rejected(broker) => broker.close().await?,
    }
    Ok(())
}
