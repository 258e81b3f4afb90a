//! Client side: dialing a server and keeping the connection alive.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tether_session::{connect_broker, Broker, BrokerConfig, BrokerFactory, Keeper, KeeperConfig};
use tether_transport::dial;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::TetherError;

/// Retry policy of a [`TcpDialer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Attempts per factory call before giving up. At least one attempt
    /// is always made.
    pub max_attempts: u32,

    /// Base pause between attempts.
    pub retry_backoff: Duration,

    /// Up to this many extra milliseconds are added to each pause, so a
    /// crowd of clients dropped at once does not reconnect in lockstep.
    pub retry_jitter_ms: u64,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(500),
            retry_jitter_ms: 250,
        }
    }
}

impl DialerConfig {
    fn pause(&self) -> Duration {
        let jitter = if self.retry_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.retry_jitter_ms)
        };
        self.retry_backoff + Duration::from_millis(jitter)
    }
}

/// A [`BrokerFactory`] that dials TCP and runs the initiator handshake.
///
/// Every broker it produces carries the same connection id, taken from
/// its [`BrokerConfig`], so the server can resume the session.
pub struct TcpDialer {
    addr: String,
    broker_config: BrokerConfig,
    config: DialerConfig,
    primed: Option<Broker<TcpStream>>,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>, broker_config: BrokerConfig, config: DialerConfig) -> Self {
        Self {
            addr: addr.into(),
            broker_config,
            config,
            primed: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.broker_config.connection_id
    }

    /// Dials and handshakes, retrying per [`DialerConfig`].
    ///
    /// A refused handshake is returned at once; retrying with the same
    /// settings cannot succeed.
    ///
    /// # Errors
    /// The last attempt's error, or [`SessionError::Cancelled`](tether_session::SessionError::Cancelled).
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<Broker<TcpStream>, TetherError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(tether_session::SessionError::Cancelled.into()),
                result = self.attempt() => result,
            };
            let err = match result {
                Ok(broker) => return Ok(broker),
                Err(e) if e.is_refusal() => {
                    tracing::warn!(addr = %self.addr, error = %e, "handshake refused");
                    return Err(e);
                }
                Err(e) => e,
            };
            tracing::warn!(addr = %self.addr, attempt, error = %err, "dial failed");
            if attempt >= attempts {
                return Err(err);
            }
            attempt += 1;

            let pause = self.config.pause();
            tracing::debug!(?pause, "backing off before next dial");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(tether_session::SessionError::Cancelled.into()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn attempt(&self) -> Result<Broker<TcpStream>, TetherError> {
        let stream = dial(&self.addr).await?;
        Ok(connect_broker(stream, self.broker_config.clone()).await?)
    }

    /// Hands out `broker` on the next factory call instead of dialing.
    fn primed(mut self, broker: Broker<TcpStream>) -> Self {
        self.primed = Some(broker);
        self
    }
}

impl BrokerFactory<TcpStream> for TcpDialer {
    async fn connect(&mut self, cancel: CancellationToken) -> Option<Broker<TcpStream>> {
        if let Some(broker) = self.primed.take() {
            return Some(broker);
        }
        match self.dial(&cancel).await {
            Ok(broker) => Some(broker),
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "giving up on reconnect");
                None
            }
        }
    }
}

/// Connects to a Tether server and starts a client [`Keeper`].
///
/// The first connection is made here, so a refused handshake or an
/// unreachable server is reported to the caller. Later reconnects happen
/// inside the keeper.
pub async fn connect(
    addr: &str,
    broker_config: BrokerConfig,
    keeper_config: KeeperConfig,
    dialer_config: DialerConfig,
) -> Result<Keeper<TcpStream>, TetherError> {
    let dialer = TcpDialer::new(addr, broker_config, dialer_config);
    let first = dialer.dial(&CancellationToken::new()).await?;
    tracing::info!(addr, connection_id = %dialer.connection_id(), "connected");
    Ok(Keeper::start(dialer.primed(first), keeper_config).await?)
}
