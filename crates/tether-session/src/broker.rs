//! The broker: one physical connection, one packet at a time.
//!
//! A [`Broker`] is built by running the CONNECT / CONNECT_ACK handshake
//! over an established [`Connection`], either as initiator
//! ([`connect_broker`]) or acceptor ([`accept_broker`]). After that it
//! offers exactly two operations, [`write_packet`](Broker::write_packet)
//! and [`read_packet`](Broker::read_packet), each bounded by its own
//! deadline.
//!
//! # Framing and cancellation
//!
//! The connection is split into read and write halves, wrapped in
//! `FramedRead` / `FramedWrite` with a [`PacketCodec`]. Each half sits
//! behind its own async mutex, so a keeper's read loop and write loop can
//! use one broker at the same time.
//!
//! `FramedRead` keeps partially received bytes in its buffer, which
//! makes [`read_packet`](Broker::read_packet) cancel-safe: a read that
//! times out halfway through a packet resumes where it stopped.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_protocol::{Connect, ConnectAck, Packet, PacketCodec, PacketType, ReturnCode};
use tether_transport::Connection;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::Direction;
use crate::{BrokerConfig, SessionError};

/// A handshaken physical connection.
pub struct Broker<C: Connection> {
    reader: Mutex<FramedRead<ReadHalf<C>, PacketCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<C>, PacketCodec>>,
    config: BrokerConfig,
    local_addr: String,
    remote_addr: String,
    closed: AtomicBool,
}

/// Runs the initiator side of the handshake.
///
/// Sends CONNECT with the id, keepalive and version from `config`, then
/// waits for CONNECT_ACK. A refusal comes back as the matching
/// [`ProtocolError`](tether_protocol::ProtocolError) wrapped in
/// [`SessionError::Protocol`].
///
/// On any failure the transport is shut down. The close callback does
/// not fire: no logical connection was established.
pub async fn connect_broker<C: Connection>(
    conn: C,
    config: BrokerConfig,
) -> Result<Broker<C>, SessionError> {
    let broker = Broker::new(conn, config);
    match broker.initiate().await {
        Ok(()) => {
            tracing::info!(
                connection_id = %broker.connection_id(),
                remote = %broker.remote_addr(),
                "broker established"
            );
            Ok(broker)
        }
        Err(e) => {
            tracing::warn!(
                connection_id = %broker.connection_id(),
                error = %e,
                "handshake failed"
            );
            broker.abort().await;
            Err(e)
        }
    }
}

/// Runs the acceptor side of the handshake.
///
/// Reads one CONNECT, checks the identifier and the protocol version
/// (`config.protocol_version` is the highest version accepted), and
/// answers with CONNECT_ACK. On acceptance the peer's id, keepalive and
/// version replace those in `config`. A negative keepalive is treated as
/// zero.
pub async fn accept_broker<C: Connection>(
    conn: C,
    config: BrokerConfig,
) -> Result<Broker<C>, SessionError> {
    let mut broker = Broker::new(conn, config);
    match broker.accept().await {
        Ok(()) => {
            tracing::info!(
                connection_id = %broker.connection_id(),
                remote = %broker.remote_addr(),
                keepalive = ?broker.keepalive(),
                "broker accepted"
            );
            Ok(broker)
        }
        Err(e) => {
            tracing::warn!(remote = %broker.remote_addr(), error = %e, "handshake refused");
            broker.abort().await;
            Err(e)
        }
    }
}

impl<C: Connection> Broker<C> {
    fn new(conn: C, config: BrokerConfig) -> Self {
        let local_addr = conn.local_addr();
        let remote_addr = conn.remote_addr();
        let (read_half, write_half) = tokio::io::split(conn);
        let codec = PacketCodec::new(config.byte_order).with_max_packet_size(config.max_packet_size);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, codec)),
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            config,
            local_addr,
            remote_addr,
            closed: AtomicBool::new(false),
        }
    }

    async fn initiate(&self) -> Result<(), SessionError> {
        self.write_packet(Packet::Connect(Connect {
            protocol_version: self.config.protocol_version,
            keepalive: self.config.keepalive_secs(),
            client_identifier: self.config.connection_id.clone(),
        }))
        .await?;

        match self.read_packet().await? {
            Packet::ConnectAck(ack) => Ok(ack.return_code.into_result()?),
            other => Err(SessionError::UnexpectedPacket {
                expected: PacketType::ConnectAck,
                actual: other.packet_type(),
            }),
        }
    }

    async fn accept(&mut self) -> Result<(), SessionError> {
        let connect = match self.read_packet().await? {
            Packet::Connect(connect) => connect,
            other => {
                return Err(SessionError::UnexpectedPacket {
                    expected: PacketType::Connect,
                    actual: other.packet_type(),
                });
            }
        };

        let mut return_code = connect.validate();
        if return_code == ReturnCode::Accepted {
            return_code = connect.check_version(self.config.protocol_version);
        }
        self.write_packet(Packet::ConnectAck(ConnectAck { return_code }))
            .await?;
        return_code.into_result()?;

        self.config.connection_id = connect.client_identifier;
        self.config.keepalive = Duration::from_secs(u64::try_from(connect.keepalive).unwrap_or(0));
        self.config.protocol_version = connect.protocol_version;
        Ok(())
    }

    /// Writes one packet, bounded by the write timeout.
    ///
    /// A deadline expiry is [`SessionError::Timeout`]; the packet may or
    /// may not have reached the wire.
    pub async fn write_packet(&self, packet: Packet) -> Result<(), SessionError> {
        let packet_type = packet.packet_type();
        let mut writer = self.writer.lock().await;
        with_deadline(self.config.write_timeout, Direction::Write, writer.send(packet)).await?;
        tracing::trace!(connection_id = %self.connection_id(), packet = %packet_type, "sent");
        Ok(())
    }

    /// Reads one packet, bounded by the read timeout.
    ///
    /// A clean end of stream is [`SessionError::ConnectionClosed`].
    pub async fn read_packet(&self) -> Result<Packet, SessionError> {
        let mut reader = self.reader.lock().await;
        let next = with_deadline(self.config.read_timeout, Direction::Read, async {
            reader.next().await.transpose()
        })
        .await?;
        match next {
            Some(packet) => {
                tracing::trace!(
                    connection_id = %self.connection_id(),
                    packet = %packet.packet_type(),
                    "received"
                );
                Ok(packet)
            }
            None => Err(SessionError::ConnectionClosed),
        }
    }

    /// Flushes and shuts down the transport, then fires the close
    /// callback. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        with_deadline(self.config.write_timeout, Direction::Write, writer.close()).await?;
        tracing::debug!(connection_id = %self.connection_id(), "broker closed");
        if let Some(on_close) = &self.config.on_close {
            on_close(&self.config.connection_id);
        }
        Ok(())
    }

    /// Shuts the transport down without the callback.
    async fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = with_deadline(self.config.write_timeout, Direction::Write, writer.close()).await;
    }

    pub fn connection_id(&self) -> &str {
        &self.config.connection_id
    }

    /// Zero when heartbeats are disabled.
    pub fn keepalive(&self) -> Duration {
        self.config.keepalive
    }

    pub fn protocol_version(&self) -> i32 {
        self.config.protocol_version
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

/// Runs `fut` under `limit`, or unbounded when `limit` is zero.
async fn with_deadline<T, E, F>(limit: Duration, direction: Direction, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SessionError>,
{
    if limit.is_zero() {
        return fut.await.map_err(Into::into);
    }
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::debug!(%direction, ?limit, "deadline expired");
            Err(SessionError::Timeout(direction))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use tether_protocol::{ByteOrder, ProtocolError, PROTOCOL_VERSION};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::testing::handshake_pair;

    async fn handshake(
        client: BrokerConfig,
        server: BrokerConfig,
    ) -> (
        Result<Broker<DuplexStream>, SessionError>,
        Result<Broker<DuplexStream>, SessionError>,
    ) {
        let (a, b) = tokio::io::duplex(1024);
        tokio::join!(connect_broker(a, client), accept_broker(b, server))
    }

    // =====================================================================
    // Handshake
    // =====================================================================

    #[tokio::test]
    async fn test_accept_broker_copies_connect_fields() {
        let client = BrokerConfig::default()
            .with_connection_id("player-9")
            .with_keepalive(Duration::from_secs(7));
        let server = BrokerConfig::default().with_keepalive(Duration::ZERO);

        let (client, server) = handshake(client, server).await;
        let (client, server) = (client.unwrap(), server.unwrap());

        assert_eq!(server.connection_id(), "player-9");
        assert_eq!(server.keepalive(), Duration::from_secs(7));
        assert_eq!(server.protocol_version(), PROTOCOL_VERSION);
        assert_eq!(client.connection_id(), "player-9");
        assert_eq!(server.remote_addr(), "memory");
    }

    #[tokio::test]
    async fn test_accept_broker_empty_identifier_refused_on_both_sides() {
        let client = BrokerConfig::default().with_connection_id("");
        let (client, server) = handshake(client, BrokerConfig::default()).await;

        assert!(matches!(
            client,
            Err(SessionError::Protocol(ProtocolError::RefusedInvalidIdentifier))
        ));
        assert!(matches!(
            server,
            Err(SessionError::Protocol(ProtocolError::RefusedInvalidIdentifier))
        ));
    }

    #[tokio::test]
    async fn test_accept_broker_newer_version_refused() {
        let client = BrokerConfig::default().with_protocol_version(PROTOCOL_VERSION + 1);
        let (client, server) = handshake(client, BrokerConfig::default()).await;

        assert!(matches!(
            client,
            Err(SessionError::Protocol(ProtocolError::BadProtocolVersion))
        ));
        assert!(matches!(
            server,
            Err(SessionError::Protocol(ProtocolError::BadProtocolVersion))
        ));
    }

    #[tokio::test]
    async fn test_accept_broker_older_version_adopted() {
        let client = BrokerConfig::default().with_protocol_version(1);
        let server = BrokerConfig::default().with_protocol_version(3);
        let (_client, server) = handshake(client, server).await;
        assert_eq!(server.unwrap().protocol_version(), 1);
    }

    #[tokio::test]
    async fn test_accept_broker_non_connect_first_packet_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let peer = async move {
            let mut w = FramedWrite::new(a, PacketCodec::default());
            w.send(Packet::Heartbeat).await.unwrap();
            w
        };
        let (_peer, server) = tokio::join!(peer, accept_broker(b, BrokerConfig::default()));
        assert!(matches!(
            server,
            Err(SessionError::UnexpectedPacket {
                expected: PacketType::Connect,
                actual: PacketType::Heartbeat
            })
        ));
    }

    #[tokio::test]
    async fn test_accept_broker_oversized_frame_rejected_before_buffering() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(1024);
        // CONNECT header declaring a 256 MiB body.
        a.write_all(&[0x01, 0xFF, 0xFF, 0xFF, 0x7F]).await.unwrap();
        let server = accept_broker(b, BrokerConfig::default().with_max_packet_size(4096)).await;
        assert!(matches!(
            server,
            Err(SessionError::Protocol(ProtocolError::PacketTooLarge(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_broker_refusal_does_not_fire_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let client = BrokerConfig::default()
            .with_connection_id("")
            .with_on_close(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let (client, _server) = handshake(client, BrokerConfig::default()).await;
        assert!(client.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handshake_little_endian_both_sides() {
        let client = BrokerConfig::default()
            .with_connection_id("le")
            .with_byte_order(ByteOrder::Little);
        let server = BrokerConfig::default().with_byte_order(ByteOrder::Little);
        let (client, server) = handshake(client, server).await;
        assert!(client.is_ok());
        assert_eq!(server.unwrap().connection_id(), "le");
    }

    // =====================================================================
    // read_packet / write_packet
    // =====================================================================

    #[tokio::test]
    async fn test_write_packet_then_read_packet_delivers() {
        let (client, server) = handshake_pair("rw", Duration::ZERO).await;
        client.write_packet(Packet::publish(1, &b"hi"[..])).await.unwrap();
        let packet = server.read_packet().await.unwrap();
        assert_eq!(packet, Packet::publish(1, &b"hi"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_packet_nothing_to_read_times_out() {
        let (client, _server) = handshake_pair("idle", Duration::ZERO).await;
        let err = client.read_packet().await.unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_read_packet_after_peer_close_reports_closed() {
        let (client, server) = handshake_pair("gone", Duration::ZERO).await;
        server.close().await.unwrap();
        drop(server);
        assert!(matches!(
            client.read_packet().await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    // =====================================================================
    // close
    // =====================================================================

    #[tokio::test]
    async fn test_close_fires_callback_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let client = BrokerConfig::default()
            .with_connection_id("once")
            .with_on_close(move |id| {
                assert_eq!(id, "once");
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let (client, _server) = handshake(client, BrokerConfig::default()).await;
        let client = client.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
