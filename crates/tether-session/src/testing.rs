//! Shared fixtures for unit tests: brokers over in-memory pipes.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_protocol::{ConnectAck, Packet, PacketCodec, ReturnCode};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use crate::{accept_broker, connect_broker, Broker, BrokerConfig};

/// The far end of a broker under test, speaking raw packets with no
/// deadlines and no automatic heartbeat replies.
pub(crate) type Peer = Framed<DuplexStream, PacketCodec>;

fn client_config(id: &str, keepalive: Duration) -> BrokerConfig {
    BrokerConfig::default()
        .with_connection_id(id)
        .with_keepalive(keepalive)
}

/// Two brokers that completed the handshake with each other.
pub(crate) async fn handshake_pair(
    id: &str,
    keepalive: Duration,
) -> (Broker<DuplexStream>, Broker<DuplexStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (client, server) = tokio::join!(
        connect_broker(a, client_config(id, keepalive)),
        accept_broker(b, BrokerConfig::default())
    );
    (client.expect("client handshake"), server.expect("server handshake"))
}

/// An initiating broker and a raw peer that accepted its CONNECT.
pub(crate) async fn raw_pair(id: &str, keepalive: Duration) -> (Broker<DuplexStream>, Peer) {
    raw_pair_with(client_config(id, keepalive)).await
}

/// [`raw_pair`] with full control over the broker's settings.
pub(crate) async fn raw_pair_with(config: BrokerConfig) -> (Broker<DuplexStream>, Peer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut peer = Framed::new(b, PacketCodec::default());
    let accept = async {
        let first = peer.next().await.expect("CONNECT").expect("decodes");
        assert!(matches!(first, Packet::Connect(_)), "got {first}");
        peer.send(Packet::ConnectAck(ConnectAck {
            return_code: ReturnCode::Accepted,
        }))
        .await
        .expect("send CONNECT_ACK");
    };
    let (broker, ()) = tokio::join!(connect_broker(a, config), accept);
    (broker.expect("client handshake"), peer)
}

/// Next packet from the peer's side of the pipe, skipping heartbeats.
pub(crate) async fn next_non_heartbeat(peer: &mut Peer) -> Option<Packet> {
    loop {
        match peer.next().await? {
            Ok(Packet::Heartbeat) => continue,
            Ok(packet) => return Some(packet),
            Err(e) => panic!("peer decode failed: {e}"),
        }
    }
}
