//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on a random port and dial it, so bytes
//! actually cross the loopback interface.

use tether_transport::{dial, Connection, Transport, TcpTransport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_tcp_accept_and_exchange_bytes() {
    let mut transport = TcpTransport::bind("127.0.0.1:0").await.expect("should bind");
    let addr = transport.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
    let mut client = dial(&addr).await.expect("should dial");
    let mut server_conn = server.await.unwrap();

    assert_eq!(Connection::remote_addr(&client), addr);
    assert_eq!(
        Connection::local_addr(&client),
        Connection::remote_addr(&server_conn)
    );

    client.write_all(b"hello from client").await.unwrap();
    let mut buf = [0u8; 17];
    server_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello from client");

    server_conn.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
}

#[tokio::test]
async fn test_tcp_accept_after_shutdown_fails() {
    let mut transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
    transport.shutdown().await.unwrap();
    assert!(matches!(transport.accept().await, Err(TransportError::Shutdown)));
}

#[tokio::test]
async fn test_dial_unreachable_reports_address() {
    // Bind and drop to get a port that is very likely closed.
    let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = transport.local_addr().unwrap().to_string();
    drop(transport);

    match dial(&addr).await {
        Err(TransportError::ConnectFailed { addr: failed, .. }) => assert_eq!(failed, addr),
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
}
