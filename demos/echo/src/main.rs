use std::process::ExitCode;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether::prelude::*;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub seq: u32,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Mode {
    Server { addr: String },
    Client { addr: String, count: u32 },
}

const USAGE: &str = "usage: echo server <addr> | echo client <addr> <count>";

fn parse_args(args: &[String]) -> Result<Mode, String> {
    match args {
        [mode, addr] if mode == "server" => Ok(Mode::Server { addr: addr.clone() }),
        [mode, addr, count] if mode == "client" => {
            let count = count
                .parse()
                .map_err(|_| format!("count must be a number, got {count:?}"))?;
            Ok(Mode::Client {
                addr: addr.clone(),
                count,
            })
        }
        _ => Err(USAGE.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The packets the server answers one PUBLISH with: an ack, then the
/// message itself.
fn echo_replies(publish: Publish) -> [Packet; 2] {
    [
        Packet::PublishAck(PublishAck {
            message_id: publish.message_id,
        }),
        Packet::Publish(publish),
    ]
}

async fn serve(keeper: Keeper<tokio::net::TcpStream>) {
    let id = keeper.connection_id().to_string();
    tracing::info!(connection_id = %id, "session started");
    let cancel = CancellationToken::new();

    while let Some(packet) = keeper.read().await {
        let Packet::Publish(publish) = packet else {
            continue;
        };
        match publish.decode_with::<_, Line>(&JsonPresentation) {
            Ok(line) => tracing::info!(connection_id = %id, seq = line.seq, text = %line.text, "echo"),
            Err(e) => tracing::warn!(connection_id = %id, error = %e, "undecodable payload, echoing raw"),
        }
        for reply in echo_replies(publish) {
            if let Err(e) = keeper.write_packet(&cancel, reply).await {
                tracing::warn!(connection_id = %id, error = %e, "reply failed");
                return;
            }
        }
    }
    tracing::info!(connection_id = %id, "session ended");
}

async fn run_server(addr: &str) -> Result<(), TetherError> {
    let (server, mut sessions) = TetherServer::builder().bind(addr).build().await?;
    println!("echo server listening on {}", server.local_addr()?);
    tokio::spawn(server.run());

    while let Some(keeper) = sessions.recv().await {
        tokio::spawn(serve(keeper));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn run_client(addr: &str, count: u32) -> Result<(), TetherError> {
    let keeper = tether::connect(
        addr,
        BrokerConfig::default().with_keepalive(Duration::from_secs(5)),
        KeeperConfig::default(),
        DialerConfig::default(),
    )
    .await?;
    println!("connected as {}", keeper.connection_id());

    let cancel = CancellationToken::new();
    for seq in 1..=count {
        let line = Line {
            seq,
            text: format!("hello #{seq}"),
        };
        let packet = Publish::encode_with(&JsonPresentation, seq, &line)?;
        keeper.write_packet(&cancel, packet).await?;
    }

    let mut echoed = 0;
    while echoed < count {
        let Some(packet) = keeper.read().await else {
            break;
        };
        match packet {
            Packet::Publish(publish) => {
                let line: Line = publish.decode_with(&JsonPresentation)?;
                println!("echo {}: {}", line.seq, line.text);
                echoed += 1;
            }
            Packet::PublishAck(ack) => tracing::debug!(message_id = ack.message_id, "acked"),
            other => tracing::debug!(packet = %other, "ignored"),
        }
    }

    keeper.close().await?;
    println!("{echoed}/{count} messages echoed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    tether::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let result = match mode {
        Mode::Server { addr } => run_server(&addr).await,
        Mode::Client { addr, count } => run_client(&addr, count).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
