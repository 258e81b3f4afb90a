//! The keeper: a logical connection that outlives its transports.
//!
//! A [`Keeper`] owns a stable connection id and a sequence of
//! [`Broker`]s. For each broker it runs three loops until one of them
//! fails, then asks its [`BrokerFactory`] for the next broker:
//!
//! ```text
//!            start()
//!              │
//!         [Connecting] ──(factory: None)──→ StartFailed
//!              │
//!              ▼
//!   ┌──────→ [Active] ── write loop ┐
//!   │          │        read loop   ├─ first to exit cancels the others
//!   │          │        keepalive   ┘
//!   │          ▼
//!   │    broker closed
//!   │          │
//!   │   close() requested? ──yes──→ [Closed]
//!   │          │ no
//!   │          ▼
//!   └── [Reconnecting] ──(factory: None / id mismatch)──→ [Closed]
//! ```
//!
//! # Queues
//!
//! Application and loops talk only through channels:
//!
//! - **outbound** (`write_packet` → write loop). The read loop puts
//!   HEARTBEAT_ACK replies here and the keepalive loop puts HEARTBEATs
//!   here, so a single consumer writes everything in enqueue order.
//! - **inbound** (read loop → `read`). Only application packets: the
//!   three control packets are consumed by the loops.
//! - **acks** (read loop → keepalive loop), per broker instance, with
//!   room for one: at most one heartbeat is ever in flight.
//!
//! Packets in flight when a broker fails are not replayed.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tether_protocol::Packet;
use tether_transport::Connection;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{Broker, KeeperConfig, SessionError};

// ---------------------------------------------------------------------------
// BrokerFactory
// ---------------------------------------------------------------------------

/// Produces handshaken brokers on demand.
///
/// Called once by [`Keeper::start`] and again after every broker
/// failure. `None` means "give up": at start that is
/// [`SessionError::StartFailed`], later it ends the keeper. The token is
/// cancelled when the keeper shuts down; long waits should honor it.
///
/// Any `FnMut(CancellationToken) -> impl Future<Output = Option<Broker<C>>>`
/// closure is a factory.
pub trait BrokerFactory<C: Connection>: Send + 'static {
    fn connect(
        &mut self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Option<Broker<C>>> + Send;

    /// Fires when a newer broker is waiting for this keeper.
    ///
    /// Asked once per broker, right before its loops start. When the
    /// token fires, the keeper drops that broker and calls
    /// [`connect`](Self::connect) again without waiting for the old
    /// transport to fail.
    fn superseded(&self) -> Option<CancellationToken> {
        None
    }
}

impl<C, F, Fut> BrokerFactory<C> for F
where
    C: Connection,
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Option<Broker<C>>> + Send,
{
    fn connect(
        &mut self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Option<Broker<C>>> + Send {
        self(cancel)
    }
}

// ---------------------------------------------------------------------------
// KeeperState
// ---------------------------------------------------------------------------

/// Where a keeper's supervising task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    Connecting,
    Active,
    Reconnecting,
    /// Terminal.
    Closed,
}

// ---------------------------------------------------------------------------
// Keeper
// ---------------------------------------------------------------------------

/// An outbound packet plus an optional "it hit the wire" signal.
struct Outbound {
    packet: Packet,
    written: Option<oneshot::Sender<()>>,
}

impl Outbound {
    fn new(packet: Packet) -> Self {
        Self {
            packet,
            written: None,
        }
    }
}

/// State shared by the handle and the supervising task.
struct Shared {
    connection_id: String,
    closed: AtomicBool,
    cancel: CancellationToken,
    state: watch::Sender<KeeperState>,
    config: KeeperConfig,
}

impl Shared {
    fn set_state(&self, state: KeeperState) {
        self.state.send_replace(state);
    }

    fn is_closing(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }
}

/// A long-lived logical connection.
///
/// Cheap to share behind an `Arc`: every method takes `&self`.
/// Dropping the keeper cancels its supervising task without the parting
/// DISCONNECT; call [`close`](Self::close) for a graceful shutdown.
pub struct Keeper<C: Connection> {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    _connection: PhantomData<fn() -> C>,
}

impl<C: Connection> Keeper<C> {
    /// Obtains the first broker and starts supervising.
    ///
    /// The keeper's connection id is fixed from that first broker.
    ///
    /// # Errors
    /// [`SessionError::StartFailed`] if the factory yields `None`.
    pub async fn start<F>(mut factory: F, config: KeeperConfig) -> Result<Self, SessionError>
    where
        F: BrokerFactory<C>,
    {
        let cancel = CancellationToken::new();
        let Some(first) = factory.connect(cancel.clone()).await else {
            tracing::warn!("keeper failed to start: factory produced no broker");
            return Err(SessionError::StartFailed);
        };

        let (state, _) = watch::channel(KeeperState::Connecting);
        let shared = Arc::new(Shared {
            connection_id: first.connection_id().to_string(),
            closed: AtomicBool::new(false),
            cancel,
            state,
            config,
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(shared.config.inbound_capacity.max(1));

        let supervisor = Supervisor {
            shared: shared.clone(),
            factory,
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            inbound_tx,
            _connection: PhantomData,
        };
        let handle = tokio::spawn(supervisor.run(first));

        tracing::info!(connection_id = %shared.connection_id, "keeper started");
        Ok(Self {
            shared,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            supervisor: Mutex::new(Some(handle)),
            _connection: PhantomData,
        })
    }

    /// Queues a packet for the write loop.
    ///
    /// Returns once the packet is queued, not once it is written.
    ///
    /// # Errors
    /// - [`SessionError::Cancelled`] if `cancel` fires first.
    /// - [`SessionError::Closed`] if the keeper is closed or closing.
    pub async fn write_packet(
        &self,
        cancel: &CancellationToken,
        packet: Packet,
    ) -> Result<(), SessionError> {
        if self.shared.is_closing() {
            return Err(SessionError::Closed);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = self.shared.cancel.cancelled() => Err(SessionError::Closed),
            sent = self.outbound.send(Outbound::new(packet)) => {
                sent.map_err(|_| SessionError::Closed)
            }
        }
    }

    /// Next application packet, or `None` once the keeper has ended and
    /// the queue is drained.
    pub async fn read(&self) -> Option<Packet> {
        self.inbound.lock().await.recv().await
    }

    /// Shuts the keeper down.
    ///
    /// If a broker is attached, a DISCONNECT is queued and given up to
    /// `close_timeout` to reach the wire. Then every loop is cancelled
    /// and this waits for the supervising task to exit.
    pub async fn close(&self) -> Result<(), SessionError> {
        let first_close = !self.shared.closed.swap(true, Ordering::AcqRel);
        // `Connecting` still has the first broker in hand: the supervisor
        // just hasn't been polled yet.
        let has_broker = matches!(
            *self.shared.state.borrow(),
            KeeperState::Connecting | KeeperState::Active
        );
        if first_close && has_broker {
            self.send_parting_disconnect().await;
        }
        self.shared.cancel.cancel();

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(
                    connection_id = %self.shared.connection_id,
                    error = %e,
                    "keeper supervisor task failed"
                );
            }
        } else {
            // Someone else is joining; wait for the terminal state.
            let mut state = self.shared.state.subscribe();
            let _ = state.wait_for(|s| *s == KeeperState::Closed).await;
        }
        Ok(())
    }

    async fn send_parting_disconnect(&self) {
        let (written_tx, written_rx) = oneshot::channel();
        let parting = async {
            self.outbound
                .send(Outbound {
                    packet: Packet::Disconnect,
                    written: Some(written_tx),
                })
                .await
                .ok()?;
            written_rx.await.ok()
        };
        match tokio::time::timeout(self.shared.config.close_timeout, parting).await {
            Ok(Some(())) => {
                tracing::debug!(connection_id = %self.shared.connection_id, "parting DISCONNECT sent");
            }
            _ => {
                tracing::debug!(
                    connection_id = %self.shared.connection_id,
                    "parting DISCONNECT not confirmed"
                );
            }
        }
    }

    /// The logical connection id. Never changes.
    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    pub fn state(&self) -> KeeperState {
        *self.shared.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<KeeperState> {
        self.shared.state.subscribe()
    }

    /// `true` once [`close`](Self::close) was called or the supervising
    /// task ended on its own.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }
}

impl<C: Connection> Drop for Keeper<C> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor<C: Connection, F> {
    shared: Arc<Shared>,
    factory: F,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Packet>,
    _connection: PhantomData<fn() -> C>,
}

impl<C: Connection, F: BrokerFactory<C>> Supervisor<C, F> {
    async fn run(mut self, first: Broker<C>) {
        let connection_id = self.shared.connection_id.clone();
        let mut broker = first;

        loop {
            if broker.connection_id() != connection_id {
                let err = SessionError::IdentityMismatch {
                    expected: connection_id.clone(),
                    actual: broker.connection_id().to_string(),
                };
                tracing::error!(%connection_id, error = %err, "aborting reconnection");
                let _ = broker.close().await;
                break;
            }

            self.shared.set_state(KeeperState::Active);
            match AssertUnwindSafe(self.run_instance(&broker)).catch_unwind().await {
                Ok(Ok(())) => tracing::debug!(%connection_id, "broker instance ended"),
                Ok(Err(SessionError::KeepaliveTimeout)) => {
                    tracing::error!(%connection_id, "keepalive timed out, dropping broker");
                }
                Ok(Err(e)) => tracing::warn!(%connection_id, error = %e, "broker instance failed"),
                Err(panic) => tracing::error!(
                    %connection_id,
                    panic = %panic_message(panic.as_ref()),
                    "broker instance panicked"
                ),
            }
            if let Err(e) = broker.close().await {
                tracing::debug!(%connection_id, error = %e, "closing broker failed");
            }
            drop(broker);

            if self.shared.is_closing() {
                break;
            }

            self.shared.set_state(KeeperState::Reconnecting);
            tracing::info!(%connection_id, "reconnecting");
            let cancel = self.shared.cancel.clone();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = self.factory.connect(cancel.clone()) => next,
            };
            match next {
                Some(next) => broker = next,
                None => {
                    tracing::info!(%connection_id, "no broker available, giving up");
                    break;
                }
            }
        }

        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        // Release the factory and the queues before observers see the
        // terminal state; `read` returns `None` from here on.
        let Self {
            shared,
            factory,
            outbound_tx,
            outbound_rx,
            inbound_tx,
            ..
        } = self;
        drop((factory, outbound_tx, outbound_rx, inbound_tx));
        shared.set_state(KeeperState::Closed);
        tracing::info!(%connection_id, "keeper closed");
    }

    /// Runs the three loops against one broker until the first exits.
    async fn run_instance(&mut self, broker: &Broker<C>) -> Result<(), SessionError> {
        let cancel = self.shared.cancel.child_token();
        let backoff = self.shared.config.retry_backoff;
        let (ack_tx, mut ack_rx) = mpsc::channel(1);

        let superseded = self.factory.superseded();

        let (written, read, keepalive, ()) = tokio::join!(
            write_loop(broker, &mut self.outbound_rx, &cancel, backoff),
            read_loop(broker, &self.inbound_tx, &self.outbound_tx, &ack_tx, &cancel, backoff),
            keepalive_loop(broker.keepalive(), &self.outbound_tx, &mut ack_rx, &cancel),
            watch_superseded(broker, superseded, &cancel),
        );
        // Cancellation is how the loops stop each other; the interesting
        // error is whichever one wasn't that.
        [written, read, keepalive]
            .into_iter()
            .filter(|r| !matches!(r, Err(SessionError::Cancelled)))
            .find(Result::is_err)
            .unwrap_or(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Ends the instance once a newer broker is waiting.
async fn watch_superseded<C: Connection>(
    broker: &Broker<C>,
    superseded: Option<CancellationToken>,
    cancel: &CancellationToken,
) {
    let Some(superseded) = superseded else {
        return;
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = superseded.cancelled() => {
            tracing::info!(connection_id = %broker.connection_id(), "newer broker waiting, dropping current one");
            cancel.cancel();
        }
    }
}

/// Sleeps for `backoff`; `false` if cancelled meanwhile.
async fn pause(backoff: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

async fn enqueue(
    outbound: &mpsc::Sender<Outbound>,
    packet: Packet,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        sent = outbound.send(Outbound::new(packet)) => sent.map_err(|_| SessionError::Closed),
    }
}

async fn write_loop<C: Connection>(
    broker: &Broker<C>,
    outbound: &mut mpsc::Receiver<Outbound>,
    cancel: &CancellationToken,
    backoff: Duration,
) -> Result<(), SessionError> {
    let _guard = cancel.clone().drop_guard();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = outbound.recv() => next,
        };
        let Some(Outbound { packet, written }) = next else {
            return Ok(());
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = broker.write_packet(packet) => result,
        };
        match result {
            Ok(()) => {
                if let Some(written) = written {
                    let _ = written.send(());
                }
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!(connection_id = %broker.connection_id(), "write timed out, backing off");
                if !pause(backoff, cancel).await {
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_loop<C: Connection>(
    broker: &Broker<C>,
    inbound: &mpsc::Sender<Packet>,
    outbound: &mpsc::Sender<Outbound>,
    acks: &mpsc::Sender<()>,
    cancel: &CancellationToken,
    backoff: Duration,
) -> Result<(), SessionError> {
    let _guard = cancel.clone().drop_guard();
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = broker.read_packet() => result,
        };
        let packet = match result {
            Ok(packet) => packet,
            Err(e) if e.is_timeout() => {
                if !pause(backoff, cancel).await {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        match packet {
            Packet::Heartbeat => {
                tracing::debug!(connection_id = %broker.connection_id(), "heartbeat received");
                enqueue(outbound, Packet::HeartbeatAck, cancel).await?;
            }
            Packet::HeartbeatAck => {
                // Unsolicited or duplicate acks are dropped.
                let _ = acks.try_send(());
            }
            Packet::Disconnect => {
                tracing::info!(connection_id = %broker.connection_id(), "peer disconnected");
                return Ok(());
            }
            packet => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = inbound.send(packet) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn keepalive_loop(
    interval: Duration,
    outbound: &mpsc::Sender<Outbound>,
    acks: &mut mpsc::Receiver<()>,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    if interval.is_zero() {
        // Disabled. Exiting now would cancel the other two loops.
        cancel.cancelled().await;
        return Ok(());
    }
    let _guard = cancel.clone().drop_guard();

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        while acks.try_recv().is_ok() {}
        enqueue(outbound, Packet::Heartbeat, cancel).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            ack = tokio::time::timeout(interval, acks.recv()) => match ack {
                Ok(Some(())) => tracing::trace!("heartbeat acknowledged"),
                Ok(None) => return Ok(()),
                Err(_) => return Err(SessionError::KeepaliveTimeout),
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use futures_util::SinkExt;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::testing::{next_non_heartbeat, raw_pair, raw_pair_with};
    use crate::BrokerConfig;

    // -- Helpers ----------------------------------------------------------

    /// A factory that hands out prepared brokers in order and reports
    /// each call on `calls`.
    fn queued_factory(
        brokers: Vec<Broker<DuplexStream>>,
    ) -> (
        impl BrokerFactory<DuplexStream>,
        mpsc::UnboundedReceiver<usize>,
    ) {
        let queue = Arc::new(StdMutex::new(VecDeque::from(brokers)));
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let mut count = 0;
        let factory = move |_cancel: CancellationToken| {
            count += 1;
            let _ = calls_tx.send(count);
            let next = queue.lock().unwrap().pop_front();
            async move { next }
        };
        (factory, calls_rx)
    }

    async fn started(
        brokers: Vec<Broker<DuplexStream>>,
    ) -> (Keeper<DuplexStream>, mpsc::UnboundedReceiver<usize>) {
        let (factory, mut calls) = queued_factory(brokers);
        let keeper = Keeper::start(factory, KeeperConfig::default())
            .await
            .expect("keeper starts");
        assert_eq!(calls.recv().await, Some(1));
        (keeper, calls)
    }

    async fn wait_for_state(keeper: &Keeper<DuplexStream>, want: KeeperState) {
        let mut rx = keeper.subscribe_state();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
            .await
            .expect("state reached in time")
            .expect("state channel open");
    }

    fn publish(id: u32) -> Packet {
        Packet::publish(id, format!("msg-{id}").into_bytes())
    }

    // =====================================================================
    // start()
    // =====================================================================

    #[tokio::test]
    async fn test_start_factory_none_returns_start_failed() {
        let result =
            Keeper::<DuplexStream>::start(|_: CancellationToken| async { None }, KeeperConfig::default())
                .await;
        assert!(matches!(result, Err(SessionError::StartFailed)));
    }

    #[tokio::test]
    async fn test_start_adopts_first_broker_identity() {
        let (broker, _peer) = raw_pair("alice", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;
        assert_eq!(keeper.connection_id(), "alice");
        wait_for_state(&keeper, KeeperState::Active).await;
        keeper.close().await.unwrap();
    }

    // =====================================================================
    // write_packet()
    // =====================================================================

    #[tokio::test]
    async fn test_write_packet_preserves_enqueue_order() {
        let (broker, mut peer) = raw_pair("order", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;
        let token = CancellationToken::new();

        for id in [1, 2, 3] {
            keeper.write_packet(&token, publish(id)).await.unwrap();
        }
        for id in [1, 2, 3] {
            assert_eq!(next_non_heartbeat(&mut peer).await, Some(publish(id)));
        }
        keeper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_packet_cancelled_token_returns_cancelled() {
        let (broker, _peer) = raw_pair("cancel", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;
        let token = CancellationToken::new();
        token.cancel();

        let result = keeper.write_packet(&token, publish(1)).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
        keeper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_packet_after_close_returns_closed() {
        let (broker, _peer) = raw_pair("closed", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;
        keeper.close().await.unwrap();

        let result = keeper.write_packet(&CancellationToken::new(), publish(1)).await;
        assert!(matches!(result, Err(SessionError::Closed)));
        assert!(keeper.is_closed());
    }

    // =====================================================================
    // read loop
    // =====================================================================

    #[tokio::test]
    async fn test_read_heartbeat_answered_and_not_delivered() {
        let (broker, mut peer) = raw_pair("hb", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;

        peer.send(Packet::Heartbeat).await.unwrap();
        peer.send(publish(7)).await.unwrap();

        assert_eq!(next_non_heartbeat(&mut peer).await, Some(Packet::HeartbeatAck));
        assert_eq!(keeper.read().await, Some(publish(7)));
        keeper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_delivers_in_wire_order() {
        let (broker, mut peer) = raw_pair("in-order", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;

        for id in [10, 11, 12] {
            peer.send(publish(id)).await.unwrap();
        }
        for id in [10, 11, 12] {
            assert_eq!(keeper.read().await, Some(publish(id)));
        }
        keeper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_peer_disconnect_triggers_reconnect() {
        let (first, mut peer1) = raw_pair("bye", Duration::ZERO).await;
        let (second, mut peer2) = raw_pair("bye", Duration::ZERO).await;
        let (keeper, mut calls) = started(vec![first, second]).await;

        peer1.send(Packet::Disconnect).await.unwrap();
        assert_eq!(calls.recv().await, Some(2));

        peer2.send(publish(1)).await.unwrap();
        assert_eq!(keeper.read().await, Some(publish(1)));
        keeper.close().await.unwrap();
        assert_eq!(next_non_heartbeat(&mut peer2).await, Some(Packet::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_retried_not_fatal() {
        let config = BrokerConfig::default()
            .with_connection_id("patient")
            .with_keepalive(Duration::ZERO)
            .with_read_timeout(Duration::from_secs(1));
        let (broker, mut peer) = raw_pair_with(config).await;
        let (keeper, mut calls) = started(vec![broker]).await;

        // Several read deadlines expire while the peer stays quiet.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(calls.try_recv().is_err(), "factory not called again");
        assert_eq!(keeper.state(), KeeperState::Active);

        peer.send(publish(3)).await.unwrap();
        assert_eq!(keeper.read().await, Some(publish(3)));
        keeper.close().await.unwrap();
    }

    // =====================================================================
    // keepalive
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_answered_heartbeats_keep_broker() {
        let (broker, mut peer) = raw_pair("alive", Duration::from_secs(1)).await;
        let (keeper, mut calls) = started(vec![broker]).await;

        for _ in 0..3 {
            let packet = futures_util::StreamExt::next(&mut peer).await;
            assert!(matches!(packet, Some(Ok(Packet::Heartbeat))));
            peer.send(Packet::HeartbeatAck).await.unwrap();
        }
        assert!(calls.try_recv().is_err(), "factory not called again");
        assert_eq!(keeper.state(), KeeperState::Active);
        keeper.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_missing_ack_reinvokes_factory() {
        let (first, mut peer1) = raw_pair("liveness", Duration::from_secs(1)).await;
        let (second, _peer2) = raw_pair("liveness", Duration::from_secs(1)).await;
        let started_at = Instant::now();
        let (keeper, mut calls) = started(vec![first, second]).await;

        // The silent peer sees the heartbeat but never answers it.
        let packet = futures_util::StreamExt::next(&mut peer1).await;
        assert!(matches!(packet, Some(Ok(Packet::Heartbeat))));

        let call = tokio::time::timeout(Duration::from_secs(5), calls.recv())
            .await
            .expect("factory re-invoked in bounded time");
        assert_eq!(call, Some(2));
        assert!(started_at.elapsed() >= Duration::from_secs(2));
        keeper.close().await.unwrap();
    }

    // =====================================================================
    // reconnect identity
    // =====================================================================

    #[tokio::test]
    async fn test_reconnect_identity_mismatch_aborts() {
        let (first, peer1) = raw_pair("alice", Duration::ZERO).await;
        let (imposter, _peer2) = raw_pair("mallory", Duration::ZERO).await;
        let (keeper, mut calls) = started(vec![first, imposter]).await;

        drop(peer1);
        assert_eq!(calls.recv().await, Some(2));
        wait_for_state(&keeper, KeeperState::Closed).await;

        assert_eq!(keeper.connection_id(), "alice");
        assert!(keeper.is_closed());
        assert_eq!(keeper.read().await, None);
        assert!(calls.try_recv().is_err(), "no further reconnects");
    }

    #[tokio::test]
    async fn test_reconnect_factory_exhausted_closes_keeper() {
        let (first, peer1) = raw_pair("solo", Duration::ZERO).await;
        let (keeper, mut calls) = started(vec![first]).await;

        drop(peer1);
        assert_eq!(calls.recv().await, Some(2));
        wait_for_state(&keeper, KeeperState::Closed).await;
        assert_eq!(keeper.read().await, None);
    }

    // =====================================================================
    // close()
    // =====================================================================

    #[tokio::test]
    async fn test_close_sends_disconnect_then_eof() {
        let (broker, mut peer) = raw_pair("graceful", Duration::ZERO).await;
        let (keeper, mut calls) = started(vec![broker]).await;
        wait_for_state(&keeper, KeeperState::Active).await;

        keeper.close().await.unwrap();
        assert_eq!(keeper.state(), KeeperState::Closed);

        assert_eq!(next_non_heartbeat(&mut peer).await, Some(Packet::Disconnect));
        assert_eq!(next_non_heartbeat(&mut peer).await, None, "transport shut down");
        assert!(calls.try_recv().is_err(), "no reconnect after close");
    }

    #[tokio::test]
    async fn test_close_right_after_start_still_sends_disconnect() {
        let (broker, mut peer) = raw_pair("fast", Duration::ZERO).await;
        let (factory, _calls) = queued_factory(vec![broker]);
        let keeper = Keeper::start(factory, KeeperConfig::default()).await.unwrap();

        keeper.close().await.unwrap();
        assert_eq!(next_non_heartbeat(&mut peer).await, Some(Packet::Disconnect));
        assert_eq!(next_non_heartbeat(&mut peer).await, None);
    }

    #[tokio::test]
    async fn test_close_twice_is_ok() {
        let (broker, _peer) = raw_pair("twice", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;
        keeper.close().await.unwrap();
        keeper.close().await.unwrap();
        assert_eq!(keeper.state(), KeeperState::Closed);
    }

    #[tokio::test]
    async fn test_drop_cancels_supervisor() {
        let (broker, mut peer) = raw_pair("dropped", Duration::ZERO).await;
        let (keeper, _calls) = started(vec![broker]).await;
        let mut state = keeper.subscribe_state();
        drop(keeper);

        state
            .wait_for(|s| *s == KeeperState::Closed)
            .await
            .expect("supervisor reports closed");
        // No parting DISCONNECT on drop, just the shutdown.
        assert_eq!(next_non_heartbeat(&mut peer).await, None);
    }

    // =====================================================================
    // Panics
    // =====================================================================

    /// Hands out brokers in order; setting up the first instance panics.
    struct PanicsOnFirstInstance {
        brokers: VecDeque<Broker<DuplexStream>>,
        calls: mpsc::UnboundedSender<usize>,
        count: usize,
    }

    impl BrokerFactory<DuplexStream> for PanicsOnFirstInstance {
        async fn connect(&mut self, _cancel: CancellationToken) -> Option<Broker<DuplexStream>> {
            self.count += 1;
            let _ = self.calls.send(self.count);
            self.brokers.pop_front()
        }

        fn superseded(&self) -> Option<CancellationToken> {
            if self.count == 1 {
                panic!("instance setup failed");
            }
            None
        }
    }

    #[tokio::test]
    async fn test_instance_panic_is_contained_and_reconnects() {
        let (first, mut peer1) = raw_pair("sturdy", Duration::ZERO).await;
        let (second, mut peer2) = raw_pair("sturdy", Duration::ZERO).await;
        let (calls_tx, mut calls) = mpsc::unbounded_channel();
        let factory = PanicsOnFirstInstance {
            brokers: VecDeque::from(vec![first, second]),
            calls: calls_tx,
            count: 0,
        };
        let keeper = Keeper::start(factory, KeeperConfig::default()).await.unwrap();
        assert_eq!(calls.recv().await, Some(1));

        // The panicking instance's broker is closed and a new one fetched.
        assert_eq!(calls.recv().await, Some(2));
        assert_eq!(next_non_heartbeat(&mut peer1).await, None);

        peer2.send(publish(4)).await.unwrap();
        assert_eq!(keeper.read().await, Some(publish(4)));
        assert!(!keeper.is_closed());
        keeper.close().await.unwrap();
    }

    // =====================================================================
    // Helpers
    // =====================================================================

    #[test]
    fn test_panic_message_extracts_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
