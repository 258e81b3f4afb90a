//! The session manager: routes accepted brokers to logical sessions.
//!
//! On the server, a client that reconnects shows up as a brand-new TCP
//! connection. After the handshake its broker carries the same
//! connection id as before, and it should feed the keeper that already
//! exists for that id instead of starting a second one.
//!
//! The manager keeps one entry per live session:
//!
//! ```text
//! route(broker)
//!   ├─ unknown id ─────────────→ Fresh(SessionFactory)  → caller starts a Keeper
//!   ├─ known id, slot free ────→ Resumed                → broker handed to the keeper
//!   └─ known id, slot taken ───→ Rejected(broker)       → caller closes it
//! ```
//!
//! The [`SessionFactory`] is the keeper's [`BrokerFactory`]. Its first
//! call yields the accepting broker. Every later call means the previous
//! transport died: the session is marked `Disconnected` and the factory
//! waits up to the grace period for a handoff. When the factory is
//! dropped (the keeper ended) the entry is removed.
//!
//! A handoff also fires the session's `superseded` token, so a keeper
//! still holding a half-open transport drops it and picks up the new
//! broker at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tether_transport::Connection;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{Broker, BrokerFactory, SessionConfig};

/// Lifecycle of one server-side session.
///
/// ```text
///   Connected ──(transport lost)──→ Disconnected ──(grace elapsed)──→ removed
///       ↑                                │
///       └──────────(handoff)─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A broker is attached (or queued for the keeper).
    Connected,

    /// The keeper lost its broker at the given instant and is waiting
    /// for the client to come back.
    Disconnected { since: Instant },
}

/// What [`SessionManager::route`] did with a broker.
pub enum Route<C: Connection> {
    /// New session. Start a keeper with this factory.
    Fresh(SessionFactory<C>),
    /// Handed to the existing session's keeper.
    Resumed,
    /// The session already has a reconnect queued. The broker is
    /// returned so the caller can close it.
    Rejected(Broker<C>),
}

struct SessionEntry<C: Connection> {
    state: SessionState,
    handoff: mpsc::Sender<Broker<C>>,
    /// Token of the broker the keeper is currently running.
    superseded: CancellationToken,
    generation: u64,
}

struct Registry<C: Connection> {
    sessions: HashMap<String, SessionEntry<C>>,
    next_generation: u64,
}

/// Registry of server-side sessions, keyed by connection id.
///
/// Clones share the same registry.
pub struct SessionManager<C: Connection> {
    registry: Arc<Mutex<Registry<C>>>,
    config: SessionConfig,
}

impl<C: Connection> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

/// The registry holds no invariant a panicking holder could break
/// halfway, so a poisoned lock is still usable.
fn lock<C: Connection>(registry: &Mutex<Registry<C>>) -> MutexGuard<'_, Registry<C>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connection> SessionManager<C> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                sessions: HashMap::new(),
                next_generation: 0,
            })),
            config,
        }
    }

    /// Routes a freshly accepted broker.
    pub fn route(&self, broker: Broker<C>) -> Route<C> {
        let connection_id = broker.connection_id().to_string();
        let mut registry = lock(&self.registry);

        let broker = match registry.sessions.get_mut(&connection_id) {
            Some(entry) => match entry.handoff.try_send(broker) {
                Ok(()) => {
                    entry.state = SessionState::Connected;
                    entry.superseded.cancel();
                    tracing::info!(%connection_id, "session resumed");
                    return Route::Resumed;
                }
                Err(TrySendError::Full(broker)) => {
                    tracing::warn!(%connection_id, "reconnect already pending, rejecting");
                    return Route::Rejected(broker);
                }
                // The keeper is gone but its factory has not been dropped
                // yet. Start over.
                Err(TrySendError::Closed(broker)) => broker,
            },
            None => broker,
        };

        let generation = registry.next_generation;
        registry.next_generation += 1;
        let (handoff_tx, handoff_rx) = mpsc::channel(self.config.handoff_capacity.max(1));
        let superseded = CancellationToken::new();
        registry.sessions.insert(
            connection_id.clone(),
            SessionEntry {
                state: SessionState::Connected,
                handoff: handoff_tx,
                superseded: superseded.clone(),
                generation,
            },
        );
        tracing::info!(%connection_id, "session created");

        Route::Fresh(SessionFactory {
            connection_id,
            first: Some(broker),
            handoff: handoff_rx,
            superseded,
            registry: self.registry.clone(),
            generation,
            grace: self.config.reconnect_grace(),
        })
    }

    /// Looks up a session's state.
    ///
    /// Returns `None` if no session exists for this id.
    pub fn get_state(&self, connection_id: &str) -> Option<SessionState> {
        lock(&self.registry)
            .sessions
            .get(connection_id)
            .map(|entry| entry.state)
    }

    /// Returns the number of live sessions (any state).
    pub fn len(&self) -> usize {
        lock(&self.registry).sessions.len()
    }

    /// Returns `true` if there are no sessions.
    pub fn is_empty(&self) -> bool {
        lock(&self.registry).sessions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SessionFactory
// ---------------------------------------------------------------------------

/// The [`BrokerFactory`] behind one server-side session.
pub struct SessionFactory<C: Connection> {
    connection_id: String,
    first: Option<Broker<C>>,
    handoff: mpsc::Receiver<Broker<C>>,
    superseded: CancellationToken,
    registry: Arc<Mutex<Registry<C>>>,
    generation: u64,
    grace: Duration,
}

impl<C: Connection> SessionFactory<C> {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn set_state(&self, state: SessionState) {
        let mut registry = lock(&self.registry);
        if let Some(entry) = registry.sessions.get_mut(&self.connection_id) {
            if entry.generation == self.generation {
                entry.state = state;
            }
        }
    }

    /// Adopts `broker` as the running one.
    ///
    /// Any broker queued meanwhile is newer, so it wins and the older
    /// ones are returned for closing. The fresh token is installed under
    /// the same lock `route` holds while queueing, so a handoff that
    /// lands after this call fires it.
    fn adopt(&mut self, mut broker: Broker<C>) -> (Broker<C>, Vec<Broker<C>>) {
        let mut stale = Vec::new();
        let mut registry = lock(&self.registry);
        while let Ok(newer) = self.handoff.try_recv() {
            stale.push(std::mem::replace(&mut broker, newer));
        }
        self.superseded = CancellationToken::new();
        if let Some(entry) = registry.sessions.get_mut(&self.connection_id) {
            if entry.generation == self.generation {
                entry.state = SessionState::Connected;
                entry.superseded = self.superseded.clone();
            }
        }
        (broker, stale)
    }
}

impl<C: Connection> BrokerFactory<C> for SessionFactory<C> {
    async fn connect(&mut self, cancel: CancellationToken) -> Option<Broker<C>> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }

        self.set_state(SessionState::Disconnected {
            since: Instant::now(),
        });
        tracing::info!(
            connection_id = %self.connection_id,
            grace = ?self.grace,
            "waiting for client to reconnect"
        );

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = tokio::time::timeout(self.grace, self.handoff.recv()) => next.ok().flatten(),
        };
        let Some(next) = next else {
            tracing::info!(
                connection_id = %self.connection_id,
                "session expired (grace period elapsed)"
            );
            return None;
        };

        let (broker, stale) = self.adopt(next);
        for old in stale {
            tracing::debug!(connection_id = %self.connection_id, "closing superseded handoff");
            let _ = old.close().await;
        }
        Some(broker)
    }

    fn superseded(&self) -> Option<CancellationToken> {
        Some(self.superseded.clone())
    }
}

impl<C: Connection> Drop for SessionFactory<C> {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        let current = registry
            .sessions
            .get(&self.connection_id)
            .is_some_and(|entry| entry.generation == self.generation);
        if current {
            registry.sessions.remove(&self.connection_id);
            tracing::debug!(connection_id = %self.connection_id, "session removed");
        }
    }
}
