//! The engine facade handed to consumers.
//!
//! [`SessionEngine`] owns the driver task and exposes a small,
//! runtime-agnostic surface: commands go in over a channel, reads come
//! out of shared state. Dropping the engine drops the command sender,
//! which the driver observes as a shutdown.

use crate::backend::SessionBackend;
use crate::config::EngineConfig;
use crate::driver::{Command, Driver, SharedStatus};
use crate::store::{SessionStateStore, SubscriberId};
use crate::supervisor::{HealthLevel, TransportMode};
use parking_lot::Mutex;
use std::sync::Arc;
use tabletalk_model::{ServerTime, SessionId, SessionSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A point-in-time view of the connection, for UI badges and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHealth {
    /// The transport currently feeding the store.
    pub mode: TransportMode,
    /// Derived health of that transport.
    pub health: HealthLevel,
    /// Consecutive errors on the active transport.
    pub consecutive_errors: u32,
    /// Server time of the last committed change, if any.
    pub last_update: Option<ServerTime>,
}

impl ConnectionHealth {
    pub(crate) fn idle() -> Self {
        Self {
            mode: TransportMode::Push,
            health: HealthLevel::Disconnected,
            consecutive_errors: 0,
            last_update: None,
        }
    }
}

/// Counters accumulated since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Deltas merged into the snapshot.
    pub deltas_applied: u64,
    /// Deltas dropped as stale duplicates.
    pub stale_dropped: u64,
    /// Deltas dropped because no safe ordering existed.
    pub conflicts_dropped: u64,
    /// Wire rows discarded as malformed.
    pub rows_rejected: u64,
    /// Full snapshot reloads committed.
    pub full_reloads: u64,
    /// Incremental fetches issued.
    pub incremental_fetches: u64,
    /// Falls from push to the polling transport.
    pub fallbacks: u64,
    /// Push recovery attempts (successful or not).
    pub recovery_attempts: u64,
}

/// The synchronization engine.
///
/// Create one per session consumer with [`SessionEngine::new`], then
/// [`connect`](SessionEngine::connect) it to a session. The mirrored
/// snapshot is read through [`snapshot`](SessionEngine::snapshot) or
/// observed through [`on_snapshot_change`](SessionEngine::on_snapshot_change).
///
/// All methods are non-blocking; the work happens on a dedicated driver
/// task that must be created inside a tokio runtime.
pub struct SessionEngine {
    store: Arc<SessionStateStore>,
    status: Arc<SharedStatus>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEngine {
    /// Creates an engine over the given backend and spawns its driver.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new<B: SessionBackend>(cfg: EngineConfig, backend: B) -> Self {
        let store = Arc::new(SessionStateStore::new());
        let status = Arc::new(SharedStatus::new());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(
            cfg,
            backend,
            Arc::clone(&store),
            Arc::clone(&status),
            command_rx,
        );
        let handle = tokio::spawn(driver.run());
        Self {
            store,
            status,
            commands,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Starts syncing `session`. An already-connected engine switches
    /// sessions, tearing the previous one down first.
    pub fn connect(&self, session: SessionId) {
        let _ = self.commands.send(Command::Connect(session));
    }

    /// Stops syncing. The last snapshot stays readable.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Requests an immediate full reload on the active transport and
    /// resets its error counters.
    pub fn force_refresh(&self) {
        let _ = self.commands.send(Command::ForceRefresh);
    }

    /// The current mirrored snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot()
    }

    /// The underlying store, for callers that want to share it.
    pub fn store(&self) -> Arc<SessionStateStore> {
        Arc::clone(&self.store)
    }

    /// Registers a snapshot-change observer. Fired at most once per
    /// commit, only when the commit changed the snapshot.
    pub fn on_snapshot_change(
        &self,
        listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.store.subscribe(listener)
    }

    /// Removes a previously registered observer.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.store.unsubscribe(id);
    }

    /// The connection as last published by the driver.
    pub fn connection_health(&self) -> ConnectionHealth {
        *self.status.connection.read()
    }

    /// Registers an observer fired whenever the connection view changes:
    /// mode switches, health transitions, new committed server times.
    pub fn on_connection_change(
        &self,
        listener: impl Fn(&ConnectionHealth) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.status.subscribe(listener)
    }

    /// Removes a previously registered connection observer.
    pub fn unsubscribe_connection(&self, id: SubscriberId) {
        self.status.unsubscribe(id);
    }

    /// Counters accumulated since creation.
    pub fn stats(&self) -> SyncStats {
        *self.status.stats.read()
    }

    /// Stops the driver and waits for it to finish.
    ///
    /// Idempotent; dropping the engine without calling this also stops
    /// the driver, just without the join.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("connection", &self.connection_health())
            .finish_non_exhaustive()
    }
}
