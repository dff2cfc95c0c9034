//! Remote store boundary.
//!
//! The engine only consumes the remote store's read/subscribe path:
//! a live change subscription, full snapshot fetches, and incremental
//! "changed since" fetches. [`SessionBackend`] abstracts that boundary,
//! allowing real network implementations and scripted ones for tests.

use crate::error::{EngineError, EngineResult};
use std::future::Future;
use tabletalk_model::{ChangeRow, EntityKind, ServerTime, SessionId, SnapshotRows};
use tokio::sync::mpsc;

/// Raw signals delivered on an open change subscription.
#[derive(Debug, Clone)]
pub enum PushSignal {
    /// One or more change rows arrived.
    Rows(Vec<ChangeRow>),
    /// The subscription hit an error but may still be open.
    Error(String),
    /// The subscription closed unexpectedly.
    Closed,
}

/// Handle to one open change subscription.
///
/// Closing is idempotent and fully releases the remote subscription;
/// dropping the handle closes it too, so an aborted listener task can
/// never leak a live subscription.
pub struct Subscription {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a close callback.
    pub fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Some(Box::new(closer)),
        }
    }

    /// A subscription that needs no remote teardown.
    pub fn noop() -> Self {
        Self { closer: None }
    }

    /// Releases the subscription. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("open", &self.closer.is_some())
            .finish()
    }
}

/// The remote store's read/subscribe interface.
///
/// All methods are non-blocking; failures are reported as values and
/// recovered by the engine, never surfaced as panics.
pub trait SessionBackend: Send + Sync + 'static {
    /// Opens a change subscription for one session covering the given
    /// entity kinds. Signals are delivered through `sink`; the returned
    /// subscription resolving successfully is the acknowledgment.
    fn subscribe_changes(
        &self,
        session: &SessionId,
        kinds: &[EntityKind],
        sink: mpsc::UnboundedSender<PushSignal>,
    ) -> impl Future<Output = EngineResult<Subscription>> + Send;

    /// Fetches the full entity set for a session.
    fn fetch_snapshot(
        &self,
        session: &SessionId,
    ) -> impl Future<Output = EngineResult<SnapshotRows>> + Send;

    /// Fetches rows of one entity kind changed since the given server time.
    fn fetch_since(
        &self,
        session: &SessionId,
        kind: EntityKind,
        since: ServerTime,
    ) -> impl Future<Output = EngineResult<Vec<ChangeRow>>> + Send;
}

/// A scripted backend for unit tests.
#[derive(Default)]
pub struct MockBackend {
    snapshot: parking_lot::Mutex<Option<SnapshotRows>>,
    since_rows: parking_lot::Mutex<Vec<ChangeRow>>,
    refuse_subscribe: parking_lot::Mutex<bool>,
    fail_fetches: parking_lot::Mutex<u32>,
    subscribe_calls: std::sync::atomic::AtomicU64,
    open_subscriptions: std::sync::Arc<std::sync::atomic::AtomicU64>,
    sink: parking_lot::Mutex<Option<mpsc::UnboundedSender<PushSignal>>>,
}

impl MockBackend {
    /// Creates an empty mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the snapshot returned by `fetch_snapshot`.
    pub fn set_snapshot(&self, rows: SnapshotRows) {
        *self.snapshot.lock() = Some(rows);
    }

    /// Sets the rows returned by `fetch_since` for any kind.
    pub fn set_since_rows(&self, rows: Vec<ChangeRow>) {
        *self.since_rows.lock() = rows;
    }

    /// Makes subscription attempts fail.
    pub fn set_refuse_subscribe(&self, refuse: bool) {
        *self.refuse_subscribe.lock() = refuse;
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: u32) {
        *self.fail_fetches.lock() = count;
    }

    /// Number of subscription attempts so far.
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of subscriptions currently held open.
    pub fn open_subscriptions(&self) -> u64 {
        self.open_subscriptions
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Emits a signal on the currently open subscription, if any.
    pub fn emit(&self, signal: PushSignal) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(signal);
        }
    }

    fn take_fetch_failure(&self) -> bool {
        let mut remaining = self.fail_fetches.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

impl SessionBackend for MockBackend {
    async fn subscribe_changes(
        &self,
        _session: &SessionId,
        _kinds: &[EntityKind],
        sink: mpsc::UnboundedSender<PushSignal>,
    ) -> EngineResult<Subscription> {
        self.subscribe_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if *self.refuse_subscribe.lock() {
            return Err(EngineError::transport("subscribe refused"));
        }
        *self.sink.lock() = Some(sink);
        self.open_subscriptions
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let open = std::sync::Arc::clone(&self.open_subscriptions);
        Ok(Subscription::new(move || {
            open.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }))
    }

    async fn fetch_snapshot(&self, session: &SessionId) -> EngineResult<SnapshotRows> {
        if self.take_fetch_failure() {
            return Err(EngineError::fetch("scripted snapshot failure"));
        }
        self.snapshot
            .lock()
            .clone()
            .ok_or_else(|| EngineError::fetch(format!("no snapshot scripted for {session}")))
    }

    async fn fetch_since(
        &self,
        _session: &SessionId,
        kind: EntityKind,
        since: ServerTime,
    ) -> EngineResult<Vec<ChangeRow>> {
        if self.take_fetch_failure() {
            return Err(EngineError::fetch("scripted since failure"));
        }
        Ok(self
            .since_rows
            .lock()
            .iter()
            .filter(|row| row.entity_kind == kind.as_str() && row.server_time > since.millis())
            .cloned()
            .collect())
    }
}
