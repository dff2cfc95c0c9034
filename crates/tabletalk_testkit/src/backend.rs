//! A scriptable remote store for integration tests.
//!
//! [`ScriptedBackend`] implements the engine's backend trait around a
//! shared script: tests keep a clone to stage snapshots, feed the change
//! log, inject failures, and drive the push channel, while the engine
//! owns the other clone.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tabletalk_engine::{EngineError, EngineResult, PushSignal, SessionBackend, Subscription};
use tabletalk_model::{ChangeRow, EntityKind, ServerTime, SessionId, SnapshotRows};
use tokio::sync::mpsc;

#[derive(Default)]
struct Script {
    snapshot: Mutex<Option<SnapshotRows>>,
    change_log: Mutex<Vec<ChangeRow>>,
    refuse_subscribes: Mutex<u32>,
    hold_acknowledgment: AtomicBool,
    fail_snapshots: Mutex<u32>,
    fail_since: Mutex<u32>,
    subscribe_calls: AtomicU64,
    snapshot_calls: AtomicU64,
    since_calls: AtomicU64,
    open_subscriptions: Arc<AtomicU64>,
    sink: Mutex<Option<mpsc::UnboundedSender<PushSignal>>>,
}

/// A remote store whose behavior is scripted by the test.
///
/// Clones share one script, so a test typically clones the backend,
/// hands one clone to the engine, and keeps the other as a remote
/// control.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Script>,
}

impl ScriptedBackend {
    /// Creates a backend with nothing scripted.
    ///
    /// Until a snapshot is staged, snapshot fetches fail, which is
    /// itself a useful script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages the response for snapshot fetches.
    pub fn stage_snapshot(&self, rows: SnapshotRows) {
        *self.script.snapshot.lock() = Some(rows);
    }

    /// Appends rows to the change log served by incremental fetches.
    pub fn append_changes(&self, rows: Vec<ChangeRow>) {
        self.script.change_log.lock().extend(rows);
    }

    /// Makes the next `count` subscription attempts fail.
    pub fn refuse_next_subscribes(&self, count: u32) {
        *self.script.refuse_subscribes.lock() = count;
    }

    /// When set, subscription attempts never acknowledge.
    pub fn hold_acknowledgment(&self, hold: bool) {
        self.script
            .hold_acknowledgment
            .store(hold, Ordering::SeqCst);
    }

    /// Makes the next `count` snapshot fetches fail.
    pub fn fail_next_snapshots(&self, count: u32) {
        *self.script.fail_snapshots.lock() = count;
    }

    /// Makes the next `count` incremental fetches fail.
    ///
    /// A fetch spanning several entity kinds counts once per failing
    /// kind request.
    pub fn fail_next_since(&self, count: u32) {
        *self.script.fail_since.lock() = count;
    }

    /// Delivers change rows on the open subscription, if any.
    pub fn push_rows(&self, rows: Vec<ChangeRow>) {
        self.emit(PushSignal::Rows(rows));
    }

    /// Delivers a transport error on the open subscription, if any.
    pub fn push_error(&self, reason: &str) {
        self.emit(PushSignal::Error(reason.to_owned()));
    }

    /// Closes the open subscription from the remote side.
    pub fn push_closed(&self) {
        self.emit(PushSignal::Closed);
    }

    /// Number of subscription attempts observed.
    pub fn subscribe_calls(&self) -> u64 {
        self.script.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of snapshot fetches observed.
    pub fn snapshot_calls(&self) -> u64 {
        self.script.snapshot_calls.load(Ordering::SeqCst)
    }

    /// Number of per-kind incremental fetches observed.
    pub fn since_calls(&self) -> u64 {
        self.script.since_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions currently held open by the engine.
    pub fn open_subscriptions(&self) -> u64 {
        self.script.open_subscriptions.load(Ordering::SeqCst)
    }

    fn emit(&self, signal: PushSignal) {
        if let Some(sink) = self.script.sink.lock().as_ref() {
            let _ = sink.send(signal);
        }
    }

    fn take_failure(slot: &Mutex<u32>) -> bool {
        let mut remaining = slot.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

impl SessionBackend for ScriptedBackend {
    async fn subscribe_changes(
        &self,
        _session: &SessionId,
        _kinds: &[EntityKind],
        sink: mpsc::UnboundedSender<PushSignal>,
    ) -> EngineResult<Subscription> {
        self.script.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.hold_acknowledgment.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if Self::take_failure(&self.script.refuse_subscribes) {
            return Err(EngineError::transport("scripted subscribe refusal"));
        }
        *self.script.sink.lock() = Some(sink);
        let open = Arc::clone(&self.script.open_subscriptions);
        open.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription::new(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    async fn fetch_snapshot(&self, _session: &SessionId) -> EngineResult<SnapshotRows> {
        self.script.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.script.fail_snapshots) {
            return Err(EngineError::fetch("scripted snapshot failure"));
        }
        self.script
            .snapshot
            .lock()
            .clone()
            .ok_or_else(|| EngineError::fetch("no snapshot staged"))
    }

    async fn fetch_since(
        &self,
        _session: &SessionId,
        kind: EntityKind,
        since: ServerTime,
    ) -> EngineResult<Vec<ChangeRow>> {
        self.script.since_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.script.fail_since) {
            return Err(EngineError::fetch("scripted fetch failure"));
        }
        let rows = self
            .script
            .change_log
            .lock()
            .iter()
            .filter(|row| {
                row.entity_kind == kind.as_str() && row.server_time > since.millis()
            })
            .cloned()
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{participant_row, phase_row, session_id, SnapshotFixture};
    use tabletalk_model::SessionPhase;

    #[tokio::test]
    async fn serves_staged_snapshot_and_filters_changes() {
        let backend = ScriptedBackend::new();
        let session = session_id();
        backend.stage_snapshot(SnapshotFixture::new(&session).taken_at(1_000).build());
        backend.append_changes(vec![
            phase_row(&session, SessionPhase::Voting, 2_000),
            participant_row(&crate::fixtures::participant_id(), "Alice", 3_000),
        ]);

        let snapshot = backend.fetch_snapshot(&session).await.unwrap();
        assert_eq!(snapshot.server_time, 1_000);

        let rows = backend
            .fetch_since(&session, EntityKind::Session, ServerTime::from_millis(1_000))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let none = backend
            .fetch_since(&session, EntityKind::Session, ServerTime::from_millis(2_000))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let backend = ScriptedBackend::new();
        let session = session_id();
        backend.stage_snapshot(SnapshotFixture::new(&session).build());
        backend.fail_next_snapshots(1);

        assert!(backend.fetch_snapshot(&session).await.is_err());
        assert!(backend.fetch_snapshot(&session).await.is_ok());
    }

    #[tokio::test]
    async fn subscription_lifecycle_is_tracked() {
        let backend = ScriptedBackend::new();
        let session = session_id();
        let (sink, _rx) = mpsc::unbounded_channel();

        let mut subscription = backend
            .subscribe_changes(&session, &EntityKind::ALL, sink)
            .await
            .unwrap();
        assert_eq!(backend.open_subscriptions(), 1);

        subscription.close();
        assert_eq!(backend.open_subscriptions(), 0);
        assert_eq!(backend.subscribe_calls(), 1);
    }
}
