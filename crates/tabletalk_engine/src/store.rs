//! The authoritative in-memory snapshot.

use crate::merge::{merge, MergeReport};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tabletalk_model::{Delta, ServerTime, SessionPhase, SessionSnapshot};

/// Identifies one registered snapshot listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

type Listener = std::sync::Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

/// Outcome of one committed mutation.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Whether the snapshot actually changed.
    pub changed: bool,
    /// Phase after the commit, if a session record exists.
    pub phase: Option<SessionPhase>,
    /// What the merge did, for delta commits.
    pub report: MergeReport,
}

/// Sole owner of the authoritative, mutable current snapshot.
///
/// All mutation funnels through [`merge`] or wholesale replacement; every
/// committed change notifies subscribers synchronously, once, with the
/// post-commit snapshot. The generation counter advances on each full
/// replacement so superseded in-flight fetch results can be discarded by
/// the caller.
pub struct SessionStateStore {
    snapshot: RwLock<SessionSnapshot>,
    listeners: Mutex<Vec<(SubscriberId, Listener)>>,
    next_subscriber: AtomicU64,
    generation: AtomicU64,
    last_commit: RwLock<Option<ServerTime>>,
}

impl SessionStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(SessionSnapshot::empty()),
            listeners: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            last_commit: RwLock::new(None),
        }
    }

    /// Registers a listener invoked on every committed mutation.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .push((id, std::sync::Arc::new(listener)));
        id
    }

    /// Removes a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Returns a clone of the current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Returns the current phase, if a session record exists.
    pub fn phase(&self) -> Option<SessionPhase> {
        self.snapshot.read().phase()
    }

    /// Returns the generation of the current snapshot.
    ///
    /// Advances on every full replacement; delta merges do not advance it.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the server time of the last committed change.
    pub fn last_commit(&self) -> Option<ServerTime> {
        *self.last_commit.read()
    }

    /// Replaces the snapshot wholesale (full reload path).
    ///
    /// Returns the new generation.
    pub fn replace(&self, next: SessionSnapshot) -> u64 {
        let latest = next.latest_server_time();
        let changed = {
            let mut guard = self.snapshot.write();
            let changed = *guard != next;
            *guard = next;
            changed
        };
        *self.last_commit.write() = Some(latest);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if changed {
            self.notify();
        }
        generation
    }

    /// Merges a delta batch into the snapshot.
    ///
    /// The mutation and its single notification cycle are atomic with
    /// respect to each other: listeners observe the post-merge snapshot.
    pub fn apply_deltas(&self, deltas: &[Delta]) -> CommitOutcome {
        let (changed, phase, report, latest) = {
            let mut guard = self.snapshot.write();
            let (next, report) = merge(&guard, deltas);
            let changed = *guard != next;
            let phase = next.phase();
            let latest = next.latest_server_time();
            *guard = next;
            (changed, phase, report, latest)
        };
        if changed {
            *self.last_commit.write() = Some(latest);
            self.notify();
        }
        CommitOutcome {
            changed,
            phase,
            report,
        }
    }

    fn notify(&self) {
        let snapshot = self.snapshot.read().clone();
        // Callbacks run without the registry lock held so a listener may
        // subscribe or unsubscribe (itself included) from inside the
        // callback without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| std::sync::Arc::clone(listener))
            .collect();
        for listener in &listeners {
            listener(&snapshot);
        }
    }
}

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tabletalk_model::{
        Delta, DeltaBody, Participant, ParticipantId, SessionId, SourceTransport, SyncSession,
    };

    fn participant_delta(id: &str, at: i64) -> Delta {
        Delta::insert(
            DeltaBody::Participant(Participant::new(ParticipantId::new(id), id.to_owned())),
            ServerTime::from_millis(at),
            SourceTransport::Push,
        )
    }

    #[test]
    fn apply_notifies_once_per_commit() {
        let store = SessionStateStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.subscribe(move |snapshot| {
            assert_eq!(snapshot.participants.len(), 2);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let outcome =
            store.apply_deltas(&[participant_delta("p1", 10), participant_delta("p2", 11)]);
        assert!(outcome.changed);
        assert_eq!(outcome.report.applied, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unchanged_commit_does_not_notify() {
        let store = SessionStateStore::new();
        store.apply_deltas(&[participant_delta("p1", 10)]);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Re-applying the same delta is a no-op.
        let outcome = store.apply_deltas(&[participant_delta("p1", 10)]);
        assert!(!outcome.changed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = SessionStateStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = store.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        store.unsubscribe(id);

        store.apply_deltas(&[participant_delta("p1", 10)]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_resubscribe_and_remove_itself_during_notify() {
        let store = Arc::new(SessionStateStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<parking_lot::Mutex<Option<SubscriberId>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let id = {
            let inner = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            store.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                // A one-shot observer: register a replacement and drop out.
                inner.subscribe(|_| {});
                if let Some(id) = own_id.lock().take() {
                    inner.unsubscribe(id);
                }
            })
        };
        *own_id.lock() = Some(id);

        store.apply_deltas(&[participant_delta("p1", 10)]);
        store.apply_deltas(&[participant_delta("p2", 20)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_bumps_generation() {
        let store = SessionStateStore::new();
        assert_eq!(store.generation(), 0);

        let mut snapshot = SessionSnapshot::empty();
        snapshot.session = Some(SyncSession::new(
            SessionId::new("s1"),
            ServerTime::from_millis(5),
        ));
        let generation = store.replace(snapshot);
        assert_eq!(generation, 1);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.last_commit(), Some(ServerTime::from_millis(5)));

        // Deltas do not advance the generation.
        store.apply_deltas(&[participant_delta("p1", 10)]);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.last_commit(), Some(ServerTime::from_millis(10)));
    }
}
