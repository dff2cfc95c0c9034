//! The engine's single-task event loop.
//!
//! One driver task per engine instance multiplexes four event sources:
//! consumer commands, push channel events, the completion of the (at
//! most one) in-flight fetch, and a unified timer deadline covering the
//! poll scheduler and the recovery timer. All store mutation happens
//! here, on one task, which is what makes transport exclusivity and the
//! teardown guarantees easy to uphold.

use crate::backend::SessionBackend;
use crate::config::EngineConfig;
use crate::engine::{ConnectionHealth, SyncStats};
use crate::error::EngineError;
use crate::poll::{FetchKind, PollScheduler};
use crate::push::{PushChannel, PushEvent, PushEventKind};
use crate::store::{CommitOutcome, SessionStateStore, SubscriberId};
use crate::supervisor::{ConnectionSupervisor, Directive, SupervisorState, TransportMode};
use parking_lot::RwLock;
use std::sync::Arc;
use tabletalk_model::{
    decode_row, decode_snapshot, Delta, EntityKind, ServerTime, SessionId, SessionSnapshot,
    SourceTransport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Commands from the engine facade.
#[derive(Debug)]
pub(crate) enum Command {
    /// Start syncing the given session.
    Connect(SessionId),
    /// Stop syncing; the engine stays usable.
    Disconnect,
    /// Immediate full reload, resetting error counters.
    ForceRefresh,
    /// Stop the driver task.
    Shutdown,
}

type ConnectionListener = Arc<dyn Fn(&ConnectionHealth) + Send + Sync>;

/// State shared between the driver and the facade.
pub(crate) struct SharedStatus {
    pub(crate) connection: RwLock<ConnectionHealth>,
    pub(crate) stats: RwLock<SyncStats>,
    listeners: parking_lot::Mutex<Vec<(SubscriberId, ConnectionListener)>>,
    next_subscriber: std::sync::atomic::AtomicU64,
}

impl SharedStatus {
    pub(crate) fn new() -> Self {
        Self {
            connection: RwLock::new(ConnectionHealth::idle()),
            stats: RwLock::new(SyncStats::default()),
            listeners: parking_lot::Mutex::new(Vec::new()),
            next_subscriber: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(
        &self,
        listener: impl Fn(&ConnectionHealth) + Send + Sync + 'static,
    ) -> SubscriberId {
        let id = SubscriberId::from_raw(
            self.next_subscriber
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Stores the new connection view, notifying listeners only when it
    /// actually changed.
    pub(crate) fn publish(&self, next: ConnectionHealth) {
        let changed = {
            let mut current = self.connection.write();
            let changed = *current != next;
            *current = next;
            changed
        };
        if changed {
            // Same reentrancy contract as the store registry: callbacks
            // run over a copy so they may unsubscribe themselves.
            let listeners: Vec<ConnectionListener> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in &listeners {
                listener(&next);
            }
        }
    }
}

/// The payload a completed fetch produced.
enum FetchPayload {
    /// A decoded full snapshot and the number of rejected rows.
    Snapshot(Box<SessionSnapshot>, usize),
    /// Decoded incremental deltas, the latest row time, rejected count.
    Deltas(Vec<Delta>, ServerTime, usize),
}

struct InFlightFetch {
    kind: FetchKind,
    /// True if the poll scheduler issued this fetch.
    scheduled: bool,
    /// Scheduler epoch at spawn; a bumped epoch means discard.
    poll_epoch: u64,
    /// Store generation at spawn; a bumped generation supersedes an
    /// incremental result.
    generation: u64,
    task: JoinHandle<Result<FetchPayload, EngineError>>,
}

pub(crate) struct Driver<B: SessionBackend> {
    cfg: EngineConfig,
    backend: Arc<B>,
    store: Arc<SessionStateStore>,
    status: Arc<SharedStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    push_rx: mpsc::UnboundedReceiver<PushEvent>,
    push: PushChannel<B>,
    poll: PollScheduler,
    supervisor: ConnectionSupervisor,
    session: Option<SessionId>,
    recovery_at: Option<Instant>,
    /// When to retry the subscription after a terminal channel failure
    /// that stayed below the fallback threshold.
    reopen_at: Option<Instant>,
    in_flight: Option<InFlightFetch>,
    last_phase: Option<tabletalk_model::SessionPhase>,
}

impl<B: SessionBackend> Driver<B> {
    pub(crate) fn new(
        cfg: EngineConfig,
        backend: B,
        store: Arc<SessionStateStore>,
        status: Arc<SharedStatus>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let backend = Arc::new(backend);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let push = PushChannel::new(Arc::clone(&backend), cfg.ack_timeout);
        let poll = PollScheduler::new(cfg.poll.clone());
        let supervisor = ConnectionSupervisor::new(cfg.clone());
        Self {
            cfg,
            backend,
            store,
            status,
            commands,
            push_tx,
            push_rx,
            push,
            poll,
            supervisor,
            session: None,
            recovery_at: None,
            reopen_at: None,
            in_flight: None,
            last_phase: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.publish_status();
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        self.teardown();
                        return;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.push_rx.recv() => self.handle_push_event(event),
                result = join_fetch(&mut self.in_flight) => {
                    if let Some(fetch) = self.in_flight.take() {
                        self.handle_fetch_result(fetch, result);
                    }
                }
                _ = sleep_until_deadline(deadline) => self.handle_timers(),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.recovery_at, self.reopen_at, self.poll.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Connect(session) => {
                if self.session.is_some() {
                    self.teardown_session();
                }
                tracing::debug!(session = %session, "connecting");
                self.session = Some(session);
                self.last_phase = None;
                let directives = self.supervisor.connect(now);
                self.apply(directives, now);
            }
            Command::Disconnect => {
                tracing::debug!("disconnecting");
                let directives = self.supervisor.disconnect();
                self.apply(directives, now);
                self.teardown_session();
            }
            Command::ForceRefresh => {
                let directives = self.supervisor.force_reload();
                self.apply(directives, now);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_push_event(&mut self, event: PushEvent) {
        // Events from a torn-down subscription are stale by definition.
        if event.epoch != self.push.epoch() {
            return;
        }
        let now = Instant::now();
        match event.kind {
            PushEventKind::Connected => {
                tracing::debug!("push subscription acknowledged");
                let directives = self.supervisor.subscription_acknowledged(now);
                self.apply(directives, now);
            }
            PushEventKind::Deltas(deltas) => {
                // Only the active producer reaches the merge.
                if self.supervisor.current_mode() != TransportMode::Push {
                    return;
                }
                let outcome = self.store.apply_deltas(&deltas);
                self.record_commit(&outcome);
                let directives = self.supervisor.push_activity(now);
                self.apply(directives, now);
                self.check_phase(now);
            }
            PushEventKind::ChannelError(reason) => {
                tracing::warn!(%reason, "push transport error");
                let directives = self.supervisor.push_failure(now);
                self.apply(directives, now);
            }
            PushEventKind::ConnectFailed(reason) => {
                tracing::warn!(%reason, "push subscription failed");
                let directives = self.supervisor.push_failure(now);
                self.apply(directives, now);
                self.arm_reopen(now);
            }
            PushEventKind::Closed => {
                tracing::warn!("push subscription closed unexpectedly");
                let directives = self.supervisor.push_failure(now);
                self.apply(directives, now);
                self.arm_reopen(now);
            }
        }
    }

    /// Arms a delayed subscription retry after a terminal channel
    /// failure that did not cross the fallback threshold. The delay
    /// spaces retries at least one debounce window apart, so repeated
    /// refusals keep counting toward the threshold instead of looping
    /// hot.
    fn arm_reopen(&mut self, now: Instant) {
        if matches!(
            self.supervisor.state(),
            SupervisorState::Connecting
                | SupervisorState::PushHealthy
                | SupervisorState::PushDegraded
        ) {
            self.reopen_at = Some(now + self.cfg.error_debounce);
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        if let Some(at) = self.reopen_at {
            if at <= now {
                self.reopen_at = None;
                self.apply(vec![Directive::OpenPush], now);
            }
        }
        if let Some(at) = self.recovery_at {
            if at <= now {
                self.recovery_at = None;
                self.status.stats.write().recovery_attempts += 1;
                let directives = self.supervisor.recovery_due(now);
                self.apply(directives, now);
            }
        }
        if let Some(kind) = self.poll.tick(now) {
            self.spawn_fetch(kind, true);
        }
    }

    fn handle_fetch_result(
        &mut self,
        fetch: InFlightFetch,
        result: Result<FetchPayload, EngineError>,
    ) {
        let now = Instant::now();

        // The session may have been torn down or the scheduler recycled
        // while this fetch was in flight; such results must not touch
        // the store.
        if self.session.is_none() {
            return;
        }
        if fetch.scheduled && fetch.poll_epoch != self.poll.epoch() {
            return;
        }

        match result {
            Ok(FetchPayload::Snapshot(snapshot, rejected)) => {
                let latest = snapshot.latest_server_time();
                self.store.replace(*snapshot);
                {
                    let mut stats = self.status.stats.write();
                    stats.full_reloads += 1;
                    stats.rows_rejected += rejected as u64;
                }
                if fetch.scheduled {
                    self.poll.on_success(now, fetch.kind, latest);
                    let directives = self.supervisor.poll_success(now);
                    self.apply(directives, now);
                }
                self.check_phase(now);
            }
            Ok(FetchPayload::Deltas(deltas, latest, rejected)) => {
                self.status.stats.write().rows_rejected += rejected as u64;
                // A full reload committed after this fetch started
                // supersedes it: record the success, discard the data.
                if fetch.generation == self.store.generation() {
                    let outcome = self.store.apply_deltas(&deltas);
                    self.record_commit(&outcome);
                    if fetch.scheduled {
                        self.poll.on_success(now, fetch.kind, latest);
                    }
                    self.check_phase(now);
                } else if fetch.scheduled {
                    self.poll.on_success(now, fetch.kind, ServerTime::ZERO);
                }
                if fetch.scheduled {
                    let directives = self.supervisor.poll_success(now);
                    self.apply(directives, now);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "fetch failed");
                if fetch.scheduled {
                    self.poll.on_failure(now);
                    let directives = self.supervisor.poll_failure(now);
                    self.apply(directives, now);
                } else {
                    // The startup reload on the push side failed: the
                    // store is unreachable, which counts against push
                    // and eventually falls back to polling's retry
                    // machinery.
                    let directives = self.supervisor.push_failure(now);
                    self.apply(directives, now);
                }
            }
        }
    }

    fn apply(&mut self, directives: Vec<Directive>, now: Instant) {
        for directive in directives {
            match directive {
                Directive::OpenPush => {
                    self.reopen_at = None;
                    if let Some(session) = self.session.clone() {
                        self.push.open(&session, self.push_tx.clone());
                    }
                }
                Directive::ClosePush => {
                    self.reopen_at = None;
                    self.push.close();
                }
                Directive::StartPoll => {
                    let interval = self
                        .last_phase
                        .and_then(|phase| self.cfg.poll.interval_for_phase(phase))
                        .unwrap_or(self.cfg.poll.active_interval);
                    self.status.stats.write().fallbacks += 1;
                    self.poll.enable(now, interval);
                }
                Directive::StopPoll => self.poll.disable(),
                Directive::FullReload => self.request_full_reload(now),
                Directive::ScheduleRecovery(at) => self.recovery_at = Some(at),
                Directive::CancelRecovery => self.recovery_at = None,
            }
        }
    }

    fn request_full_reload(&mut self, now: Instant) {
        if self.session.is_none() {
            return;
        }
        self.abort_in_flight();
        if self.poll.is_enabled() && self.supervisor.current_mode() == TransportMode::Poll {
            self.poll.force_refresh(now);
            if let Some(kind) = self.poll.tick(now) {
                self.spawn_fetch(kind, true);
            }
        } else {
            self.spawn_fetch(FetchKind::FullReload, false);
        }
    }

    fn spawn_fetch(&mut self, kind: FetchKind, scheduled: bool) {
        let Some(session) = self.session.clone() else {
            return;
        };
        self.abort_in_flight();
        if matches!(kind, FetchKind::Incremental { .. }) {
            self.status.stats.write().incremental_fetches += 1;
        }
        let backend = Arc::clone(&self.backend);
        let task = tokio::spawn(run_fetch(backend, session, kind));
        self.in_flight = Some(InFlightFetch {
            kind,
            scheduled,
            poll_epoch: self.poll.epoch(),
            generation: self.store.generation(),
            task,
        });
    }

    fn abort_in_flight(&mut self) {
        if let Some(fetch) = self.in_flight.take() {
            fetch.task.abort();
        }
    }

    fn record_commit(&mut self, outcome: &CommitOutcome) {
        let mut stats = self.status.stats.write();
        stats.deltas_applied += outcome.report.applied as u64;
        stats.stale_dropped += outcome.report.stale as u64;
        stats.conflicts_dropped += outcome.report.conflicts.len() as u64;
        drop(stats);
        for key in &outcome.report.conflicts {
            tracing::warn!(?key, "delta dropped: no safe ordering");
        }
    }

    /// One decision per observed phase change: adjust the poll interval,
    /// and tear everything down when the terminal phase is reached.
    fn check_phase(&mut self, now: Instant) {
        let phase = self.store.phase();
        if phase == self.last_phase {
            return;
        }
        self.last_phase = phase;
        let Some(phase) = phase else {
            return;
        };
        tracing::debug!(phase = phase.as_str(), "session phase changed");
        if phase.is_terminal() {
            let directives = self.supervisor.session_ended();
            self.apply(directives, now);
            self.recovery_at = None;
        } else if self.poll.is_enabled() {
            self.poll
                .set_interval(now, self.cfg.poll.interval_for_phase(phase));
        }
    }

    fn teardown_session(&mut self) {
        self.push.close();
        self.poll.disable();
        self.recovery_at = None;
        self.reopen_at = None;
        self.abort_in_flight();
        self.session = None;
        self.last_phase = None;
    }

    fn teardown(&mut self) {
        self.teardown_session();
        self.publish_status();
    }

    fn publish_status(&self) {
        let state = self.supervisor.connection_state();
        self.status.publish(ConnectionHealth {
            mode: state.mode,
            health: state.health,
            consecutive_errors: state.consecutive_errors,
            last_update: self.store.last_commit(),
        });
    }
}

async fn join_fetch(
    slot: &mut Option<InFlightFetch>,
) -> Result<FetchPayload, EngineError> {
    match slot.as_mut() {
        Some(fetch) => match (&mut fetch.task).await {
            Ok(result) => result,
            Err(join_err) => Err(EngineError::fetch(format!("fetch task failed: {join_err}"))),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_fetch<B: SessionBackend>(
    backend: Arc<B>,
    session: SessionId,
    kind: FetchKind,
) -> Result<FetchPayload, EngineError> {
    match kind {
        FetchKind::FullReload => {
            let rows = backend.fetch_snapshot(&session).await?;
            let decoded = decode_snapshot(&rows)?;
            for err in &decoded.rejected {
                tracing::warn!(error = %err, "discarding malformed snapshot row");
            }
            Ok(FetchPayload::Snapshot(
                Box::new(decoded.snapshot),
                decoded.rejected.len(),
            ))
        }
        FetchKind::Incremental { since } => {
            let mut deltas = Vec::new();
            let mut rejected = 0usize;
            let mut latest = since;
            for entity_kind in EntityKind::ALL {
                let rows = backend.fetch_since(&session, entity_kind, since).await?;
                for row in &rows {
                    latest = latest.max(ServerTime::from_millis(row.server_time));
                    match decode_row(row, SourceTransport::Poll) {
                        Ok(delta) => deltas.push(delta),
                        Err(err) => {
                            tracing::warn!(error = %err, "discarding malformed poll row");
                            rejected += 1;
                        }
                    }
                }
            }
            Ok(FetchPayload::Deltas(deltas, latest, rejected))
        }
    }
}
