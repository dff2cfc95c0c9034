//! End-to-end engine tests over a scripted backend.
//!
//! All tests run under a paused clock: sleeps advance virtual time
//! instantly once every task is idle, so the 30-second timers in the
//! transport lifecycle are exercised for real without wall-clock cost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabletalk_engine::{
    EngineConfig, HealthLevel, SessionEngine, SessionStateStore, TransportMode,
};
use tabletalk_model::{SessionId, SessionPhase};
use tabletalk_testkit::backend::ScriptedBackend;
use tabletalk_testkit::fixtures::{
    malformed_row, participant_id, participant_row, phase_row, session_id, SnapshotFixture,
};

/// Opt-in trace output for debugging a failing scenario; run with
/// `RUST_LOG=tabletalk_engine=trace`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spins up an engine over a scripted backend with a staged lobby
/// snapshot and waits for the initial load.
async fn connected_engine() -> (SessionEngine, ScriptedBackend, SessionId) {
    init_tracing();
    let backend = ScriptedBackend::new();
    let session = session_id();
    backend.stage_snapshot(SnapshotFixture::new(&session).taken_at(1_000).build());

    let engine = SessionEngine::new(EngineConfig::new(), backend.clone());
    engine.connect(session.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    (engine, backend, session)
}

/// Lets the driver absorb whatever is queued.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn connect_acknowledges_then_loads_the_snapshot() {
    init_tracing();
    let backend = ScriptedBackend::new();
    let session = session_id();
    backend.stage_snapshot(
        SnapshotFixture::new(&session)
            .phase(SessionPhase::Voting)
            .participant("p1", "Alice")
            .taken_at(1_000)
            .build(),
    );

    let engine = SessionEngine::new(EngineConfig::new(), backend.clone());
    assert!(engine.snapshot().is_empty());

    engine.connect(session);
    settle().await;

    // Verified order: subscription first, then the snapshot load.
    assert_eq!(backend.subscribe_calls(), 1);
    assert_eq!(backend.open_subscriptions(), 1);
    assert!(backend.snapshot_calls() >= 1);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase(), Some(SessionPhase::Voting));
    assert_eq!(snapshot.participants.len(), 1);

    let health = engine.connection_health();
    assert_eq!(health.mode, TransportMode::Push);
    assert_eq!(health.health, HealthLevel::Healthy);

    engine.shutdown().await;
    assert_eq!(backend.open_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn pushed_rows_reach_the_mirror_and_fire_observers() {
    let (engine, backend, _session) = connected_engine().await;

    let notified = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&notified);
    engine.on_snapshot_change(move |_snapshot: &_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let alice = participant_id();
    backend.push_rows(vec![
        participant_row(&alice, "Alice", 2_000),
        malformed_row(2_001),
    ]);
    settle().await;

    let snapshot = engine.snapshot();
    assert!(snapshot.participant(&alice).is_some());
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // A duplicate of the same row is stale and must not re-notify.
    backend.push_rows(vec![participant_row(&alice, "Alice", 2_000)]);
    settle().await;
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    assert!(engine.stats().stale_dropped >= 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn spaced_push_errors_fall_back_to_polling() {
    let (engine, backend, session) = connected_engine().await;

    for _ in 0..3 {
        backend.push_error("stream reset");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    let health = engine.connection_health();
    assert_eq!(health.mode, TransportMode::Poll);
    assert_eq!(backend.open_subscriptions(), 0);
    assert_eq!(engine.stats().fallbacks, 1);

    // Polling now carries the session: a change appears on the next
    // incremental fetch.
    backend.append_changes(vec![phase_row(&session, SessionPhase::Voting, 5_000)]);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.snapshot().phase(), Some(SessionPhase::Voting));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn mode_changes_fire_the_connection_observer() {
    let (engine, backend, _session) = connected_engine().await;

    let saw_poll = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&saw_poll);
    engine.on_connection_change(move |health| {
        if health.mode == TransportMode::Poll {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    for _ in 0..3 {
        backend.push_error("stream reset");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    assert!(saw_poll.load(Ordering::SeqCst) >= 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn an_error_burst_counts_as_one_error() {
    let (engine, backend, _session) = connected_engine().await;

    // Three signals inside the debounce window.
    backend.push_error("reset");
    backend.push_error("reset");
    backend.push_error("reset");
    settle().await;

    let health = engine.connection_health();
    assert_eq!(health.mode, TransportMode::Push);
    assert_eq!(health.health, HealthLevel::Degraded);
    assert_eq!(health.consecutive_errors, 1);
    assert_eq!(backend.open_subscriptions(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn recovery_reopens_push_after_the_delay() {
    let (engine, backend, _session) = connected_engine().await;

    for _ in 0..3 {
        backend.push_error("stream reset");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert_eq!(engine.connection_health().mode, TransportMode::Poll);
    let subscribes_before = backend.subscribe_calls();

    // Poll keeps running while the reopened subscription is unverified;
    // only the acknowledgment hands push back the session.
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(backend.subscribe_calls(), subscribes_before + 1);
    let health = engine.connection_health();
    assert_eq!(health.mode, TransportMode::Push);
    assert_eq!(health.health, HealthLevel::Healthy);
    assert_eq!(backend.open_subscriptions(), 1);
    assert_eq!(engine.stats().recovery_attempts, 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_recovery_stays_on_poll_and_rearms() {
    let (engine, backend, _session) = connected_engine().await;

    for _ in 0..3 {
        backend.push_error("stream reset");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    backend.refuse_next_subscribes(1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(engine.connection_health().mode, TransportMode::Poll);

    // The next recovery window succeeds.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(engine.connection_health().mode, TransportMode::Push);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_subscription_times_out_into_fallback() {
    init_tracing();
    let backend = ScriptedBackend::new();
    let session = session_id();
    backend.stage_snapshot(SnapshotFixture::new(&session).taken_at(1_000).build());
    backend.hold_acknowledgment(true);

    let engine = SessionEngine::new(EngineConfig::new(), backend.clone());
    engine.connect(session);

    // Three 10-second acknowledgment timeouts, then fallback.
    tokio::time::sleep(Duration::from_secs(35)).await;

    let health = engine.connection_health();
    assert_eq!(health.mode, TransportMode::Poll);
    assert!(!engine.snapshot().is_empty());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn terminal_phase_tears_the_transports_down() {
    let (engine, backend, session) = connected_engine().await;

    backend.push_rows(vec![phase_row(&session, SessionPhase::Ended, 9_000)]);
    settle().await;

    assert_eq!(engine.snapshot().phase(), Some(SessionPhase::Ended));
    assert_eq!(backend.open_subscriptions(), 0);

    // Nothing is fetched anymore; the last snapshot stays readable.
    let snapshot_calls = backend.snapshot_calls();
    let since_calls = backend.since_calls();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(backend.snapshot_calls(), snapshot_calls);
    assert_eq!(backend.since_calls(), since_calls);
    assert_eq!(engine.snapshot().phase(), Some(SessionPhase::Ended));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_refresh_reloads_on_the_active_transport() {
    let (engine, backend, session) = connected_engine().await;
    let snapshot_calls = backend.snapshot_calls();

    backend.stage_snapshot(
        SnapshotFixture::new(&session)
            .phase(SessionPhase::TopicResults)
            .taken_at(7_000)
            .build(),
    );
    engine.force_refresh();
    settle().await;

    assert_eq!(backend.snapshot_calls(), snapshot_calls + 1);
    assert_eq!(engine.snapshot().phase(), Some(SessionPhase::TopicResults));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_full_reload_runs_while_polling() {
    let (engine, backend, session) = connected_engine().await;

    for _ in 0..3 {
        backend.push_error("stream reset");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert_eq!(engine.connection_health().mode, TransportMode::Poll);
    let snapshot_calls = backend.snapshot_calls();

    // A snapshot change that incremental fetches will never see (its
    // server time is behind the cursor) still lands via the periodic
    // full reload.
    backend.stage_snapshot(
        SnapshotFixture::new(&session)
            .phase(SessionPhase::TopicReveal)
            .taken_at(500)
            .build(),
    );
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(backend.snapshot_calls() > snapshot_calls);
    assert_eq!(engine.snapshot().phase(), Some(SessionPhase::TopicReveal));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_fetching_but_keeps_the_snapshot() {
    let (engine, backend, _session) = connected_engine().await;
    assert!(!engine.snapshot().is_empty());

    engine.disconnect();
    settle().await;
    assert_eq!(backend.open_subscriptions(), 0);

    let snapshot_calls = backend.snapshot_calls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.snapshot_calls(), snapshot_calls);
    assert!(!engine.snapshot().is_empty());
    assert_eq!(
        engine.connection_health().health,
        HealthLevel::Disconnected
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn the_store_handle_outlives_the_session() {
    let (engine, _backend, _session) = connected_engine().await;
    let store: Arc<SessionStateStore> = engine.store();
    engine.shutdown().await;
    drop(engine);
    assert!(!store.snapshot().is_empty());
}
