//! Transport supervision state machine.
//!
//! Decides which transport is the active producer, tracks health, and
//! triggers fallback and recovery. The machine is synchronous: every
//! event takes the current instant and returns the [`Directive`]s the
//! driver must carry out. Keeping the machine free of I/O makes the
//! debounce and fallback transitions unit testable without a runtime.

use crate::config::EngineConfig;
use tokio::time::Instant;

/// Supervisor states.
///
/// `Idle → Connecting → PushHealthy ⇄ PushDegraded → FallbackPoll →
/// Recovering → …`; `Ended` is terminal from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not connected to any session.
    Idle,
    /// Waiting for the first subscription acknowledgment.
    Connecting,
    /// Push is the active producer and error-free.
    PushHealthy,
    /// Push is still active but has accumulated errors.
    PushDegraded,
    /// Poll is the active producer; push is torn down.
    FallbackPoll,
    /// Poll is still active; a push reopen is in flight, unverified.
    Recovering,
    /// The session reached its terminal phase. No events leave this state.
    Ended,
}

/// Which transport is currently authorized to feed the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// The live change subscription.
    Push,
    /// The interval-polling fallback.
    Poll,
}

/// Derived connection health, surfaced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    /// Active transport has no recent errors.
    Healthy,
    /// Connecting, recovering, or accumulating errors.
    Degraded,
    /// Poll errors passed their own threshold; still retrying forever.
    Disconnected,
}

/// A point-in-time view of the connection, per the engine's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Active transport.
    pub mode: TransportMode,
    /// Derived health.
    pub health: HealthLevel,
    /// Consecutive errors on the active transport.
    pub consecutive_errors: u32,
    /// When the active transport last succeeded.
    pub last_success_at: Option<Instant>,
}

/// Side effects the driver must perform after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Open (or speculatively reopen) the push subscription.
    OpenPush,
    /// Tear down the push subscription.
    ClosePush,
    /// Make poll the active producer.
    StartPoll,
    /// Stop the polling loop.
    StopPoll,
    /// Perform an immediate full reload on the active transport.
    FullReload,
    /// Arm the recovery timer for the given instant.
    ScheduleRecovery(Instant),
    /// Disarm the recovery timer.
    CancelRecovery,
}

/// The transport supervision state machine.
pub struct ConnectionSupervisor {
    cfg: EngineConfig,
    state: SupervisorState,
    push_errors: u32,
    poll_errors: u32,
    last_counted_error: Option<Instant>,
    last_success: Option<Instant>,
}

impl ConnectionSupervisor {
    /// Creates an idle supervisor.
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            state: SupervisorState::Idle,
            push_errors: 0,
            poll_errors: 0,
            last_counted_error: None,
            last_success: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// The currently active producer.
    pub fn current_mode(&self) -> TransportMode {
        match self.state {
            SupervisorState::FallbackPoll | SupervisorState::Recovering => TransportMode::Poll,
            _ => TransportMode::Push,
        }
    }

    /// Derived health of the active transport.
    pub fn health(&self) -> HealthLevel {
        match self.state {
            SupervisorState::Idle | SupervisorState::Ended => HealthLevel::Disconnected,
            SupervisorState::Connecting | SupervisorState::Recovering => HealthLevel::Degraded,
            SupervisorState::PushHealthy => HealthLevel::Healthy,
            SupervisorState::PushDegraded => HealthLevel::Degraded,
            SupervisorState::FallbackPoll => {
                if self.poll_errors >= self.cfg.poll.disconnect_threshold {
                    HealthLevel::Disconnected
                } else if self.poll_errors > 0 {
                    HealthLevel::Degraded
                } else {
                    HealthLevel::Healthy
                }
            }
        }
    }

    /// Snapshot of the connection for consumers.
    pub fn connection_state(&self) -> ConnectionState {
        let consecutive_errors = match self.current_mode() {
            TransportMode::Push => self.push_errors,
            TransportMode::Poll => self.poll_errors,
        };
        ConnectionState {
            mode: self.current_mode(),
            health: self.health(),
            consecutive_errors,
            last_success_at: self.last_success,
        }
    }

    /// Connect to a session: open the push subscription.
    pub fn connect(&mut self, _now: Instant) -> Vec<Directive> {
        self.state = SupervisorState::Connecting;
        self.push_errors = 0;
        self.poll_errors = 0;
        self.last_counted_error = None;
        vec![Directive::OpenPush]
    }

    /// Disconnect: tear everything down, back to idle.
    pub fn disconnect(&mut self) -> Vec<Directive> {
        self.state = SupervisorState::Idle;
        self.push_errors = 0;
        self.poll_errors = 0;
        self.last_counted_error = None;
        vec![
            Directive::ClosePush,
            Directive::StopPoll,
            Directive::CancelRecovery,
        ]
    }

    /// The push subscription was verified with a successful acknowledgment.
    ///
    /// Only this event ever declares push healthy; a speculative reopen
    /// without it leaves poll as the active producer.
    pub fn subscription_acknowledged(&mut self, now: Instant) -> Vec<Directive> {
        match self.state {
            SupervisorState::Connecting => {
                self.state = SupervisorState::PushHealthy;
                self.push_errors = 0;
                self.last_success = Some(now);
                vec![Directive::FullReload]
            }
            SupervisorState::Recovering => {
                self.state = SupervisorState::PushHealthy;
                self.push_errors = 0;
                self.poll_errors = 0;
                self.last_success = Some(now);
                vec![
                    Directive::StopPoll,
                    Directive::CancelRecovery,
                    Directive::FullReload,
                ]
            }
            // An ack from a subscription that is no longer wanted.
            _ => Vec::new(),
        }
    }

    /// A push error, close, or ack timeout was reported.
    ///
    /// Duplicate signals within the debounce window of the last counted
    /// error collapse into one logical failure.
    pub fn push_failure(&mut self, now: Instant) -> Vec<Directive> {
        match self.state {
            SupervisorState::Idle | SupervisorState::Ended | SupervisorState::FallbackPoll => {
                return Vec::new();
            }
            _ => {}
        }

        if let Some(last) = self.last_counted_error {
            if now.duration_since(last) < self.cfg.error_debounce {
                tracing::debug!("push error within debounce window, ignored");
                return Vec::new();
            }
        }
        self.last_counted_error = Some(now);
        self.push_errors += 1;

        match self.state {
            SupervisorState::Recovering => {
                // The speculative reopen failed verification: stay on
                // poll and try again later.
                self.state = SupervisorState::FallbackPoll;
                vec![
                    Directive::ClosePush,
                    Directive::ScheduleRecovery(now + self.cfg.recovery_delay),
                ]
            }
            SupervisorState::Connecting
            | SupervisorState::PushHealthy
            | SupervisorState::PushDegraded => {
                if self.push_errors >= self.cfg.push_error_threshold {
                    tracing::warn!(
                        errors = self.push_errors,
                        "push transport failed, falling back to polling"
                    );
                    self.state = SupervisorState::FallbackPoll;
                    self.poll_errors = 0;
                    vec![
                        Directive::ClosePush,
                        Directive::StartPoll,
                        Directive::ScheduleRecovery(now + self.cfg.recovery_delay),
                    ]
                } else {
                    self.state = SupervisorState::PushDegraded;
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Deltas arrived on the live push subscription.
    pub fn push_activity(&mut self, now: Instant) -> Vec<Directive> {
        if matches!(
            self.state,
            SupervisorState::PushHealthy | SupervisorState::PushDegraded
        ) {
            self.last_success = Some(now);
            self.push_errors = 0;
            self.state = SupervisorState::PushHealthy;
        }
        Vec::new()
    }

    /// The recovery timer fired: speculatively reopen push.
    pub fn recovery_due(&mut self, _now: Instant) -> Vec<Directive> {
        if self.state == SupervisorState::FallbackPoll {
            self.state = SupervisorState::Recovering;
            vec![Directive::OpenPush]
        } else {
            Vec::new()
        }
    }

    /// A poll fetch succeeded.
    pub fn poll_success(&mut self, now: Instant) -> Vec<Directive> {
        self.poll_errors = 0;
        self.last_success = Some(now);
        Vec::new()
    }

    /// A poll fetch failed.
    pub fn poll_failure(&mut self, _now: Instant) -> Vec<Directive> {
        self.poll_errors += 1;
        if self.poll_errors >= self.cfg.poll.disconnect_threshold {
            tracing::warn!(
                errors = self.poll_errors,
                "poll transport repeatedly failing, reporting disconnected"
            );
        }
        Vec::new()
    }

    /// The session reached its terminal phase.
    pub fn session_ended(&mut self) -> Vec<Directive> {
        self.state = SupervisorState::Ended;
        vec![
            Directive::ClosePush,
            Directive::StopPoll,
            Directive::CancelRecovery,
        ]
    }

    /// Manual reload: reset error counters, reload on the active mode.
    pub fn force_reload(&mut self) -> Vec<Directive> {
        if self.state == SupervisorState::Ended || self.state == SupervisorState::Idle {
            return Vec::new();
        }
        self.push_errors = 0;
        self.poll_errors = 0;
        if self.state == SupervisorState::PushDegraded {
            self.state = SupervisorState::PushHealthy;
        }
        vec![Directive::FullReload]
    }
}
