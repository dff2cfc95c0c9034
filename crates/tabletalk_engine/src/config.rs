//! Configuration for the sync engine.

use std::time::Duration;
use tabletalk_model::SessionPhase;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive push errors that trigger fallback to polling.
    pub push_error_threshold: u32,
    /// Window in which duplicate push error signals collapse into one.
    pub error_debounce: Duration,
    /// How long to stay in fallback before attempting push recovery.
    pub recovery_delay: Duration,
    /// How long to wait for a subscription acknowledgment.
    pub ack_timeout: Duration,
    /// Polling behavior.
    pub poll: PollConfig,
}

impl EngineConfig {
    /// Creates the default engine configuration.
    pub fn new() -> Self {
        Self {
            push_error_threshold: 3,
            error_debounce: Duration::from_millis(100),
            recovery_delay: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            poll: PollConfig::default(),
        }
    }

    /// Sets the push error threshold.
    pub fn with_push_error_threshold(mut self, threshold: u32) -> Self {
        self.push_error_threshold = threshold;
        self
    }

    /// Sets the error debounce window.
    pub fn with_error_debounce(mut self, window: Duration) -> Self {
        self.error_debounce = window;
        self
    }

    /// Sets the recovery delay.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    /// Sets the subscription acknowledgment timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the polling configuration.
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the polling fallback.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Base interval between incremental fetches in active phases.
    pub active_interval: Duration,
    /// A full reload is forced unconditionally at this interval.
    pub full_reload_interval: Duration,
    /// Base delay for error backoff.
    pub backoff_base: Duration,
    /// Cap for error backoff.
    pub backoff_cap: Duration,
    /// Consecutive poll errors after which health reads disconnected.
    pub disconnect_threshold: u32,
}

impl PollConfig {
    /// Creates the default polling configuration.
    pub fn new() -> Self {
        Self {
            active_interval: Duration::from_secs(2),
            full_reload_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(30),
            disconnect_threshold: 5,
        }
    }

    /// Sets the active-phase fetch interval.
    pub fn with_active_interval(mut self, interval: Duration) -> Self {
        self.active_interval = interval;
        self
    }

    /// Sets the forced full reload interval.
    pub fn with_full_reload_interval(mut self, interval: Duration) -> Self {
        self.full_reload_interval = interval;
        self
    }

    /// Sets the backoff base delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Sets the backoff cap.
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Maps a session phase to the fetch interval, `None` meaning
    /// "stop polling".
    ///
    /// Pure: all active phases share one short interval; the terminal
    /// phase stops the scheduler.
    pub fn interval_for_phase(&self, phase: SessionPhase) -> Option<Duration> {
        if phase.is_terminal() {
            None
        } else {
            Some(self.active_interval)
        }
    }

    /// Delay before the next attempt after `consecutive_errors` failures.
    ///
    /// `min(base × 2^(errors − 1), cap)`; success elsewhere resets the
    /// counter and the delay reverts to the phase interval.
    pub fn backoff_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.active_interval;
        }
        let exp = consecutive_errors.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_cap)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new()
    }
}
