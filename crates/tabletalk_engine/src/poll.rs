//! The polling fallback transport's scheduler.
//!
//! A deadline-driven state machine: the driver asks for the next wake-up
//! time, calls [`PollScheduler::tick`] when it fires, runs the returned
//! fetch, and reports the outcome back. Keeping the timing logic here,
//! free of any I/O, is what makes the interval/backoff/skip rules unit
//! testable.

use crate::config::PollConfig;
use std::time::Duration;
use tabletalk_model::ServerTime;
use tokio::time::Instant;

/// The fetch a tick decided to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Fetch entities changed since the cursor.
    Incremental {
        /// The last successful fetch's server time.
        since: ServerTime,
    },
    /// Fetch and replace the entire session snapshot.
    FullReload,
}

impl FetchKind {
    /// Returns true for the full reload variant.
    pub fn is_full(self) -> bool {
        matches!(self, FetchKind::FullReload)
    }
}

/// Timer state for the polling loop.
///
/// Invariants:
/// - at most one fetch is in flight; ticks that fire meanwhile are
///   skipped, never queued
/// - a full reload is forced at `full_reload_interval` no matter how many
///   incremental fetches succeeded in between
/// - failures back off exponentially up to the cap; one success resets
///   the delay to the phase interval
/// - the epoch advances on disable, so completions of fetches issued
///   before a teardown can be recognized and discarded
#[derive(Debug)]
pub struct PollScheduler {
    cfg: PollConfig,
    interval: Option<Duration>,
    consecutive_errors: u32,
    cursor: ServerTime,
    next_due: Option<Instant>,
    full_due: Option<Instant>,
    force_full: bool,
    in_flight: bool,
    epoch: u64,
}

impl PollScheduler {
    /// Creates a disabled scheduler.
    pub fn new(cfg: PollConfig) -> Self {
        Self {
            cfg,
            interval: None,
            consecutive_errors: 0,
            cursor: ServerTime::ZERO,
            next_due: None,
            full_due: None,
            force_full: false,
            in_flight: false,
            epoch: 0,
        }
    }

    /// Returns true while polling is enabled.
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Current consecutive error count.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// The incremental fetch cursor.
    pub fn cursor(&self) -> ServerTime {
        self.cursor
    }

    /// The current teardown epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Enables polling at the given phase interval.
    ///
    /// The first tick runs immediately and is a full reload: a transport
    /// that just became the active producer starts from a known-good
    /// snapshot rather than trusting its cursor.
    pub fn enable(&mut self, now: Instant, interval: Duration) {
        self.interval = Some(interval);
        self.consecutive_errors = 0;
        self.force_full = true;
        self.next_due = Some(now);
        self.full_due = Some(now + self.cfg.full_reload_interval);
    }

    /// Disables polling and cancels all pending timers.
    ///
    /// Bumps the epoch: a fetch still in flight will resolve, but its
    /// result must be discarded by the caller.
    pub fn disable(&mut self) {
        self.interval = None;
        self.next_due = None;
        self.full_due = None;
        self.force_full = false;
        self.in_flight = false;
        self.epoch += 1;
    }

    /// Applies a phase-interval change; `None` disables polling.
    pub fn set_interval(&mut self, now: Instant, interval: Option<Duration>) {
        match interval {
            None => self.disable(),
            Some(interval) => {
                if !self.is_enabled() {
                    return;
                }
                self.interval = Some(interval);
                // Not while backing off: an error delay outranks the
                // phase interval.
                if self.consecutive_errors == 0 && !self.in_flight {
                    let candidate = now + interval;
                    self.next_due = Some(match self.next_due {
                        Some(due) => due.min(candidate),
                        None => candidate,
                    });
                }
            }
        }
    }

    /// When the driver should next call [`PollScheduler::tick`].
    ///
    /// `None` while disabled or while a fetch is in flight (the
    /// completion, not a timer, is the next relevant event).
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_enabled() || self.in_flight {
            return None;
        }
        match (self.next_due, self.full_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Decides what (if anything) to fetch now.
    ///
    /// A due tick while a fetch is in flight is skipped, not queued.
    pub fn tick(&mut self, now: Instant) -> Option<FetchKind> {
        if !self.is_enabled() || self.in_flight {
            return None;
        }
        let full_due = self.force_full || self.full_due.is_some_and(|due| due <= now);
        if full_due {
            self.force_full = false;
            self.in_flight = true;
            self.next_due = None;
            return Some(FetchKind::FullReload);
        }
        if self.next_due.is_some_and(|due| due <= now) {
            self.in_flight = true;
            self.next_due = None;
            return Some(FetchKind::Incremental { since: self.cursor });
        }
        None
    }

    /// Records a successful fetch.
    pub fn on_success(&mut self, now: Instant, kind: FetchKind, latest: ServerTime) {
        self.in_flight = false;
        self.consecutive_errors = 0;
        self.cursor = self.cursor.max(latest);
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
        if kind.is_full() {
            self.full_due = Some(now + self.cfg.full_reload_interval);
        }
    }

    /// Records a failed fetch and schedules the backed-off retry.
    pub fn on_failure(&mut self, now: Instant) {
        self.in_flight = false;
        self.consecutive_errors += 1;
        if self.is_enabled() {
            self.next_due = Some(now + self.cfg.backoff_delay(self.consecutive_errors));
        }
    }

    /// Manual refresh: resets error/backoff state and pending timers and
    /// forces an immediate full reload.
    ///
    /// The caller aborts any in-flight fetch first.
    pub fn force_refresh(&mut self, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.consecutive_errors = 0;
        self.in_flight = false;
        self.force_full = true;
        self.next_due = Some(now);
    }
}
