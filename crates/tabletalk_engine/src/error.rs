//! Error types for the sync engine.

use tabletalk_model::{DecodeError, EntityKey};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside the sync engine.
///
/// Nothing here is fatal to the consumer: transport and fetch errors are
/// recovered locally via mode fallback and backoff, data errors discard
/// the offending row, and conflicts discard the offending delta. Errors
/// surface to the application only as degraded health.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Push subscription failure: subscribe/ack error or unexpected close.
    #[error("transport error: {0}")]
    Transport(String),

    /// Poll fetch failure: network or API error.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Malformed or incomplete inbound row.
    #[error("data error: {0}")]
    Data(#[from] DecodeError),

    /// The merge could not establish a safe ordering for an entity.
    ///
    /// Resolved by dropping the delta, never by crashing.
    #[error("state conflict for {key:?}: {reason}")]
    StateConflict {
        /// The entity the conflicting delta targeted.
        key: EntityKey,
        /// Why no safe ordering exists.
        reason: String,
    },

    /// The subscription acknowledgment did not arrive in time.
    ///
    /// Counts as a connection error toward the supervisor's threshold.
    #[error("subscription acknowledgment timed out after {0}ms")]
    AckTimeout(u64),
}

impl EngineError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a fetch error.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    /// Returns true if this error counts against the push transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::AckTimeout(_))
    }
}
