//! Hybrid push/poll synchronization engine for TableTalk sessions.
//!
//! Keeps a client-side mirror of a live session convergent with the
//! remote store. A push subscription is the preferred transport; an
//! interval-polling fallback takes over when push degrades, and a
//! recovery loop periodically tries to get back. Exactly one transport
//! feeds the merge at any time.
//!
//! The entry point is [`SessionEngine`], built over an implementation
//! of the [`SessionBackend`] trait.
//!
//! ```no_run
//! use tabletalk_engine::{EngineConfig, MockBackend, SessionEngine};
//! use tabletalk_model::SessionId;
//!
//! # async fn demo() {
//! let engine = SessionEngine::new(EngineConfig::new(), MockBackend::new());
//! engine.on_snapshot_change(|snapshot| {
//!     println!("phase: {:?}", snapshot.phase());
//! });
//! engine.connect(SessionId::new("session-1"));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
mod driver;
pub mod engine;
pub mod error;
pub mod merge;
pub mod poll;
pub mod push;
pub mod store;
pub mod supervisor;

pub use backend::{MockBackend, PushSignal, SessionBackend, Subscription};
pub use config::{EngineConfig, PollConfig};
pub use engine::{ConnectionHealth, SessionEngine, SyncStats};
pub use error::{EngineError, EngineResult};
pub use merge::{merge, MergeReport};
pub use poll::{FetchKind, PollScheduler};
pub use push::{PushChannel, PushEvent, PushEventKind};
pub use store::{CommitOutcome, SessionStateStore, SubscriberId};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, Directive, HealthLevel, SupervisorState, TransportMode,
};
