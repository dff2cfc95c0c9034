//! # Tabletalk Model
//!
//! Shared session data model for the tabletalk sync core.
//!
//! This crate provides:
//! - Typed identities and server timestamps
//! - The session phase state machine (monotonic, one-directional)
//! - Synchronized entities (session, participants, votes, picks)
//! - Typed deltas and their identities
//! - Schema decoding of loosely-typed inbound rows at the transport
//!   boundary, with per-row rejection
//! - The session snapshot that the engine converges
//!
//! ## Key Invariants
//!
//! - Every entity is keyed by a stable identity
//! - Vote topic sets only grow, never shrink
//! - Phase transitions never go backward
//! - Malformed inbound rows are rejected at decode time, never propagated

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod delta;
mod entity;
mod ids;
mod phase;
mod rows;
mod snapshot;

pub use delta::{Delta, DeltaBody, DeltaOp, EntityKey, EntityKind, SessionPatch, SourceTransport};
pub use entity::{Participant, Pick, SyncSession, VoteRecord};
pub use ids::{ItemId, ParticipantId, ServerTime, SessionId, TopicId};
pub use phase::SessionPhase;
pub use rows::{
    decode_row, decode_snapshot, ChangeRow, DecodeError, DecodedSnapshot, SnapshotRows,
};
pub use snapshot::{SessionSnapshot, Stamped};
