//! Synchronized session entities.

use crate::ids::{ItemId, ParticipantId, ServerTime, SessionId, TopicId};
use crate::phase::SessionPhase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The session record itself.
///
/// Replaced wholesale on a full reload, patched field-by-field on deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    /// Session identity.
    pub id: SessionId,
    /// Current phase.
    pub phase: SessionPhase,
    /// Current round, starting at 1.
    pub round: u32,
    /// Server time of the last applied change.
    pub updated_at: ServerTime,
}

impl SyncSession {
    /// Creates a fresh session in the lobby phase.
    pub fn new(id: SessionId, updated_at: ServerTime) -> Self {
        Self {
            id,
            phase: SessionPhase::Lobby,
            round: 1,
            updated_at,
        }
    }
}

/// One participant in a session, unique by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identity.
    pub id: ParticipantId,
    /// Display name shown to other participants.
    pub display_name: String,
    /// Whether the participant has cast their topic votes.
    pub has_voted: bool,
    /// Whether the participant has picked an item this round.
    pub has_picked: bool,
    /// The picked item, if any.
    pub picked_item: Option<ItemId>,
}

impl Participant {
    /// Creates a participant that has not voted or picked yet.
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            has_voted: false,
            has_picked: false,
            picked_item: None,
        }
    }
}

/// The set of topics one participant voted for.
///
/// The topic set only grows under sync (union merge), never shrinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// The voting participant.
    pub participant: ParticipantId,
    /// The chosen topics.
    pub topics: BTreeSet<TopicId>,
}

impl VoteRecord {
    /// Creates a vote record for the given topics.
    pub fn new(participant: ParticipantId, topics: impl IntoIterator<Item = TopicId>) -> Self {
        Self {
            participant,
            topics: topics.into_iter().collect(),
        }
    }

    /// Unions another record's topics into this one.
    pub fn absorb(&mut self, other: &VoteRecord) {
        self.topics.extend(other.topics.iter().cloned());
    }
}

/// One item pick, append-only within a round.
///
/// Identity is `(participant, round)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pick {
    /// The picking participant.
    pub participant: ParticipantId,
    /// The picked item.
    pub item: ItemId,
    /// The round the pick belongs to.
    pub round: u32,
    /// Server time the pick was recorded.
    pub picked_at: ServerTime,
}
