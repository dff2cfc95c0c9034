//! The converged session snapshot.

use crate::entity::{Participant, Pick, SyncSession, VoteRecord};
use crate::ids::{ParticipantId, ServerTime};
use crate::phase::SessionPhase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An entity value together with the server time of its last applied change.
///
/// The merge never lets `value` regress to a state carrying an older
/// `server_time` than what is stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    /// The entity value.
    pub value: T,
    /// Server time of the last change applied to this entity.
    pub server_time: ServerTime,
}

impl<T> Stamped<T> {
    /// Wraps a value with its server timestamp.
    pub fn new(value: T, server_time: ServerTime) -> Self {
        Self { value, server_time }
    }
}

/// The full client-side mirror of one session's shared state.
///
/// Produced either by a full reload (wholesale replacement) or by merging
/// delta batches onto a prior snapshot. Two snapshots compare equal when
/// every entity and its applied timestamp match, which is what the
/// convergence property tests rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// The session record, if one has been loaded.
    pub session: Option<SyncSession>,
    /// Participants by id.
    pub participants: BTreeMap<ParticipantId, Stamped<Participant>>,
    /// Vote records by voting participant.
    pub votes: BTreeMap<ParticipantId, Stamped<VoteRecord>>,
    /// Picks by `(participant, round)`.
    pub picks: BTreeMap<(ParticipantId, u32), Stamped<Pick>>,
}

impl SessionSnapshot {
    /// Creates an empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the current phase, if the session record is loaded.
    pub fn phase(&self) -> Option<SessionPhase> {
        self.session.as_ref().map(|s| s.phase)
    }

    /// Returns a participant by id.
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id).map(|s| &s.value)
    }

    /// Returns a participant's vote record.
    pub fn votes_of(&self, id: &ParticipantId) -> Option<&VoteRecord> {
        self.votes.get(id).map(|s| &s.value)
    }

    /// Returns a pick by participant and round.
    pub fn pick(&self, id: &ParticipantId, round: u32) -> Option<&Pick> {
        self.picks.get(&(id.clone(), round)).map(|s| &s.value)
    }

    /// Returns the total number of entities in the snapshot.
    pub fn entity_count(&self) -> usize {
        usize::from(self.session.is_some())
            + self.participants.len()
            + self.votes.len()
            + self.picks.len()
    }

    /// Returns true if nothing has been loaded yet.
    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }

    /// Returns the latest server time applied anywhere in the snapshot.
    ///
    /// Used as the cursor for incremental fetches.
    pub fn latest_server_time(&self) -> ServerTime {
        let mut latest = self
            .session
            .as_ref()
            .map(|s| s.updated_at)
            .unwrap_or(ServerTime::ZERO);
        for stamped in self.participants.values() {
            latest = latest.max(stamped.server_time);
        }
        for stamped in self.votes.values() {
            latest = latest.max(stamped.server_time);
        }
        for stamped in self.picks.values() {
            latest = latest.max(stamped.server_time);
        }
        latest
    }
}
