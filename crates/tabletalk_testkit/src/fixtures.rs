//! Wire-level fixtures.
//!
//! Builders for the raw JSON rows the remote store delivers, so tests
//! can script realistic push payloads and poll responses without
//! hand-writing JSON in every test.

use serde_json::{json, Value};
use tabletalk_model::{
    ChangeRow, ItemId, ParticipantId, ServerTime, SessionId, SessionPhase, SnapshotRows, TopicId,
};
use uuid::Uuid;

/// A fresh, unique session id.
pub fn session_id() -> SessionId {
    SessionId::new(format!("session-{}", Uuid::new_v4()))
}

/// A fresh, unique participant id.
pub fn participant_id() -> ParticipantId {
    ParticipantId::new(format!("participant-{}", Uuid::new_v4()))
}

/// A change row advancing the session phase.
pub fn phase_row(session: &SessionId, phase: SessionPhase, server_time: i64) -> ChangeRow {
    ChangeRow {
        op: "update".into(),
        entity_kind: "session".into(),
        before: None,
        after: json!({ "id": session.as_str(), "phase": phase.as_str() }),
        server_time,
    }
}

/// A change row advancing the session round.
pub fn round_row(session: &SessionId, round: u32, server_time: i64) -> ChangeRow {
    ChangeRow {
        op: "update".into(),
        entity_kind: "session".into(),
        before: None,
        after: json!({ "id": session.as_str(), "round": round }),
        server_time,
    }
}

/// A change row inserting a participant.
pub fn participant_row(id: &ParticipantId, name: &str, server_time: i64) -> ChangeRow {
    ChangeRow {
        op: "insert".into(),
        entity_kind: "participant".into(),
        before: None,
        after: json!({ "id": id.as_str(), "displayName": name }),
        server_time,
    }
}

/// A change row updating a participant's flags.
pub fn participant_update_row(
    id: &ParticipantId,
    name: &str,
    has_voted: bool,
    server_time: i64,
) -> ChangeRow {
    ChangeRow {
        op: "update".into(),
        entity_kind: "participant".into(),
        before: None,
        after: json!({
            "id": id.as_str(),
            "displayName": name,
            "hasVoted": has_voted,
        }),
        server_time,
    }
}

/// A change row recording a participant's topic votes.
pub fn vote_row(participant: &ParticipantId, topics: &[TopicId], server_time: i64) -> ChangeRow {
    let topic_ids: Vec<&str> = topics.iter().map(TopicId::as_str).collect();
    ChangeRow {
        op: "update".into(),
        entity_kind: "vote".into(),
        before: None,
        after: json!({
            "participantId": participant.as_str(),
            "topicIds": topic_ids,
        }),
        server_time,
    }
}

/// A change row recording an item pick.
pub fn pick_row(
    participant: &ParticipantId,
    item: &ItemId,
    round: u32,
    server_time: i64,
) -> ChangeRow {
    ChangeRow {
        op: "insert".into(),
        entity_kind: "pick".into(),
        before: None,
        after: json!({
            "participantId": participant.as_str(),
            "itemId": item.as_str(),
            "round": round,
            "pickedAt": server_time,
        }),
        server_time,
    }
}

/// A change row that fails schema validation.
pub fn malformed_row(server_time: i64) -> ChangeRow {
    ChangeRow {
        op: "update".into(),
        entity_kind: "participant".into(),
        before: None,
        after: json!({ "unexpected": true }),
        server_time,
    }
}

/// Builds raw snapshot responses row by row.
///
/// ```
/// use tabletalk_testkit::fixtures::{session_id, SnapshotFixture};
/// use tabletalk_model::SessionPhase;
///
/// let session = session_id();
/// let rows = SnapshotFixture::new(&session)
///     .phase(SessionPhase::Voting)
///     .participant("p1", "Alice")
///     .participant("p2", "Bob")
///     .taken_at(5_000)
///     .build();
/// assert_eq!(rows.participants.len(), 2);
/// ```
pub struct SnapshotFixture {
    session: SessionId,
    phase: SessionPhase,
    round: u32,
    participants: Vec<Value>,
    votes: Vec<Value>,
    picks: Vec<Value>,
    server_time: i64,
}

impl SnapshotFixture {
    /// Starts an empty lobby snapshot for `session`.
    pub fn new(session: &SessionId) -> Self {
        Self {
            session: session.clone(),
            phase: SessionPhase::Lobby,
            round: 1,
            participants: Vec::new(),
            votes: Vec::new(),
            picks: Vec::new(),
            server_time: 1_000,
        }
    }

    /// Sets the session phase.
    pub fn phase(mut self, phase: SessionPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Sets the session round.
    pub fn round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    /// Adds a participant row.
    pub fn participant(mut self, id: &str, name: &str) -> Self {
        self.participants
            .push(json!({ "id": id, "displayName": name }));
        self
    }

    /// Adds a vote row.
    pub fn vote(mut self, participant: &str, topics: &[&str]) -> Self {
        self.votes
            .push(json!({ "participantId": participant, "topicIds": topics }));
        self
    }

    /// Adds a pick row.
    pub fn pick(mut self, participant: &str, item: &str, round: u32) -> Self {
        self.picks.push(json!({
            "participantId": participant,
            "itemId": item,
            "round": round,
        }));
        self
    }

    /// Adds a raw row to the participants list, schema-valid or not.
    pub fn raw_participant(mut self, value: Value) -> Self {
        self.participants.push(value);
        self
    }

    /// Sets the snapshot's server time, in milliseconds.
    pub fn taken_at(mut self, server_time: i64) -> Self {
        self.server_time = server_time;
        self
    }

    /// Produces the raw snapshot response.
    pub fn build(self) -> SnapshotRows {
        SnapshotRows {
            session: json!({
                "id": self.session.as_str(),
                "phase": self.phase.as_str(),
                "round": self.round,
                "updatedAt": self.server_time,
            }),
            participants: self.participants,
            votes: self.votes,
            picks: self.picks,
            server_time: self.server_time,
        }
    }
}

/// Millisecond server time, for call sites that want the newtype.
pub fn at(millis: i64) -> ServerTime {
    ServerTime::from_millis(millis)
}
