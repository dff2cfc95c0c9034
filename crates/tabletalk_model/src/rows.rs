//! Schema decoding of loosely-typed inbound rows.
//!
//! The remote store delivers changes as untyped JSON rows. Everything
//! crossing that boundary is validated here and turned into typed deltas
//! or snapshot entities; a malformed row is rejected with a [`DecodeError`]
//! and never reaches the merge.

use crate::delta::{Delta, DeltaBody, DeltaOp, EntityKind, SessionPatch, SourceTransport};
use crate::entity::{Participant, Pick, SyncSession, VoteRecord};
use crate::ids::{ItemId, ParticipantId, ServerTime, SessionId, TopicId};
use crate::phase::SessionPhase;
use crate::snapshot::{SessionSnapshot, Stamped};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding inbound rows.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The row names an entity kind this client does not know.
    #[error("unknown entity kind: {0:?}")]
    UnknownEntityKind(String),

    /// The row names an operation other than insert/update.
    #[error("unknown row operation: {0:?}")]
    UnknownOp(String),

    /// The row payload did not match the schema for its kind.
    #[error("malformed {kind} row: {source}")]
    Malformed {
        /// The entity kind being decoded.
        kind: &'static str,
        /// The underlying schema violation.
        #[source]
        source: serde_json::Error,
    },

    /// A session row patched neither phase nor round.
    #[error("session row for {0} carries no patchable fields")]
    EmptySessionPatch(SessionId),
}

/// One raw change row as delivered by the remote store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    /// Row operation: `"insert"` or `"update"`.
    pub op: String,
    /// Entity kind the row targets.
    pub entity_kind: String,
    /// Prior state, when the store provides one. Unused by the merge.
    #[serde(default)]
    pub before: Option<Value>,
    /// New state of the entity.
    pub after: Value,
    /// Server-assigned time of the change, in milliseconds.
    pub server_time: i64,
}

/// The raw full entity set returned by a snapshot fetch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRows {
    /// The session record row.
    pub session: Value,
    /// All participant rows.
    #[serde(default)]
    pub participants: Vec<Value>,
    /// All vote rows.
    #[serde(default)]
    pub votes: Vec<Value>,
    /// All pick rows.
    #[serde(default)]
    pub picks: Vec<Value>,
    /// Server time the snapshot was taken, in milliseconds.
    pub server_time: i64,
}

/// A decoded full snapshot plus the rows that failed validation.
///
/// Rejected rows are counted against the fetch but do not fail it
/// (DataError semantics: discard the offending row, keep the rest).
#[derive(Debug)]
pub struct DecodedSnapshot {
    /// The decoded snapshot.
    pub snapshot: SessionSnapshot,
    /// Schema violations of individual entity rows.
    pub rejected: Vec<DecodeError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionRow {
    id: SessionId,
    #[serde(default)]
    phase: Option<SessionPhase>,
    #[serde(default)]
    round: Option<u32>,
    #[serde(default)]
    updated_at: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ParticipantRow {
    id: ParticipantId,
    display_name: String,
    #[serde(default)]
    has_voted: bool,
    #[serde(default)]
    has_picked: bool,
    #[serde(default)]
    picked_item: Option<ItemId>,
    #[serde(default)]
    updated_at: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct VoteRow {
    participant_id: ParticipantId,
    #[serde(default)]
    topic_ids: Vec<TopicId>,
    #[serde(default)]
    updated_at: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PickRow {
    participant_id: ParticipantId,
    item_id: ItemId,
    round: u32,
    #[serde(default)]
    picked_at: Option<i64>,
}

fn malformed(kind: &'static str) -> impl FnOnce(serde_json::Error) -> DecodeError {
    move |source| DecodeError::Malformed { kind, source }
}

impl ParticipantRow {
    fn into_entity(self) -> Participant {
        Participant {
            id: self.id,
            display_name: self.display_name,
            has_voted: self.has_voted,
            has_picked: self.has_picked,
            picked_item: self.picked_item,
        }
    }
}

impl VoteRow {
    fn into_entity(self) -> VoteRecord {
        VoteRecord {
            participant: self.participant_id,
            topics: self.topic_ids.into_iter().collect(),
        }
    }
}

impl PickRow {
    fn into_entity(self, fallback_time: ServerTime) -> Pick {
        let picked_at = self
            .picked_at
            .map(ServerTime::from_millis)
            .unwrap_or(fallback_time);
        Pick {
            participant: self.participant_id,
            item: self.item_id,
            round: self.round,
            picked_at,
        }
    }
}

fn decode_body(
    kind: &str,
    after: &Value,
    server_time: ServerTime,
) -> Result<DeltaBody, DecodeError> {
    match kind {
        "session" => {
            let row: SessionRow =
                serde_json::from_value(after.clone()).map_err(malformed("session"))?;
            if row.phase.is_none() && row.round.is_none() {
                return Err(DecodeError::EmptySessionPatch(row.id));
            }
            Ok(DeltaBody::Session(
                row.id,
                SessionPatch {
                    phase: row.phase,
                    round: row.round,
                },
            ))
        }
        "participant" => {
            let row: ParticipantRow =
                serde_json::from_value(after.clone()).map_err(malformed("participant"))?;
            Ok(DeltaBody::Participant(row.into_entity()))
        }
        "vote" => {
            let row: VoteRow = serde_json::from_value(after.clone()).map_err(malformed("vote"))?;
            Ok(DeltaBody::Vote(row.into_entity()))
        }
        "pick" => {
            let row: PickRow = serde_json::from_value(after.clone()).map_err(malformed("pick"))?;
            Ok(DeltaBody::Pick(row.into_entity(server_time)))
        }
        other => Err(DecodeError::UnknownEntityKind(other.to_owned())),
    }
}

/// Decodes one raw change row into a typed delta.
pub fn decode_row(row: &ChangeRow, source: SourceTransport) -> Result<Delta, DecodeError> {
    let op = match row.op.as_str() {
        "insert" => DeltaOp::Insert,
        "update" => DeltaOp::Update,
        other => return Err(DecodeError::UnknownOp(other.to_owned())),
    };
    let server_time = ServerTime::from_millis(row.server_time);
    let body = decode_body(&row.entity_kind, &row.after, server_time)?;
    Ok(Delta {
        op,
        body,
        server_time,
        source,
    })
}

/// Decodes a raw full snapshot into a [`SessionSnapshot`].
///
/// The session row must decode; it anchors the snapshot. Individual
/// participant/vote/pick rows that fail validation are collected in
/// `rejected` and skipped.
pub fn decode_snapshot(rows: &SnapshotRows) -> Result<DecodedSnapshot, DecodeError> {
    let fetched_at = ServerTime::from_millis(rows.server_time);

    let session_row: SessionRow =
        serde_json::from_value(rows.session.clone()).map_err(malformed("session"))?;
    let session = SyncSession {
        id: session_row.id,
        phase: session_row.phase.unwrap_or(SessionPhase::Lobby),
        round: session_row.round.unwrap_or(1),
        updated_at: session_row
            .updated_at
            .map(ServerTime::from_millis)
            .unwrap_or(fetched_at),
    };

    let mut snapshot = SessionSnapshot {
        session: Some(session),
        ..SessionSnapshot::default()
    };
    let mut rejected = Vec::new();

    for value in &rows.participants {
        match serde_json::from_value::<ParticipantRow>(value.clone()) {
            Ok(row) => {
                let stamp = row
                    .updated_at
                    .map(ServerTime::from_millis)
                    .unwrap_or(fetched_at);
                let entity = row.into_entity();
                snapshot
                    .participants
                    .insert(entity.id.clone(), Stamped::new(entity, stamp));
            }
            Err(err) => rejected.push(malformed("participant")(err)),
        }
    }

    for value in &rows.votes {
        match serde_json::from_value::<VoteRow>(value.clone()) {
            Ok(row) => {
                let stamp = row
                    .updated_at
                    .map(ServerTime::from_millis)
                    .unwrap_or(fetched_at);
                let entity = row.into_entity();
                snapshot
                    .votes
                    .insert(entity.participant.clone(), Stamped::new(entity, stamp));
            }
            Err(err) => rejected.push(malformed("vote")(err)),
        }
    }

    for value in &rows.picks {
        match serde_json::from_value::<PickRow>(value.clone()) {
            Ok(row) => {
                let entity = row.into_entity(fetched_at);
                let stamp = entity.picked_at;
                snapshot.picks.insert(
                    (entity.participant.clone(), entity.round),
                    Stamped::new(entity, stamp),
                );
            }
            Err(err) => rejected.push(malformed("pick")(err)),
        }
    }

    Ok(DecodedSnapshot { snapshot, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn participant_row(id: &str, name: &str) -> Value {
        json!({ "id": id, "displayName": name })
    }

    #[test]
    fn decodes_a_participant_insert() {
        let row = ChangeRow {
            op: "insert".into(),
            entity_kind: "participant".into(),
            before: None,
            after: json!({
                "id": "p1",
                "displayName": "Ana",
                "hasVoted": true,
            }),
            server_time: 100,
        };

        let delta = decode_row(&row, SourceTransport::Push).unwrap();
        assert_eq!(delta.op, DeltaOp::Insert);
        assert_eq!(delta.server_time, ServerTime::from_millis(100));
        assert_eq!(delta.source, SourceTransport::Push);
        match delta.body {
            DeltaBody::Participant(p) => {
                assert_eq!(p.id, ParticipantId::new("p1"));
                assert!(p.has_voted);
                assert!(!p.has_picked);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn decodes_a_session_phase_patch() {
        let row = ChangeRow {
            op: "update".into(),
            entity_kind: "session".into(),
            before: None,
            after: json!({ "id": "s1", "phase": "voting" }),
            server_time: 50,
        };

        let delta = decode_row(&row, SourceTransport::Poll).unwrap();
        match delta.body {
            DeltaBody::Session(id, patch) => {
                assert_eq!(id, SessionId::new("s1"));
                assert_eq!(patch.phase, Some(SessionPhase::Voting));
                assert_eq!(patch.round, None);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_kind_and_op() {
        let row = ChangeRow {
            op: "insert".into(),
            entity_kind: "scoreboard".into(),
            before: None,
            after: json!({}),
            server_time: 1,
        };
        assert!(matches!(
            decode_row(&row, SourceTransport::Push),
            Err(DecodeError::UnknownEntityKind(_))
        ));

        let row = ChangeRow {
            op: "delete".into(),
            entity_kind: "participant".into(),
            before: None,
            after: json!({}),
            server_time: 1,
        };
        assert!(matches!(
            decode_row(&row, SourceTransport::Push),
            Err(DecodeError::UnknownOp(_))
        ));
    }

    #[test]
    fn rejects_malformed_payload() {
        let row = ChangeRow {
            op: "update".into(),
            entity_kind: "vote".into(),
            before: None,
            after: json!({ "topicIds": ["t1"] }), // participantId missing
            server_time: 1,
        };
        assert!(matches!(
            decode_row(&row, SourceTransport::Poll),
            Err(DecodeError::Malformed { kind: "vote", .. })
        ));
    }

    #[test]
    fn rejects_empty_session_patch() {
        let row = ChangeRow {
            op: "update".into(),
            entity_kind: "session".into(),
            before: None,
            after: json!({ "id": "s1" }),
            server_time: 1,
        };
        assert!(matches!(
            decode_row(&row, SourceTransport::Push),
            Err(DecodeError::EmptySessionPatch(_))
        ));
    }

    #[test]
    fn pick_falls_back_to_row_server_time() {
        let row = ChangeRow {
            op: "insert".into(),
            entity_kind: "pick".into(),
            before: None,
            after: json!({ "participantId": "p1", "itemId": "card-2", "round": 1 }),
            server_time: 77,
        };
        let delta = decode_row(&row, SourceTransport::Push).unwrap();
        match delta.body {
            DeltaBody::Pick(pick) => assert_eq!(pick.picked_at, ServerTime::from_millis(77)),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn snapshot_decoding_skips_bad_rows() {
        let rows = SnapshotRows {
            session: json!({ "id": "s1", "phase": "voting", "round": 2 }),
            participants: vec![
                participant_row("p1", "Ana"),
                json!({ "displayName": "no id" }),
            ],
            votes: vec![json!({ "participantId": "p1", "topicIds": ["t1", "t2"] })],
            picks: vec![json!({ "participantId": "p1" })],
            server_time: 500,
        };

        let decoded = decode_snapshot(&rows).unwrap();
        assert_eq!(decoded.rejected.len(), 2);

        let snapshot = decoded.snapshot;
        assert_eq!(snapshot.phase(), Some(SessionPhase::Voting));
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(
            snapshot
                .votes_of(&ParticipantId::new("p1"))
                .map(|v| v.topics.len()),
            Some(2)
        );
        assert!(snapshot.picks.is_empty());
        assert_eq!(snapshot.latest_server_time(), ServerTime::from_millis(500));
    }

    #[test]
    fn snapshot_requires_a_valid_session_row() {
        let rows = SnapshotRows {
            session: json!({ "phase": "lobby" }), // id missing
            participants: vec![],
            votes: vec![],
            picks: vec![],
            server_time: 1,
        };
        assert!(decode_snapshot(&rows).is_err());
    }
}
