//! Property-based generators.
//!
//! Strategies draw entity ids from small pools on purpose: convergence
//! and idempotence properties are only interesting when deltas collide
//! on the same keys.

use proptest::prelude::*;
use tabletalk_model::{
    Delta, DeltaBody, ItemId, Participant, ParticipantId, Pick, ServerTime, SessionId,
    SessionPatch, SessionPhase, SourceTransport, TopicId, VoteRecord,
};

/// Strategy for participant ids, drawn from a pool of eight.
pub fn participant_id_strategy() -> impl Strategy<Value = ParticipantId> {
    (0u8..8).prop_map(|n| ParticipantId::new(format!("p{n}")))
}

/// Strategy for topic ids, drawn from a pool of five.
pub fn topic_id_strategy() -> impl Strategy<Value = TopicId> {
    (0u8..5).prop_map(|n| TopicId::new(format!("t{n}")))
}

/// Strategy for item ids, drawn from a pool of five.
pub fn item_id_strategy() -> impl Strategy<Value = ItemId> {
    (0u8..5).prop_map(|n| ItemId::new(format!("i{n}")))
}

/// Strategy for server times in a narrow window, so collisions happen.
pub fn server_time_strategy() -> impl Strategy<Value = ServerTime> {
    (0i64..200).prop_map(ServerTime::from_millis)
}

/// Strategy for either transport.
pub fn transport_strategy() -> impl Strategy<Value = SourceTransport> {
    prop_oneof![Just(SourceTransport::Push), Just(SourceTransport::Poll)]
}

/// Strategy for session phases.
pub fn phase_strategy() -> impl Strategy<Value = SessionPhase> {
    proptest::sample::select(SessionPhase::ALL.to_vec())
}

/// Strategy for participant records.
pub fn participant_strategy() -> impl Strategy<Value = Participant> {
    (
        participant_id_strategy(),
        "[A-Z][a-z]{2,8}",
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(id, name, has_voted, has_picked)| {
            let mut participant = Participant::new(id, &name);
            participant.has_voted = has_voted;
            participant.has_picked = has_picked;
            participant
        })
}

/// Strategy for vote records with one to four topics.
pub fn vote_strategy() -> impl Strategy<Value = VoteRecord> {
    (
        participant_id_strategy(),
        proptest::collection::btree_set(topic_id_strategy(), 1..4),
    )
        .prop_map(|(participant, topics)| VoteRecord {
            participant,
            topics,
        })
}

/// Strategy for picks in rounds one to three.
pub fn pick_strategy() -> impl Strategy<Value = Pick> {
    (
        participant_id_strategy(),
        item_id_strategy(),
        1u32..4,
        server_time_strategy(),
    )
        .prop_map(|(participant, item, round, picked_at)| Pick {
            participant,
            item,
            round,
            picked_at,
        })
}

/// Strategy for a single delta targeting `session`.
pub fn delta_strategy(session: SessionId) -> impl Strategy<Value = Delta> {
    let body = prop_oneof![
        2 => phase_strategy().prop_map({
            let session = session.clone();
            move |phase| DeltaBody::Session(session.clone(), SessionPatch::phase(phase))
        }),
        1 => (1u32..4).prop_map(move |round| {
            DeltaBody::Session(session.clone(), SessionPatch::round(round))
        }),
        4 => participant_strategy().prop_map(DeltaBody::Participant),
        3 => vote_strategy().prop_map(DeltaBody::Vote),
        2 => pick_strategy().prop_map(DeltaBody::Pick),
    ];
    (body, server_time_strategy(), transport_strategy(), any::<bool>()).prop_map(
        |(body, server_time, source, insert)| {
            if insert {
                Delta::insert(body, server_time, source)
            } else {
                Delta::update(body, server_time, source)
            }
        },
    )
}

/// Strategy for a batch of up to 32 deltas targeting `session`.
pub fn delta_batch_strategy(session: SessionId) -> impl Strategy<Value = Vec<Delta>> {
    proptest::collection::vec(delta_strategy(session), 0..32)
}
