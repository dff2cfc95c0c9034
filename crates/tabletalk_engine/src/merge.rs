//! Pure delta merge.
//!
//! [`merge`] integrates a batch of deltas into a snapshot regardless of
//! which transport produced them, safely under duplication and
//! reordering. The batch is totally ordered internally by
//! `(server_time, entity key)` before applying, so the result is
//! independent of input order and of the delivering transport.

use tabletalk_model::{
    Delta, DeltaBody, DeltaOp, EntityKey, ServerTime, SessionId, SessionPatch, SessionSnapshot,
    Stamped, SyncSession,
};

/// What happened to each delta in a merge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Deltas that changed or re-confirmed the snapshot.
    pub applied: usize,
    /// Deltas dropped as stale: older timestamp, or insert on an
    /// existing identity (the at-least-once duplicate case).
    pub stale: usize,
    /// Deltas dropped because no safe ordering exists for them.
    pub conflicts: Vec<EntityKey>,
}

impl MergeReport {
    /// Total number of deltas that were dropped.
    pub fn dropped(&self) -> usize {
        self.stale + self.conflicts.len()
    }
}

/// Merges a batch of deltas onto a snapshot, returning the new snapshot.
///
/// The input snapshot is left untouched. Guarantees:
/// - `merge(state, [])` equals `state` (no-op law)
/// - re-merging an already-applied batch changes nothing (idempotence)
/// - the result is independent of delta order within the batch and of
///   which transport supplied which delta (convergence)
/// - no entity field ever reverts to a value carrying an older server
///   timestamp than the one already applied (monotonicity)
pub fn merge(base: &SessionSnapshot, deltas: &[Delta]) -> (SessionSnapshot, MergeReport) {
    let mut next = base.clone();
    let mut report = MergeReport::default();

    if deltas.is_empty() {
        return (next, report);
    }

    let mut ordered: Vec<&Delta> = deltas.iter().collect();
    ordered.sort_by(|a, b| {
        a.server_time
            .cmp(&b.server_time)
            .then_with(|| a.key().cmp(&b.key()))
    });

    for delta in ordered {
        apply_one(&mut next, delta, &mut report);
    }

    (next, report)
}

fn apply_one(next: &mut SessionSnapshot, delta: &Delta, report: &mut MergeReport) {
    let ts = delta.server_time;
    match &delta.body {
        DeltaBody::Session(id, patch) => apply_session(next, id, patch, ts, report),
        DeltaBody::Participant(participant) => {
            let key = participant.id.clone();
            match next.participants.get_mut(&key) {
                None => {
                    next.participants
                        .insert(key, Stamped::new(participant.clone(), ts));
                    report.applied += 1;
                }
                Some(stored) => match delta.op {
                    DeltaOp::Insert => report.stale += 1,
                    DeltaOp::Update => {
                        if ts >= stored.server_time {
                            stored.value = participant.clone();
                            stored.server_time = ts;
                            report.applied += 1;
                        } else {
                            report.stale += 1;
                        }
                    }
                },
            }
        }
        DeltaBody::Vote(vote) => {
            let key = vote.participant.clone();
            match next.votes.get_mut(&key) {
                None => {
                    next.votes.insert(key, Stamped::new(vote.clone(), ts));
                    report.applied += 1;
                }
                Some(stored) => {
                    // Topic sets only grow: union regardless of op or
                    // timestamp, which makes duplicates and reorderings
                    // harmless by construction.
                    stored.value.absorb(vote);
                    stored.server_time = stored.server_time.max(ts);
                    report.applied += 1;
                }
            }
        }
        DeltaBody::Pick(pick) => {
            let key = (pick.participant.clone(), pick.round);
            match next.picks.get_mut(&key) {
                None => {
                    next.picks.insert(key, Stamped::new(pick.clone(), ts));
                    report.applied += 1;
                }
                Some(stored) => match delta.op {
                    DeltaOp::Insert => report.stale += 1,
                    DeltaOp::Update => {
                        if ts >= stored.server_time {
                            stored.value = pick.clone();
                            stored.server_time = ts;
                            report.applied += 1;
                        } else {
                            report.stale += 1;
                        }
                    }
                },
            }
        }
    }
}

fn apply_session(
    next: &mut SessionSnapshot,
    id: &SessionId,
    patch: &SessionPatch,
    ts: ServerTime,
    report: &mut MergeReport,
) {
    match next.session.as_mut() {
        None => {
            // A session delta can arrive before the first full reload;
            // seed the record from the patch.
            let mut session = SyncSession::new(id.clone(), ts);
            if let Some(phase) = patch.phase {
                session.phase = phase;
            }
            if let Some(round) = patch.round {
                session.round = round;
            }
            next.session = Some(session);
            report.applied += 1;
        }
        Some(session) => {
            if session.id != *id {
                report
                    .conflicts
                    .push(EntityKey::Session(id.clone()));
                return;
            }
            if ts < session.updated_at {
                report.stale += 1;
                return;
            }
            if let Some(phase) = patch.phase {
                if !session.phase.can_advance_to(phase) {
                    // A newer timestamp cannot move the phase backward;
                    // no safe ordering exists, so the delta is dropped.
                    report
                        .conflicts
                        .push(EntityKey::Session(id.clone()));
                    return;
                }
                session.phase = phase;
            }
            if let Some(round) = patch.round {
                session.round = round;
            }
            session.updated_at = ts;
            report.applied += 1;
        }
    }
}
