//! Property tests for the merge's convergence guarantees.
//!
//! The merge is pure, so these run without a runtime: random delta
//! batches drawn from small id pools (to force key collisions) are
//! applied in different shapes and the resulting snapshots compared.

use proptest::prelude::*;
use tabletalk_engine::merge;
use tabletalk_model::{Delta, ServerTime, SessionId, SessionSnapshot};
use tabletalk_testkit::generators::delta_batch_strategy;

/// Reassigns strictly increasing server times, keeping batch order.
///
/// Equal `(server_time, key)` pairs denote the same logical event, so
/// ordering properties are only required over batches without such
/// collisions.
fn with_distinct_times(mut batch: Vec<Delta>) -> Vec<Delta> {
    for (index, delta) in batch.iter_mut().enumerate() {
        delta.server_time = ServerTime::from_millis((index as i64 + 1) * 10);
    }
    batch
}

fn sorted(mut batch: Vec<Delta>) -> Vec<Delta> {
    batch.sort_by_key(|delta| (delta.server_time, delta.key()));
    batch
}

proptest! {
    /// Applying a batch twice leaves the snapshot unchanged.
    #[test]
    fn reapplying_a_batch_changes_nothing(
        batch in delta_batch_strategy(SessionId::new("s1"))
    ) {
        let (once, _) = merge(&SessionSnapshot::empty(), &batch);
        let (twice, report) = merge(&once, &batch);
        prop_assert_eq!(once, twice);
        prop_assert!(report.conflicts.len() <= batch.len());
    }

    /// Batch order does not matter when server times are distinct.
    #[test]
    fn shuffled_batches_converge(
        (batch, shuffled) in delta_batch_strategy(SessionId::new("s1"))
            .prop_map(with_distinct_times)
            .prop_flat_map(|batch| {
                let shuffled = Just(batch.clone()).prop_shuffle();
                (Just(batch), shuffled)
            })
    ) {
        let (a, _) = merge(&SessionSnapshot::empty(), &batch);
        let (b, _) = merge(&SessionSnapshot::empty(), &shuffled);
        prop_assert_eq!(a, b);
    }

    /// One big batch and one-at-a-time application agree, which is the
    /// poll-versus-push delivery difference.
    #[test]
    fn batched_and_single_delivery_converge(
        batch in delta_batch_strategy(SessionId::new("s1"))
            .prop_map(with_distinct_times)
    ) {
        let ordered = sorted(batch);
        let (batched, _) = merge(&SessionSnapshot::empty(), &ordered);

        let mut stepped = SessionSnapshot::empty();
        for delta in &ordered {
            let (next, _) = merge(&stepped, std::slice::from_ref(delta));
            stepped = next;
        }
        prop_assert_eq!(batched, stepped);
    }

    /// The session phase never moves backward, whatever arrives.
    #[test]
    fn phase_rank_is_monotonic(batch in delta_batch_strategy(SessionId::new("s1"))) {
        let mut snapshot = SessionSnapshot::empty();
        let mut highest = None;
        for delta in &batch {
            let (next, _) = merge(&snapshot, std::slice::from_ref(delta));
            snapshot = next;
            let rank = snapshot.phase().map(|phase| phase.rank());
            prop_assert!(rank >= highest);
            highest = highest.max(rank);
        }
    }

    /// Vote topic sets only ever grow.
    #[test]
    fn vote_sets_never_shrink(batch in delta_batch_strategy(SessionId::new("s1"))) {
        let mut snapshot = SessionSnapshot::empty();
        for delta in &batch {
            let before = snapshot.votes.clone();
            let (next, _) = merge(&snapshot, std::slice::from_ref(delta));
            for (participant, stamped) in &before {
                let topics = &next.votes[participant].value.topics;
                prop_assert!(stamped.value.topics.is_subset(topics));
            }
            snapshot = next;
        }
    }

    /// Every delta is accounted for exactly once per merge call.
    #[test]
    fn reports_account_for_every_delta(
        batch in delta_batch_strategy(SessionId::new("s1"))
    ) {
        let (_, report) = merge(&SessionSnapshot::empty(), &batch);
        prop_assert_eq!(report.applied + report.dropped(), batch.len());
    }
}
