//! Property-based tests for the SPoS round engine
//!
//! These tests use randomized inputs to verify invariants that should
//! hold true for all valid inputs.

use alloy_primitives::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;
use reth_consensus_spos::{
    bitmap_len,
    hashing::Keccak256Hasher,
    header_check::compute_signers_public_keys,
    is_bit_set,
    sharding::{ExpandedListSelector, Validator},
    set_bit, QuorumThreshold, Round, SystemSyncTimer,
};
use std::{collections::HashSet, sync::Arc};

fn genesis() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn validators(chances: &[u32]) -> Vec<Arc<Validator>> {
    chances
        .iter()
        .enumerate()
        .map(|(i, chances)| {
            let pub_key = Bytes::from((i as u32).to_be_bytes().to_vec());
            Arc::new(Validator::new(pub_key, *chances, i as u32).unwrap())
        })
        .collect()
}

proptest! {
    /// Property: the round containing `now` starts at or before `now` and lasts one duration
    #[test]
    fn prop_round_index_matches_elapsed_time(
        duration_ms in 1i64..10_000,
        elapsed_ms in 0i64..1_000_000_000,
        start_round in 0i64..100,
    ) {
        let duration = TimeDelta::milliseconds(duration_ms);
        let now = genesis() + TimeDelta::milliseconds(elapsed_ms);
        let round =
            Round::new(genesis(), now, duration, Some(Arc::new(SystemSyncTimer)), start_round).unwrap();

        prop_assert_eq!(round.index(), elapsed_ms / duration_ms + start_round);
        prop_assert!(round.time_stamp() <= now);
        prop_assert!(now < round.time_stamp() + duration);
    }

    /// Property: updating within the same round leaves the clock untouched
    #[test]
    fn prop_round_update_is_idempotent_within_round(
        duration_ms in 1i64..10_000,
        elapsed_ms in 0i64..1_000_000,
        offset in 0i64..10_000,
    ) {
        let duration = TimeDelta::milliseconds(duration_ms);
        let now = genesis() + TimeDelta::milliseconds(elapsed_ms);
        let round = Round::new(genesis(), now, duration, Some(Arc::new(SystemSyncTimer)), 0).unwrap();
        let (index, start) = (round.index(), round.time_stamp());

        let later = start + TimeDelta::milliseconds(offset % duration_ms);
        round.update_round(genesis(), later);
        prop_assert_eq!(round.index(), index);
        prop_assert_eq!(round.time_stamp(), start);
    }

    /// Property: selection yields distinct in-range positions and is deterministic
    #[test]
    fn prop_selector_picks_distinct_validators(
        chances in prop::collection::vec(0u32..20, 1..40),
        randomness in prop::collection::vec(any::<u8>(), 1..64),
        size_seed in any::<usize>(),
    ) {
        let selector = ExpandedListSelector::new(&validators(&chances), Arc::new(Keccak256Hasher));
        let size = size_seed % chances.len() + 1;

        let picked = selector.select(&randomness, size).unwrap();
        prop_assert_eq!(picked.len(), size);
        prop_assert!(picked.iter().all(|p| *p < chances.len()));
        prop_assert_eq!(picked.iter().collect::<HashSet<_>>().len(), size);
        prop_assert_eq!(selector.select(&randomness, size).unwrap(), picked);
    }

    /// Property: a larger sample than validators is always rejected
    #[test]
    fn prop_selector_rejects_oversized_sample(
        count in 1usize..20,
        extra in 1usize..10,
    ) {
        let selector = ExpandedListSelector::new(&validators(&vec![1; count]), Arc::new(Keccak256Hasher));
        prop_assert!(selector.select(b"seed", count + extra).is_err());
    }

    /// Property: signers are exactly the group members with a set bit, in group order
    #[test]
    fn prop_signers_follow_bitmap(
        group_size in 1usize..100,
        bitmap in prop::collection::vec(any::<u8>(), 0..16),
    ) {
        let group: Vec<Bytes> =
            (0..group_size).map(|i| Bytes::from((i as u32).to_be_bytes().to_vec())).collect();
        let signers = compute_signers_public_keys(&group, &bitmap);

        let expected: Vec<Bytes> =
            (0..group_size).filter(|i| is_bit_set(&bitmap, *i)).map(|i| group[i].clone()).collect();
        prop_assert_eq!(signers, expected);
    }

    /// Property: setting bits in a sized bitmap is observable and never spills past the group
    #[test]
    fn prop_bitmap_bits_roundtrip(
        group_size in 1usize..200,
        indexes in prop::collection::vec(any::<usize>(), 0..50),
    ) {
        let mut bitmap = vec![0u8; bitmap_len(group_size)];
        let indexes: HashSet<usize> = indexes.into_iter().map(|i| i % group_size).collect();
        for index in &indexes {
            set_bit(&mut bitmap, *index);
        }

        prop_assert!(bitmap.len() * 8 >= group_size);
        prop_assert!(bitmap.len() * 8 < group_size + 8);
        for i in 0..bitmap.len() * 8 {
            prop_assert_eq!(is_bit_set(&bitmap, i), indexes.contains(&i));
        }
    }

    /// Property: quorums are reachable and keep their safety margins
    #[test]
    fn prop_quorum_thresholds(group_size in 1usize..1_000, percent in 1u64..=100) {
        let pbft = QuorumThreshold::Pbft.required(group_size);
        prop_assert!(pbft <= group_size);
        prop_assert!(3 * pbft > 2 * group_size);

        let majority = QuorumThreshold::Majority.required(group_size);
        prop_assert!(majority <= group_size);
        prop_assert!(2 * majority > group_size);

        prop_assert_eq!(QuorumThreshold::All.required(group_size), group_size);

        let share = QuorumThreshold::Percent(percent).required(group_size);
        prop_assert!(share <= group_size);
        prop_assert!(share as u64 * 100 >= group_size as u64 * percent);
    }
}
