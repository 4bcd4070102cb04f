//! Stake-weighted random selection of consensus group members
//!
//! Every validator is expanded into `chances` slots. Position `i` of the group
//! takes slot `H(randomness || i) mod len(slots)` and steps forward past slots
//! of validators that were already picked, so the group never repeats a member.

use crate::{
    errors::{SposError, SposResult},
    hashing::Hasher,
};
use std::sync::Arc;

use super::Validator;

/// Selector over the expanded slot list of one shard
#[derive(Debug, Clone)]
pub struct ExpandedListSelector {
    slots: Vec<usize>,
    distinct: usize,
    hasher: Arc<dyn Hasher>,
}

impl ExpandedListSelector {
    /// Build the slot list for `validators`
    ///
    /// A validator with zero chances still gets one slot so it stays selectable.
    pub fn new(validators: &[Arc<Validator>], hasher: Arc<dyn Hasher>) -> Self {
        let slots = validators
            .iter()
            .enumerate()
            .flat_map(|(position, validator)| {
                core::iter::repeat_n(position, validator.chances().max(1) as usize)
            })
            .collect();
        Self { slots, distinct: validators.len(), hasher }
    }

    /// Number of slots in the expanded list
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the list has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Positions of `sample_size` distinct validators, leader first
    pub fn select(&self, randomness: &[u8], sample_size: usize) -> SposResult<Vec<usize>> {
        if randomness.is_empty() {
            return Err(SposError::NilRandomness);
        }
        if sample_size > self.distinct {
            return Err(SposError::InvalidSampleSize {
                requested: sample_size,
                available: self.distinct,
            });
        }

        let mut picked = vec![false; self.distinct];
        let mut selected = Vec::with_capacity(sample_size);
        let mut buffer = Vec::with_capacity(randomness.len() + 8);

        for i in 0..sample_size as u64 {
            buffer.clear();
            buffer.extend_from_slice(randomness);
            buffer.extend_from_slice(&i.to_be_bytes());
            let digest = self.hasher.compute(&buffer);

            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            let mut slot = (u64::from_be_bytes(word) % self.slots.len() as u64) as usize;

            while picked[self.slots[slot]] {
                slot = (slot + 1) % self.slots.len();
            }
            picked[self.slots[slot]] = true;
            selected.push(self.slots[slot]);
        }

        Ok(selected)
    }
}
