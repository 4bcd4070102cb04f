//! Per-round consensus state
//!
//! The engine and the worker share one [`ConsensusState`] behind a single
//! lock. The engine owns the round lifecycle; the worker reads the eligible
//! list and round index and records received proposals.

use crate::{
    bitmap_len,
    block::{BlockBody, BlockHeader},
    errors::{SposError, SposResult},
    set_bit,
};
use alloy_primitives::{Bytes, B256};
use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use std::sync::Arc;

use super::Subround;

/// Consensus state shared between the engine and the worker
pub type SharedConsensusState = Arc<RwLock<ConsensusState>>;

/// Consensus group of the current round and what each member has done
#[derive(Debug, Default)]
pub struct RoundConsensus {
    eligible: HashSet<Bytes>,
    group: Vec<Bytes>,
    leader: Bytes,
    self_pub_key: Bytes,
    job_done: HashMap<Bytes, HashSet<Subround>>,
}

impl RoundConsensus {
    /// Empty group for the node owning `self_pub_key`
    pub fn new(eligible: HashSet<Bytes>, self_pub_key: Bytes) -> Self {
        Self { eligible, self_pub_key, ..Default::default() }
    }

    /// Replace the keys allowed to send consensus messages
    pub fn set_eligible_list(&mut self, eligible: HashSet<Bytes>) {
        self.eligible = eligible;
    }

    /// Keys allowed to send consensus messages
    pub const fn eligible_list(&self) -> &HashSet<Bytes> {
        &self.eligible
    }

    /// Whether `pub_key` may send consensus messages
    pub fn is_node_in_eligible_list(&self, pub_key: &[u8]) -> bool {
        self.eligible.contains(&Bytes::copy_from_slice(pub_key))
    }

    /// Install the group of a new round and forget all jobs
    pub fn set_consensus_group(&mut self, group: Vec<Bytes>, leader: Bytes) {
        self.job_done = group.iter().map(|pk| (pk.clone(), HashSet::new())).collect();
        self.group = group;
        self.leader = leader;
    }

    /// Members in selection order
    pub fn consensus_group(&self) -> &[Bytes] {
        &self.group
    }

    /// Group size
    pub fn consensus_group_size(&self) -> usize {
        self.group.len()
    }

    /// Leader key of the round
    pub const fn leader(&self) -> &Bytes {
        &self.leader
    }

    /// Key of this node
    pub const fn self_pub_key(&self) -> &Bytes {
        &self.self_pub_key
    }

    /// Whether `pub_key` leads the round
    pub fn is_leader(&self, pub_key: &[u8]) -> bool {
        !self.leader.is_empty() && self.leader.as_ref() == pub_key
    }

    /// Whether `pub_key` is a member of the group
    pub fn is_node_in_consensus_group(&self, pub_key: &[u8]) -> bool {
        self.consensus_group_index(pub_key).is_some()
    }

    /// Position of `pub_key` in the group
    pub fn consensus_group_index(&self, pub_key: &[u8]) -> Option<usize> {
        self.group.iter().position(|pk| pk.as_ref() == pub_key)
    }

    /// Record that `pub_key` finished `subround`
    pub fn set_job_done(&mut self, pub_key: &[u8], subround: Subround) -> SposResult<()> {
        let jobs = self
            .job_done
            .get_mut(&Bytes::copy_from_slice(pub_key))
            .ok_or(SposError::NotInConsensusGroup)?;
        jobs.insert(subround);
        Ok(())
    }

    /// Whether `pub_key` finished `subround`
    pub fn job_done(&self, pub_key: &[u8], subround: Subround) -> bool {
        self.job_done
            .get(&Bytes::copy_from_slice(pub_key))
            .is_some_and(|jobs| jobs.contains(&subround))
    }

    /// Members that finished `subround`
    pub fn compute_size(&self, subround: Subround) -> usize {
        self.group.iter().filter(|pk| self.job_done(pk, subround)).count()
    }

    /// Bitmap of the members that finished `subround`
    pub fn generate_bitmap(&self, subround: Subround) -> Vec<u8> {
        let mut bitmap = vec![0u8; bitmap_len(self.group.len())];
        for (index, pk) in self.group.iter().enumerate() {
            if self.job_done(pk, subround) {
                set_bit(&mut bitmap, index);
            }
        }
        bitmap
    }
}

/// Progress of a subround
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubroundStatus {
    /// Still running or not started
    #[default]
    NotFinished,
    /// Completed for this round
    Finished,
}

/// State of the round being run
#[derive(Debug, Default)]
pub struct ConsensusState {
    /// Group, leader and jobs of the round
    pub round_consensus: RoundConsensus,
    /// Index of the round being run
    pub round_index: i64,
    /// Start time of the round being run
    pub round_timestamp: DateTime<Utc>,
    /// Set when the round can no longer finish
    pub round_canceled: bool,
    /// Accepted proposal header
    pub header: Option<BlockHeader>,
    /// Accepted proposal body
    pub body: Option<BlockBody>,
    /// Hash of the accepted proposal header
    pub header_hash: Option<B256>,
    status: HashMap<Subround, SubroundStatus>,
    received_headers: HashMap<i64, B256>,
    invalid_signers: Vec<Bytes>,
}

impl ConsensusState {
    /// State for the node owning `self_pub_key`
    pub fn new(eligible: HashSet<Bytes>, self_pub_key: Bytes) -> Self {
        Self { round_consensus: RoundConsensus::new(eligible, self_pub_key), ..Default::default() }
    }

    /// Shareable state
    pub fn shared(self) -> SharedConsensusState {
        Arc::new(RwLock::new(self))
    }

    /// Forget everything about the previous round
    pub fn reset_for_round(&mut self, round_index: i64, round_timestamp: DateTime<Utc>) {
        self.round_index = round_index;
        self.round_timestamp = round_timestamp;
        self.round_canceled = false;
        self.header = None;
        self.body = None;
        self.header_hash = None;
        self.status.clear();
        self.invalid_signers.clear();
        self.received_headers.retain(|round, _| *round >= round_index);
    }

    /// Progress of `subround` in this round
    pub fn status(&self, subround: Subround) -> SubroundStatus {
        self.status.get(&subround).copied().unwrap_or_default()
    }

    /// Update the progress of `subround`
    pub fn set_status(&mut self, subround: Subround, status: SubroundStatus) {
        self.status.insert(subround, status);
    }

    /// Record the proposal seen for `round`
    ///
    /// Returns `false` when a different header was already seen for that round.
    pub fn add_received_header(&mut self, round: i64, hash: B256) -> bool {
        match self.received_headers.get(&round) {
            Some(seen) => *seen == hash,
            None => {
                self.received_headers.insert(round, hash);
                true
            }
        }
    }

    /// Accept the round proposal
    pub fn set_proposal(&mut self, header: BlockHeader, body: BlockBody, hash: B256) {
        self.header = Some(header);
        self.body = Some(body);
        self.header_hash = Some(hash);
    }

    /// Record a member whose share failed verification
    pub fn add_invalid_signer(&mut self, pub_key: Bytes) {
        if !self.invalid_signers.contains(&pub_key) {
            self.invalid_signers.push(pub_key);
        }
    }

    /// Members whose shares failed verification this round
    pub fn invalid_signers(&self) -> &[Bytes] {
        &self.invalid_signers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn key(i: u8) -> Bytes {
        Bytes::from(vec![i; 48])
    }

    #[test]
    fn test_job_done_and_bitmap() {
        let mut rc = RoundConsensus::new(HashSet::new(), key(1));
        let group: Vec<Bytes> = (1..=10).map(key).collect();
        rc.set_consensus_group(group, key(1));

        rc.set_job_done(&key(1), Subround::Signature).unwrap();
        rc.set_job_done(&key(10), Subround::Signature).unwrap();
        rc.set_job_done(&key(2), Subround::Block).unwrap();
        assert_matches!(rc.set_job_done(&key(11), Subround::Block), Err(SposError::NotInConsensusGroup));

        assert_eq!(rc.compute_size(Subround::Signature), 2);
        assert_eq!(rc.generate_bitmap(Subround::Signature), vec![0b0000_0001, 0b0000_0010]);
        assert!(rc.is_leader(&key(1)));
        assert_eq!(rc.consensus_group_index(&key(4)), Some(3));

        rc.set_consensus_group(vec![key(3)], key(3));
        assert!(!rc.job_done(&key(1), Subround::Signature));
    }

    #[test]
    fn test_received_headers_detect_equivocation() {
        let mut state = ConsensusState::new(HashSet::new(), key(1));
        assert!(state.add_received_header(5, B256::repeat_byte(1)));
        assert!(state.add_received_header(5, B256::repeat_byte(1)));
        assert!(!state.add_received_header(5, B256::repeat_byte(2)));
        assert!(state.add_received_header(6, B256::repeat_byte(2)));

        state.reset_for_round(6, DateTime::<Utc>::default());
        assert!(state.add_received_header(5, B256::repeat_byte(2)));
        assert!(!state.add_received_header(6, B256::repeat_byte(3)));
    }

    #[test]
    fn test_reset_clears_round_data() {
        let mut state = ConsensusState::new(HashSet::from([key(1)]), key(1));
        state.set_status(Subround::Block, SubroundStatus::Finished);
        state.add_invalid_signer(key(2));
        state.add_invalid_signer(key(2));
        state.set_proposal(BlockHeader::default(), BlockBody::default(), B256::ZERO);
        assert_eq!(state.invalid_signers().len(), 1);

        state.reset_for_round(3, DateTime::<Utc>::default());
        assert_eq!(state.status(Subround::Block), SubroundStatus::NotFinished);
        assert!(state.header.is_none());
        assert!(state.invalid_signers().is_empty());
        assert!(state.round_consensus.is_node_in_eligible_list(&key(1)));
    }
}
