//! Per-epoch chain parameters

use crate::{
    constants::METACHAIN_SHARD_ID,
    errors::{SposError, SposResult},
};
use serde::{Deserialize, Serialize};

/// Chain parameters effective from `enable_epoch` onwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParameters {
    /// First epoch these parameters apply to
    pub enable_epoch: u32,
    /// Round duration in milliseconds
    pub round_duration_ms: u64,
    /// Consensus group size of regular shards
    pub shard_consensus_group_size: u32,
    /// Minimum eligible nodes per regular shard
    pub shard_min_num_nodes: u32,
    /// Consensus group size of the metachain
    pub meta_consensus_group_size: u32,
    /// Minimum eligible nodes in the metachain
    pub meta_min_num_nodes: u32,
    /// Share of nodes allowed in waiting lists above the minimum (percent)
    pub hysteresis: u32,
    /// Whether shard sizes may adapt to the node count
    pub adaptivity: bool,
}

impl Default for ChainParameters {
    fn default() -> Self {
        Self {
            enable_epoch: 0,
            round_duration_ms: 6_000,
            shard_consensus_group_size: 7,
            shard_min_num_nodes: 7,
            meta_consensus_group_size: 7,
            meta_min_num_nodes: 7,
            hysteresis: 20,
            adaptivity: false,
        }
    }
}

impl ChainParameters {
    /// Consensus group size for `shard_id`
    pub const fn consensus_group_size(&self, shard_id: u32) -> usize {
        if shard_id == METACHAIN_SHARD_ID {
            self.meta_consensus_group_size as usize
        } else {
            self.shard_consensus_group_size as usize
        }
    }
}

/// Ordered set of chain parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParametersHolder {
    /// Sorted by `enable_epoch`, descending
    params: Vec<ChainParameters>,
    current_epoch: u32,
}

impl ChainParametersHolder {
    /// Create a holder; an entry enabled at epoch 0 is mandatory
    pub fn new(mut params: Vec<ChainParameters>) -> SposResult<Self> {
        if params.is_empty() {
            return Err(SposError::NilParameter);
        }
        params.sort_by(|a, b| b.enable_epoch.cmp(&a.enable_epoch));
        params.dedup_by_key(|p| p.enable_epoch);
        if params.last().map(|p| p.enable_epoch) != Some(0) {
            return Err(SposError::InvalidConfig("missing chain parameters for epoch 0".into()));
        }
        for p in &params {
            if p.shard_consensus_group_size == 0 || p.meta_consensus_group_size == 0 {
                return Err(SposError::InvalidConfig("consensus group size must be positive".into()));
            }
            if p.shard_consensus_group_size > p.shard_min_num_nodes ||
                p.meta_consensus_group_size > p.meta_min_num_nodes
            {
                return Err(SposError::InvalidConfig(
                    "consensus group size exceeds the minimum number of nodes".into(),
                ));
            }
        }
        Ok(Self { params, current_epoch: 0 })
    }

    /// Single parameter set for every epoch
    pub fn single(params: ChainParameters) -> SposResult<Self> {
        Self::new(vec![ChainParameters { enable_epoch: 0, ..params }])
    }

    /// Parameters effective at `epoch`
    pub fn chain_parameters_for_epoch(&self, epoch: u32) -> ChainParameters {
        // epoch 0 is always present, so the search cannot fail
        self.params
            .iter()
            .find(|p| p.enable_epoch <= epoch)
            .copied()
            .unwrap_or_else(|| self.params[self.params.len() - 1])
    }

    /// Parameters effective at the last epoch seen
    pub fn current_chain_parameters(&self) -> ChainParameters {
        self.chain_parameters_for_epoch(self.current_epoch)
    }

    /// Record a new epoch
    pub const fn set_current_epoch(&mut self, epoch: u32) {
        self.current_epoch = epoch;
    }

    /// All parameter sets, most recent first
    pub fn all(&self) -> &[ChainParameters] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params(epoch: u32, shard: u32, meta: u32) -> ChainParameters {
        ChainParameters {
            enable_epoch: epoch,
            shard_consensus_group_size: shard,
            shard_min_num_nodes: shard,
            meta_consensus_group_size: meta,
            meta_min_num_nodes: meta,
            ..Default::default()
        }
    }

    #[test]
    fn test_params_for_epoch() {
        let holder =
            ChainParametersHolder::new(vec![params(10, 5, 7), params(0, 3, 4), params(20, 9, 9)])
                .unwrap();

        assert_eq!(holder.chain_parameters_for_epoch(0).shard_consensus_group_size, 3);
        assert_eq!(holder.chain_parameters_for_epoch(9).shard_consensus_group_size, 3);
        assert_eq!(holder.chain_parameters_for_epoch(10).shard_consensus_group_size, 5);
        assert_eq!(holder.chain_parameters_for_epoch(25).consensus_group_size(METACHAIN_SHARD_ID), 9);
        assert_eq!(holder.current_chain_parameters().enable_epoch, 0);
    }

    #[test]
    fn test_invalid_params() {
        assert_matches!(ChainParametersHolder::new(vec![]), Err(SposError::NilParameter));
        assert_matches!(
            ChainParametersHolder::new(vec![params(1, 3, 3)]),
            Err(SposError::InvalidConfig(_))
        );
        assert_matches!(
            ChainParametersHolder::new(vec![params(0, 0, 3)]),
            Err(SposError::InvalidConfig(_))
        );
        let oversized = ChainParameters { shard_min_num_nodes: 2, ..params(0, 3, 3) };
        assert_matches!(ChainParametersHolder::new(vec![oversized]), Err(SposError::InvalidConfig(_)));
    }
}
