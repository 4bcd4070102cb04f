//! Shard coordinator

use crate::{
    constants::METACHAIN_SHARD_ID,
    errors::{SposError, SposResult},
    shard_name,
};

/// Number of shards and the shard this node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardCoordinator {
    num_shards: u32,
    self_id: u32,
}

impl ShardCoordinator {
    /// Create a coordinator for `num_shards` shards plus the metachain
    pub fn new(num_shards: u32, self_id: u32) -> SposResult<Self> {
        if num_shards == 0 {
            return Err(SposError::InvalidConfig("number of shards must be positive".into()));
        }
        if self_id >= num_shards && self_id != METACHAIN_SHARD_ID {
            return Err(SposError::InvalidShardId(self_id));
        }
        Ok(Self { num_shards, self_id })
    }

    /// Number of regular shards
    pub const fn number_of_shards(&self) -> u32 {
        self.num_shards
    }

    /// Shard of this node
    pub const fn self_id(&self) -> u32 {
        self.self_id
    }

    /// Whether this node is a metachain node
    pub const fn is_metachain(&self) -> bool {
        self.self_id == METACHAIN_SHARD_ID
    }

    /// Topic suffix for traffic between this shard and `dest`
    ///
    /// Intra-shard traffic uses `_<self>`, cross-shard traffic
    /// `_<lower>_<higher>` with the metachain written as `META`.
    pub fn communication_identifier(&self, dest: u32) -> String {
        if dest == self.self_id {
            return format!("_{}", shard_name(dest));
        }
        let (low, high) =
            if dest < self.self_id { (dest, self.self_id) } else { (self.self_id, dest) };
        format!("_{}_{}", shard_name(low), shard_name(high))
    }

    /// All destinations other than this shard, metachain included
    pub fn cross_shard_destinations(&self) -> Vec<u32> {
        (0..self.num_shards)
            .chain(core::iter::once(METACHAIN_SHARD_ID))
            .filter(|shard| *shard != self.self_id)
            .collect()
    }
}
