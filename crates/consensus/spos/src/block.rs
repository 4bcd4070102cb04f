//! Block header, body and proof types

use crate::{constants::METACHAIN_SHARD_ID, hashing::Hasher};
use alloy_primitives::{Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// Header of a shard or metachain block
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct BlockHeader {
    /// Shard that produced the block
    pub shard_id: u32,
    /// Epoch of the block
    pub epoch: u32,
    /// Strictly increasing with committed blocks
    pub nonce: u64,
    /// Round in which the block was proposed
    pub round: u64,
    /// Proposal time in milliseconds since the unix epoch
    pub timestamp: u64,
    /// Hash of the parent header
    pub prev_hash: B256,
    /// Random seed of the parent header
    pub prev_rand_seed: Bytes,
    /// Leader signature over `prev_rand_seed`
    pub rand_seed: Bytes,
    /// Whether this block opens `epoch`
    pub start_of_epoch: bool,
    /// Hash of the block body
    pub body_hash: B256,
    /// Chain identifier
    pub chain_id: Bytes,
    /// Miniblocks carried by the body
    pub mini_block_headers: Vec<MiniBlockHeader>,
    /// Notarised shard headers (metachain only)
    pub shard_info: Vec<ShardData>,
}

impl BlockHeader {
    /// Header hash under `hasher`
    pub fn hash(&self, hasher: &dyn Hasher) -> B256 {
        crate::hashing::rlp_hash(hasher, self)
    }

    /// Whether the block was produced by the metachain
    pub const fn is_metachain(&self) -> bool {
        self.shard_id == METACHAIN_SHARD_ID
    }

    /// Hashes of final miniblocks sent from this header's shard to `dest`
    pub fn final_cross_mini_block_hashes(&self, dest: u32) -> Vec<B256> {
        self.mini_block_headers
            .iter()
            .filter(|mb| mb.is_final && mb.sender_shard_id == self.shard_id && mb.receiver_shard_id == dest)
            .map(|mb| mb.hash)
            .collect()
    }
}

/// Summary of a miniblock inside a header
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct MiniBlockHeader {
    /// Miniblock hash
    pub hash: B256,
    /// Source shard
    pub sender_shard_id: u32,
    /// Destination shard
    pub receiver_shard_id: u32,
    /// Number of transactions
    pub tx_count: u32,
    /// Whether the miniblock is final in this header
    pub is_final: bool,
}

/// Shard header notarised by a metachain block
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct ShardData {
    /// Shard of the notarised header
    pub shard_id: u32,
    /// Hash of the notarised header
    pub header_hash: B256,
    /// Round of the notarised header
    pub round: u64,
    /// Nonce of the notarised header
    pub nonce: u64,
    /// Previous random seed of the notarised header
    pub prev_rand_seed: Bytes,
}

/// Group of transactions moving between two shards
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct MiniBlock {
    /// Source shard
    pub sender_shard_id: u32,
    /// Destination shard
    pub receiver_shard_id: u32,
    /// Transaction hashes
    pub tx_hashes: Vec<B256>,
}

/// Block body
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct BlockBody {
    /// Miniblocks in execution order
    pub mini_blocks: Vec<MiniBlock>,
}

impl BlockBody {
    /// Body hash under `hasher`
    pub fn hash(&self, hasher: &dyn Hasher) -> B256 {
        crate::hashing::rlp_hash(hasher, self)
    }

    /// Miniblock headers describing this body, all marked final
    pub fn mini_block_headers(&self, hasher: &dyn Hasher) -> Vec<MiniBlockHeader> {
        self.mini_blocks
            .iter()
            .map(|mb| MiniBlockHeader {
                hash: crate::hashing::rlp_hash(hasher, mb),
                sender_shard_id: mb.sender_shard_id,
                receiver_shard_id: mb.receiver_shard_id,
                tx_count: mb.tx_hashes.len() as u32,
                is_final: true,
            })
            .collect()
    }
}

/// Finality proof attached to a header at end of round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderProof {
    /// BLS aggregated signature over the header hash
    pub aggregated_signature: Bytes,
    /// Signers bitmap, one bit per consensus group member, LSB first
    pub pub_keys_bitmap: Bytes,
    /// Hash of the proven header
    pub header_hash: Bytes,
    /// Shard of the proven header
    pub header_shard_id: u32,
    /// Epoch of the proven header
    pub header_epoch: u32,
    /// Nonce of the proven header
    pub header_nonce: u64,
    /// Round of the proven header
    pub header_round: u64,
    /// Whether the proven header starts an epoch
    pub is_start_of_epoch: bool,
}

impl HeaderProof {
    /// Number of bits set in the bitmap
    pub fn signers_count(&self) -> usize {
        self.pub_keys_bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }
}
