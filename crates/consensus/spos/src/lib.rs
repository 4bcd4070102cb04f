//! SPoS Consensus Round Engine
//!
//! This crate implements a single-round-per-slot BFT consensus for sharded
//! chains: a leader is drawn from a stake-weighted consensus group every round,
//! proposes a block, collects BLS signature shares from the group and finalizes
//! the block with an aggregated multi-signature proof.
//!
//! ## Architecture
//!
//! - [`round::Round`] - Round clock relative to genesis
//! - [`sharding`] - Nodes coordinator and consensus group selection
//! - [`header_check::HeaderValidator`] - Header chain linkage and proof checks
//! - [`fallback::FallbackHeaderValidator`] - Start-of-epoch stall relaxation
//! - [`spos::SposConsensus`] - Subround state machine driving one round at a time
//! - [`broadcast`] - Shard and metachain broadcast messengers with delayed
//!   rebroadcast of block data
//! - [`factory`] - Consensus service selection and node wiring

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/paradigmxyz/reth/main/assets/reth-docs.png",
    html_favicon_url = "https://avatars0.githubusercontent.com/u/97369466?s=256",
    issue_tracker_base_url = "https://github.com/paradigmxyz/reth/issues/"
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod block;
pub mod broadcast;
pub mod chain;
mod config;
mod errors;
pub mod factory;
pub mod fallback;
pub mod hashing;
pub mod header_check;
pub mod round;
pub mod sharding;
pub mod signing;
pub mod spos;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod tests;

pub use block::{BlockBody, BlockHeader, HeaderProof, MiniBlock, MiniBlockHeader, ShardData};
pub use config::{
    BroadcastConfig, ConsensusType, HasherKind, QuorumThreshold, SposConfig, SubroundTimings,
};
pub use errors::{SposError, SposResult};
pub use round::{Round, SyncTimer, SystemSyncTimer, TokioSyncTimer};
pub use spos::{RoundOutcome, SposConsensus};

/// Protocol constants for SPoS
pub mod constants {
    /// Shard id reserved for the metachain
    pub const METACHAIN_SHARD_ID: u32 = u32::MAX;

    /// Consensus messages topic
    pub const CONSENSUS_TOPIC: &str = "consensus";

    /// Shard headers sent towards the metachain
    pub const SHARD_BLOCKS_TOPIC: &str = "shardBlocks";

    /// Miniblocks topic
    pub const MINI_BLOCKS_TOPIC: &str = "txBlockBodies";

    /// Metachain headers topic
    pub const METACHAIN_BLOCKS_TOPIC: &str = "metachainBlocks";

    /// Equivalent proofs topic
    pub const EQUIVALENT_PROOFS_TOPIC: &str = "equivalentProofs";

    /// Transactions topic
    pub const TRANSACTIONS_TOPIC: &str = "transactions";

    /// One mebibyte, the bound for marshalled bodies and headers in consensus messages
    pub const MEGABYTE: usize = 1 << 20;

    /// Upper bound for an aggregated signature inside a proof
    pub const MAX_SIGNATURE_SIZE: usize = 100;

    /// BLS12-381 compressed public key (G1) length
    pub const BLS_PUBLIC_KEY_SIZE: usize = 48;

    /// BLS12-381 compressed signature (G2) length
    pub const BLS_SIGNATURE_SIZE: usize = 96;

    /// Domain separation tag for consensus BLS signatures
    pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_SPOS_";

    /// Alarm id prefix for validator header rebroadcasts
    pub const HEADER_ALARM_PREFIX: &str = "header_";

    /// Alarm id prefix for validator block data rebroadcasts
    pub const VALIDATOR_ALARM_PREFIX: &str = "delay_";

    /// Alarm id prefix for leader block data broadcasts
    pub const LEADER_ALARM_PREFIX: &str = "leader_";

    /// Consecutive aborted rounds after which a node reports itself as not live
    pub const MAX_CONSECUTIVE_ABORTED_ROUNDS: u64 = 10;

    /// Early consensus messages kept for rounds that have not started yet
    pub const MAX_BUFFERED_MESSAGES: usize = 1_000;

    /// Capacity of the intercepted headers cache in the delayed broadcaster
    pub const HEADERS_CACHE_SIZE: usize = 1_000;

    /// Verified peer signatures kept by the peer signature handler
    pub const PEER_SIGNATURE_CACHE_SIZE: usize = 10_000;
}

/// Shard id formatted for topics and logs
pub fn shard_name(shard_id: u32) -> String {
    if shard_id == constants::METACHAIN_SHARD_ID {
        "META".to_string()
    } else {
        shard_id.to_string()
    }
}

/// Bitmap length needed for a consensus group of `group_size` members
pub const fn bitmap_len(group_size: usize) -> usize {
    group_size.div_ceil(8)
}

/// Whether bit `index` is set, LSB first within each byte
pub fn is_bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap.get(index / 8).is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

/// Set bit `index`, LSB first within each byte
pub fn set_bit(bitmap: &mut [u8], index: usize) {
    if let Some(byte) = bitmap.get_mut(index / 8) {
        *byte |= 1 << (index % 8);
    }
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_shard_name() {
        assert_eq!(shard_name(0), "0");
        assert_eq!(shard_name(constants::METACHAIN_SHARD_ID), "META");
    }

    #[test]
    fn test_bitmap_helpers() {
        assert_eq!(bitmap_len(0), 0);
        assert_eq!(bitmap_len(3), 1);
        assert_eq!(bitmap_len(8), 1);
        assert_eq!(bitmap_len(9), 2);

        let mut bitmap = vec![0u8; 2];
        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 9);
        set_bit(&mut bitmap, 16);
        assert_eq!(bitmap, vec![0b0000_0001, 0b0000_0010]);
        assert!(is_bit_set(&bitmap, 9));
        assert!(!is_bit_set(&bitmap, 1));
        assert!(!is_bit_set(&bitmap, 16));
    }
}
