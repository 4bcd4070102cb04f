//! Broadcast messengers
//!
//! A consensus node publishes through a [`BroadcastMessenger`]. Shard nodes
//! delay cross-shard block data until the metachain notarizes the block;
//! metachain nodes publish their block data immediately. Consensus validators
//! on both sides schedule fallback rebroadcasts through the
//! [`DelayedBlockBroadcaster`].

mod alarm;
mod common;
mod delayed;
mod interceptors;
mod meta;
mod network;
mod shard;

pub use alarm::AlarmScheduler;
pub use common::{BroadcastHandlers, CommonMessenger, CommonMessengerArgs};
pub use delayed::{
    DelayedBlockBroadcaster, DelayedBroadcastData, DelayedBroadcasterArgs,
    ValidatorHeaderBroadcastData,
};
pub use interceptors::{InterceptedData, InterceptedDataHandler, InterceptorsContainer, RawHandler};
pub use meta::MetaChainMessenger;
pub use network::{LocalMessenger, LocalNetwork, Messenger};
pub use shard::ShardChainMessenger;

use crate::{
    block::{BlockHeader, HeaderProof},
    chain::{MiniBlocksData, TransactionsData},
    errors::SposResult,
    spos::ConsensusMessage,
};
use core::fmt::Debug;

/// Publication surface used by the consensus engine
pub trait BroadcastMessenger: Send + Sync + Debug {
    /// Publish a consensus message on the shard's consensus topic
    fn broadcast_consensus_message(&self, message: &ConsensusMessage) -> SposResult<()>;

    /// Publish or schedule the block data of a block this node led
    fn broadcast_block_data_leader(
        &self,
        header: &BlockHeader,
        mini_blocks: MiniBlocksData,
        transactions: TransactionsData,
        pub_key: &[u8],
    ) -> SposResult<()>;

    /// Publish a committed header
    fn broadcast_header(&self, header: &BlockHeader, pub_key: &[u8]) -> SposResult<()>;

    /// Schedule a fallback header rebroadcast for the validator at `order`
    fn prepare_broadcast_header_validator(
        &self,
        header: &BlockHeader,
        mini_blocks: &MiniBlocksData,
        transactions: &TransactionsData,
        order: usize,
        pub_key: &[u8],
    );

    /// Schedule a fallback block data rebroadcast for the validator at `order`
    fn prepare_broadcast_block_data_validator(
        &self,
        header: &BlockHeader,
        mini_blocks: MiniBlocksData,
        transactions: TransactionsData,
        order: usize,
        pub_key: &[u8],
    );

    /// Publish the proof of a committed header
    fn broadcast_equivalent_proof(&self, proof: Option<&HeaderProof>, pub_key: &[u8])
        -> SposResult<()>;

    /// Cancel scheduled broadcasts
    fn close(&self);
}
