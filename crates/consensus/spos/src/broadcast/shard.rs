//! Shard chain messenger

use super::{
    AlarmScheduler, BroadcastHandlers, BroadcastMessenger, CommonMessenger, CommonMessengerArgs,
    DelayedBlockBroadcaster, DelayedBroadcastData, DelayedBroadcasterArgs,
    ValidatorHeaderBroadcastData,
};
use crate::{
    block::{BlockHeader, HeaderProof},
    chain::{MiniBlocksData, TransactionsData},
    constants::LEADER_ALARM_PREFIX,
    errors::{SposError, SposResult},
    spos::ConsensusMessage,
};
use alloy_primitives::Bytes;
use std::sync::Arc;
use tracing::{debug, warn, Span};

/// Messenger of shard nodes
///
/// Block data addressed to the metachain goes out right away; the rest waits
/// for the metachain to notarize the block.
#[derive(Debug)]
pub struct ShardChainMessenger {
    common: Arc<CommonMessenger>,
    delayed: Arc<DelayedBlockBroadcaster>,
    alarm: Arc<AlarmScheduler>,
    span: Span,
}

impl ShardChainMessenger {
    /// Create the messenger and its delayed broadcaster
    pub fn new(args: CommonMessengerArgs) -> SposResult<Self> {
        Self::new_with_span(args, Span::none())
    }

    /// Same as [`Self::new`] logging under `span`
    pub fn new_with_span(args: CommonMessengerArgs, span: Span) -> SposResult<Self> {
        let common = Arc::new(CommonMessenger::new(&args)?.with_span(span.clone()));
        let alarm = args.alarm_scheduler.clone().ok_or(SposError::NilAlarmScheduler)?;
        let delayed = DelayedBlockBroadcaster::new_with_span(
            DelayedBroadcasterArgs {
                shard_coordinator: args.shard_coordinator,
                interceptors_container: args.interceptors_container,
                headers_subscriber: args.headers_subscriber,
                alarm_scheduler: Some(alarm.clone()),
                config: args.config,
            },
            span.clone(),
        )?;
        delayed.set_broadcast_handlers(common.clone());
        Ok(Self { common, delayed, alarm, span })
    }

    /// Delayed broadcaster backing this messenger
    pub const fn delayed_broadcaster(&self) -> &Arc<DelayedBlockBroadcaster> {
        &self.delayed
    }
}

impl BroadcastMessenger for ShardChainMessenger {
    fn broadcast_consensus_message(&self, message: &ConsensusMessage) -> SposResult<()> {
        self.common.broadcast_consensus_message(message)
    }

    fn broadcast_block_data_leader(
        &self,
        header: &BlockHeader,
        mut mini_blocks: MiniBlocksData,
        mut transactions: TransactionsData,
        pub_key: &[u8],
    ) -> SposResult<()> {
        let header_hash = header.hash(self.common.hasher());
        let (meta_mini_blocks, meta_transactions) = self
            .common
            .extract_meta_mini_blocks_and_transactions(&mut mini_blocks, &mut transactions);

        if !meta_mini_blocks.is_empty() || !meta_transactions.is_empty() {
            let common = Arc::clone(&self.common);
            let key = Bytes::copy_from_slice(pub_key);
            let between = self.common.config().extra_delay_between_mbs_and_txs();
            self.alarm.add(
                format!("{LEADER_ALARM_PREFIX}meta_{}", hex::encode(header_hash)),
                self.common.config().extra_delay_for_broadcast(),
                move |_| async move {
                    common.broadcast_block_data(meta_mini_blocks, meta_transactions, &key, between).await;
                },
            );
        }

        if mini_blocks.is_empty() && transactions.is_empty() {
            return Ok(());
        }
        debug!(
            parent: &self.span,
            header_hash = %header_hash,
            shards = mini_blocks.len(),
            "Leader block data delayed until notarized"
        );
        self.delayed.set_leader_data(DelayedBroadcastData::new(
            header.clone(),
            header_hash,
            mini_blocks,
            transactions,
            0,
            Bytes::copy_from_slice(pub_key),
        ))
    }

    fn broadcast_header(&self, header: &BlockHeader, pub_key: &[u8]) -> SposResult<()> {
        self.common.broadcast_header(header, pub_key)
    }

    fn prepare_broadcast_header_validator(
        &self,
        header: &BlockHeader,
        _mini_blocks: &MiniBlocksData,
        _transactions: &TransactionsData,
        order: usize,
        pub_key: &[u8],
    ) {
        let data = ValidatorHeaderBroadcastData {
            header_hash: header.hash(self.common.hasher()),
            header: header.clone(),
            order,
            pub_key: Bytes::copy_from_slice(pub_key),
        };
        if let Err(err) = self.delayed.set_header_for_validator(data) {
            warn!(parent: &self.span, %err, "Could not schedule validator header broadcast");
        }
    }

    fn prepare_broadcast_block_data_validator(
        &self,
        header: &BlockHeader,
        mini_blocks: MiniBlocksData,
        transactions: TransactionsData,
        order: usize,
        pub_key: &[u8],
    ) {
        if mini_blocks.is_empty() && transactions.is_empty() {
            return;
        }
        let data = DelayedBroadcastData::new(
            header.clone(),
            header.hash(self.common.hasher()),
            mini_blocks,
            transactions,
            order,
            Bytes::copy_from_slice(pub_key),
        );
        if let Err(err) = self.delayed.set_validator_data(data) {
            warn!(parent: &self.span, %err, "Could not schedule validator block data broadcast");
        }
    }

    fn broadcast_equivalent_proof(
        &self,
        proof: Option<&HeaderProof>,
        pub_key: &[u8],
    ) -> SposResult<()> {
        self.common.broadcast_equivalent_proof(proof, pub_key)
    }

    fn close(&self) {
        self.delayed.close();
    }
}
