//! Metachain messenger

use super::{
    AlarmScheduler, BroadcastHandlers, BroadcastMessenger, CommonMessenger, CommonMessengerArgs,
    DelayedBlockBroadcaster, DelayedBroadcasterArgs, ValidatorHeaderBroadcastData,
};
use crate::{
    block::{BlockHeader, HeaderProof},
    chain::{MiniBlocksData, TransactionsData},
    constants::LEADER_ALARM_PREFIX,
    errors::{SposError, SposResult},
    spos::ConsensusMessage,
};
use alloy_primitives::Bytes;
use std::{sync::Arc, time::Duration};
use tracing::{trace, warn, Span};

/// Messenger of metachain nodes
///
/// Metachain block data is never held back. Validators only schedule the
/// fallback header rebroadcast.
#[derive(Debug)]
pub struct MetaChainMessenger {
    common: Arc<CommonMessenger>,
    delayed: Arc<DelayedBlockBroadcaster>,
    alarm: Arc<AlarmScheduler>,
    span: Span,
}

impl MetaChainMessenger {
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
}

impl BroadcastMessenger for MetaChainMessenger {
    fn broadcast_consensus_message(&self, message: &ConsensusMessage) -> SposResult<()> {
        self.common.broadcast_consensus_message(message)
    }

    fn broadcast_block_data_leader(
        &self,
        header: &BlockHeader,
        mini_blocks: MiniBlocksData,
        transactions: TransactionsData,
        pub_key: &[u8],
    ) -> SposResult<()> {
        if mini_blocks.is_empty() && transactions.is_empty() {
            return Ok(());
        }
        let common = Arc::clone(&self.common);
        let key = Bytes::copy_from_slice(pub_key);
        let between = self.common.config().extra_delay_between_mbs_and_txs();
        self.alarm.add(
            format!("{LEADER_ALARM_PREFIX}{}", hex::encode(header.hash(self.common.hasher()))),
            Duration::ZERO,
            move |_| async move {
                common.broadcast_block_data(mini_blocks, transactions, &key, between).await;
            },
        );
        Ok(())
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
        _mini_blocks: MiniBlocksData,
        _transactions: TransactionsData,
        order: usize,
        _pub_key: &[u8],
    ) {
        trace!(parent: &self.span, nonce = header.nonce, order, "Metachain block data is not rebroadcast");
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
