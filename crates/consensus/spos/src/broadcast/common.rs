//! Broadcast operations shared by shard and metachain messengers

use super::{AlarmScheduler, InterceptorsContainer, Messenger};
use crate::{
    block::{BlockHeader, HeaderProof},
    chain::{MiniBlocksData, TransactionsData},
    config::BroadcastConfig,
    constants::{
        CONSENSUS_TOPIC, EQUIVALENT_PROOFS_TOPIC, METACHAIN_BLOCKS_TOPIC, METACHAIN_SHARD_ID,
        MINI_BLOCKS_TOPIC, SHARD_BLOCKS_TOPIC,
    },
    errors::{SposError, SposResult},
    hashing::{pack_data_in_chunks, Hasher, Marshalizer},
    sharding::ShardCoordinator,
    signing::{KeysHandler, PeerSignatureHandler},
    spos::ConsensusMessage,
    storage::HeadersPool,
};
use core::fmt::Debug;
use std::{sync::Arc, time::Duration};
use tracing::{debug, Span};

/// Sink the delayed broadcaster hands due block data to
pub trait BroadcastHandlers: Send + Sync + Debug {
    /// Publish miniblocks, one publication per destination shard
    fn broadcast_mini_blocks(&self, mini_blocks: &MiniBlocksData, pub_key: &[u8]) -> SposResult<()>;

    /// Publish transactions in size-bounded packets
    fn broadcast_transactions(
        &self,
        transactions: &TransactionsData,
        pub_key: &[u8],
    ) -> SposResult<()>;

    /// Publish a block header
    fn broadcast_header(&self, header: &BlockHeader, pub_key: &[u8]) -> SposResult<()>;
}

/// Construction arguments for the shard and metachain messengers
#[derive(Debug, Default)]
pub struct CommonMessengerArgs {
    /// Publisher
    pub messenger: Option<Arc<dyn Messenger>>,
    /// Payload codec
    pub marshalizer: Option<Arc<dyn Marshalizer>>,
    /// Header hashing
    pub hasher: Option<Arc<dyn Hasher>>,
    /// Shard layout and topic naming
    pub shard_coordinator: Option<Arc<ShardCoordinator>>,
    /// Signs the peer id carried by consensus messages
    pub peer_signature_handler: Option<Arc<PeerSignatureHandler>>,
    /// Own and hosted keys
    pub keys_handler: Option<Arc<KeysHandler>>,
    /// Notifies the delayed broadcaster about received headers
    pub headers_subscriber: Option<Arc<dyn HeadersPool>>,
    /// Notifies the delayed broadcaster about intercepted headers and miniblocks
    pub interceptors_container: Option<Arc<InterceptorsContainer>>,
    /// Runs delayed broadcasts
    pub alarm_scheduler: Option<Arc<AlarmScheduler>>,
    /// Delays and cache sizes
    pub config: BroadcastConfig,
}

/// Direct publication of consensus messages and block data
#[derive(Debug)]
pub struct CommonMessenger {
    messenger: Arc<dyn Messenger>,
    marshalizer: Arc<dyn Marshalizer>,
    hasher: Arc<dyn Hasher>,
    shard_coordinator: Arc<ShardCoordinator>,
    peer_signature_handler: Arc<PeerSignatureHandler>,
    keys_handler: Arc<KeysHandler>,
    config: BroadcastConfig,
    span: Span,
}

impl CommonMessenger {
    /// Create a messenger from the shared arguments
    pub fn new(args: &CommonMessengerArgs) -> SposResult<Self> {
        Ok(Self {
            messenger: args.messenger.clone().ok_or(SposError::NilMessenger)?,
            marshalizer: args.marshalizer.clone().ok_or(SposError::NilMarshalizer)?,
            hasher: args.hasher.clone().ok_or(SposError::NilHasher)?,
            shard_coordinator: args.shard_coordinator.clone().ok_or(SposError::NilShardCoordinator)?,
            peer_signature_handler: args
                .peer_signature_handler
                .clone()
                .ok_or(SposError::NilPeerSignatureHandler)?,
            keys_handler: args.keys_handler.clone().ok_or(SposError::NilKeysHandler)?,
            config: args.config.clone(),
            span: Span::none(),
        })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Header hashing used by the messengers
    pub fn hasher(&self) -> &dyn Hasher {
        self.hasher.as_ref()
    }

    /// Shard layout used for topic naming
    pub fn shard_coordinator(&self) -> &ShardCoordinator {
        &self.shard_coordinator
    }

    /// Delays and cache sizes
    pub const fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Sign the sender's peer id into `message` and publish it on the consensus topic
    pub fn broadcast_consensus_message(&self, message: &ConsensusMessage) -> SposResult<()> {
        let pid = self.keys_handler.pid_for(&message.pub_key);
        let mut message = message.clone();
        message.signature = self.peer_signature_handler.get_peer_signature(&message.pub_key, &pid)?;
        message.originator_pid = pid;

        let topic = format!(
            "{CONSENSUS_TOPIC}{}",
            self.shard_coordinator.communication_identifier(self.shard_coordinator.self_id())
        );
        let payload = self.marshalizer.marshal_message(&message)?;
        self.publish(&topic, payload, &message.pub_key);
        Ok(())
    }

    /// Publish an equivalent proof for the node's shard
    pub fn broadcast_equivalent_proof(
        &self,
        proof: Option<&HeaderProof>,
        pub_key: &[u8],
    ) -> SposResult<()> {
        let proof = proof.ok_or(SposError::NilHeaderProof)?;
        let topic = format!(
            "{EQUIVALENT_PROOFS_TOPIC}{}",
            self.shard_coordinator.communication_identifier(self.shard_coordinator.self_id())
        );
        self.publish(&topic, self.marshalizer.marshal_proof(proof)?, pub_key);
        Ok(())
    }

    /// Publish miniblocks, wait `delay`, then publish transactions
    pub async fn broadcast_block_data(
        &self,
        mini_blocks: MiniBlocksData,
        transactions: TransactionsData,
        pub_key: &[u8],
        delay: Duration,
    ) {
        if let Err(err) = self.broadcast_mini_blocks(&mini_blocks, pub_key) {
            debug!(parent: &self.span, %err, "Miniblocks broadcast failed");
        }
        if transactions.is_empty() {
            return;
        }
        tokio::time::sleep(delay).await;
        if let Err(err) = self.broadcast_transactions(&transactions, pub_key) {
            debug!(parent: &self.span, %err, "Transactions broadcast failed");
        }
    }

    /// Move the data addressed to the metachain out of `mini_blocks` and `transactions`
    pub fn extract_meta_mini_blocks_and_transactions(
        &self,
        mini_blocks: &mut MiniBlocksData,
        transactions: &mut TransactionsData,
    ) -> (MiniBlocksData, TransactionsData) {
        let mut meta_mini_blocks = MiniBlocksData::new();
        if let Some(data) = mini_blocks.remove(&METACHAIN_SHARD_ID) {
            meta_mini_blocks.insert(METACHAIN_SHARD_ID, data);
        }

        let suffix = self.shard_coordinator.communication_identifier(METACHAIN_SHARD_ID);
        let meta_topics: Vec<String> =
            transactions.keys().filter(|topic| topic.ends_with(&suffix)).cloned().collect();
        let meta_transactions = meta_topics
            .into_iter()
            .filter_map(|topic| transactions.remove(&topic).map(|items| (topic, items)))
            .collect();

        (meta_mini_blocks, meta_transactions)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, pub_key: &[u8]) {
        if self.keys_handler.is_original_public_key(pub_key) {
            self.messenger.broadcast(topic, payload);
        } else {
            self.messenger.broadcast_using_private_key(
                topic,
                payload,
                &self.keys_handler.pid_for(pub_key),
            );
        }
    }
}

impl BroadcastHandlers for CommonMessenger {
    fn broadcast_mini_blocks(&self, mini_blocks: &MiniBlocksData, pub_key: &[u8]) -> SposResult<()> {
        for (shard, data) in mini_blocks {
            let topic = format!(
                "{MINI_BLOCKS_TOPIC}{}",
                self.shard_coordinator.communication_identifier(*shard)
            );
            self.publish(&topic, data.to_vec(), pub_key);
        }
        if !mini_blocks.is_empty() {
            debug!(parent: &self.span, shards = mini_blocks.len(), "Miniblocks broadcast");
        }
        Ok(())
    }

    fn broadcast_transactions(
        &self,
        transactions: &TransactionsData,
        pub_key: &[u8],
    ) -> SposResult<()> {
        let mut packets_count = 0usize;
        for (topic, items) in transactions {
            let packets = pack_data_in_chunks(
                self.marshalizer.as_ref(),
                items,
                self.config.max_bulk_transaction_size,
            )?;
            packets_count += packets.len();
            for packet in packets {
                self.publish(topic, packet, pub_key);
            }
        }
        if packets_count > 0 {
            debug!(parent: &self.span, packets = packets_count, "Transactions broadcast");
        }
        Ok(())
    }

    fn broadcast_header(&self, header: &BlockHeader, pub_key: &[u8]) -> SposResult<()> {
        let topic = if self.shard_coordinator.is_metachain() {
            METACHAIN_BLOCKS_TOPIC.to_string()
        } else {
            format!(
                "{SHARD_BLOCKS_TOPIC}{}",
                self.shard_coordinator.communication_identifier(METACHAIN_SHARD_ID)
            )
        };
        self.publish(&topic, self.marshalizer.marshal_header(header)?, pub_key);
        Ok(())
    }
}
