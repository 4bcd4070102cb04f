//! Consensus service selection and node wiring
//!
//! [`build_consensus_node`] assembles every component a validator needs on a
//! [`LocalNetwork`]: round clock, chain, header checks, signing, the worker
//! fed by the consensus topic, a shard or metachain broadcast messenger and
//! the [`SposConsensus`] engine.

use crate::{
    block::BlockHeader,
    broadcast::{
        AlarmScheduler, BroadcastMessenger, CommonMessengerArgs, InterceptorsContainer,
        LocalMessenger, LocalNetwork, MetaChainMessenger, ShardChainMessenger,
    },
    chain::{Blockchain, InMemoryBlockProcessor},
    config::{ConsensusType, SposConfig},
    constants::{CONSENSUS_TOPIC, PEER_SIGNATURE_CACHE_SIZE},
    errors::{SposError, SposResult},
    fallback::{FallbackHeaderValidator, FallbackHeaderValidatorArgs},
    hashing::{hasher_for, JsonMarshalizer, Marshalizer},
    header_check::{HeaderValidator, HeaderValidatorArgs},
    round::{Round, SyncTimer},
    sharding::{NodesCoordinatorHandle, ShardCoordinator},
    signing::{KeysHandler, PeerSignatureHandler, SigningHandler},
    spos::{
        BlsConsensusService, ConsensusCore, ConsensusMessageValidator,
        ConsensusMessageValidatorArgs, ConsensusState, RoundOutcome, SposConsensus,
        SposConsensusArgs, Worker, WorkerArgs,
    },
    storage::{InMemoryHeadersPool, InMemoryStorage},
};
use alloy_primitives::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{debug, Span};

/// Consensus service for `consensus_type`
pub const fn get_consensus_core_factory(consensus_type: ConsensusType) -> ConsensusCore {
    match consensus_type {
        ConsensusType::Bls => ConsensusCore::Bls(BlsConsensusService),
    }
}

/// Consensus service named `name`, as written in configuration files
pub fn get_consensus_core_factory_by_name(name: &str) -> SposResult<ConsensusCore> {
    name.parse().map(get_consensus_core_factory)
}

/// Broadcast messenger matching the node's shard
///
/// Metachain nodes get a [`MetaChainMessenger`], shard nodes a
/// [`ShardChainMessenger`].
pub fn get_broadcast_messenger(
    args: CommonMessengerArgs,
    span: Span,
) -> SposResult<Arc<dyn BroadcastMessenger>> {
    let shard_coordinator = args.shard_coordinator.clone().ok_or(SposError::NilShardCoordinator)?;
    if shard_coordinator.is_metachain() {
        return Ok(Arc::new(MetaChainMessenger::new_with_span(args, span)?));
    }
    Ok(Arc::new(ShardChainMessenger::new_with_span(args, span)?))
}

/// Inputs of [`build_consensus_node`]
#[derive(Debug)]
pub struct ConsensusNodeArgs {
    /// Consensus settings
    pub config: SposConfig,
    /// Start time of round zero
    pub genesis_time: DateTime<Utc>,
    /// First header of the chain
    pub genesis_header: BlockHeader,
    /// Own and hosted validator keys
    pub keys_handler: Option<Arc<KeysHandler>>,
    /// Validator registry
    pub nodes_coordinator: Option<NodesCoordinatorHandle>,
    /// Shard layout
    pub shard_coordinator: Option<Arc<ShardCoordinator>>,
    /// Network to join
    pub network: Option<Arc<LocalNetwork>>,
    /// Time source of the round clock
    pub sync_timer: Option<Arc<dyn SyncTimer>>,
}

/// A validator wired to a [`LocalNetwork`]
#[derive(Debug)]
pub struct ConsensusNode {
    engine: Arc<SposConsensus>,
    worker: Arc<Worker>,
    block_processor: Arc<InMemoryBlockProcessor>,
    headers_pool: Arc<InMemoryHeadersPool>,
    storage: Arc<InMemoryStorage>,
    broadcast_messenger: Arc<dyn BroadcastMessenger>,
    messenger: Arc<LocalMessenger>,
    keys_handler: Arc<KeysHandler>,
}

impl ConsensusNode {
    /// Round engine
    pub const fn engine(&self) -> &Arc<SposConsensus> {
        &self.engine
    }

    /// Entry point of the consensus topic
    pub const fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Block processor, used to queue miniblocks for proposals
    pub const fn block_processor(&self) -> &Arc<InMemoryBlockProcessor> {
        &self.block_processor
    }

    /// Headers received from the network
    pub const fn headers_pool(&self) -> &Arc<InMemoryHeadersPool> {
        &self.headers_pool
    }

    /// Committed headers, proofs and miniblocks
    pub const fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// Publication surface of the engine
    pub const fn broadcast_messenger(&self) -> &Arc<dyn BroadcastMessenger> {
        &self.broadcast_messenger
    }

    /// Network messenger of this node
    pub const fn messenger(&self) -> &Arc<LocalMessenger> {
        &self.messenger
    }

    /// Peer id on the network
    pub fn pid(&self) -> &Bytes {
        self.keys_handler.own_pid()
    }

    /// Validator key of the node itself
    pub fn public_key(&self) -> &Bytes {
        self.keys_handler.own_public_key()
    }

    /// Run the round the clock is currently in
    pub async fn run_round(&self) -> RoundOutcome {
        self.engine.run_round().await
    }

    /// Cancel scheduled broadcasts
    pub fn close(&self) {
        self.broadcast_messenger.close();
    }
}

/// Wire a validator and join it to the network
///
/// Must run inside a tokio runtime, which drives the alarm scheduler.
pub fn build_consensus_node(args: ConsensusNodeArgs) -> SposResult<ConsensusNode> {
    build_consensus_node_with_span(args, Span::none())
}

/// Same as [`build_consensus_node`] logging under `span`
pub fn build_consensus_node_with_span(
    args: ConsensusNodeArgs,
    span: Span,
) -> SposResult<ConsensusNode> {
    let config = args.config;
    config.validate()?;
    let keys_handler = args.keys_handler.ok_or(SposError::NilKeysHandler)?;
    let nodes_coordinator = args.nodes_coordinator.ok_or(SposError::NilNodesCoordinator)?;
    let shard_coordinator = args.shard_coordinator.ok_or(SposError::NilShardCoordinator)?;
    let network = args.network.ok_or(SposError::NilMessenger)?;
    let sync_timer = args.sync_timer.ok_or(SposError::NilSyncTimer)?;

    let hasher = hasher_for(config.hasher);
    let marshalizer: Arc<dyn Marshalizer> = Arc::new(JsonMarshalizer);

    let duration = TimeDelta::from_std(config.round_duration())
        .map_err(|_| SposError::InvalidRoundDuration)?;
    let round = Arc::new(Round::new(
        args.genesis_time,
        sync_timer.current_time(),
        duration,
        Some(sync_timer),
        config.start_round,
    )?);

    let storage = Arc::new(InMemoryStorage::new());
    let headers_pool = Arc::new(InMemoryHeadersPool::new());
    let blockchain = Arc::new(Blockchain::new(args.genesis_header, hasher.as_ref()));
    let block_processor = Arc::new(
        InMemoryBlockProcessor::new(
            blockchain.clone(),
            storage.clone(),
            hasher.clone(),
            marshalizer.clone(),
            shard_coordinator.clone(),
        )
        .with_span(span.clone()),
    );

    let fallback_validator = FallbackHeaderValidator::new(FallbackHeaderValidatorArgs {
        headers_pool: Some(headers_pool.clone()),
        marshalizer: Some(marshalizer.clone()),
        storage: Some(storage.clone()),
        max_rounds_without_committed_start_in_epoch_block: config
            .max_rounds_without_committed_start_in_epoch_block,
    })?
    .with_span(span.clone());
    let header_validator = Arc::new(
        HeaderValidator::new(HeaderValidatorArgs {
            hasher: Some(hasher.clone()),
            nodes_coordinator: Some(nodes_coordinator.clone()),
            fallback_validator: Some(Arc::new(fallback_validator)),
            threshold: config.threshold,
            fallback_threshold: config.fallback_threshold,
        })?
        .with_span(span.clone()),
    );

    let eligible = nodes_coordinator.get_consensus_whitelisted_nodes(nodes_coordinator.current_epoch())?;
    let consensus_state =
        ConsensusState::new(eligible, keys_handler.own_public_key().clone()).shared();

    let peer_signature_handler =
        Arc::new(PeerSignatureHandler::new(Some(keys_handler.clone()), PEER_SIGNATURE_CACHE_SIZE)?);
    let signing_handler = Arc::new(SigningHandler::new(Some(keys_handler.clone()), Vec::new())?);

    let consensus_core = get_consensus_core_factory(config.consensus_type);
    let chain_id = Bytes::copy_from_slice(config.chain_id.as_bytes());
    let message_validator = Arc::new(
        ConsensusMessageValidator::new(ConsensusMessageValidatorArgs {
            consensus_core,
            peer_signature_handler: Some(peer_signature_handler.clone()),
            consensus_state: Some(consensus_state.clone()),
            hasher: Some(hasher.clone()),
            chain_id,
        })?
        .with_span(span.clone()),
    );

    let (sender, inbox) = tokio::sync::mpsc::unbounded_channel();
    let worker = Arc::new(
        Worker::new(WorkerArgs {
            marshalizer: Some(marshalizer.clone()),
            hasher: Some(hasher.clone()),
            message_validator: Some(message_validator.clone()),
            consensus_state: Some(consensus_state.clone()),
            sender: Some(sender),
        })?
        .with_span(span.clone()),
    );

    let interceptors = Arc::new(
        InterceptorsContainer::new(Some(marshalizer.clone()), Some(hasher.clone()))?
            .with_headers_pool(headers_pool.clone())
            .with_span(span.clone()),
    );
    let consensus_topic = format!(
        "{CONSENSUS_TOPIC}{}",
        shard_coordinator.communication_identifier(shard_coordinator.self_id())
    );
    let topic_worker = Arc::clone(&worker);
    interceptors.register_raw_handler(
        &consensus_topic,
        Arc::new(move |payload: &[u8], from: &[u8]| {
            topic_worker.process_received_message(payload, from)
        }),
    );
    let messenger = network.join(keys_handler.own_pid().clone(), interceptors.clone());

    let alarm_scheduler = Arc::new(AlarmScheduler::new()?.with_span(span.clone()));
    let broadcast_messenger = get_broadcast_messenger(
        CommonMessengerArgs {
            messenger: Some(messenger.clone()),
            marshalizer: Some(marshalizer.clone()),
            hasher: Some(hasher.clone()),
            shard_coordinator: Some(shard_coordinator.clone()),
            peer_signature_handler: Some(peer_signature_handler),
            keys_handler: Some(keys_handler.clone()),
            headers_subscriber: Some(headers_pool.clone()),
            interceptors_container: Some(interceptors),
            alarm_scheduler: Some(alarm_scheduler),
            config: config.broadcast.clone(),
        },
        span.clone(),
    )?;

    debug!(
        parent: &span,
        pid = %hex::encode(keys_handler.own_pid()),
        shard = shard_coordinator.self_id(),
        topic = %consensus_topic,
        "Consensus node wired"
    );

    let engine = SposConsensus::new(SposConsensusArgs {
        config,
        genesis_time: args.genesis_time,
        round: Some(round),
        blockchain: Some(blockchain),
        block_processor: Some(block_processor.clone()),
        header_validator: Some(header_validator),
        signing_handler: Some(signing_handler),
        keys_handler: Some(keys_handler.clone()),
        broadcast_messenger: Some(broadcast_messenger.clone()),
        marshalizer: Some(marshalizer),
        hasher: Some(hasher),
        shard_coordinator: Some(shard_coordinator),
        consensus_state: Some(consensus_state),
        message_validator: Some(message_validator),
        consensus_core,
        inbox: Some(inbox),
    })?
    .with_span(span);

    Ok(ConsensusNode {
        engine: Arc::new(engine),
        worker,
        block_processor,
        headers_pool,
        storage,
        broadcast_messenger,
        messenger,
        keys_handler,
    })
}
