//! Test helper utilities for SPoS consensus testing
//!
//! Provides deterministic BLS keys, validator registries, header validators,
//! signed proofs and a network of wired consensus nodes.

use crate::{
    block::{BlockHeader, HeaderProof},
    broadcast::LocalNetwork,
    config::{BroadcastConfig, QuorumThreshold, SposConfig},
    factory::{build_consensus_node, ConsensusNode, ConsensusNodeArgs},
    fallback::{FallbackHeaderValidator, FallbackHeaderValidatorArgs},
    hashing::{JsonMarshalizer, Keccak256Hasher},
    header_check::{compute_consensus_group, HeaderValidator, HeaderValidatorArgs},
    round::{SyncTimer, TokioSyncTimer},
    sharding::{
        ChainParameters, ChainParametersHolder, ConsensusGroup, EpochNodesConfig,
        IndexHashedNodesCoordinator, IndexHashedNodesCoordinatorArgs, NodesCoordinator,
        NodesCoordinatorHandle, ShardCoordinator, Validator,
    },
    signing::{aggregate_signatures, BlsKeyPair, KeysHandler},
    spos::RoundOutcome,
    storage::{InMemoryHeadersPool, InMemoryStorage},
};
use alloy_primitives::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::BTreeMap, sync::Arc};

/// Deterministic BLS key pairs, seeded `1..=count`
pub fn mock_keys(count: usize) -> Vec<BlsKeyPair> {
    (1..=count).map(|i| mock_key(i as u8)).collect()
}

/// Deterministic BLS key pair
pub fn mock_key(seed: u8) -> BlsKeyPair {
    BlsKeyPair::from_seed(&[seed; 32]).expect("32 bytes of keying material")
}

/// Validators with one chance each, in key order
pub fn mock_validators(keys: &[BlsKeyPair]) -> Vec<Arc<Validator>> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            Arc::new(Validator::new(key.public_key().clone(), 1, i as u32).expect("non-empty key"))
        })
        .collect()
}

/// Chain parameters with the same group size for shards and metachain
pub fn mock_chain_parameters(group_size: u32) -> ChainParametersHolder {
    ChainParametersHolder::single(ChainParameters {
        shard_consensus_group_size: group_size,
        shard_min_num_nodes: group_size,
        meta_consensus_group_size: group_size,
        meta_min_num_nodes: group_size,
        ..Default::default()
    })
    .expect("valid chain parameters")
}

/// Registry with every key eligible in `shard_id` for epochs `0..=last_epoch`
///
/// The coordinator belongs to the first key.
pub fn mock_nodes_coordinator(
    keys: &[BlsKeyPair],
    shard_id: u32,
    group_size: u32,
    last_epoch: u32,
) -> Arc<IndexHashedNodesCoordinator> {
    mock_nodes_coordinator_for(keys, keys[0].public_key().clone(), shard_id, group_size, last_epoch)
}

/// Same as [`mock_nodes_coordinator`] owned by `self_public_key`
pub fn mock_nodes_coordinator_for(
    keys: &[BlsKeyPair],
    self_public_key: Bytes,
    shard_id: u32,
    group_size: u32,
    last_epoch: u32,
) -> Arc<IndexHashedNodesCoordinator> {
    let config = mock_epoch_config(keys, shard_id);
    let coordinator = IndexHashedNodesCoordinator::new(IndexHashedNodesCoordinatorArgs {
        hasher: Some(Arc::new(Keccak256Hasher)),
        chain_parameters: Some(mock_chain_parameters(group_size)),
        self_public_key,
        start_epoch: 0,
        shard_id_as_observer: shard_id,
        consensus_group_cache_size: 64,
        nodes_config: config.clone(),
    })
    .expect("valid registry");

    for epoch in 1..=last_epoch {
        coordinator.set_nodes_config_for_epoch(epoch, config.clone()).expect("valid registry");
    }
    Arc::new(coordinator)
}

/// Registry of one shard holding every key
pub fn mock_epoch_config(keys: &[BlsKeyPair], shard_id: u32) -> EpochNodesConfig {
    EpochNodesConfig {
        num_shards: 1,
        eligible: BTreeMap::from([(shard_id, mock_validators(keys))]),
        ..Default::default()
    }
}

/// Fallback validator over an empty pool and storage
pub fn mock_fallback_validator(
    max_rounds: u64,
) -> (Arc<FallbackHeaderValidator>, Arc<InMemoryHeadersPool>) {
    let pool = Arc::new(InMemoryHeadersPool::new());
    let validator = FallbackHeaderValidator::new(FallbackHeaderValidatorArgs {
        headers_pool: Some(pool.clone()),
        marshalizer: Some(Arc::new(JsonMarshalizer)),
        storage: Some(Arc::new(InMemoryStorage::new())),
        max_rounds_without_committed_start_in_epoch_block: max_rounds,
    })
    .expect("all collaborators set");
    (Arc::new(validator), pool)
}

/// Header validator over [`mock_nodes_coordinator`] with a majority fallback quorum
pub fn mock_header_validator(
    keys: &[BlsKeyPair],
    shard_id: u32,
    group_size: u32,
    threshold: QuorumThreshold,
) -> HeaderValidator {
    let (fallback, _) = mock_fallback_validator(10);
    HeaderValidator::new(HeaderValidatorArgs {
        hasher: Some(Arc::new(Keccak256Hasher)),
        nodes_coordinator: Some(NodesCoordinatorHandle::Active(mock_nodes_coordinator(
            keys, shard_id, group_size, 1,
        ))),
        fallback_validator: Some(fallback),
        threshold,
        fallback_threshold: QuorumThreshold::Majority,
    })
    .expect("all collaborators set")
}

/// Proof for `header` signed by the first `signers` members of its group
pub fn mock_signed_proof(
    keys: &[BlsKeyPair],
    nodes_coordinator: &NodesCoordinatorHandle,
    header: &BlockHeader,
    signers: usize,
) -> HeaderProof {
    let hash = header.hash(&Keccak256Hasher);
    let group =
        compute_consensus_group(Some(header), Some(nodes_coordinator)).expect("group for header");

    let mut bitmap = vec![0u8; crate::bitmap_len(group.len())];
    let mut shares = Vec::new();
    for (index, member) in group.validators().iter().enumerate().take(signers) {
        let key = keys
            .iter()
            .find(|k| k.public_key() == member.pub_key())
            .expect("member key is known");
        shares.push(key.sign(hash.as_slice()));
        crate::set_bit(&mut bitmap, index);
    }

    HeaderProof {
        aggregated_signature: aggregate_signatures(&shares).expect("valid shares"),
        pub_keys_bitmap: Bytes::from(bitmap),
        header_hash: Bytes::copy_from_slice(hash.as_slice()),
        header_shard_id: header.shard_id,
        header_epoch: header.epoch,
        header_nonce: header.nonce,
        header_round: header.round,
        is_start_of_epoch: header.start_of_epoch,
    }
}

/// Wall time test clocks start at
pub fn mock_base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

/// Genesis header with a fixed randomness seed
pub fn mock_genesis_header(shard_id: u32, chain_id: &str) -> BlockHeader {
    BlockHeader {
        shard_id,
        rand_seed: Bytes::from_static(b"genesis seed"),
        chain_id: Bytes::copy_from_slice(chain_id.as_bytes()),
        ..Default::default()
    }
}

/// Config for fast rounds where every group member must sign
pub fn mock_spos_config(round_ms: u64) -> SposConfig {
    SposConfig::default()
        .with_chain_id("T")
        .with_round_duration_ms(round_ms)
        .with_threshold(QuorumThreshold::All)
        .with_broadcast(BroadcastConfig {
            validator_delay_per_order_ms: round_ms,
            extra_delay_for_broadcast_ms: round_ms / 2,
            extra_delay_between_mbs_and_txs_ms: round_ms / 10,
            ..Default::default()
        })
}

/// Validators of one shard joined to a [`LocalNetwork`]
///
/// The shared clock starts at round 1. Build it inside a tokio runtime,
/// preferably a paused one.
#[derive(Debug)]
pub struct MockConsensusNetwork {
    /// Network the nodes publish on
    pub network: Arc<LocalNetwork>,
    /// Nodes, in key order
    pub nodes: Vec<Arc<ConsensusNode>>,
    /// Validator keys, in node order
    pub keys: Vec<BlsKeyPair>,
    /// Registry shared by the test to look up consensus groups
    pub coordinator: Arc<IndexHashedNodesCoordinator>,
    /// Start of round zero
    pub genesis_time: DateTime<Utc>,
    /// Round duration
    pub round_duration: TimeDelta,
    timer: Arc<TokioSyncTimer>,
}

impl MockConsensusNetwork {
    /// `count` validators in `shard_id`, registry known up to `last_epoch`
    pub fn new(
        count: usize,
        group_size: u32,
        shard_id: u32,
        config: SposConfig,
        last_epoch: u32,
    ) -> Self {
        let keys = mock_keys(count);
        let round_duration =
            TimeDelta::milliseconds(i64::try_from(config.round_duration_ms).expect("small duration"));
        let genesis_time = mock_base_time() - round_duration;
        let timer = Arc::new(TokioSyncTimer::new(mock_base_time()));
        let network = LocalNetwork::new();
        let shard_coordinator = Arc::new(ShardCoordinator::new(1, shard_id).expect("valid shard"));

        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let pid = Bytes::from(format!("peer-{i}").into_bytes());
                let coordinator = mock_nodes_coordinator_for(
                    &keys,
                    key.public_key().clone(),
                    shard_id,
                    group_size,
                    last_epoch,
                );
                let node = build_consensus_node(ConsensusNodeArgs {
                    config: config.clone(),
                    genesis_time,
                    genesis_header: mock_genesis_header(shard_id, &config.chain_id),
                    keys_handler: Some(Arc::new(KeysHandler::new(mock_key(i as u8 + 1), pid))),
                    nodes_coordinator: Some(NodesCoordinatorHandle::Active(coordinator)),
                    shard_coordinator: Some(shard_coordinator.clone()),
                    network: Some(network.clone()),
                    sync_timer: Some(timer.clone()),
                })
                .expect("node wiring");
                Arc::new(node)
            })
            .collect();

        let coordinator = mock_nodes_coordinator(&keys, shard_id, group_size, last_epoch);
        Self { network, nodes, keys, coordinator, genesis_time, round_duration, timer }
    }

    /// Run the current round on every node at once, outcomes in node order
    pub async fn run_round(&self) -> Vec<RoundOutcome> {
        let handles: Vec<_> = self
            .nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                tokio::spawn(async move { node.run_round().await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await.expect("round task"));
        }
        outcomes
    }

    /// Sleep until `round` starts
    pub async fn wait_for_round(&self, round: i32) {
        let start = self.genesis_time + self.round_duration * round;
        if let Ok(remaining) = (start - self.timer.current_time()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }

    /// Consensus group of `round` on top of the current chain tip
    pub fn group_for_round(&self, round: u64) -> ConsensusGroup {
        let (tip, _) = self.nodes[0].engine().blockchain().last_header();
        self.coordinator
            .compute_consensus_group(&tip.rand_seed, round, tip.shard_id, tip.epoch)
            .expect("group for round")
    }

    /// Position of the node holding `pub_key`
    pub fn index_of(&self, pub_key: &[u8]) -> usize {
        self.keys.iter().position(|k| k.public_key().as_ref() == pub_key).expect("known key")
    }

    /// Take the node holding `pub_key` off or back on the network
    pub fn set_online(&self, pub_key: &[u8], online: bool) {
        let node = &self.nodes[self.index_of(pub_key)];
        self.network.set_online(node.pid(), online);
    }

    /// Cancel scheduled broadcasts on every node
    pub fn close(&self) {
        for node in &self.nodes {
            node.close();
        }
    }
}
