//! Nodes coordinator
//!
//! Holds the per-epoch validator registry and computes consensus groups from
//! it. Consensus groups are a pure function of
//! `(randomness, round, shard, epoch)` over the registry, so every honest node
//! with the same registry computes the same leader and signers.

use crate::{
    constants::METACHAIN_SHARD_ID,
    errors::{SposError, SposResult},
    hashing::Hasher,
};
use alloy_primitives::Bytes;
use core::{fmt::Debug, num::NonZeroUsize};
use hashbrown::{HashMap, HashSet};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, trace, warn, Span};

use super::{ChainParametersHolder, ExpandedListSelector, Validator};

/// Validators per shard id
pub type ShardValidators = BTreeMap<u32, Vec<Arc<Validator>>>;

/// Public keys per shard id
pub type ShardPublicKeys = BTreeMap<u32, Vec<Bytes>>;

/// Validator registry of one epoch
#[derive(Debug, Clone, Default)]
pub struct EpochNodesConfig {
    /// Number of regular shards
    pub num_shards: u32,
    /// Validators that may be selected into consensus groups
    pub eligible: ShardValidators,
    /// Validators joining in a later epoch
    pub waiting: ShardValidators,
    /// Validators leaving the registry
    pub leaving: ShardValidators,
    /// Validators moved to another shard
    pub shuffled_out: ShardValidators,
}

impl EpochNodesConfig {
    fn public_keys(validators: &ShardValidators) -> ShardPublicKeys {
        validators
            .iter()
            .map(|(shard, list)| (*shard, list.iter().map(|v| v.pub_key().clone()).collect()))
            .collect()
    }

    fn shard_of(&self, pub_key: &[u8]) -> Option<u32> {
        [&self.eligible, &self.waiting].into_iter().find_map(|map| {
            map.iter()
                .find(|(_, list)| list.iter().any(|v| v.pub_key().as_ref() == pub_key))
                .map(|(shard, _)| *shard)
        })
    }
}

/// Ordered consensus group, leader first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusGroup {
    validators: Vec<Arc<Validator>>,
}

impl ConsensusGroup {
    /// Wrap an ordered list of validators
    pub const fn new(validators: Vec<Arc<Validator>>) -> Self {
        Self { validators }
    }

    /// Leader of the round, `None` for an empty group
    pub fn leader(&self) -> Option<&Arc<Validator>> {
        self.validators.first()
    }

    /// Members in selection order
    pub fn validators(&self) -> &[Arc<Validator>] {
        &self.validators
    }

    /// Public keys in selection order
    pub fn public_keys(&self) -> Vec<Bytes> {
        self.validators.iter().map(|v| v.pub_key().clone()).collect()
    }

    /// Position of `pub_key` in the group
    pub fn index_of(&self, pub_key: &[u8]) -> Option<usize> {
        self.validators.iter().position(|v| v.pub_key().as_ref() == pub_key)
    }

    /// Group size
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the group has no members
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Read access to the validator registry
pub trait NodesCoordinator: Send + Sync + Debug {
    /// Consensus group for a round; the leader is the first member
    fn compute_consensus_group(
        &self,
        randomness: &[u8],
        round: u64,
        shard_id: u32,
        epoch: u32,
    ) -> SposResult<ConsensusGroup>;

    /// Consensus group size effective for `shard_id` at `epoch`
    fn consensus_group_size_for_shard_and_epoch(&self, shard_id: u32, epoch: u32) -> usize;

    /// Keys allowed to send consensus messages to this node during `epoch`
    fn get_consensus_whitelisted_nodes(&self, epoch: u32) -> SposResult<HashSet<Bytes>>;

    /// Eligible keys of every shard at `epoch`
    fn get_all_eligible_validators_public_keys(&self, epoch: u32) -> SposResult<ShardPublicKeys>;

    /// Waiting keys of every shard at `epoch`
    fn get_all_waiting_validators_public_keys(&self, epoch: u32) -> SposResult<ShardPublicKeys>;

    /// Leaving keys of every shard at `epoch`
    fn get_all_leaving_validators_public_keys(&self, epoch: u32) -> SposResult<ShardPublicKeys>;

    /// Shuffled-out keys of every shard at `epoch`
    fn get_all_shuffled_out_validators_public_keys(
        &self,
        epoch: u32,
    ) -> SposResult<ShardPublicKeys>;

    /// Validator owning `pub_key` in the current epoch, with its shard
    fn get_validator_with_public_key(&self, pub_key: &[u8]) -> SposResult<(Arc<Validator>, u32)>;

    /// Eligible-list indexes of `pub_keys` in this node's shard at `epoch`
    fn get_validators_indexes(&self, pub_keys: &[Bytes], epoch: u32) -> SposResult<Vec<u64>>;

    /// Shard this node belongs to at `epoch`
    fn shard_id_for_epoch(&self, epoch: u32) -> SposResult<u32>;

    /// Last epoch with a registry
    fn current_epoch(&self) -> u32;

    /// Public key of this node
    fn own_public_key(&self) -> Bytes;

    /// Leader and member keys of a round's consensus group
    fn get_consensus_validators_public_keys(
        &self,
        randomness: &[u8],
        round: u64,
        shard_id: u32,
        epoch: u32,
    ) -> SposResult<(Bytes, Vec<Bytes>)> {
        let group = self.compute_consensus_group(randomness, round, shard_id, epoch)?;
        let leader = group.leader().map(|v| v.pub_key().clone()).unwrap_or_default();
        Ok((leader, group.public_keys()))
    }
}

/// Nodes coordinator as wired into the consensus core
///
/// `Disabled` is used while bootstrapping, before the registry is known. It
/// answers every query with an empty result instead of failing, which must not
/// be read as "no validators exist".
#[derive(Debug, Clone)]
pub enum NodesCoordinatorHandle {
    /// Backed by a real registry
    Active(Arc<dyn NodesCoordinator>),
    /// Bootstrap placeholder
    Disabled,
}

impl NodesCoordinatorHandle {
    /// Whether this is the bootstrap placeholder
    pub const fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    /// See [`NodesCoordinator::compute_consensus_group`]
    pub fn compute_consensus_group(
        &self,
        randomness: &[u8],
        round: u64,
        shard_id: u32,
        epoch: u32,
    ) -> SposResult<ConsensusGroup> {
        match self {
            Self::Active(inner) => inner.compute_consensus_group(randomness, round, shard_id, epoch),
            Self::Disabled => Ok(ConsensusGroup::default()),
        }
    }

    /// See [`NodesCoordinator::consensus_group_size_for_shard_and_epoch`]
    pub fn consensus_group_size_for_shard_and_epoch(&self, shard_id: u32, epoch: u32) -> usize {
        match self {
            Self::Active(inner) => inner.consensus_group_size_for_shard_and_epoch(shard_id, epoch),
            Self::Disabled => 0,
        }
    }

    /// See [`NodesCoordinator::get_consensus_whitelisted_nodes`]
    pub fn get_consensus_whitelisted_nodes(&self, epoch: u32) -> SposResult<HashSet<Bytes>> {
        match self {
            Self::Active(inner) => inner.get_consensus_whitelisted_nodes(epoch),
            Self::Disabled => Ok(HashSet::new()),
        }
    }

    /// See [`NodesCoordinator::get_consensus_validators_public_keys`]
    pub fn get_consensus_validators_public_keys(
        &self,
        randomness: &[u8],
        round: u64,
        shard_id: u32,
        epoch: u32,
    ) -> SposResult<(Bytes, Vec<Bytes>)> {
        match self {
            Self::Active(inner) => {
                inner.get_consensus_validators_public_keys(randomness, round, shard_id, epoch)
            }
            Self::Disabled => Ok((Bytes::new(), Vec::new())),
        }
    }

    /// See [`NodesCoordinator::get_all_eligible_validators_public_keys`]
    pub fn get_all_eligible_validators_public_keys(
        &self,
        epoch: u32,
    ) -> SposResult<ShardPublicKeys> {
        match self {
            Self::Active(inner) => inner.get_all_eligible_validators_public_keys(epoch),
            Self::Disabled => Ok(ShardPublicKeys::new()),
        }
    }

    /// See [`NodesCoordinator::get_all_waiting_validators_public_keys`]
    pub fn get_all_waiting_validators_public_keys(
        &self,
        epoch: u32,
    ) -> SposResult<ShardPublicKeys> {
        match self {
            Self::Active(inner) => inner.get_all_waiting_validators_public_keys(epoch),
            Self::Disabled => Ok(ShardPublicKeys::new()),
        }
    }

    /// See [`NodesCoordinator::get_validator_with_public_key`]
    ///
    /// The placeholder reports every key as unknown.
    pub fn get_validator_with_public_key(
        &self,
        pub_key: &[u8],
    ) -> SposResult<(Arc<Validator>, u32)> {
        match self {
            Self::Active(inner) => inner.get_validator_with_public_key(pub_key),
            Self::Disabled => Err(SposError::ValidatorNotFound),
        }
    }

    /// See [`NodesCoordinator::get_validators_indexes`]
    pub fn get_validators_indexes(&self, pub_keys: &[Bytes], epoch: u32) -> SposResult<Vec<u64>> {
        match self {
            Self::Active(inner) => inner.get_validators_indexes(pub_keys, epoch),
            Self::Disabled => Ok(Vec::new()),
        }
    }

    /// See [`NodesCoordinator::shard_id_for_epoch`]
    pub fn shard_id_for_epoch(&self, epoch: u32) -> SposResult<u32> {
        match self {
            Self::Active(inner) => inner.shard_id_for_epoch(epoch),
            Self::Disabled => Ok(0),
        }
    }

    /// See [`NodesCoordinator::current_epoch`]
    pub fn current_epoch(&self) -> u32 {
        match self {
            Self::Active(inner) => inner.current_epoch(),
            Self::Disabled => 0,
        }
    }

    /// See [`NodesCoordinator::own_public_key`]
    pub fn own_public_key(&self) -> Bytes {
        match self {
            Self::Active(inner) => inner.own_public_key(),
            Self::Disabled => Bytes::new(),
        }
    }
}

/// Construction arguments for [`IndexHashedNodesCoordinator`]
#[derive(Debug, Default)]
pub struct IndexHashedNodesCoordinatorArgs {
    /// Hasher used for selection randomness
    pub hasher: Option<Arc<dyn Hasher>>,
    /// Consensus group sizes per epoch
    pub chain_parameters: Option<ChainParametersHolder>,
    /// Public key of this node
    pub self_public_key: Bytes,
    /// Epoch of the initial registry
    pub start_epoch: u32,
    /// Shard reported for this node when it is not in the registry
    pub shard_id_as_observer: u32,
    /// Consensus group cache capacity
    pub consensus_group_cache_size: usize,
    /// Registry of `start_epoch`
    pub nodes_config: EpochNodesConfig,
}

#[derive(Debug)]
struct EpochState {
    config: EpochNodesConfig,
    shard_id: u32,
    selectors: BTreeMap<u32, ExpandedListSelector>,
}

#[derive(Debug)]
struct CoordinatorState {
    current_epoch: u32,
    chain_parameters: ChainParametersHolder,
    epochs: HashMap<u32, EpochState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsensusGroupKey {
    randomness: Bytes,
    round: u64,
    shard_id: u32,
    epoch: u32,
}

/// Nodes coordinator selecting groups by hashing round randomness into a
/// stake-weighted expanded eligible list
#[derive(Debug)]
pub struct IndexHashedNodesCoordinator {
    hasher: Arc<dyn Hasher>,
    self_public_key: Bytes,
    start_epoch: u32,
    shard_id_as_observer: u32,
    state: RwLock<CoordinatorState>,
    consensus_group_cache: Mutex<LruCache<ConsensusGroupKey, ConsensusGroup>>,
    span: Span,
}

impl IndexHashedNodesCoordinator {
    /// Create a coordinator holding the registry of `args.start_epoch`
    pub fn new(args: IndexHashedNodesCoordinatorArgs) -> SposResult<Self> {
        let hasher = args.hasher.ok_or(SposError::NilHasher)?;
        let chain_parameters = args.chain_parameters.ok_or(SposError::NilChainParametersHandler)?;
        if args.self_public_key.is_empty() {
            return Err(SposError::InvalidPublicKey);
        }
        let cache_size =
            NonZeroUsize::new(args.consensus_group_cache_size).ok_or(SposError::InvalidCacheSize)?;

        let coordinator = Self {
            hasher,
            self_public_key: args.self_public_key,
            start_epoch: args.start_epoch,
            shard_id_as_observer: args.shard_id_as_observer,
            state: RwLock::new(CoordinatorState {
                current_epoch: args.start_epoch,
                chain_parameters,
                epochs: HashMap::new(),
            }),
            consensus_group_cache: Mutex::new(LruCache::new(cache_size)),
            span: Span::none(),
        };
        coordinator.set_nodes_config_for_epoch(args.start_epoch, args.nodes_config)?;
        Ok(coordinator)
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Install the registry of `epoch`
    ///
    /// Every shard listed must be a known shard or the metachain and hold at
    /// least a consensus group worth of eligible validators.
    pub fn set_nodes_config_for_epoch(
        &self,
        epoch: u32,
        config: EpochNodesConfig,
    ) -> SposResult<()> {
        let mut state = self.state.write();
        let params = state.chain_parameters.chain_parameters_for_epoch(epoch);

        let mut selectors = BTreeMap::new();
        for (shard, list) in &config.eligible {
            if *shard >= config.num_shards && *shard != METACHAIN_SHARD_ID {
                return Err(SposError::InvalidShardId(*shard));
            }
            let group_size = params.consensus_group_size(*shard);
            if list.len() < group_size {
                return Err(SposError::InvalidSampleSize {
                    requested: group_size,
                    available: list.len(),
                });
            }
            selectors.insert(*shard, ExpandedListSelector::new(list, self.hasher.clone()));
        }

        let shard_id = config.shard_of(&self.self_public_key).unwrap_or(self.shard_id_as_observer);
        debug!(
            parent: &self.span,
            epoch,
            shard_id,
            shards = config.eligible.len(),
            "Set nodes config for epoch"
        );

        state.epochs.insert(epoch, EpochState { config, shard_id, selectors });
        if epoch > state.current_epoch {
            state.current_epoch = epoch;
            state.chain_parameters.set_current_epoch(epoch);
        }
        drop(state);

        self.consensus_group_cache.lock().clear();
        Ok(())
    }

    fn keys_for_epoch(
        &self,
        epoch: u32,
        pick: impl FnOnce(&EpochNodesConfig) -> &ShardValidators,
    ) -> SposResult<ShardPublicKeys> {
        let state = self.state.read();
        let epoch_state =
            state.epochs.get(&epoch).ok_or(SposError::EpochNodesConfigDoesNotExist(epoch))?;
        Ok(EpochNodesConfig::public_keys(pick(&epoch_state.config)))
    }
}

impl NodesCoordinator for IndexHashedNodesCoordinator {
    fn compute_consensus_group(
        &self,
        randomness: &[u8],
        round: u64,
        shard_id: u32,
        epoch: u32,
    ) -> SposResult<ConsensusGroup> {
        trace!(parent: &self.span, epoch, shard_id, round, "Computing consensus group");
        if randomness.is_empty() {
            return Err(SposError::NilRandomness);
        }

        let key = ConsensusGroupKey {
            randomness: Bytes::copy_from_slice(randomness),
            round,
            shard_id,
            epoch,
        };

        let state = self.state.read();
        let epoch_state =
            state.epochs.get(&epoch).ok_or(SposError::EpochNodesConfigDoesNotExist(epoch))?;
        if shard_id >= epoch_state.config.num_shards && shard_id != METACHAIN_SHARD_ID {
            warn!(
                parent: &self.span,
                shard_id,
                num_shards = epoch_state.config.num_shards,
                "Shard id is not valid"
            );
            return Err(SposError::InvalidShardId(shard_id));
        }

        if let Some(group) = self.consensus_group_cache.lock().get(&key) {
            return Ok(group.clone());
        }

        let eligible = epoch_state.config.eligible.get(&shard_id).cloned().unwrap_or_default();
        let group_size =
            state.chain_parameters.chain_parameters_for_epoch(epoch).consensus_group_size(shard_id);
        let selector = epoch_state.selectors.get(&shard_id).ok_or(SposError::InvalidSampleSize {
            requested: group_size,
            available: 0,
        })?;

        let mut seed = format!("{round}-").into_bytes();
        seed.extend_from_slice(randomness);
        let positions = selector.select(&seed, group_size)?;
        drop(state);

        let group = ConsensusGroup::new(positions.into_iter().map(|i| eligible[i].clone()).collect());
        self.consensus_group_cache.lock().put(key, group.clone());
        Ok(group)
    }

    fn consensus_group_size_for_shard_and_epoch(&self, shard_id: u32, epoch: u32) -> usize {
        self.state.read().chain_parameters.chain_parameters_for_epoch(epoch).consensus_group_size(shard_id)
    }

    fn get_consensus_whitelisted_nodes(&self, epoch: u32) -> SposResult<HashSet<Bytes>> {
        let mut whitelisted = HashSet::new();

        if epoch > self.start_epoch {
            match self.get_all_eligible_validators_public_keys(epoch - 1) {
                Ok(previous) => {
                    if let Ok(shard) = self.shard_id_for_epoch(epoch - 1) {
                        whitelisted.extend(previous.get(&shard).into_iter().flatten().cloned());
                    }
                }
                Err(err) => {
                    warn!(parent: &self.span, %err, epoch, "Get consensus whitelisted nodes");
                }
            }
        }

        let current = self.get_all_eligible_validators_public_keys(epoch)?;
        let shard = self.shard_id_for_epoch(epoch)?;
        whitelisted.extend(current.get(&shard).into_iter().flatten().cloned());
        Ok(whitelisted)
    }

    fn get_all_eligible_validators_public_keys(&self, epoch: u32) -> SposResult<ShardPublicKeys> {
        self.keys_for_epoch(epoch, |config| &config.eligible)
    }

    fn get_all_waiting_validators_public_keys(&self, epoch: u32) -> SposResult<ShardPublicKeys> {
        self.keys_for_epoch(epoch, |config| &config.waiting)
    }

    fn get_all_leaving_validators_public_keys(&self, epoch: u32) -> SposResult<ShardPublicKeys> {
        self.keys_for_epoch(epoch, |config| &config.leaving)
    }

    fn get_all_shuffled_out_validators_public_keys(
        &self,
        epoch: u32,
    ) -> SposResult<ShardPublicKeys> {
        self.keys_for_epoch(epoch, |config| &config.shuffled_out)
    }

    fn get_validator_with_public_key(&self, pub_key: &[u8]) -> SposResult<(Arc<Validator>, u32)> {
        if pub_key.is_empty() {
            return Err(SposError::InvalidPublicKey);
        }
        let state = self.state.read();
        let epoch_state = state
            .epochs
            .get(&state.current_epoch)
            .ok_or(SposError::EpochNodesConfigDoesNotExist(state.current_epoch))?;

        [&epoch_state.config.eligible, &epoch_state.config.waiting]
            .into_iter()
            .flat_map(|map| map.iter())
            .find_map(|(shard, list)| {
                list.iter().find(|v| v.pub_key().as_ref() == pub_key).map(|v| (v.clone(), *shard))
            })
            .ok_or(SposError::ValidatorNotFound)
    }

    fn get_validators_indexes(&self, pub_keys: &[Bytes], epoch: u32) -> SposResult<Vec<u64>> {
        let eligible = self.get_all_eligible_validators_public_keys(epoch)?;
        let shard = self.shard_id_for_epoch(epoch)?;
        let list = eligible.get(&shard).map(Vec::as_slice).unwrap_or_default();

        pub_keys
            .iter()
            .map(|pk| {
                list.iter()
                    .position(|candidate| candidate == pk)
                    .map(|index| index as u64)
                    .ok_or(SposError::ValidatorNotFound)
            })
            .collect()
    }

    fn shard_id_for_epoch(&self, epoch: u32) -> SposResult<u32> {
        self.state
            .read()
            .epochs
            .get(&epoch)
            .map(|epoch_state| epoch_state.shard_id)
            .ok_or(SposError::EpochNodesConfigDoesNotExist(epoch))
    }

    fn current_epoch(&self) -> u32 {
        self.state.read().current_epoch
    }

    fn own_public_key(&self) -> Bytes {
        self.self_public_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hashing::Keccak256Hasher, sharding::ChainParameters};
    use assert_matches::assert_matches;

    fn key(shard: u32, i: u8) -> Bytes {
        let mut pk = vec![i; 48];
        pk[0] = shard as u8;
        Bytes::from(pk)
    }

    fn shard_validators(shards: &[u32], per_shard: u8) -> ShardValidators {
        shards
            .iter()
            .map(|shard| {
                let list = (0..per_shard)
                    .map(|i| Arc::new(Validator::new(key(*shard, i + 1), 1, i as u32).unwrap()))
                    .collect();
                (*shard, list)
            })
            .collect()
    }

    fn coordinator(group_size: u32, self_key: Bytes) -> IndexHashedNodesCoordinator {
        let params = ChainParameters {
            shard_consensus_group_size: group_size,
            shard_min_num_nodes: group_size,
            meta_consensus_group_size: group_size,
            meta_min_num_nodes: group_size,
            ..Default::default()
        };
        IndexHashedNodesCoordinator::new(IndexHashedNodesCoordinatorArgs {
            hasher: Some(Arc::new(Keccak256Hasher)),
            chain_parameters: Some(ChainParametersHolder::single(params).unwrap()),
            self_public_key: self_key,
            start_epoch: 0,
            shard_id_as_observer: 0,
            consensus_group_cache_size: 16,
            nodes_config: EpochNodesConfig {
                num_shards: 2,
                eligible: shard_validators(&[0, 1, METACHAIN_SHARD_ID], 5),
                ..Default::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn test_new_requires_collaborators() {
        let missing_hasher = IndexHashedNodesCoordinator::new(IndexHashedNodesCoordinatorArgs {
            self_public_key: key(0, 1),
            consensus_group_cache_size: 1,
            ..Default::default()
        });
        assert_matches!(missing_hasher, Err(SposError::NilHasher));

        let missing_params = IndexHashedNodesCoordinator::new(IndexHashedNodesCoordinatorArgs {
            hasher: Some(Arc::new(Keccak256Hasher)),
            self_public_key: key(0, 1),
            consensus_group_cache_size: 1,
            ..Default::default()
        });
        assert_matches!(missing_params, Err(SposError::NilChainParametersHandler));
    }

    #[test]
    fn test_compute_consensus_group_errors() {
        let nc = coordinator(3, key(0, 1));
        assert_matches!(nc.compute_consensus_group(b"", 1, 0, 0), Err(SposError::NilRandomness));
        assert_matches!(
            nc.compute_consensus_group(b"r", 1, 0, 7),
            Err(SposError::EpochNodesConfigDoesNotExist(7))
        );
        assert_matches!(nc.compute_consensus_group(b"r", 1, 2, 0), Err(SposError::InvalidShardId(2)));
    }

    #[test]
    fn test_compute_consensus_group_is_deterministic() {
        let nc = coordinator(3, key(0, 1));
        let other = coordinator(3, key(1, 1));

        let group = nc.compute_consensus_group(b"seed", 10, 0, 0).unwrap();
        assert_eq!(group.len(), 3);
        assert_eq!(group, nc.compute_consensus_group(b"seed", 10, 0, 0).unwrap());
        assert_eq!(group, other.compute_consensus_group(b"seed", 10, 0, 0).unwrap());

        let meta = nc.compute_consensus_group(b"seed", 10, METACHAIN_SHARD_ID, 0).unwrap();
        assert!(meta.validators().iter().all(|v| v.pub_key()[0] == METACHAIN_SHARD_ID as u8));

        let (leader, keys) = nc.get_consensus_validators_public_keys(b"seed", 10, 0, 0).unwrap();
        assert_eq!(&leader, group.leader().unwrap().pub_key());
        assert_eq!(keys, group.public_keys());
    }

    #[test]
    fn test_rounds_change_groups() {
        let nc = coordinator(3, key(0, 1));
        let leaders: HashSet<Bytes> = (0..40)
            .map(|round| {
                nc.compute_consensus_group(b"seed", round, 0, 0).unwrap().leader().unwrap().pub_key().clone()
            })
            .collect();
        assert!(leaders.len() > 1);
    }

    #[test]
    fn test_whitelisted_nodes_union_previous_epoch() {
        let nc = coordinator(3, key(0, 1));
        let whitelisted = nc.get_consensus_whitelisted_nodes(0).unwrap();
        assert_eq!(whitelisted.len(), 5);

        let mut next = shard_validators(&[0, 1, METACHAIN_SHARD_ID], 5);
        next.insert(0, vec![
            Arc::new(Validator::new(key(0, 1), 1, 0).unwrap()),
            Arc::new(Validator::new(key(0, 20), 1, 1).unwrap()),
            Arc::new(Validator::new(key(0, 21), 1, 2).unwrap()),
        ]);
        nc.set_nodes_config_for_epoch(1, EpochNodesConfig {
            num_shards: 2,
            eligible: next,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(nc.current_epoch(), 1);
        let whitelisted = nc.get_consensus_whitelisted_nodes(1).unwrap();
        assert_eq!(whitelisted.len(), 7);
        assert!(whitelisted.contains(&key(0, 5)));
        assert!(whitelisted.contains(&key(0, 21)));
    }

    #[test]
    fn test_validator_queries() {
        let nc = coordinator(3, key(1, 2));
        assert_eq!(nc.shard_id_for_epoch(0).unwrap(), 1);

        let (validator, shard) = nc.get_validator_with_public_key(&key(1, 3)).unwrap();
        assert_eq!(shard, 1);
        assert_eq!(validator.index(), 2);
        assert_matches!(nc.get_validator_with_public_key(&[9; 48]), Err(SposError::ValidatorNotFound));

        let indexes = nc.get_validators_indexes(&[key(1, 5), key(1, 1)], 0).unwrap();
        assert_eq!(indexes, vec![4, 0]);
        assert_matches!(
            nc.get_validators_indexes(&[key(0, 1)], 0),
            Err(SposError::ValidatorNotFound)
        );

        assert!(nc.get_all_waiting_validators_public_keys(0).unwrap().is_empty());
        assert_eq!(nc.get_all_eligible_validators_public_keys(0).unwrap().len(), 3);
    }

    #[test]
    fn test_too_small_eligible_list_rejected() {
        let nc = coordinator(3, key(0, 1));
        let result = nc.set_nodes_config_for_epoch(1, EpochNodesConfig {
            num_shards: 1,
            eligible: shard_validators(&[0], 2),
            ..Default::default()
        });
        assert_matches!(result, Err(SposError::InvalidSampleSize { requested: 3, available: 2 }));
    }

    #[test]
    fn test_disabled_handle_returns_empty_results() {
        let handle = NodesCoordinatorHandle::Disabled;
        assert!(handle.is_disabled());
        assert!(handle.compute_consensus_group(b"seed", 1, 0, 0).unwrap().is_empty());
        assert_eq!(handle.consensus_group_size_for_shard_and_epoch(0, 0), 0);
        assert!(handle.get_consensus_whitelisted_nodes(0).unwrap().is_empty());
        assert!(handle.own_public_key().is_empty());

        let active = NodesCoordinatorHandle::Active(Arc::new(coordinator(3, key(0, 1))));
        assert!(!active.is_disabled());
        assert_eq!(active.compute_consensus_group(b"seed", 1, 0, 0).unwrap().len(), 3);
    }
}
