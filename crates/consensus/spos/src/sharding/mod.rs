//! Sharding: shard coordinator, validator registry and consensus group selection

mod chain_parameters;
mod nodes_coordinator;
mod selector;
mod shard_coordinator;
mod validator;

pub use chain_parameters::{ChainParameters, ChainParametersHolder};
pub use nodes_coordinator::{
    ConsensusGroup, EpochNodesConfig, IndexHashedNodesCoordinator,
    IndexHashedNodesCoordinatorArgs, NodesCoordinator, NodesCoordinatorHandle, ShardPublicKeys,
    ShardValidators,
};
pub use selector::ExpandedListSelector;
pub use shard_coordinator::ShardCoordinator;
pub use validator::Validator;
