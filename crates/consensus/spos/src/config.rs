//! SPoS Configuration Types

use crate::errors::{SposError, SposResult};
use core::{fmt, str::FromStr, time::Duration};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported consensus services
///
/// Unknown names are rejected while the configuration is deserialized, so a
/// running engine never sees an unsupported type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusType {
    /// BLS multi-signature SPoS
    #[default]
    Bls,
}

impl ConsensusType {
    /// Canonical name used in configuration files
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bls => "bls",
        }
    }
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusType {
    type Err = SposError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bls" => Ok(Self::Bls),
            other => Err(SposError::InvalidConsensusType(other.to_string())),
        }
    }
}

/// Hash function used for header hashes and selection randomness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HasherKind {
    /// Keccak-256 (alloy)
    #[default]
    Keccak256,
    /// SHA3-256
    Sha3_256,
}

/// Number of valid signature shares needed to finalize a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumThreshold {
    /// `2n/3 + 1`
    Pbft,
    /// `n/2 + 1`
    Majority,
    /// Every member of the consensus group
    All,
    /// `ceil(n * percent / 100)`
    Percent(u64),
}

impl QuorumThreshold {
    /// Signatures required for a consensus group of `group_size` members
    pub fn required(&self, group_size: usize) -> usize {
        match self {
            Self::Pbft => group_size * 2 / 3 + 1,
            Self::Majority => group_size / 2 + 1,
            Self::All => group_size,
            Self::Percent(percent) => (group_size as u64 * percent).div_ceil(100) as usize,
        }
    }
}

/// Subround deadlines as percentages of the round duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubroundTimings {
    /// End of the start-round subround
    pub start_round_end: u64,
    /// End of the block subround
    pub block_end: u64,
    /// Point after which the leader stops waiting for the full group
    pub wait_all_signatures: u64,
    /// End of the signature subround
    pub signature_end: u64,
    /// End of the end-round subround
    pub end_round_end: u64,
}

impl Default for SubroundTimings {
    fn default() -> Self {
        Self {
            start_round_end: 5,
            block_end: 25,
            wait_all_signatures: 65,
            signature_end: 85,
            end_round_end: 95,
        }
    }
}

impl SubroundTimings {
    fn validate(&self) -> SposResult<()> {
        let ordered = self.start_round_end <= self.block_end &&
            self.block_end <= self.wait_all_signatures &&
            self.wait_all_signatures <= self.signature_end &&
            self.signature_end <= self.end_round_end &&
            self.end_round_end <= 100;
        if !ordered {
            return Err(SposError::InvalidConfig("subround timings must be ordered and <= 100".into()));
        }
        Ok(())
    }
}

/// Delayed broadcast settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Pending leader entries kept before the oldest is flushed
    pub max_delay_cache_size: u32,
    /// Pending validator entries kept before the oldest is dropped
    pub max_validator_delay_cache_size: u32,
    /// Delay per position in the consensus group for validator rebroadcasts (ms)
    pub validator_delay_per_order_ms: u64,
    /// Extra delay before block data goes out after a notarisation (ms)
    pub extra_delay_for_broadcast_ms: u64,
    /// Gap between miniblock and transaction broadcasts (ms)
    pub extra_delay_between_mbs_and_txs_ms: u64,
    /// Maximum size of one transactions packet in bytes
    pub max_bulk_transaction_size: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_delay_cache_size: 20,
            max_validator_delay_cache_size: 20,
            validator_delay_per_order_ms: 1_000,
            extra_delay_for_broadcast_ms: 1_000,
            extra_delay_between_mbs_and_txs_ms: 1_000,
            max_bulk_transaction_size: 1 << 18,
        }
    }
}

impl BroadcastConfig {
    /// Validator rebroadcast delay per consensus order
    pub const fn validator_delay_per_order(&self) -> Duration {
        Duration::from_millis(self.validator_delay_per_order_ms)
    }

    /// Extra delay applied before block data broadcast
    pub const fn extra_delay_for_broadcast(&self) -> Duration {
        Duration::from_millis(self.extra_delay_for_broadcast_ms)
    }

    /// Delay between the miniblocks and transactions broadcasts
    pub const fn extra_delay_between_mbs_and_txs(&self) -> Duration {
        Duration::from_millis(self.extra_delay_between_mbs_and_txs_ms)
    }
}

/// SPoS consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SposConfig {
    /// Chain identifier carried by every consensus message
    pub chain_id: String,

    /// Consensus service
    pub consensus_type: ConsensusType,

    /// Hash function
    pub hasher: HasherKind,

    /// Round duration in milliseconds (default: 6000)
    pub round_duration_ms: u64,

    /// Index of the first round
    pub start_round: i64,

    /// Subround deadlines
    pub timings: SubroundTimings,

    /// Normal quorum
    pub threshold: QuorumThreshold,

    /// Quorum used when fallback validation applies
    pub fallback_threshold: QuorumThreshold,

    /// Rounds after which a start-of-epoch metachain block may use fallback validation
    pub max_rounds_without_committed_start_in_epoch_block: u64,

    /// Rounds per epoch, 0 disables epoch changes
    pub rounds_per_epoch: u64,

    /// Consensus group LRU cache capacity
    pub consensus_group_cache_size: usize,

    /// Delayed broadcast settings
    pub broadcast: BroadcastConfig,
}

impl Default for SposConfig {
    fn default() -> Self {
        Self {
            chain_id: "1".to_string(),
            consensus_type: ConsensusType::Bls,
            hasher: HasherKind::Keccak256,
            round_duration_ms: 6_000,
            start_round: 0,
            timings: SubroundTimings::default(),
            threshold: QuorumThreshold::Pbft,
            fallback_threshold: QuorumThreshold::Majority,
            max_rounds_without_committed_start_in_epoch_block: 50,
            rounds_per_epoch: 0,
            consensus_group_cache_size: 1_000,
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl SposConfig {
    /// Create a new SPoS config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> SposResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|err| SposError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> SposResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|err| SposError::InvalidConfig(err.to_string()))?;
        Self::from_toml_str(&contents)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> SposResult<()> {
        if self.round_duration_ms == 0 {
            return Err(SposError::InvalidRoundDuration);
        }
        if self.chain_id.is_empty() {
            return Err(SposError::InvalidChainId);
        }
        if self.consensus_group_cache_size == 0 ||
            self.broadcast.max_delay_cache_size == 0 ||
            self.broadcast.max_validator_delay_cache_size == 0
        {
            return Err(SposError::InvalidCacheSize);
        }
        self.timings.validate()
    }

    /// Set chain id
    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = chain_id.into();
        self
    }

    /// Set round duration in milliseconds
    pub const fn with_round_duration_ms(mut self, ms: u64) -> Self {
        self.round_duration_ms = ms;
        self
    }

    /// Set start round
    pub const fn with_start_round(mut self, start_round: i64) -> Self {
        self.start_round = start_round;
        self
    }

    /// Set normal quorum
    pub const fn with_threshold(mut self, threshold: QuorumThreshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set fallback quorum
    pub const fn with_fallback_threshold(mut self, threshold: QuorumThreshold) -> Self {
        self.fallback_threshold = threshold;
        self
    }

    /// Set rounds per epoch
    pub const fn with_rounds_per_epoch(mut self, rounds: u64) -> Self {
        self.rounds_per_epoch = rounds;
        self
    }

    /// Set hasher
    pub const fn with_hasher(mut self, hasher: HasherKind) -> Self {
        self.hasher = hasher;
        self
    }

    /// Set subround timings
    pub const fn with_timings(mut self, timings: SubroundTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Set broadcast settings
    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Round duration
    pub const fn round_duration(&self) -> Duration {
        Duration::from_millis(self.round_duration_ms)
    }

    /// Offset of `percent` of the round duration
    pub const fn round_fraction(&self, percent: u64) -> Duration {
        Duration::from_nanos(self.round_duration_ms * 1_000_000 * percent / 100)
    }
}
