//! Consensus services

use crate::config::ConsensusType;
use core::fmt;

use super::MessageType;

/// Steps of one consensus round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subround {
    /// Group computation and role assignment
    StartRound,
    /// Proposal and its validation
    Block,
    /// Signature share collection
    Signature,
    /// Aggregation, commit and dissemination
    EndRound,
}

impl Subround {
    /// Subrounds in execution order
    pub const ALL: [Self; 4] = [Self::StartRound, Self::Block, Self::Signature, Self::EndRound];

    /// Name used in logs
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StartRound => "(START_ROUND)",
            Self::Block => "(BLOCK)",
            Self::Signature => "(SIGNATURE)",
            Self::EndRound => "(END_ROUND)",
        }
    }
}

impl fmt::Display for Subround {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// BLS multi-signature consensus service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlsConsensusService;

impl BlsConsensusService {
    /// Messages of `msg_type` accepted per key and round
    pub const fn message_type_limit(&self, _msg_type: MessageType) -> u32 {
        1
    }

    /// Subround consuming messages of `msg_type`
    pub const fn subround_for_message(&self, msg_type: MessageType) -> Subround {
        match msg_type {
            MessageType::BlockBodyAndHeader | MessageType::BlockBody | MessageType::BlockHeader => {
                Subround::Block
            }
            MessageType::Signature => Subround::Signature,
            MessageType::BlockHeaderFinalInfo | MessageType::InvalidSigners => Subround::EndRound,
        }
    }

    /// Whether only the round leader may send `msg_type`
    pub const fn is_leader_only(&self, msg_type: MessageType) -> bool {
        !matches!(msg_type, MessageType::Signature)
    }
}

/// Closed set of consensus services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusCore {
    /// BLS multi-signature SPoS
    Bls(BlsConsensusService),
}

impl Default for ConsensusCore {
    fn default() -> Self {
        Self::Bls(BlsConsensusService)
    }
}

impl ConsensusCore {
    /// Configured type of this service
    pub const fn consensus_type(&self) -> ConsensusType {
        match self {
            Self::Bls(_) => ConsensusType::Bls,
        }
    }

    /// Subrounds run by this service
    pub const fn subrounds(&self) -> &'static [Subround] {
        match self {
            Self::Bls(_) => &Subround::ALL,
        }
    }

    /// See [`BlsConsensusService::message_type_limit`]
    pub const fn message_type_limit(&self, msg_type: MessageType) -> u32 {
        match self {
            Self::Bls(service) => service.message_type_limit(msg_type),
        }
    }

    /// See [`BlsConsensusService::subround_for_message`]
    pub const fn subround_for_message(&self, msg_type: MessageType) -> Subround {
        match self {
            Self::Bls(service) => service.subround_for_message(msg_type),
        }
    }

    /// See [`BlsConsensusService::is_leader_only`]
    pub const fn is_leader_only(&self, msg_type: MessageType) -> bool {
        match self {
            Self::Bls(service) => service.is_leader_only(msg_type),
        }
    }

    /// Whether this service consumes `msg_type`
    pub fn is_message_type_valid(&self, msg_type: MessageType) -> bool {
        self.subrounds().contains(&self.subround_for_message(msg_type))
    }
}
