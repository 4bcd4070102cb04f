//! Consensus wire messages

use crate::errors::SposError;
use alloy_primitives::Bytes;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Kind of a consensus message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageType {
    /// Leader proposal carrying header and body
    BlockBodyAndHeader = 0,
    /// Leader proposal body only
    BlockBody = 1,
    /// Leader proposal header only
    BlockHeader = 2,
    /// Signature share of a group member
    Signature = 3,
    /// Aggregated signature and bitmap from the leader
    BlockHeaderFinalInfo = 4,
    /// Group members whose shares failed verification
    InvalidSigners = 5,
}

impl MessageType {
    /// Every message type, in wire order
    pub const ALL: [Self; 6] = [
        Self::BlockBodyAndHeader,
        Self::BlockBody,
        Self::BlockHeader,
        Self::Signature,
        Self::BlockHeaderFinalInfo,
        Self::InvalidSigners,
    ];

    /// Name used in logs
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BlockBodyAndHeader => "(BLOCK_BODY_AND_HEADER)",
            Self::BlockBody => "(BLOCK_BODY)",
            Self::BlockHeader => "(BLOCK_HEADER)",
            Self::Signature => "(SIGNATURE)",
            Self::BlockHeaderFinalInfo => "(FINAL_INFO)",
            Self::InvalidSigners => "(INVALID_SIGNERS)",
        }
    }

    /// Whether the message carries a marshalled header
    pub const fn carries_header(&self) -> bool {
        matches!(self, Self::BlockBodyAndHeader | Self::BlockHeader)
    }

    /// Whether the message carries a marshalled body
    pub const fn carries_body(&self) -> bool {
        matches!(self, Self::BlockBodyAndHeader | Self::BlockBody)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = SposError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(value as usize).copied().ok_or(SposError::InvalidMessageType(value))
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as Self
    }
}

/// Message exchanged on the consensus topic
///
/// Fields not used by a message type stay empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    /// Hash of the header the message refers to
    pub block_header_hash: Bytes,
    /// BLS share over the header hash
    pub signature_share: Bytes,
    /// Marshalled block body
    pub body: Bytes,
    /// Marshalled block header
    pub header: Bytes,
    /// Validator key of the sender
    pub pub_key: Bytes,
    /// Signature of `originator_pid` by `pub_key`
    pub signature: Bytes,
    /// Message kind
    pub msg_type: MessageType,
    /// Round the message belongs to
    pub round_index: i64,
    /// Chain the message belongs to
    pub chain_id: Bytes,
    /// Signers of the aggregated signature
    pub pub_keys_bitmap: Bytes,
    /// Aggregated signature over the header hash
    pub aggregate_signature: Bytes,
    /// Leader signature over header hash and aggregated signature
    pub leader_signature: Bytes,
    /// Peer id the message was sent from
    pub originator_pid: Bytes,
    /// Marshalled packet of invalid signer keys
    pub invalid_signers: Bytes,
}

impl ConsensusMessage {
    /// Message of `msg_type` with only the envelope fields set
    pub fn new(msg_type: MessageType, round_index: i64, chain_id: Bytes, pub_key: Bytes) -> Self {
        Self {
            block_header_hash: Bytes::new(),
            signature_share: Bytes::new(),
            body: Bytes::new(),
            header: Bytes::new(),
            pub_key,
            signature: Bytes::new(),
            msg_type,
            round_index,
            chain_id,
            pub_keys_bitmap: Bytes::new(),
            aggregate_signature: Bytes::new(),
            leader_signature: Bytes::new(),
            originator_pid: Bytes::new(),
            invalid_signers: Bytes::new(),
        }
    }
}

/// Bytes covered by the leader signature of a final info message
pub fn leader_signed_payload(header_hash: &[u8], aggregated_signature: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(header_hash.len() + aggregated_signature.len());
    payload.extend_from_slice(header_hash);
    payload.extend_from_slice(aggregated_signature);
    payload
}
