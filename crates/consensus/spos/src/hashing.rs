//! Hasher and marshalizer collaborators
//!
//! Header hashes are computed over the RLP encoding of a header; everything that
//! travels on a topic or sits in storage goes through a [`Marshalizer`].

use crate::{
    block::{BlockBody, BlockHeader, HeaderProof, MiniBlock},
    config::HasherKind,
    errors::SposResult,
    spos::ConsensusMessage,
};
use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::Encodable;
use core::fmt::Debug;
use serde::{de::DeserializeOwned, Serialize};
use sha3::{Digest, Sha3_256};
use std::sync::Arc;

/// 256-bit hash function
pub trait Hasher: Send + Sync + Debug {
    /// Digest of `data`
    fn compute(&self, data: &[u8]) -> B256;

    /// Digest length in bytes
    fn size(&self) -> usize {
        B256::len_bytes()
    }
}

/// Keccak-256 hasher
#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak256Hasher;

impl Hasher for Keccak256Hasher {
    fn compute(&self, data: &[u8]) -> B256 {
        keccak256(data)
    }
}

/// SHA3-256 hasher
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha3Hasher;

impl Hasher for Sha3Hasher {
    fn compute(&self, data: &[u8]) -> B256 {
        B256::from_slice(&Sha3_256::digest(data))
    }
}

/// Build the configured hasher
pub fn hasher_for(kind: HasherKind) -> Arc<dyn Hasher> {
    match kind {
        HasherKind::Keccak256 => Arc::new(Keccak256Hasher),
        HasherKind::Sha3_256 => Arc::new(Sha3Hasher),
    }
}

/// Hash of the RLP encoding of `value`
pub fn rlp_hash<T: Encodable>(hasher: &dyn Hasher, value: &T) -> B256 {
    hasher.compute(&alloy_rlp::encode(value))
}

/// Wire codec for consensus data
pub trait Marshalizer: Send + Sync + Debug {
    /// Encode a block header
    fn marshal_header(&self, header: &BlockHeader) -> SposResult<Vec<u8>>;
    /// Decode a block header
    fn unmarshal_header(&self, data: &[u8]) -> SposResult<BlockHeader>;
    /// Encode a block body
    fn marshal_body(&self, body: &BlockBody) -> SposResult<Vec<u8>>;
    /// Decode a block body
    fn unmarshal_body(&self, data: &[u8]) -> SposResult<BlockBody>;
    /// Encode a consensus message
    fn marshal_message(&self, message: &ConsensusMessage) -> SposResult<Vec<u8>>;
    /// Decode a consensus message
    fn unmarshal_message(&self, data: &[u8]) -> SposResult<ConsensusMessage>;
    /// Encode a header proof
    fn marshal_proof(&self, proof: &HeaderProof) -> SposResult<Vec<u8>>;
    /// Decode a header proof
    fn unmarshal_proof(&self, data: &[u8]) -> SposResult<HeaderProof>;
    /// Encode the miniblocks sent to one shard
    fn marshal_mini_blocks(&self, mini_blocks: &[MiniBlock]) -> SposResult<Vec<u8>>;
    /// Decode the miniblocks sent to one shard
    fn unmarshal_mini_blocks(&self, data: &[u8]) -> SposResult<Vec<MiniBlock>>;
    /// Encode a packet of already encoded items
    fn marshal_packet(&self, items: &[Bytes]) -> SposResult<Vec<u8>>;
    /// Decode a packet of encoded items
    fn unmarshal_packet(&self, data: &[u8]) -> SposResult<Vec<Bytes>>;
}

/// JSON marshalizer
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshalizer;

impl JsonMarshalizer {
    fn encode<T: Serialize + ?Sized>(value: &T) -> SposResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> SposResult<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl Marshalizer for JsonMarshalizer {
    fn marshal_header(&self, header: &BlockHeader) -> SposResult<Vec<u8>> {
        Self::encode(header)
    }

    fn unmarshal_header(&self, data: &[u8]) -> SposResult<BlockHeader> {
        Self::decode(data)
    }

    fn marshal_body(&self, body: &BlockBody) -> SposResult<Vec<u8>> {
        Self::encode(body)
    }

    fn unmarshal_body(&self, data: &[u8]) -> SposResult<BlockBody> {
        Self::decode(data)
    }

    fn marshal_message(&self, message: &ConsensusMessage) -> SposResult<Vec<u8>> {
        Self::encode(message)
    }

    fn unmarshal_message(&self, data: &[u8]) -> SposResult<ConsensusMessage> {
        Self::decode(data)
    }

    fn marshal_proof(&self, proof: &HeaderProof) -> SposResult<Vec<u8>> {
        Self::encode(proof)
    }

    fn unmarshal_proof(&self, data: &[u8]) -> SposResult<HeaderProof> {
        Self::decode(data)
    }

    fn marshal_mini_blocks(&self, mini_blocks: &[MiniBlock]) -> SposResult<Vec<u8>> {
        Self::encode(mini_blocks)
    }

    fn unmarshal_mini_blocks(&self, data: &[u8]) -> SposResult<Vec<MiniBlock>> {
        Self::decode(data)
    }

    fn marshal_packet(&self, items: &[Bytes]) -> SposResult<Vec<u8>> {
        Self::encode(items)
    }

    fn unmarshal_packet(&self, data: &[u8]) -> SposResult<Vec<Bytes>> {
        Self::decode(data)
    }
}

/// Split `items` into marshalled packets no larger than `max_packet_size`
///
/// An item bigger than the limit travels alone in its own packet.
pub fn pack_data_in_chunks(
    marshalizer: &dyn Marshalizer,
    items: &[Bytes],
    max_packet_size: usize,
) -> SposResult<Vec<Vec<u8>>> {
    let mut packets = Vec::new();
    let mut current: Vec<Bytes> = Vec::new();
    let mut current_size = 0usize;

    for item in items {
        if !current.is_empty() && current_size + item.len() > max_packet_size {
            packets.push(marshalizer.marshal_packet(&current)?);
            current.clear();
            current_size = 0;
        }
        current_size += item.len();
        current.push(item.clone());
    }

    if !current.is_empty() {
        packets.push(marshalizer.marshal_packet(&current)?);
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashers_are_distinct_and_sized() {
        let keccak = Keccak256Hasher;
        let sha3 = Sha3Hasher;
        assert_eq!(keccak.size(), 32);
        assert_eq!(sha3.size(), 32);
        assert_ne!(keccak.compute(b"spos"), sha3.compute(b"spos"));
        assert_eq!(keccak.compute(b""), alloy_primitives::KECCAK256_EMPTY);
    }

    #[test]
    fn test_header_hash_changes_with_fields() {
        let hasher = Keccak256Hasher;
        let header = BlockHeader { nonce: 1, round: 1, ..Default::default() };
        let other = BlockHeader { nonce: 2, ..header.clone() };
        assert_ne!(rlp_hash(&hasher, &header), rlp_hash(&hasher, &other));
        assert_eq!(rlp_hash(&hasher, &header), header.hash(&hasher));
    }

    #[test]
    fn test_pack_data_in_chunks() {
        let marshalizer = JsonMarshalizer;
        let items: Vec<Bytes> = (0..10u8).map(|i| Bytes::from(vec![i; 10])).collect();

        let packets = pack_data_in_chunks(&marshalizer, &items, 35).unwrap();
        assert_eq!(packets.len(), 4);
        let first = marshalizer.unmarshal_packet(&packets[0]).unwrap();
        assert_eq!(first, items[..3].to_vec());

        let single = pack_data_in_chunks(&marshalizer, &items, usize::MAX).unwrap();
        assert_eq!(single.len(), 1);

        assert!(pack_data_in_chunks(&marshalizer, &[], 10).unwrap().is_empty());
    }
}
