//! Header chain linkage and proof checks
//!
//! Cheap structural checks run before any signature verification: a header
//! must extend its predecessor, and a proof must have wire sizes matching the
//! consensus group that produced it.

use crate::{
    bitmap_len,
    block::{BlockHeader, HeaderProof},
    config::QuorumThreshold,
    constants::MAX_SIGNATURE_SIZE,
    errors::{SposError, SposResult},
    fallback::FallbackHeaderValidator,
    hashing::Hasher,
    is_bit_set,
    sharding::{ConsensusGroup, NodesCoordinatorHandle},
    signing::verify_aggregated_signature,
};
use alloy_primitives::Bytes;
use std::sync::Arc;
use tracing::{debug, Span};

/// Epoch whose registry produced a header
///
/// A start-of-epoch block is agreed by the group of the epoch it closes.
pub const fn registry_epoch(epoch: u32, start_of_epoch: bool) -> u32 {
    if start_of_epoch && epoch > 0 {
        epoch - 1
    } else {
        epoch
    }
}

/// Consensus group that should have produced `header`
pub fn compute_consensus_group(
    header: Option<&BlockHeader>,
    nodes_coordinator: Option<&NodesCoordinatorHandle>,
) -> SposResult<ConsensusGroup> {
    let header = header.ok_or(SposError::NilHeaderHandler)?;
    let nodes_coordinator = nodes_coordinator.ok_or(SposError::NilNodesCoordinator)?;
    if header.prev_rand_seed.is_empty() {
        return Err(SposError::NilPrevRandSeed);
    }

    nodes_coordinator.compute_consensus_group(
        &header.prev_rand_seed,
        header.round,
        header.shard_id,
        registry_epoch(header.epoch, header.start_of_epoch),
    )
}

/// Members of `consensus_group` whose bit is set in `bitmap`, in group order
///
/// Bits past the group or past the bitmap are ignored.
pub fn compute_signers_public_keys(consensus_group: &[Bytes], bitmap: &[u8]) -> Vec<Bytes> {
    let bound = consensus_group.len().min(bitmap.len() * 8);
    (0..bound).filter(|i| is_bit_set(bitmap, *i)).map(|i| consensus_group[i].clone()).collect()
}

/// Construction arguments for [`HeaderValidator`]
#[derive(Debug)]
pub struct HeaderValidatorArgs {
    /// Header hasher
    pub hasher: Option<Arc<dyn Hasher>>,
    /// Registry the consensus groups come from
    pub nodes_coordinator: Option<NodesCoordinatorHandle>,
    /// Start-of-epoch stall detection
    pub fallback_validator: Option<Arc<FallbackHeaderValidator>>,
    /// Regular quorum
    pub threshold: QuorumThreshold,
    /// Quorum for headers qualifying for fallback validation
    pub fallback_threshold: QuorumThreshold,
}

/// Checks headers against their predecessor and proofs against their group
#[derive(Debug)]
pub struct HeaderValidator {
    hasher: Arc<dyn Hasher>,
    nodes_coordinator: NodesCoordinatorHandle,
    fallback_validator: Arc<FallbackHeaderValidator>,
    threshold: QuorumThreshold,
    fallback_threshold: QuorumThreshold,
    span: Span,
}

impl HeaderValidator {
    /// Create a header validator
    pub fn new(args: HeaderValidatorArgs) -> SposResult<Self> {
        Ok(Self {
            hasher: args.hasher.ok_or(SposError::NilHasher)?,
            nodes_coordinator: args.nodes_coordinator.ok_or(SposError::NilNodesCoordinator)?,
            fallback_validator: args
                .fallback_validator
                .ok_or(SposError::NilFallbackHeaderValidator)?,
            threshold: args.threshold,
            fallback_threshold: args.fallback_threshold,
            span: Span::none(),
        })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Nodes coordinator used for group lookups
    pub const fn nodes_coordinator(&self) -> &NodesCoordinatorHandle {
        &self.nodes_coordinator
    }

    /// Fallback validator consulted for quorum relaxation
    pub const fn fallback_validator(&self) -> &Arc<FallbackHeaderValidator> {
        &self.fallback_validator
    }

    /// Check that `current` extends `previous`
    ///
    /// Round and nonce are checked before the hash linkage.
    pub fn is_header_construction_valid(
        &self,
        current: Option<&BlockHeader>,
        previous: Option<&BlockHeader>,
    ) -> SposResult<()> {
        let (Some(current), Some(previous)) = (current, previous) else {
            return Err(SposError::NilBlockHeader);
        };

        if previous.round >= current.round {
            debug!(
                parent: &self.span,
                previous_round = previous.round,
                round = current.round,
                "Round does not match in shard"
            );
            return Err(SposError::LowerRoundInBlock);
        }

        let expected_nonce = previous
            .nonce
            .checked_add(1)
            .ok_or_else(|| SposError::InvalidHeader(format!("nonce {} overflows", previous.nonce)))?;
        if current.nonce != expected_nonce {
            debug!(
                parent: &self.span,
                previous_nonce = previous.nonce,
                nonce = current.nonce,
                "Nonce does not match in shard"
            );
            return Err(SposError::WrongNonceInBlock);
        }

        let previous_hash = previous.hash(self.hasher.as_ref());
        if current.prev_hash != previous_hash {
            debug!(
                parent: &self.span,
                prev_hash = %current.prev_hash,
                expected = %previous_hash,
                "Block hash does not match"
            );
            return Err(SposError::BlockHashDoesNotMatch);
        }

        if current.prev_rand_seed != previous.rand_seed {
            debug!(
                parent: &self.span,
                prev_rand_seed = %hex::encode(&current.prev_rand_seed),
                rand_seed = %hex::encode(&previous.rand_seed),
                "Random seed does not match"
            );
            return Err(SposError::RandSeedDoesNotMatch);
        }

        Ok(())
    }

    /// Whether bitmap, aggregated signature and header hash have valid sizes
    pub fn is_proof_size_valid(&self, proof: &HeaderProof) -> bool {
        let epoch = registry_epoch(proof.header_epoch, proof.is_start_of_epoch);
        let group_size = self
            .nodes_coordinator
            .consensus_group_size_for_shard_and_epoch(proof.header_shard_id, epoch);

        let expected_bitmap = bitmap_len(group_size);
        if proof.pub_keys_bitmap.len() != expected_bitmap {
            debug!(
                parent: &self.span,
                size = proof.pub_keys_bitmap.len(),
                expected = expected_bitmap,
                "Wrong size bitmap"
            );
            return false;
        }

        let sig_len = proof.aggregated_signature.len();
        if sig_len == 0 || sig_len > MAX_SIGNATURE_SIZE {
            debug!(parent: &self.span, size = sig_len, "Wrong size aggregated signature");
            return false;
        }

        if proof.header_hash.len() != self.hasher.size() {
            debug!(
                parent: &self.span,
                size = proof.header_hash.len(),
                expected = self.hasher.size(),
                "Wrong size header hash"
            );
            return false;
        }

        true
    }

    /// Valid shares needed to finalize `header` with a group of `group_size`
    pub fn required_signatures(&self, header: &BlockHeader, group_size: usize) -> usize {
        if self.fallback_validator.should_apply_fallback_validation(Some(header)) {
            self.fallback_threshold.required(group_size)
        } else {
            self.threshold.required(group_size)
        }
    }

    /// Full proof check: sizes, header hash, quorum and aggregated signature
    pub fn verify_proof(&self, header: &BlockHeader, proof: &HeaderProof) -> SposResult<()> {
        if !self.is_proof_size_valid(proof) {
            return Err(SposError::InvalidProof);
        }

        let hash = header.hash(self.hasher.as_ref());
        if proof.header_hash.as_ref() != hash.as_slice() {
            debug!(parent: &self.span, header_hash = %hash, "Proof is for another header");
            return Err(SposError::InvalidProof);
        }

        let group = compute_consensus_group(Some(header), Some(&self.nodes_coordinator))?;
        let signers = compute_signers_public_keys(&group.public_keys(), &proof.pub_keys_bitmap);
        let need = self.required_signatures(header, group.len());
        if signers.len() < need {
            return Err(SposError::InsufficientSignatures { have: signers.len(), need });
        }

        verify_aggregated_signature(&signers, hash.as_slice(), &proof.aggregated_signature)
    }
}
