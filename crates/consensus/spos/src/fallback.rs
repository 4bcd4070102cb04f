//! Fallback validation for start-of-epoch metachain blocks
//!
//! When the metachain stalls at an epoch boundary for long enough, the
//! start-of-epoch block may be finalized with the relaxed fallback quorum.
//! Every lookup failure answers `false`, so the relaxation is never assumed.

use crate::{
    block::BlockHeader,
    constants::METACHAIN_SHARD_ID,
    errors::{SposError, SposResult},
    hashing::Marshalizer,
    storage::{HeadersPool, Storer, UnitType},
};
use alloy_primitives::B256;
use std::sync::Arc;
use tracing::{debug, trace, Span};

/// Construction arguments for [`FallbackHeaderValidator`]
#[derive(Debug, Default)]
pub struct FallbackHeaderValidatorArgs {
    /// Pool searched first for the previous header
    pub headers_pool: Option<Arc<dyn HeadersPool>>,
    /// Decodes headers read from storage
    pub marshalizer: Option<Arc<dyn Marshalizer>>,
    /// Searched when the pool misses
    pub storage: Option<Arc<dyn Storer>>,
    /// Round gap after which fallback validation applies
    pub max_rounds_without_committed_start_in_epoch_block: u64,
}

/// Decides whether a header may be finalized with the fallback quorum
#[derive(Debug)]
pub struct FallbackHeaderValidator {
    headers_pool: Arc<dyn HeadersPool>,
    marshalizer: Arc<dyn Marshalizer>,
    storage: Arc<dyn Storer>,
    max_rounds: u64,
    span: Span,
}

impl FallbackHeaderValidator {
    /// Create a validator; every collaborator is mandatory
    pub fn new(args: FallbackHeaderValidatorArgs) -> SposResult<Self> {
        let headers_pool = args.headers_pool.ok_or(SposError::NilHeadersDataPool)?;
        let marshalizer = args.marshalizer.ok_or(SposError::NilMarshalizer)?;
        let storage = args.storage.ok_or(SposError::NilStorage)?;
        Ok(Self {
            headers_pool,
            marshalizer,
            storage,
            max_rounds: args.max_rounds_without_committed_start_in_epoch_block,
            span: Span::none(),
        })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Whether a header with these fields qualifies for fallback validation
    pub fn should_apply_fallback_validation_for_header_with(
        &self,
        shard_id: u32,
        start_of_epoch_block: bool,
        round: u64,
        prev_header_hash: &B256,
    ) -> bool {
        if shard_id != METACHAIN_SHARD_ID || !start_of_epoch_block {
            return false;
        }

        let previous = match self.previous_header(prev_header_hash) {
            Ok(header) => header,
            Err(err) => {
                debug!(
                    parent: &self.span,
                    %err,
                    prev_hash = %prev_header_hash,
                    "Previous header for fallback validation not found"
                );
                return false;
            }
        };

        if round < previous.round {
            debug!(
                parent: &self.span,
                round,
                previous_round = previous.round,
                "Header round is lower than previous header round"
            );
            return false;
        }

        let apply = round - previous.round >= self.max_rounds;
        trace!(parent: &self.span, round, previous_round = previous.round, apply, "Fallback check");
        apply
    }

    /// Nil-safe form of [`Self::should_apply_fallback_validation_for_header_with`]
    pub fn should_apply_fallback_validation(&self, header: Option<&BlockHeader>) -> bool {
        header.is_some_and(|header| {
            self.should_apply_fallback_validation_for_header_with(
                header.shard_id,
                header.start_of_epoch,
                header.round,
                &header.prev_hash,
            )
        })
    }

    fn previous_header(&self, hash: &B256) -> SposResult<BlockHeader> {
        if let Ok(header) = self.headers_pool.get_header_by_hash(hash) {
            return Ok(header);
        }
        let data = self
            .storage
            .get(UnitType::MetaBlock, hash.as_slice())
            .map_err(|_| SposError::MissingHeader)?;
        self.marshalizer.unmarshal_header(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hashing::{JsonMarshalizer, Keccak256Hasher},
        storage::{InMemoryHeadersPool, InMemoryStorage},
    };
    use assert_matches::assert_matches;

    const MAX_ROUNDS: u64 = 10;

    struct Fixture {
        validator: FallbackHeaderValidator,
        pool: Arc<InMemoryHeadersPool>,
        storage: Arc<InMemoryStorage>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(InMemoryHeadersPool::new());
        let storage = Arc::new(InMemoryStorage::new());
        let validator = FallbackHeaderValidator::new(FallbackHeaderValidatorArgs {
            headers_pool: Some(pool.clone()),
            marshalizer: Some(Arc::new(JsonMarshalizer)),
            storage: Some(storage.clone()),
            max_rounds_without_committed_start_in_epoch_block: MAX_ROUNDS,
        })
        .unwrap();
        Fixture { validator, pool, storage }
    }

    fn previous_meta_header(round: u64) -> (BlockHeader, B256) {
        let header = BlockHeader { shard_id: METACHAIN_SHARD_ID, round, ..Default::default() };
        let hash = header.hash(&Keccak256Hasher);
        (header, hash)
    }

    #[test]
    fn test_new_rejects_missing_collaborators() {
        assert_matches!(
            FallbackHeaderValidator::new(FallbackHeaderValidatorArgs::default()),
            Err(SposError::NilHeadersDataPool)
        );
        assert_matches!(
            FallbackHeaderValidator::new(FallbackHeaderValidatorArgs {
                headers_pool: Some(Arc::new(InMemoryHeadersPool::new())),
                ..Default::default()
            }),
            Err(SposError::NilMarshalizer)
        );
        assert_matches!(
            FallbackHeaderValidator::new(FallbackHeaderValidatorArgs {
                headers_pool: Some(Arc::new(InMemoryHeadersPool::new())),
                marshalizer: Some(Arc::new(JsonMarshalizer)),
                ..Default::default()
            }),
            Err(SposError::NilStorage)
        );
    }

    #[test]
    fn test_applies_after_enough_rounds() {
        let f = fixture();
        let (previous, hash) = previous_meta_header(5);
        f.pool.add_header(hash, previous);

        assert!(f.validator.should_apply_fallback_validation_for_header_with(
            METACHAIN_SHARD_ID,
            true,
            5 + MAX_ROUNDS,
            &hash
        ));
        assert!(!f.validator.should_apply_fallback_validation_for_header_with(
            METACHAIN_SHARD_ID,
            true,
            5 + MAX_ROUNDS - 1,
            &hash
        ));
        assert!(!f.validator.should_apply_fallback_validation_for_header_with(
            METACHAIN_SHARD_ID,
            true,
            4,
            &hash
        ));
    }

    #[test]
    fn test_fails_closed_on_each_condition() {
        let f = fixture();
        let (previous, hash) = previous_meta_header(5);
        f.pool.add_header(hash, previous);
        let round = 100;

        // wrong shard
        assert!(!f.validator.should_apply_fallback_validation_for_header_with(0, true, round, &hash));
        // not a start-of-epoch block
        assert!(!f.validator.should_apply_fallback_validation_for_header_with(
            METACHAIN_SHARD_ID,
            false,
            round,
            &hash
        ));
        // previous header unknown
        assert!(!f.validator.should_apply_fallback_validation_for_header_with(
            METACHAIN_SHARD_ID,
            true,
            round,
            &B256::repeat_byte(7)
        ));
    }

    #[test]
    fn test_previous_header_from_storage() {
        let f = fixture();
        let (previous, hash) = previous_meta_header(1);
        f.storage
            .put(
                UnitType::MetaBlock,
                hash.as_slice(),
                JsonMarshalizer.marshal_header(&previous).unwrap().into(),
            )
            .unwrap();

        let header = BlockHeader {
            shard_id: METACHAIN_SHARD_ID,
            start_of_epoch: true,
            round: 1 + MAX_ROUNDS,
            prev_hash: hash,
            ..Default::default()
        };
        assert!(f.validator.should_apply_fallback_validation(Some(&header)));
        assert!(!f.validator.should_apply_fallback_validation(None));
    }
}
