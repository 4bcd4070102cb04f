//! Chain tip and block processing collaborators

use crate::{
    block::{BlockBody, BlockHeader, HeaderProof, MiniBlock},
    constants::TRANSACTIONS_TOPIC,
    errors::{SposError, SposResult},
    hashing::{Hasher, Marshalizer},
    sharding::ShardCoordinator,
    storage::{Storer, UnitType},
};
use alloy_primitives::{Bytes, B256};
use core::fmt::Debug;
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, Span};

#[derive(Debug, Default)]
struct ChainTip {
    header: Option<BlockHeader>,
    hash: Option<B256>,
    proof: Option<HeaderProof>,
}

/// Genesis header plus the last committed header of one shard
#[derive(Debug)]
pub struct Blockchain {
    genesis_header: BlockHeader,
    genesis_hash: B256,
    tip: RwLock<ChainTip>,
}

impl Blockchain {
    /// Chain starting at `genesis_header`
    pub fn new(genesis_header: BlockHeader, hasher: &dyn Hasher) -> Self {
        let genesis_hash = genesis_header.hash(hasher);
        Self { genesis_header, genesis_hash, tip: RwLock::new(ChainTip::default()) }
    }

    /// Genesis header
    pub const fn genesis_header(&self) -> &BlockHeader {
        &self.genesis_header
    }

    /// Genesis header hash
    pub const fn genesis_header_hash(&self) -> B256 {
        self.genesis_hash
    }

    /// Last committed header, `None` before the first commit
    pub fn current_header(&self) -> Option<BlockHeader> {
        self.tip.read().header.clone()
    }

    /// Hash of the last committed header
    pub fn current_header_hash(&self) -> Option<B256> {
        self.tip.read().hash
    }

    /// Proof of the last committed header
    pub fn current_proof(&self) -> Option<HeaderProof> {
        self.tip.read().proof.clone()
    }

    /// Last committed header and its hash, falling back to genesis
    pub fn last_header(&self) -> (BlockHeader, B256) {
        let tip = self.tip.read();
        match (&tip.header, tip.hash) {
            (Some(header), Some(hash)) => (header.clone(), hash),
            _ => (self.genesis_header.clone(), self.genesis_hash),
        }
    }

    /// Move the tip
    pub fn set_current_header(&self, header: BlockHeader, hash: B256, proof: HeaderProof) {
        let mut tip = self.tip.write();
        tip.header = Some(header);
        tip.hash = Some(hash);
        tip.proof = Some(proof);
    }
}

/// Miniblocks per destination shard, marshalled
pub type MiniBlocksData = HashMap<u32, Bytes>;

/// Transactions per topic, each item marshalled
pub type TransactionsData = HashMap<String, Vec<Bytes>>;

/// Block creation, execution and commit
pub trait BlockProcessor: Send + Sync + Debug {
    /// Fill body-dependent fields of `header` and return it with its body
    fn create_block(&self, header: BlockHeader) -> SposResult<(BlockHeader, BlockBody)>;

    /// Execute a proposed block without committing it
    fn process_block(&self, header: &BlockHeader, body: &BlockBody) -> SposResult<()>;

    /// Persist a finalized block and move the chain tip
    fn commit_block(
        &self,
        header: &BlockHeader,
        body: &BlockBody,
        proof: &HeaderProof,
    ) -> SposResult<()>;

    /// Cross-shard miniblocks and transactions of a block, ready for broadcast
    fn marshalled_data_to_broadcast(
        &self,
        header: &BlockHeader,
        body: &BlockBody,
    ) -> SposResult<(MiniBlocksData, TransactionsData)>;
}

/// Block processor keeping blocks in a [`Storer`]
///
/// Proposals carry the miniblocks queued with [`InMemoryBlockProcessor::add_mini_block`].
#[derive(Debug)]
pub struct InMemoryBlockProcessor {
    blockchain: Arc<Blockchain>,
    storage: Arc<dyn Storer>,
    hasher: Arc<dyn Hasher>,
    marshalizer: Arc<dyn Marshalizer>,
    shard_coordinator: Arc<ShardCoordinator>,
    pending: Mutex<Vec<MiniBlock>>,
    span: Span,
}

impl InMemoryBlockProcessor {
    /// Create a block processor over `blockchain` and `storage`
    pub fn new(
        blockchain: Arc<Blockchain>,
        storage: Arc<dyn Storer>,
        hasher: Arc<dyn Hasher>,
        marshalizer: Arc<dyn Marshalizer>,
        shard_coordinator: Arc<ShardCoordinator>,
    ) -> Self {
        Self {
            blockchain,
            storage,
            hasher,
            marshalizer,
            shard_coordinator,
            pending: Mutex::new(Vec::new()),
            span: Span::none(),
        }
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Queue a miniblock for the next proposal
    pub fn add_mini_block(&self, mini_block: MiniBlock) {
        self.pending.lock().push(mini_block);
    }
}

impl BlockProcessor for InMemoryBlockProcessor {
    fn create_block(&self, mut header: BlockHeader) -> SposResult<(BlockHeader, BlockBody)> {
        let body = BlockBody { mini_blocks: core::mem::take(&mut *self.pending.lock()) };
        header.body_hash = body.hash(self.hasher.as_ref());
        header.mini_block_headers = body.mini_block_headers(self.hasher.as_ref());
        Ok((header, body))
    }

    fn process_block(&self, header: &BlockHeader, body: &BlockBody) -> SposResult<()> {
        if body.hash(self.hasher.as_ref()) != header.body_hash {
            return Err(SposError::BlockProcessing("body hash mismatch".into()));
        }
        if body.mini_block_headers(self.hasher.as_ref()) != header.mini_block_headers {
            return Err(SposError::BlockProcessing("miniblock headers mismatch".into()));
        }
        Ok(())
    }

    fn commit_block(
        &self,
        header: &BlockHeader,
        body: &BlockBody,
        proof: &HeaderProof,
    ) -> SposResult<()> {
        let hash = header.hash(self.hasher.as_ref());
        if proof.header_hash.as_ref() != hash.as_slice() {
            return Err(SposError::InvalidProof);
        }

        let unit = UnitType::for_headers_of(header.shard_id);
        self.storage.put(unit, hash.as_slice(), self.marshalizer.marshal_header(header)?.into())?;
        self.storage.put(
            UnitType::Proofs,
            hash.as_slice(),
            self.marshalizer.marshal_proof(proof)?.into(),
        )?;
        for (mini_block, mb_header) in body.mini_blocks.iter().zip(&header.mini_block_headers) {
            self.storage.put(
                UnitType::MiniBlock,
                mb_header.hash.as_slice(),
                self.marshalizer.marshal_mini_blocks(core::slice::from_ref(mini_block))?.into(),
            )?;
        }

        self.blockchain.set_current_header(header.clone(), hash, proof.clone());
        debug!(
            parent: &self.span,
            nonce = header.nonce,
            round = header.round,
            header_hash = %hash,
            "Committed block"
        );
        Ok(())
    }

    fn marshalled_data_to_broadcast(
        &self,
        header: &BlockHeader,
        body: &BlockBody,
    ) -> SposResult<(MiniBlocksData, TransactionsData)> {
        let self_id = self.shard_coordinator.self_id();
        let mut per_shard: HashMap<u32, Vec<MiniBlock>> = HashMap::new();
        let mut transactions = TransactionsData::new();

        for mini_block in &body.mini_blocks {
            if mini_block.receiver_shard_id == self_id || mini_block.sender_shard_id != header.shard_id
            {
                continue;
            }
            per_shard.entry(mini_block.receiver_shard_id).or_default().push(mini_block.clone());

            let topic = format!(
                "{TRANSACTIONS_TOPIC}{}",
                self.shard_coordinator.communication_identifier(mini_block.receiver_shard_id)
            );
            transactions
                .entry(topic)
                .or_default()
                .extend(mini_block.tx_hashes.iter().map(|tx| Bytes::copy_from_slice(tx.as_slice())));
        }

        let mut mini_blocks = MiniBlocksData::new();
        for (shard, blocks) in per_shard {
            mini_blocks.insert(shard, self.marshalizer.marshal_mini_blocks(&blocks)?.into());
        }
        Ok((mini_blocks, transactions))
    }
}
