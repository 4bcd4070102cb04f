//! SPoS round engine
//!
//! Drives one round at a time through its subrounds:
//!
//! 1. `StartRound` positions the clock, computes the consensus group from the
//!    chain tip and assigns roles to the keys hosted by this node. It lasts
//!    until its deadline, so peers enter the round before the proposal.
//! 2. `Block` has the leader propose a block; everybody else waits for the
//!    proposal and validates it.
//! 3. `Signature` has every hosted member sign the header hash; the leader
//!    collects shares until all members answered or the quorum deadline.
//! 4. `EndRound` has the leader aggregate, commit and disseminate the block;
//!    everybody else waits for the final info and commits after checking the
//!    proof.
//!
//! Each subround owns a deadline expressed as a share of the round duration.
//! A subround that cannot finish in time aborts the round.

use super::{
    leader_signed_payload, ConsensusCore, ConsensusMessage, ConsensusMessageValidator,
    MessageType, SharedConsensusState, Subround, SubroundStatus,
};
use crate::{
    block::{BlockBody, BlockHeader, HeaderProof},
    broadcast::BroadcastMessenger,
    chain::{BlockProcessor, Blockchain},
    config::SposConfig,
    constants::{MAX_BUFFERED_MESSAGES, MAX_CONSECUTIVE_ABORTED_ROUNDS},
    errors::{SposError, SposResult},
    hashing::{Hasher, Marshalizer},
    header_check::HeaderValidator,
    round::Round,
    sharding::ShardCoordinator,
    signing::{verify_signature, KeysHandler, SigningHandler},
};
use alloy_primitives::{Bytes, B256};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex as AsyncMutex},
    time::Instant,
};
use tracing::{debug, info, trace, warn, Span};

/// Construction arguments for [`SposConsensus`]
#[derive(Debug)]
pub struct SposConsensusArgs {
    /// Consensus settings
    pub config: SposConfig,
    /// Start time of round zero
    pub genesis_time: DateTime<Utc>,
    /// Round clock
    pub round: Option<Arc<Round>>,
    /// Chain tip
    pub blockchain: Option<Arc<Blockchain>>,
    /// Creates, processes and commits blocks
    pub block_processor: Option<Arc<dyn BlockProcessor>>,
    /// Proposal and proof checks; also provides the nodes coordinator
    pub header_validator: Option<Arc<HeaderValidator>>,
    /// Collects and aggregates signature shares
    pub signing_handler: Option<Arc<SigningHandler>>,
    /// Keys hosted by this node
    pub keys_handler: Option<Arc<KeysHandler>>,
    /// Publication surface
    pub broadcast_messenger: Option<Arc<dyn BroadcastMessenger>>,
    /// Payload codec
    pub marshalizer: Option<Arc<dyn Marshalizer>>,
    /// Header hashing
    pub hasher: Option<Arc<dyn Hasher>>,
    /// Shard of this node
    pub shard_coordinator: Option<Arc<ShardCoordinator>>,
    /// State shared with the worker
    pub consensus_state: Option<SharedConsensusState>,
    /// Message counters reset every round
    pub message_validator: Option<Arc<ConsensusMessageValidator>>,
    /// Consensus service
    pub consensus_core: ConsensusCore,
    /// Messages forwarded by the worker
    pub inbox: Option<UnboundedReceiver<ConsensusMessage>>,
}

impl Default for SposConsensusArgs {
    fn default() -> Self {
        Self {
            config: SposConfig::default(),
            genesis_time: DateTime::<Utc>::UNIX_EPOCH,
            round: None,
            blockchain: None,
            block_processor: None,
            header_validator: None,
            signing_handler: None,
            keys_handler: None,
            broadcast_messenger: None,
            marshalizer: None,
            hasher: None,
            shard_coordinator: None,
            consensus_state: None,
            message_validator: None,
            consensus_core: ConsensusCore::default(),
            inbox: None,
        }
    }
}

/// Result of one round as seen by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A block was committed
    Finished {
        /// Round index
        round: i64,
        /// Committed header
        header: BlockHeader,
        /// Its proof
        proof: HeaderProof,
    },
    /// The round ended without a commit
    Aborted {
        /// Round index
        round: i64,
        /// Subround that failed
        subround: Subround,
        /// Why it failed
        reason: SposError,
    },
}

impl RoundOutcome {
    /// Round index
    pub const fn round(&self) -> i64 {
        match self {
            Self::Finished { round, .. } | Self::Aborted { round, .. } => *round,
        }
    }

    /// Whether a block was committed
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Round counters
#[derive(Debug, Default)]
pub struct ConsensusStats {
    finished: AtomicU64,
    aborted: AtomicU64,
    consecutive_aborted: AtomicU64,
}

impl ConsensusStats {
    /// Rounds that committed a block
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    /// Rounds that aborted
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Aborted rounds since the last commit
    pub fn consecutive_aborted(&self) -> u64 {
        self.consecutive_aborted.load(Ordering::Relaxed)
    }

    /// Whether the node committed recently enough
    pub fn is_live(&self) -> bool {
        self.consecutive_aborted() < MAX_CONSECUTIVE_ABORTED_ROUNDS
    }

    fn record(&self, outcome: &RoundOutcome) {
        if outcome.is_finished() {
            self.finished.fetch_add(1, Ordering::Relaxed);
            self.consecutive_aborted.store(0, Ordering::Relaxed);
        } else {
            self.aborted.fetch_add(1, Ordering::Relaxed);
            self.consecutive_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct Inbox {
    rx: UnboundedReceiver<ConsensusMessage>,
    buffered: Vec<ConsensusMessage>,
}

/// Round data fixed at `StartRound`
#[derive(Debug)]
struct RoundContext {
    round: i64,
    start: DateTime<Utc>,
    tip: BlockHeader,
    tip_hash: B256,
    group: Vec<Bytes>,
    leader: Bytes,
    own_members: Vec<(usize, Bytes)>,
}

impl RoundContext {
    fn is_leader(&self, pub_key: &[u8]) -> bool {
        self.leader.as_ref() == pub_key
    }

    fn leads(&self) -> bool {
        self.own_members.iter().any(|(_, pk)| self.is_leader(pk))
    }
}

type SubroundResult<T> = Result<T, (Subround, SposError)>;

fn at(subround: Subround) -> impl FnOnce(SposError) -> (Subround, SposError) {
    move |err| (subround, err)
}

/// SPoS consensus engine of one node
#[derive(Debug)]
pub struct SposConsensus {
    config: SposConfig,
    genesis_time: DateTime<Utc>,
    round: Arc<Round>,
    blockchain: Arc<Blockchain>,
    block_processor: Arc<dyn BlockProcessor>,
    header_validator: Arc<HeaderValidator>,
    signing_handler: Arc<SigningHandler>,
    keys_handler: Arc<KeysHandler>,
    broadcast_messenger: Arc<dyn BroadcastMessenger>,
    marshalizer: Arc<dyn Marshalizer>,
    hasher: Arc<dyn Hasher>,
    shard_coordinator: Arc<ShardCoordinator>,
    consensus_state: SharedConsensusState,
    message_validator: Arc<ConsensusMessageValidator>,
    consensus_core: ConsensusCore,
    chain_id: Bytes,
    inbox: AsyncMutex<Inbox>,
    stats: ConsensusStats,
    span: Span,
}

impl SposConsensus {
    /// Create an engine
    pub fn new(args: SposConsensusArgs) -> SposResult<Self> {
        args.config.validate()?;
        if args.config.consensus_type != args.consensus_core.consensus_type() {
            return Err(SposError::InvalidConsensusType(args.config.consensus_type.to_string()));
        }
        let chain_id = Bytes::copy_from_slice(args.config.chain_id.as_bytes());
        Ok(Self {
            round: args.round.ok_or(SposError::NilRoundHandler)?,
            blockchain: args.blockchain.ok_or(SposError::NilBlockchain)?,
            block_processor: args.block_processor.ok_or(SposError::NilBlockProcessor)?,
            header_validator: args.header_validator.ok_or(SposError::NilHeaderValidator)?,
            signing_handler: args.signing_handler.ok_or(SposError::NilSigningHandler)?,
            keys_handler: args.keys_handler.ok_or(SposError::NilKeysHandler)?,
            broadcast_messenger: args.broadcast_messenger.ok_or(SposError::NilBroadcastMessenger)?,
            marshalizer: args.marshalizer.ok_or(SposError::NilMarshalizer)?,
            hasher: args.hasher.ok_or(SposError::NilHasher)?,
            shard_coordinator: args.shard_coordinator.ok_or(SposError::NilShardCoordinator)?,
            consensus_state: args.consensus_state.ok_or(SposError::NilConsensusState)?,
            message_validator: args.message_validator.ok_or(SposError::NilMessageValidator)?,
            inbox: AsyncMutex::new(Inbox {
                rx: args.inbox.ok_or(SposError::NilChannel)?,
                buffered: Vec::new(),
            }),
            consensus_core: args.consensus_core,
            config: args.config,
            genesis_time: args.genesis_time,
            chain_id,
            stats: ConsensusStats::default(),
            span: Span::none(),
        })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Round counters
    pub const fn stats(&self) -> &ConsensusStats {
        &self.stats
    }

    /// Round clock
    pub const fn round(&self) -> &Arc<Round> {
        &self.round
    }

    /// Chain this engine extends
    pub const fn blockchain(&self) -> &Arc<Blockchain> {
        &self.blockchain
    }

    /// State shared with the worker
    pub const fn consensus_state(&self) -> &SharedConsensusState {
        &self.consensus_state
    }

    /// Run the round the clock is currently in
    pub async fn run_round(&self) -> RoundOutcome {
        self.round.update_round(self.genesis_time, self.round.now());
        let round = self.round.index();

        let outcome = match self.execute_round(round).await {
            Ok((header, proof)) => RoundOutcome::Finished { round, header, proof },
            Err((subround, reason)) => {
                self.consensus_state.write().round_canceled = true;
                debug!(parent: &self.span, round, %subround, %reason, "Round aborted");
                RoundOutcome::Aborted { round, subround, reason }
            }
        };

        self.stats.record(&outcome);
        if self.stats.consecutive_aborted() == MAX_CONSECUTIVE_ABORTED_ROUNDS {
            warn!(
                parent: &self.span,
                aborted = MAX_CONSECUTIVE_ABORTED_ROUNDS,
                "No block committed in a row of rounds"
            );
        }
        outcome
    }

    /// Run `count` consecutive rounds, sleeping until each next round starts
    pub async fn run_rounds(&self, count: usize) -> Vec<RoundOutcome> {
        let mut outcomes = Vec::with_capacity(count);
        for _ in 0..count {
            outcomes.push(self.run_round().await);
            self.wait_for_next_round().await;
        }
        outcomes
    }

    async fn wait_for_next_round(&self) {
        let remaining = self.round.remaining_time(self.round.time_stamp(), self.round.time_duration());
        if let Ok(remaining) = remaining.to_std() {
            tokio::time::sleep(remaining).await;
        }
    }

    async fn execute_round(&self, round: i64) -> SubroundResult<(BlockHeader, HeaderProof)> {
        let ctx = self.start_round(round).map_err(at(Subround::StartRound))?;
        tokio::time::sleep_until(self.deadline(ctx.start, self.config.timings.start_round_end)).await;
        self.set_finished(Subround::StartRound);

        if ctx.leads() {
            self.propose_block(&ctx).map_err(at(Subround::Block))?;
        } else {
            self.receive_proposal(&ctx).await.map_err(at(Subround::Block))?;
        }
        self.set_finished(Subround::Block);

        self.signature_subround(&ctx).await.map_err(at(Subround::Signature))?;
        self.set_finished(Subround::Signature);

        let finished = if ctx.leads() {
            self.finalize_as_leader(&ctx)
        } else {
            self.finalize_from_leader(&ctx).await
        };
        let (header, proof) = finished.map_err(at(Subround::EndRound))?;
        self.set_finished(Subround::EndRound);
        Ok((header, proof))
    }

    fn set_finished(&self, subround: Subround) {
        self.consensus_state.write().set_status(subround, SubroundStatus::Finished);
    }

    fn start_round(&self, round: i64) -> SposResult<RoundContext> {
        if self.round.before_genesis() {
            return Err(SposError::RoundBeforeGenesis(round));
        }
        let (tip, tip_hash) = self.blockchain.last_header();
        if round <= tip.round as i64 {
            return Err(SposError::LowerRoundInBlock);
        }

        let group = self.header_validator.nodes_coordinator().compute_consensus_group(
            &tip.rand_seed,
            round as u64,
            self.shard_coordinator.self_id(),
            tip.epoch,
        )?;
        let leader = group.leader().map(|v| v.pub_key().clone()).ok_or(SposError::ValidatorNotFound)?;
        let members = group.public_keys();
        let start = self.round.time_stamp();

        {
            let mut state = self.consensus_state.write();
            state.reset_for_round(round, start);
            state.round_consensus.set_consensus_group(members.clone(), leader.clone());
        }
        self.signing_handler.reset(members.clone());
        self.message_validator.reset_consensus_messages(round);

        let own_members: Vec<(usize, Bytes)> = members
            .iter()
            .enumerate()
            .filter(|(_, pk)| self.keys_handler.is_key_managed_by_current_node(pk))
            .map(|(index, pk)| (index, pk.clone()))
            .collect();

        debug!(
            parent: &self.span,
            round,
            leader = %hex::encode(&leader),
            group_size = members.len(),
            own_members = own_members.len(),
            "Round started"
        );
        Ok(RoundContext { round, start, tip, tip_hash, group: members, leader, own_members })
    }

    /// Epoch of a block proposed in `round` on top of `tip`
    ///
    /// The epoch advances by at most one per block, so a chain that stalled
    /// across several epoch boundaries catches up one start-of-epoch block at
    /// a time.
    fn next_epoch(&self, tip: &BlockHeader, round: i64) -> (u32, bool) {
        let rounds_per_epoch = self.config.rounds_per_epoch;
        if rounds_per_epoch > 0 && (round as u64) / rounds_per_epoch > u64::from(tip.epoch) {
            (tip.epoch.saturating_add(1), true)
        } else {
            (tip.epoch, false)
        }
    }

    fn deadline(&self, start: DateTime<Utc>, percent: u64) -> Instant {
        let max = TimeDelta::from_std(self.config.round_fraction(percent)).unwrap_or(TimeDelta::MAX);
        let remaining = self.round.remaining_time(start, max).to_std().unwrap_or_default();
        Instant::now() + remaining
    }

    fn message(&self, msg_type: MessageType, round: i64, pub_key: &Bytes) -> ConsensusMessage {
        ConsensusMessage::new(msg_type, round, self.chain_id.clone(), pub_key.clone())
    }

    /// Next message of `round` accepted by `accept`, or `None` at `deadline`
    ///
    /// Messages of later rounds, and of this round that `accept` rejects, are
    /// kept for later calls.
    async fn next_message<F>(
        &self,
        round: i64,
        deadline: Instant,
        accept: F,
    ) -> Option<ConsensusMessage>
    where
        F: Fn(&ConsensusMessage) -> bool,
    {
        let mut inbox = self.inbox.lock().await;
        inbox.buffered.retain(|msg| msg.round_index >= round);
        if let Some(pos) = inbox.buffered.iter().position(|msg| msg.round_index == round && accept(msg))
        {
            return Some(inbox.buffered.remove(pos));
        }

        loop {
            let msg = match tokio::time::timeout_at(deadline, inbox.rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!(parent: &self.span, "Consensus inbox closed");
                    return None;
                }
                Err(_) => return None,
            };
            if msg.round_index == round && accept(&msg) {
                return Some(msg);
            }
            if msg.round_index < round {
                trace!(parent: &self.span, round = msg.round_index, "Dropped message of a past round");
                continue;
            }
            if inbox.buffered.len() >= MAX_BUFFERED_MESSAGES {
                inbox.buffered.remove(0);
            }
            inbox.buffered.push(msg);
        }
    }

    fn propose_block(&self, ctx: &RoundContext) -> SposResult<()> {
        let leader_key =
            self.keys_handler.key_pair(&ctx.leader).ok_or(SposError::InvalidPrivateKey)?;
        let nonce = ctx
            .tip
            .nonce
            .checked_add(1)
            .ok_or_else(|| SposError::InvalidHeader(format!("nonce {} overflows", ctx.tip.nonce)))?;
        let (epoch, start_of_epoch) = self.next_epoch(&ctx.tip, ctx.round);
        let header = BlockHeader {
            shard_id: self.shard_coordinator.self_id(),
            epoch,
            nonce,
            round: ctx.round as u64,
            timestamp: u64::try_from(ctx.start.timestamp_millis()).unwrap_or_default(),
            prev_hash: ctx.tip_hash,
            prev_rand_seed: ctx.tip.rand_seed.clone(),
            rand_seed: leader_key.sign(&ctx.tip.rand_seed),
            start_of_epoch,
            chain_id: self.chain_id.clone(),
            ..Default::default()
        };
        let (header, body) = self.block_processor.create_block(header)?;
        let hash = header.hash(self.hasher.as_ref());

        let mut msg = self.message(MessageType::BlockBodyAndHeader, ctx.round, &ctx.leader);
        msg.body = self.marshalizer.marshal_body(&body)?.into();
        msg.header = self.marshalizer.marshal_header(&header)?.into();
        msg.block_header_hash = Bytes::copy_from_slice(hash.as_slice());
        self.broadcast_messenger.broadcast_consensus_message(&msg)?;

        info!(
            parent: &self.span,
            round = ctx.round,
            nonce = header.nonce,
            epoch,
            start_of_epoch,
            header_hash = %hash,
            "Proposed block"
        );
        let mut state = self.consensus_state.write();
        state.add_received_header(ctx.round, hash);
        state.set_proposal(header, body, hash);
        state.round_consensus.set_job_done(&ctx.leader, Subround::Block)
    }

    async fn receive_proposal(&self, ctx: &RoundContext) -> SposResult<()> {
        let deadline = self.deadline(ctx.start, self.config.timings.block_end);
        let mut header_part: Option<(BlockHeader, B256)> = None;
        let mut body_part: Option<BlockBody> = None;

        loop {
            let msg = self
                .next_message(ctx.round, deadline, |msg| {
                    msg.msg_type.carries_header() || msg.msg_type.carries_body()
                })
                .await
                .ok_or(SposError::TimeIsOut)?;
            if !ctx.is_leader(&msg.pub_key) {
                debug!(
                    parent: &self.span,
                    pub_key = %hex::encode(&msg.pub_key),
                    "Proposal not sent by the round leader"
                );
                continue;
            }

            if msg.msg_type.carries_header() {
                let header = self.marshalizer.unmarshal_header(&msg.header)?;
                let hash = header.hash(self.hasher.as_ref());
                if !self.consensus_state.write().add_received_header(ctx.round, hash) {
                    warn!(
                        parent: &self.span,
                        round = ctx.round,
                        header_hash = %hash,
                        "Leader sent a second header for the round"
                    );
                    continue;
                }
                header_part = Some((header, hash));
            }
            if msg.msg_type.carries_body() {
                body_part = Some(self.marshalizer.unmarshal_body(&msg.body)?);
            }

            let (Some((header, hash)), Some(body)) = (&header_part, &body_part) else { continue };
            match self.validate_proposal(ctx, header, body) {
                Ok(()) => {
                    debug!(
                        parent: &self.span,
                        round = ctx.round,
                        nonce = header.nonce,
                        header_hash = %hash,
                        "Accepted proposal"
                    );
                    let mut state = self.consensus_state.write();
                    state.set_proposal(header.clone(), body.clone(), *hash);
                    return state.round_consensus.set_job_done(&ctx.leader, Subround::Block);
                }
                Err(err) => {
                    warn!(parent: &self.span, round = ctx.round, %err, "Rejected proposal");
                    header_part = None;
                    body_part = None;
                }
            }
        }
    }

    fn validate_proposal(
        &self,
        ctx: &RoundContext,
        header: &BlockHeader,
        body: &BlockBody,
    ) -> SposResult<()> {
        if header.round != ctx.round as u64 {
            return Err(SposError::LowerRoundInBlock);
        }
        if header.shard_id != self.shard_coordinator.self_id() {
            return Err(SposError::InvalidShardId(header.shard_id));
        }
        if header.chain_id != self.chain_id {
            return Err(SposError::InvalidChainId);
        }
        self.header_validator.is_header_construction_valid(Some(header), Some(&ctx.tip))?;
        verify_signature(&ctx.leader, &header.prev_rand_seed, &header.rand_seed)
            .map_err(|_| SposError::RandSeedDoesNotMatch)?;

        let (epoch, start_of_epoch) = self.next_epoch(&ctx.tip, ctx.round);
        if header.epoch != epoch || header.start_of_epoch != start_of_epoch {
            return Err(SposError::WrongEpochInBlock { expected: epoch, got: header.epoch });
        }
        self.block_processor.process_block(header, body)
    }

    fn proposal(&self) -> SposResult<(BlockHeader, BlockBody, B256)> {
        let state = self.consensus_state.read();
        match (&state.header, &state.body, state.header_hash) {
            (Some(header), Some(body), Some(hash)) => Ok((header.clone(), body.clone(), hash)),
            _ => Err(SposError::NilHeader),
        }
    }

    async fn signature_subround(&self, ctx: &RoundContext) -> SposResult<()> {
        let (header, _, hash) = self.proposal()?;
        let leads = ctx.leads();

        for (index, pub_key) in &ctx.own_members {
            let share = self.signing_handler.create_signature_share_for_public_key(
                hash.as_slice(),
                *index,
                pub_key,
            )?;
            self.consensus_state.write().round_consensus.set_job_done(pub_key, Subround::Signature)?;
            if leads {
                continue;
            }

            let mut msg = self.message(MessageType::Signature, ctx.round, pub_key);
            msg.signature_share = share;
            msg.block_header_hash = Bytes::copy_from_slice(hash.as_slice());
            self.broadcast_messenger.broadcast_consensus_message(&msg)?;
            trace!(parent: &self.span, round = ctx.round, index, "Sent signature share");
        }

        if leads {
            let need = self.header_validator.required_signatures(&header, ctx.group.len());
            self.collect_signatures(ctx, hash, need).await?;
        }
        Ok(())
    }

    fn signatures_count(&self) -> usize {
        self.consensus_state.read().round_consensus.compute_size(Subround::Signature)
    }

    async fn collect_signatures(&self, ctx: &RoundContext, hash: B256, need: usize) -> SposResult<()> {
        let wait_all = self.deadline(ctx.start, self.config.timings.wait_all_signatures);
        let end = self.deadline(ctx.start, self.config.timings.signature_end);

        loop {
            let have = self.signatures_count();
            if have == ctx.group.len() {
                break;
            }
            let deadline = if have >= need { wait_all } else { end };
            let Some(msg) = self
                .next_message(ctx.round, deadline, |msg| msg.msg_type == MessageType::Signature)
                .await
            else {
                break;
            };

            self.on_signature_share(&ctx.group, ctx.round, hash, msg)?;
        }

        let have = self.signatures_count();
        debug!(parent: &self.span, round = ctx.round, have, need, "Signature collection done");
        if have >= need {
            Ok(())
        } else {
            Err(SposError::InsufficientSignatures { have, need })
        }
    }

    /// Verify and store the share carried by `msg`
    ///
    /// A member sending a share that differs from the one already stored, or
    /// one that does not verify, is recorded as an invalid signer.
    fn on_signature_share(
        &self,
        group: &[Bytes],
        round: i64,
        hash: B256,
        msg: ConsensusMessage,
    ) -> SposResult<()> {
        if msg.block_header_hash.as_ref() != hash.as_slice() {
            debug!(parent: &self.span, round, "Signature share for another header");
            return Ok(());
        }
        let Some(index) = group.iter().position(|pk| *pk == msg.pub_key) else { return Ok(()) };
        if self.consensus_state.read().round_consensus.job_done(&msg.pub_key, Subround::Signature) {
            if self.signing_handler.signature_share(index).is_ok_and(|stored| stored != msg.signature_share)
            {
                warn!(parent: &self.span, round, index, "Conflicting signature share");
                self.consensus_state.write().add_invalid_signer(msg.pub_key);
            }
            return Ok(());
        }

        match self.signing_handler.verify_signature_share(index, &msg.signature_share, hash.as_slice())
        {
            Ok(()) => {
                self.signing_handler.store_signature_share(index, msg.signature_share)?;
                self.consensus_state
                    .write()
                    .round_consensus
                    .set_job_done(&msg.pub_key, Subround::Signature)?;
            }
            Err(err) => {
                warn!(parent: &self.span, round, index, %err, "Invalid signature share");
                self.consensus_state.write().add_invalid_signer(msg.pub_key);
            }
        }
        Ok(())
    }

    /// Aggregate the collected shares, dropping signers whose share does not
    /// verify if the aggregate fails
    fn aggregate_valid_shares(
        &self,
        ctx: &RoundContext,
        header: &BlockHeader,
        hash: B256,
    ) -> SposResult<(Vec<u8>, Bytes)> {
        let mut bitmap =
            self.consensus_state.read().round_consensus.generate_bitmap(Subround::Signature);
        let aggregated = self.signing_handler.aggregate_sigs(&bitmap)?;
        if self.signing_handler.verify(hash.as_slice(), &bitmap).is_ok() {
            return Ok((bitmap, aggregated));
        }

        let invalid = self.signing_handler.invalid_signers(hash.as_slice());
        warn!(
            parent: &self.span,
            round = ctx.round,
            invalid = invalid.len(),
            "Aggregated signature failed verification"
        );
        {
            let mut state = self.consensus_state.write();
            for &index in &invalid {
                if let Some(byte) = bitmap.get_mut(index / 8) {
                    *byte &= !(1 << (index % 8));
                }
                if let Some(pub_key) = ctx.group.get(index) {
                    state.add_invalid_signer(pub_key.clone());
                }
            }
        }

        let have: usize = bitmap.iter().map(|byte| byte.count_ones() as usize).sum();
        let need = self.header_validator.required_signatures(header, ctx.group.len());
        if have < need {
            return Err(SposError::InsufficientSignatures { have, need });
        }
        let aggregated = self.signing_handler.aggregate_sigs(&bitmap)?;
        self.signing_handler.verify(hash.as_slice(), &bitmap)?;
        Ok((bitmap, aggregated))
    }

    fn finalize_as_leader(&self, ctx: &RoundContext) -> SposResult<(BlockHeader, HeaderProof)> {
        let (header, body, hash) = self.proposal()?;
        let (bitmap, aggregated) = self.aggregate_valid_shares(ctx, &header, hash)?;

        let proof = HeaderProof {
            aggregated_signature: aggregated.clone(),
            pub_keys_bitmap: Bytes::from(bitmap.clone()),
            header_hash: Bytes::copy_from_slice(hash.as_slice()),
            header_shard_id: header.shard_id,
            header_epoch: header.epoch,
            header_nonce: header.nonce,
            header_round: header.round,
            is_start_of_epoch: header.start_of_epoch,
        };
        self.block_processor.commit_block(&header, &body, &proof)?;
        info!(
            parent: &self.span,
            round = ctx.round,
            nonce = header.nonce,
            signers = proof.signers_count(),
            header_hash = %hash,
            "Committed block as leader"
        );
        self.after_commit(&header);

        let leader_key =
            self.keys_handler.key_pair(&ctx.leader).ok_or(SposError::InvalidPrivateKey)?;
        let mut final_info = self.message(MessageType::BlockHeaderFinalInfo, ctx.round, &ctx.leader);
        final_info.block_header_hash = proof.header_hash.clone();
        final_info.pub_keys_bitmap = proof.pub_keys_bitmap.clone();
        final_info.leader_signature = leader_key.sign(&leader_signed_payload(hash.as_slice(), &aggregated));
        final_info.aggregate_signature = aggregated;
        self.log_broadcast_error(self.broadcast_messenger.broadcast_consensus_message(&final_info));

        let invalid = self.consensus_state.read().invalid_signers().to_vec();
        if !invalid.is_empty() {
            let mut msg = self.message(MessageType::InvalidSigners, ctx.round, &ctx.leader);
            msg.block_header_hash = proof.header_hash.clone();
            msg.invalid_signers = self.marshalizer.marshal_packet(&invalid)?.into();
            self.log_broadcast_error(self.broadcast_messenger.broadcast_consensus_message(&msg));
        }

        self.log_broadcast_error(
            self.broadcast_messenger.broadcast_equivalent_proof(Some(&proof), &ctx.leader),
        );
        self.log_broadcast_error(self.broadcast_messenger.broadcast_header(&header, &ctx.leader));
        let (mini_blocks, transactions) =
            self.block_processor.marshalled_data_to_broadcast(&header, &body)?;
        self.log_broadcast_error(self.broadcast_messenger.broadcast_block_data_leader(
            &header,
            mini_blocks,
            transactions,
            &ctx.leader,
        ));
        Ok((header, proof))
    }

    async fn finalize_from_leader(
        &self,
        ctx: &RoundContext,
    ) -> SposResult<(BlockHeader, HeaderProof)> {
        let (header, body, hash) = self.proposal()?;
        let deadline = self.deadline(ctx.start, self.config.timings.end_round_end);

        let proof = loop {
            let msg = self
                .next_message(ctx.round, deadline, |msg| {
                    matches!(
                        msg.msg_type,
                        MessageType::BlockHeaderFinalInfo | MessageType::InvalidSigners
                    )
                })
                .await
                .ok_or(SposError::TimeIsOut)?;
            if !ctx.is_leader(&msg.pub_key) || msg.block_header_hash.as_ref() != hash.as_slice() {
                continue;
            }
            if msg.msg_type == MessageType::InvalidSigners {
                self.record_invalid_signers(&msg);
                continue;
            }

            let payload = leader_signed_payload(hash.as_slice(), &msg.aggregate_signature);
            if let Err(err) = verify_signature(&ctx.leader, &payload, &msg.leader_signature) {
                warn!(parent: &self.span, round = ctx.round, %err, "Invalid leader signature");
                continue;
            }
            let proof = HeaderProof {
                aggregated_signature: msg.aggregate_signature,
                pub_keys_bitmap: msg.pub_keys_bitmap,
                header_hash: msg.block_header_hash,
                header_shard_id: header.shard_id,
                header_epoch: header.epoch,
                header_nonce: header.nonce,
                header_round: header.round,
                is_start_of_epoch: header.start_of_epoch,
            };
            match self.header_validator.verify_proof(&header, &proof) {
                Ok(()) => break proof,
                Err(err) => warn!(parent: &self.span, round = ctx.round, %err, "Invalid proof"),
            }
        };

        self.signing_handler.set_aggregated_sig(proof.aggregated_signature.clone());
        self.block_processor.commit_block(&header, &body, &proof)?;
        info!(
            parent: &self.span,
            round = ctx.round,
            nonce = header.nonce,
            signers = proof.signers_count(),
            header_hash = %hash,
            "Committed block"
        );
        self.after_commit(&header);

        if let Some((order, pub_key)) = ctx.own_members.first() {
            let (mini_blocks, transactions) =
                self.block_processor.marshalled_data_to_broadcast(&header, &body)?;
            self.broadcast_messenger.prepare_broadcast_header_validator(
                &header,
                &mini_blocks,
                &transactions,
                *order,
                pub_key,
            );
            self.broadcast_messenger.prepare_broadcast_block_data_validator(
                &header,
                mini_blocks,
                transactions,
                *order,
                pub_key,
            );
        }
        Ok((header, proof))
    }

    fn record_invalid_signers(&self, msg: &ConsensusMessage) {
        match self.marshalizer.unmarshal_packet(&msg.invalid_signers) {
            Ok(signers) => {
                debug!(parent: &self.span, count = signers.len(), "Leader reported invalid signers");
                let mut state = self.consensus_state.write();
                for signer in signers {
                    state.add_invalid_signer(signer);
                }
            }
            Err(err) => debug!(parent: &self.span, %err, "Malformed invalid signers packet"),
        }
    }

    fn after_commit(&self, header: &BlockHeader) {
        if !header.start_of_epoch {
            return;
        }
        match self.header_validator.nodes_coordinator().get_consensus_whitelisted_nodes(header.epoch)
        {
            Ok(eligible) => {
                info!(parent: &self.span, epoch = header.epoch, eligible = eligible.len(), "New epoch");
                self.consensus_state.write().round_consensus.set_eligible_list(eligible);
            }
            Err(err) => warn!(
                parent: &self.span,
                epoch = header.epoch,
                %err,
                "Eligible list of the new epoch is unknown"
            ),
        }
    }

    fn log_broadcast_error(&self, result: SposResult<()>) {
        if let Err(err) = result {
            warn!(parent: &self.span, %err, "Broadcast failed");
        }
    }

    /// Consensus service run by this engine
    pub const fn consensus_core(&self) -> ConsensusCore {
        self.consensus_core
    }
}
