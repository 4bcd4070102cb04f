//! Delayed block data broadcaster
//!
//! Shard leaders hold back cross-shard block data until a metachain header
//! notarizing their block is received. Consensus validators schedule a
//! fallback rebroadcast of the header and the block data, staggered by their
//! position in the group, and cancel it as soon as the same data is
//! intercepted from the network.

use super::{AlarmScheduler, BroadcastHandlers, InterceptedData, InterceptorsContainer};
use crate::{
    block::BlockHeader,
    chain::{MiniBlocksData, TransactionsData},
    config::BroadcastConfig,
    constants::{
        HEADERS_CACHE_SIZE, HEADER_ALARM_PREFIX, LEADER_ALARM_PREFIX, METACHAIN_BLOCKS_TOPIC,
        METACHAIN_SHARD_ID, MINI_BLOCKS_TOPIC, SHARD_BLOCKS_TOPIC, VALIDATOR_ALARM_PREFIX,
    },
    errors::{SposError, SposResult},
    sharding::ShardCoordinator,
    storage::HeadersPool,
};
use alloy_primitives::{Bytes, B256};
use hashbrown::{HashMap, HashSet};
use lru::LruCache;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, trace, warn, Span};

/// Block data waiting for its broadcast
#[derive(Debug, Clone, Default)]
pub struct DelayedBroadcastData {
    /// Hash of the block header
    pub header_hash: B256,
    /// Block header
    pub header: BlockHeader,
    /// Marshalled miniblocks per destination shard
    pub mini_blocks_data: MiniBlocksData,
    /// Cross-shard miniblocks not yet seen on the network
    pub mini_block_hashes: HashSet<B256>,
    /// Marshalled transactions per topic
    pub transactions: TransactionsData,
    /// Position of the broadcasting key in the consensus group
    pub order: usize,
    /// Key the data is broadcast under
    pub pub_key: Bytes,
}

impl DelayedBroadcastData {
    /// Data of `header` with the final cross-shard miniblocks it sends as pending
    pub fn new(
        header: BlockHeader,
        header_hash: B256,
        mini_blocks_data: MiniBlocksData,
        transactions: TransactionsData,
        order: usize,
        pub_key: Bytes,
    ) -> Self {
        let mini_block_hashes = header
            .mini_block_headers
            .iter()
            .filter(|mb| {
                mb.is_final &&
                    mb.sender_shard_id == header.shard_id &&
                    mb.receiver_shard_id != header.shard_id
            })
            .map(|mb| mb.hash)
            .collect();
        Self {
            header_hash,
            header,
            mini_blocks_data,
            mini_block_hashes,
            transactions,
            order,
            pub_key,
        }
    }
}

/// Header a validator rebroadcasts if the leader's copy does not show up
#[derive(Debug, Clone, Default)]
pub struct ValidatorHeaderBroadcastData {
    /// Hash of the header
    pub header_hash: B256,
    /// Header
    pub header: BlockHeader,
    /// Position of the validator in the consensus group
    pub order: usize,
    /// Key the header is broadcast under
    pub pub_key: Bytes,
}

/// Construction arguments for [`DelayedBlockBroadcaster`]
#[derive(Debug, Default)]
pub struct DelayedBroadcasterArgs {
    /// Shard of the node
    pub shard_coordinator: Option<Arc<ShardCoordinator>>,
    /// Source of intercepted headers and miniblocks
    pub interceptors_container: Option<Arc<InterceptorsContainer>>,
    /// Source of received metachain headers
    pub headers_subscriber: Option<Arc<dyn HeadersPool>>,
    /// Runs the delayed broadcasts
    pub alarm_scheduler: Option<Arc<AlarmScheduler>>,
    /// Delays and cache sizes
    pub config: BroadcastConfig,
}

#[derive(Debug)]
struct DelayedState {
    sink: Option<Arc<dyn BroadcastHandlers>>,
    leader_data: VecDeque<DelayedBroadcastData>,
    validator_data: VecDeque<DelayedBroadcastData>,
    scheduled_validator_data: HashMap<String, DelayedBroadcastData>,
    scheduled_headers: HashMap<String, ValidatorHeaderBroadcastData>,
    intercepted_headers: LruCache<B256, ()>,
}

/// Schedules leader and validator block data broadcasts
#[derive(Debug)]
pub struct DelayedBlockBroadcaster {
    shard_coordinator: Arc<ShardCoordinator>,
    alarm: Arc<AlarmScheduler>,
    config: BroadcastConfig,
    state: Mutex<DelayedState>,
    span: Span,
}

impl DelayedBlockBroadcaster {
    /// Create the broadcaster and subscribe it to headers and interceptors
    pub fn new(args: DelayedBroadcasterArgs) -> SposResult<Arc<Self>> {
        Self::new_with_span(args, Span::none())
    }

    /// Same as [`Self::new`] logging under `span`
    pub fn new_with_span(args: DelayedBroadcasterArgs, span: Span) -> SposResult<Arc<Self>> {
        let shard_coordinator = args.shard_coordinator.ok_or(SposError::NilShardCoordinator)?;
        let interceptors =
            args.interceptors_container.ok_or(SposError::NilInterceptorsContainer)?;
        let headers_subscriber = args.headers_subscriber.ok_or(SposError::NilHeadersSubscriber)?;
        let alarm = args.alarm_scheduler.ok_or(SposError::NilAlarmScheduler)?;
        if args.config.max_delay_cache_size == 0 || args.config.max_validator_delay_cache_size == 0 {
            return Err(SposError::InvalidCacheSize);
        }
        let headers_cache =
            NonZeroUsize::new(HEADERS_CACHE_SIZE).ok_or(SposError::InvalidCacheSize)?;

        let broadcaster = Arc::new(Self {
            shard_coordinator,
            alarm,
            config: args.config,
            state: Mutex::new(DelayedState {
                sink: None,
                leader_data: VecDeque::new(),
                validator_data: VecDeque::new(),
                scheduled_validator_data: HashMap::new(),
                scheduled_headers: HashMap::new(),
                intercepted_headers: LruCache::new(headers_cache),
            }),
            span,
        });

        let weak = Arc::downgrade(&broadcaster);
        headers_subscriber.register_handler(Arc::new(move |header: &BlockHeader, hash: B256| {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.header_received(header, hash);
            }
        }));

        let header_topic = if broadcaster.shard_coordinator.is_metachain() {
            METACHAIN_BLOCKS_TOPIC.to_string()
        } else {
            format!(
                "{SHARD_BLOCKS_TOPIC}{}",
                broadcaster.shard_coordinator.communication_identifier(METACHAIN_SHARD_ID)
            )
        };
        let mut topics = vec![header_topic];
        topics.extend(broadcaster.shard_coordinator.cross_shard_destinations().into_iter().map(
            |dest| {
                format!(
                    "{MINI_BLOCKS_TOPIC}{}",
                    broadcaster.shard_coordinator.communication_identifier(dest)
                )
            },
        ));
        for topic in topics {
            let weak = Arc::downgrade(&broadcaster);
            interceptors.register_handler(
                topic,
                Arc::new(move |_: &str, data: &InterceptedData| {
                    let Some(broadcaster) = weak.upgrade() else { return };
                    match data {
                        InterceptedData::Header { hash, .. } => broadcaster.intercepted_header(*hash),
                        InterceptedData::MiniBlock { hash, .. } => {
                            broadcaster.intercepted_mini_block_data(*hash)
                        }
                        InterceptedData::Proof(_) => {}
                    }
                }),
            );
        }

        Ok(broadcaster)
    }

    /// Set the sink that performs the actual publications
    pub fn set_broadcast_handlers(&self, sink: Arc<dyn BroadcastHandlers>) {
        self.state.lock().sink = Some(sink);
    }

    /// Hold leader block data until a metachain header notarizes it
    ///
    /// When the queue overflows the oldest entry is broadcast right away.
    pub fn set_leader_data(self: &Arc<Self>, data: DelayedBroadcastData) -> SposResult<()> {
        if data.header_hash.is_zero() {
            return Err(SposError::NilHeaderHash);
        }
        let evicted = {
            let mut state = self.state.lock();
            state.leader_data.push_back(data);
            if state.leader_data.len() > self.config.max_delay_cache_size as usize {
                state.leader_data.pop_front()
            } else {
                None
            }
        };
        if let Some(oldest) = evicted {
            debug!(
                parent: &self.span,
                header_hash = %oldest.header_hash,
                "Leader delay cache full, broadcasting oldest block data"
            );
            self.schedule_leader_broadcast(oldest, Duration::ZERO);
        }
        Ok(())
    }

    /// Keep validator block data until a metachain header notarizes it
    pub fn set_validator_data(&self, data: DelayedBroadcastData) -> SposResult<()> {
        if data.header_hash.is_zero() {
            return Err(SposError::NilHeaderHash);
        }
        let mut state = self.state.lock();
        state.validator_data.push_back(data);
        if state.validator_data.len() > self.config.max_validator_delay_cache_size as usize {
            if let Some(dropped) = state.validator_data.pop_front() {
                trace!(
                    parent: &self.span,
                    header_hash = %dropped.header_hash,
                    "Validator delay cache full, dropping oldest block data"
                );
            }
        }
        Ok(())
    }

    /// Rebroadcast `data.header` after `order` delay slots unless it is intercepted first
    pub fn set_header_for_validator(
        self: &Arc<Self>,
        data: ValidatorHeaderBroadcastData,
    ) -> SposResult<()> {
        if data.header_hash.is_zero() {
            return Err(SposError::NilHeaderHash);
        }
        let alarm_id = format!("{HEADER_ALARM_PREFIX}{}", hex::encode(data.header_hash));
        let delay = self.order_delay(data.order);
        {
            let mut state = self.state.lock();
            if state.intercepted_headers.contains(&data.header_hash) {
                trace!(parent: &self.span, header_hash = %data.header_hash, "Header already intercepted");
                return Ok(());
            }
            state.scheduled_headers.insert(alarm_id.clone(), data);
        }

        let weak = Arc::downgrade(self);
        self.alarm.add(alarm_id, delay, move |id| async move {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.header_alarm_expired(&id);
            }
        });
        Ok(())
    }

    /// A metachain header arrived: release the data it notarizes
    pub fn header_received(self: &Arc<Self>, header: &BlockHeader, hash: B256) {
        if !header.is_metachain() {
            return;
        }
        let self_id = self.shard_coordinator.self_id();
        let notarized: HashSet<B256> = header
            .shard_info
            .iter()
            .filter(|shard| shard.shard_id == self_id)
            .map(|shard| shard.header_hash)
            .collect();
        if notarized.is_empty() {
            return;
        }

        let (leader, validator) = {
            let mut state = self.state.lock();
            let leader = drain_matching(&mut state.leader_data, &notarized);
            let validator = drain_matching(&mut state.validator_data, &notarized);
            (leader, validator)
        };
        trace!(
            parent: &self.span,
            meta_hash = %hash,
            leader = leader.len(),
            validator = validator.len(),
            "Metachain header notarized own blocks"
        );

        for data in leader {
            self.schedule_leader_broadcast(data, self.config.extra_delay_for_broadcast());
        }
        for data in validator {
            self.schedule_validator_broadcast(data);
        }
    }

    /// The header with `hash` was seen on the network
    pub fn intercepted_header(&self, hash: B256) {
        let alarm_id = format!("{HEADER_ALARM_PREFIX}{}", hex::encode(hash));
        let cancelled = {
            let mut state = self.state.lock();
            state.intercepted_headers.put(hash, ());
            state.scheduled_headers.remove(&alarm_id).is_some()
        };
        if cancelled {
            self.alarm.cancel(&alarm_id);
            debug!(parent: &self.span, header_hash = %hash, "Header rebroadcast cancelled");
        }
    }

    /// The miniblock with `hash` was seen on the network
    pub fn intercepted_mini_block_data(&self, hash: B256) {
        let completed: Vec<String> = {
            let mut state = self.state.lock();
            for data in &mut state.validator_data {
                data.mini_block_hashes.remove(&hash);
            }
            let mut completed = Vec::new();
            for (alarm_id, data) in &mut state.scheduled_validator_data {
                if data.mini_block_hashes.remove(&hash) && data.mini_block_hashes.is_empty() {
                    completed.push(alarm_id.clone());
                }
            }
            for alarm_id in &completed {
                state.scheduled_validator_data.remove(alarm_id);
            }
            completed
        };
        for alarm_id in completed {
            self.alarm.cancel(&alarm_id);
            debug!(parent: &self.span, alarm = %alarm_id, "Block data rebroadcast cancelled");
        }
    }

    /// Pending leader entries
    pub fn leader_data_len(&self) -> usize {
        self.state.lock().leader_data.len()
    }

    /// Pending validator entries, notarized or not
    pub fn validator_data_len(&self) -> usize {
        let state = self.state.lock();
        state.validator_data.len() + state.scheduled_validator_data.len()
    }

    /// Cancel every scheduled broadcast and drop pending data
    pub fn close(&self) {
        self.alarm.close();
        let mut state = self.state.lock();
        state.leader_data.clear();
        state.validator_data.clear();
        state.scheduled_validator_data.clear();
        state.scheduled_headers.clear();
    }

    fn order_delay(&self, order: usize) -> Duration {
        self.config.validator_delay_per_order().saturating_mul(order as u32)
    }

    fn sink(&self) -> Option<Arc<dyn BroadcastHandlers>> {
        let sink = self.state.lock().sink.clone();
        if sink.is_none() {
            warn!(parent: &self.span, "No broadcast handlers set");
        }
        sink
    }

    fn schedule_leader_broadcast(self: &Arc<Self>, data: DelayedBroadcastData, delay: Duration) {
        let Some(sink) = self.sink() else { return };
        let between = self.config.extra_delay_between_mbs_and_txs();
        let alarm_id = format!("{LEADER_ALARM_PREFIX}{}", hex::encode(data.header_hash));
        self.alarm.add(alarm_id, delay, move |_| async move {
            broadcast_block_data(sink.as_ref(), &data, between).await;
        });
    }

    fn schedule_validator_broadcast(self: &Arc<Self>, data: DelayedBroadcastData) {
        let alarm_id = format!("{VALIDATOR_ALARM_PREFIX}{}", hex::encode(data.header_hash));
        let delay = self.config.extra_delay_for_broadcast() + self.order_delay(data.order);
        self.state.lock().scheduled_validator_data.insert(alarm_id.clone(), data);

        let weak = Arc::downgrade(self);
        self.alarm.add(alarm_id, delay, move |id| async move {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.validator_alarm_expired(&id).await;
            }
        });
    }

    fn header_alarm_expired(&self, alarm_id: &str) {
        let Some(data) = self.state.lock().scheduled_headers.remove(alarm_id) else { return };
        let Some(sink) = self.sink() else { return };
        match sink.broadcast_header(&data.header, &data.pub_key) {
            Ok(()) => debug!(
                parent: &self.span,
                header_hash = %data.header_hash,
                order = data.order,
                "Validator rebroadcast header"
            ),
            Err(err) => warn!(parent: &self.span, %err, "Validator header rebroadcast failed"),
        }
    }

    async fn validator_alarm_expired(&self, alarm_id: &str) {
        let Some(data) = self.state.lock().scheduled_validator_data.remove(alarm_id) else {
            return;
        };
        let Some(sink) = self.sink() else { return };
        debug!(
            parent: &self.span,
            header_hash = %data.header_hash,
            order = data.order,
            "Validator rebroadcast block data"
        );
        broadcast_block_data(sink.as_ref(), &data, self.config.extra_delay_between_mbs_and_txs())
            .await;
    }
}

fn drain_matching(
    queue: &mut VecDeque<DelayedBroadcastData>,
    hashes: &HashSet<B256>,
) -> Vec<DelayedBroadcastData> {
    let (matching, rest): (VecDeque<_>, VecDeque<_>) =
        queue.drain(..).partition(|data| hashes.contains(&data.header_hash));
    *queue = rest;
    matching.into()
}

async fn broadcast_block_data(
    sink: &dyn BroadcastHandlers,
    data: &DelayedBroadcastData,
    between: Duration,
) {
    if let Err(err) = sink.broadcast_mini_blocks(&data.mini_blocks_data, &data.pub_key) {
        warn!(%err, header_hash = %data.header_hash, "Miniblocks broadcast failed");
    }
    if data.transactions.is_empty() {
        return;
    }
    tokio::time::sleep(between).await;
    if let Err(err) = sink.broadcast_transactions(&data.transactions, &data.pub_key) {
        warn!(%err, header_hash = %data.header_hash, "Transactions broadcast failed");
    }
}
