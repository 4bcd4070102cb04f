//! Shard and metachain messengers publishing over the local network

use super::helpers::mock_key;
use crate::{
    block::{BlockHeader, MiniBlock, MiniBlockHeader, ShardData},
    broadcast::{
        AlarmScheduler, BroadcastMessenger, CommonMessengerArgs, InterceptorsContainer,
        LocalNetwork, MetaChainMessenger, ShardChainMessenger,
    },
    chain::{MiniBlocksData, TransactionsData},
    config::BroadcastConfig,
    constants::METACHAIN_SHARD_ID,
    errors::SposError,
    hashing::{rlp_hash, JsonMarshalizer, Keccak256Hasher, Marshalizer},
    sharding::ShardCoordinator,
    signing::{KeysHandler, PeerSignatureHandler},
    storage::{HeadersPool, InMemoryHeadersPool},
};
use alloy_primitives::{Bytes, B256};
use assert_matches::assert_matches;
use std::{sync::Arc, time::Duration};

const OWN_PID: &[u8] = b"own";

struct Fixture {
    network: Arc<LocalNetwork>,
    pool: Arc<InMemoryHeadersPool>,
    interceptors: Arc<InterceptorsContainer>,
    keys: Arc<KeysHandler>,
    args: Option<CommonMessengerArgs>,
}

impl Fixture {
    fn new(shard_id: u32) -> Self {
        let keys = Arc::new(KeysHandler::new(mock_key(1), Bytes::from_static(OWN_PID)));
        let pool = Arc::new(InMemoryHeadersPool::new());
        let interceptors = Arc::new(
            InterceptorsContainer::new(Some(Arc::new(JsonMarshalizer)), Some(Arc::new(Keccak256Hasher)))
                .unwrap()
                .with_headers_pool(pool.clone()),
        );
        let network = LocalNetwork::new();
        let messenger = network.join(Bytes::from_static(OWN_PID), interceptors.clone());

        let args = CommonMessengerArgs {
            messenger: Some(messenger),
            marshalizer: Some(Arc::new(JsonMarshalizer)),
            hasher: Some(Arc::new(Keccak256Hasher)),
            shard_coordinator: Some(Arc::new(ShardCoordinator::new(2, shard_id).unwrap())),
            peer_signature_handler: Some(Arc::new(
                PeerSignatureHandler::new(Some(keys.clone()), 16).unwrap(),
            )),
            keys_handler: Some(keys.clone()),
            headers_subscriber: Some(pool.clone()),
            interceptors_container: Some(interceptors.clone()),
            alarm_scheduler: Some(Arc::new(AlarmScheduler::new().unwrap())),
            config: BroadcastConfig {
                validator_delay_per_order_ms: 100,
                extra_delay_for_broadcast_ms: 50,
                extra_delay_between_mbs_and_txs_ms: 10,
                ..Default::default()
            },
        };
        Self { network, pool, interceptors, keys, args: Some(args) }
    }

    fn shard(&mut self) -> ShardChainMessenger {
        ShardChainMessenger::new(self.args.take().unwrap()).unwrap()
    }

    fn meta(&mut self) -> MetaChainMessenger {
        MetaChainMessenger::new(self.args.take().unwrap()).unwrap()
    }

    fn own_key(&self) -> Bytes {
        self.keys.own_public_key().clone()
    }
}

fn mini_block(receiver: u32) -> MiniBlock {
    MiniBlock {
        sender_shard_id: 0,
        receiver_shard_id: receiver,
        tx_hashes: vec![B256::repeat_byte(receiver as u8)],
    }
}

/// Shard 0 block sending one miniblock to shard 1 and one to the metachain
fn shard_block() -> (BlockHeader, MiniBlocksData, TransactionsData) {
    let mini_blocks = [mini_block(1), mini_block(METACHAIN_SHARD_ID)];
    let header = BlockHeader {
        shard_id: 0,
        nonce: 1,
        round: 1,
        mini_block_headers: mini_blocks
            .iter()
            .map(|mb| MiniBlockHeader {
                hash: rlp_hash(&Keccak256Hasher, mb),
                sender_shard_id: mb.sender_shard_id,
                receiver_shard_id: mb.receiver_shard_id,
                tx_count: 1,
                is_final: true,
            })
            .collect(),
        ..Default::default()
    };
    let data = mini_blocks
        .iter()
        .map(|mb| {
            let payload = JsonMarshalizer.marshal_mini_blocks(core::slice::from_ref(mb)).unwrap();
            (mb.receiver_shard_id, Bytes::from(payload))
        })
        .collect();
    let transactions = TransactionsData::from([
        ("transactions_0_1".to_string(), vec![Bytes::from_static(b"tx-1")]),
        ("transactions_0_META".to_string(), vec![Bytes::from_static(b"tx-meta")]),
    ]);
    (header, data, transactions)
}

#[tokio::test(start_paused = true)]
async fn test_shard_leader_data_split_by_destination() {
    let mut f = Fixture::new(0);
    let messenger = f.shard();
    let (header, mini_blocks, transactions) = shard_block();
    let hash = header.hash(&Keccak256Hasher);

    messenger.broadcast_block_data_leader(&header, mini_blocks, transactions, &f.own_key()).unwrap();
    assert_eq!(f.network.published_on("txBlockBodies"), 0);
    assert_eq!(messenger.delayed_broadcaster().leader_data_len(), 1);

    tokio::time::sleep(Duration::from_millis(55)).await;
    assert_eq!(f.network.published_on("txBlockBodies_0_META"), 1);
    assert_eq!(f.network.published_on("transactions"), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.network.published_on("transactions_0_META"), 1);
    assert_eq!(f.network.published_on("txBlockBodies_0_1"), 0);

    let meta = BlockHeader {
        shard_id: METACHAIN_SHARD_ID,
        shard_info: vec![ShardData { shard_id: 0, header_hash: hash, nonce: 1, round: 1, ..Default::default() }],
        ..Default::default()
    };
    f.pool.add_header(meta.hash(&Keccak256Hasher), meta);
    assert_eq!(messenger.delayed_broadcaster().leader_data_len(), 0);

    tokio::time::sleep(Duration::from_millis(65)).await;
    assert_eq!(f.network.published_on("txBlockBodies_0_1"), 1);
    assert_eq!(f.network.published_on("transactions_0_1"), 1);
    messenger.close();
}

#[tokio::test(start_paused = true)]
async fn test_shard_validator_header_rebroadcast_cancelled_when_seen() {
    let mut f = Fixture::new(0);
    let messenger = f.shard();
    let (header, mini_blocks, transactions) = shard_block();

    messenger.prepare_broadcast_header_validator(&header, &mini_blocks, &transactions, 1, &f.own_key());
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert_eq!(f.network.published_on("shardBlocks_0_META"), 1);

    let next = BlockHeader { nonce: 2, round: 2, ..header };
    messenger.prepare_broadcast_header_validator(&next, &mini_blocks, &transactions, 1, &f.own_key());
    let payload = JsonMarshalizer.marshal_header(&next).unwrap();
    f.interceptors.process("shardBlocks_0_META", &payload, b"leader").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.network.published_on("shardBlocks_0_META"), 1);
    messenger.close();
}

#[tokio::test(start_paused = true)]
async fn test_shard_validator_block_data_waits_for_notarization() {
    let mut f = Fixture::new(0);
    let messenger = f.shard();
    let (header, mini_blocks, transactions) = shard_block();
    let hash = header.hash(&Keccak256Hasher);

    messenger.prepare_broadcast_block_data_validator(&header, mini_blocks, transactions, 2, &f.own_key());
    assert_eq!(messenger.delayed_broadcaster().validator_data_len(), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.network.published_on("txBlockBodies"), 0);

    let meta = BlockHeader {
        shard_id: METACHAIN_SHARD_ID,
        shard_info: vec![ShardData { shard_id: 0, header_hash: hash, ..Default::default() }],
        ..Default::default()
    };
    f.pool.add_header(meta.hash(&Keccak256Hasher), meta);
    tokio::time::sleep(Duration::from_millis(260)).await;
    assert_eq!(f.network.published_on("txBlockBodies"), 2);
    messenger.close();
}

#[tokio::test(start_paused = true)]
async fn test_meta_leader_data_goes_out_immediately() {
    let mut f = Fixture::new(METACHAIN_SHARD_ID);
    let messenger = f.meta();
    let header = BlockHeader { shard_id: METACHAIN_SHARD_ID, nonce: 1, ..Default::default() };
    let mini_blocks = MiniBlocksData::from([
        (0, Bytes::from(JsonMarshalizer.marshal_mini_blocks(&[mini_block(0)]).unwrap())),
        (1, Bytes::from(JsonMarshalizer.marshal_mini_blocks(&[mini_block(1)]).unwrap())),
    ]);
    let transactions =
        TransactionsData::from([("transactions_0_META".to_string(), vec![Bytes::from_static(b"tx")])]);

    messenger
        .broadcast_block_data_leader(&header, MiniBlocksData::new(), TransactionsData::new(), &f.own_key())
        .unwrap();
    messenger.broadcast_block_data_leader(&header, mini_blocks, transactions, &f.own_key()).unwrap();

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(f.network.published_on("txBlockBodies_0_META"), 1);
    assert_eq!(f.network.published_on("txBlockBodies_1_META"), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.network.published_on("transactions_0_META"), 1);
    messenger.close();
}

#[tokio::test(start_paused = true)]
async fn test_meta_validator_only_rebroadcasts_header() {
    let mut f = Fixture::new(METACHAIN_SHARD_ID);
    let messenger = f.meta();
    let header = BlockHeader { shard_id: METACHAIN_SHARD_ID, nonce: 1, ..Default::default() };
    let mini_blocks = MiniBlocksData::from([(0, Bytes::from_static(b"mbs"))]);

    messenger.prepare_broadcast_block_data_validator(
        &header,
        mini_blocks.clone(),
        TransactionsData::new(),
        0,
        &f.own_key(),
    );
    messenger.prepare_broadcast_header_validator(
        &header,
        &mini_blocks,
        &TransactionsData::new(),
        2,
        &f.own_key(),
    );

    tokio::time::sleep(Duration::from_millis(190)).await;
    assert_eq!(f.network.published_on("metachainBlocks"), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.network.published_on("metachainBlocks"), 1);
    assert_eq!(f.network.published_on("txBlockBodies"), 0);
    messenger.close();
}

#[tokio::test]
async fn test_messenger_requires_alarm_scheduler() {
    let mut f = Fixture::new(0);
    let args = CommonMessengerArgs { alarm_scheduler: None, ..f.args.take().unwrap() };
    assert_matches!(ShardChainMessenger::new(args), Err(SposError::NilAlarmScheduler));

    let mut f = Fixture::new(0);
    let args = CommonMessengerArgs { messenger: None, ..f.args.take().unwrap() };
    assert_matches!(MetaChainMessenger::new(args), Err(SposError::NilMessenger));
}
