//! Per-topic decoding of received publications

use crate::{
    block::{BlockHeader, HeaderProof, MiniBlock},
    constants::{
        EQUIVALENT_PROOFS_TOPIC, METACHAIN_BLOCKS_TOPIC, MINI_BLOCKS_TOPIC, SHARD_BLOCKS_TOPIC,
        TRANSACTIONS_TOPIC,
    },
    errors::{SposError, SposResult},
    hashing::{rlp_hash, Hasher, Marshalizer},
    storage::HeadersPool,
};
use alloy_primitives::B256;
use core::fmt;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, Span};

/// Handler receiving the raw payload and the originating peer id
pub type RawHandler = Arc<dyn Fn(&[u8], &[u8]) -> SposResult<()> + Send + Sync>;

/// Handler receiving decoded data from a topic
pub type InterceptedDataHandler = Arc<dyn Fn(&str, &InterceptedData) + Send + Sync>;

/// Decoded publication
#[derive(Debug, Clone)]
pub enum InterceptedData {
    /// Shard or metachain header
    Header {
        /// Header hash
        hash: B256,
        /// Decoded header
        header: BlockHeader,
    },
    /// One miniblock out of a miniblocks publication
    MiniBlock {
        /// Miniblock hash
        hash: B256,
        /// Decoded miniblock
        mini_block: MiniBlock,
    },
    /// Equivalent proof of a header
    Proof(HeaderProof),
}

#[derive(Default)]
struct Handlers {
    raw: HashMap<String, RawHandler>,
    data: HashMap<String, Vec<InterceptedDataHandler>>,
}

/// Routes publications to raw handlers or decodes them by topic family
///
/// Decoded headers also land in the headers pool when one is attached.
pub struct InterceptorsContainer {
    marshalizer: Arc<dyn Marshalizer>,
    hasher: Arc<dyn Hasher>,
    headers_pool: Option<Arc<dyn HeadersPool>>,
    handlers: RwLock<Handlers>,
    span: Span,
}

impl fmt::Debug for InterceptorsContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("InterceptorsContainer")
            .field("raw_topics", &handlers.raw.keys().collect::<Vec<_>>())
            .field("data_topics", &handlers.data.keys().collect::<Vec<_>>())
            .field("headers_pool", &self.headers_pool.is_some())
            .finish()
    }
}

impl InterceptorsContainer {
    /// Create an empty container
    pub fn new(
        marshalizer: Option<Arc<dyn Marshalizer>>,
        hasher: Option<Arc<dyn Hasher>>,
    ) -> SposResult<Self> {
        Ok(Self {
            marshalizer: marshalizer.ok_or(SposError::NilMarshalizer)?,
            hasher: hasher.ok_or(SposError::NilHasher)?,
            headers_pool: None,
            handlers: RwLock::default(),
            span: Span::none(),
        })
    }

    /// Store intercepted headers in `pool`
    pub fn with_headers_pool(mut self, pool: Arc<dyn HeadersPool>) -> Self {
        self.headers_pool = Some(pool);
        self
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Deliver raw payloads of `topic` to `handler`, replacing any previous one
    pub fn register_raw_handler(&self, topic: impl Into<String>, handler: RawHandler) {
        self.handlers.write().raw.insert(topic.into(), handler);
    }

    /// Add a subscriber for decoded data of `topic`
    pub fn register_handler(&self, topic: impl Into<String>, handler: InterceptedDataHandler) {
        self.handlers.write().data.entry(topic.into()).or_default().push(handler);
    }

    /// Handle a publication of `topic` from peer `from`
    pub fn process(&self, topic: &str, payload: &[u8], from: &[u8]) -> SposResult<()> {
        let (raw, subscribers) = {
            let handlers = self.handlers.read();
            (handlers.raw.get(topic).cloned(), handlers.data.get(topic).cloned().unwrap_or_default())
        };
        if let Some(raw) = raw {
            return raw(payload, from);
        }

        let items = self.decode(topic, payload)?;
        for item in &items {
            if let (InterceptedData::Header { hash, header }, Some(pool)) = (item, &self.headers_pool)
            {
                pool.add_header(*hash, header.clone());
            }
            for subscriber in &subscribers {
                subscriber(topic, item);
            }
        }
        trace!(parent: &self.span, topic, items = items.len(), "Intercepted publication");
        Ok(())
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> SposResult<Vec<InterceptedData>> {
        if topic.starts_with(SHARD_BLOCKS_TOPIC) || topic.starts_with(METACHAIN_BLOCKS_TOPIC) {
            let header = self.marshalizer.unmarshal_header(payload)?;
            let hash = header.hash(self.hasher.as_ref());
            return Ok(vec![InterceptedData::Header { hash, header }]);
        }
        if topic.starts_with(MINI_BLOCKS_TOPIC) {
            return Ok(self
                .marshalizer
                .unmarshal_mini_blocks(payload)?
                .into_iter()
                .map(|mini_block| InterceptedData::MiniBlock {
                    hash: rlp_hash(self.hasher.as_ref(), &mini_block),
                    mini_block,
                })
                .collect());
        }
        if topic.starts_with(EQUIVALENT_PROOFS_TOPIC) {
            return Ok(vec![InterceptedData::Proof(self.marshalizer.unmarshal_proof(payload)?)]);
        }
        if topic.starts_with(TRANSACTIONS_TOPIC) {
            self.marshalizer.unmarshal_packet(payload)?;
            return Ok(Vec::new());
        }
        Err(SposError::TopicNotFound(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::BlockBody,
        hashing::{JsonMarshalizer, Keccak256Hasher},
        storage::InMemoryHeadersPool,
    };
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    fn container() -> InterceptorsContainer {
        InterceptorsContainer::new(Some(Arc::new(JsonMarshalizer)), Some(Arc::new(Keccak256Hasher)))
            .unwrap()
    }

    #[test]
    fn test_requires_codec() {
        assert_matches!(
            InterceptorsContainer::new(None, Some(Arc::new(Keccak256Hasher))),
            Err(SposError::NilMarshalizer)
        );
        assert_matches!(
            InterceptorsContainer::new(Some(Arc::new(JsonMarshalizer)), None),
            Err(SposError::NilHasher)
        );
    }

    #[test]
    fn test_headers_reach_pool_and_subscribers() {
        let pool = Arc::new(InMemoryHeadersPool::new());
        let container = container().with_headers_pool(pool.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let topic = format!("{SHARD_BLOCKS_TOPIC}_0_META");
        container.register_handler(
            topic.clone(),
            Arc::new(move |_: &str, data: &InterceptedData| {
                if let InterceptedData::Header { hash, .. } = data {
                    sink.lock().push(*hash);
                }
            }),
        );

        let header = BlockHeader { nonce: 3, ..Default::default() };
        let payload = JsonMarshalizer.marshal_header(&header).unwrap();
        container.process(&topic, &payload, b"peer").unwrap();

        let hash = header.hash(&Keccak256Hasher);
        assert_eq!(seen.lock().as_slice(), &[hash]);
        assert_eq!(pool.get_header_by_hash(&hash).unwrap(), header);
    }

    #[test]
    fn test_mini_blocks_are_split_and_hashed() {
        let container = container();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let topic = format!("{MINI_BLOCKS_TOPIC}_0_1");
        container.register_handler(
            topic.clone(),
            Arc::new(move |_: &str, data: &InterceptedData| {
                if let InterceptedData::MiniBlock { hash, .. } = data {
                    sink.lock().push(*hash);
                }
            }),
        );

        let body = BlockBody {
            mini_blocks: vec![
                MiniBlock { sender_shard_id: 0, receiver_shard_id: 1, tx_hashes: vec![B256::ZERO] },
                MiniBlock { sender_shard_id: 0, receiver_shard_id: 1, tx_hashes: vec![] },
            ],
        };
        let payload = JsonMarshalizer.marshal_mini_blocks(&body.mini_blocks).unwrap();
        container.process(&topic, &payload, b"peer").unwrap();

        let expected: Vec<B256> =
            body.mini_block_headers(&Keccak256Hasher).into_iter().map(|h| h.hash).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn test_unknown_topic_and_bad_payload() {
        let container = container();
        assert_matches!(container.process("unknown", b"{}", b"p"), Err(SposError::TopicNotFound(_)));
        assert_matches!(
            container.process(METACHAIN_BLOCKS_TOPIC, b"not json", b"p"),
            Err(SposError::Codec(_))
        );
    }
}
