//! Storage and headers pool collaborators
//!
//! Both are consumed through narrow traits. The in-memory implementations back
//! the tests and the simulator.

use crate::{
    block::BlockHeader,
    errors::{SposError, SposResult},
};
use alloy_primitives::{Bytes, B256};
use core::fmt;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Storage units addressed by the consensus core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitType {
    /// Shard block headers
    BlockHeader,
    /// Metachain block headers
    MetaBlock,
    /// Miniblocks
    MiniBlock,
    /// Header proofs
    Proofs,
}

impl UnitType {
    /// Unit holding headers produced by `shard_id`
    pub const fn for_headers_of(shard_id: u32) -> Self {
        if shard_id == crate::constants::METACHAIN_SHARD_ID {
            Self::MetaBlock
        } else {
            Self::BlockHeader
        }
    }
}

/// Key-value storage service
pub trait Storer: Send + Sync + fmt::Debug {
    /// Value stored under `key` in `unit`
    fn get(&self, unit: UnitType, key: &[u8]) -> SposResult<Bytes>;

    /// Store `value` under `key` in `unit`
    fn put(&self, unit: UnitType, key: &[u8], value: Bytes) -> SposResult<()>;

    /// Whether `key` exists in `unit`
    fn has(&self, unit: UnitType, key: &[u8]) -> bool;
}

/// In-memory storage service
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    units: RwLock<HashMap<UnitType, HashMap<Bytes, Bytes>>>,
}

impl InMemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in `unit`
    pub fn len(&self, unit: UnitType) -> usize {
        self.units.read().get(&unit).map_or(0, |entries| entries.len())
    }

    /// Whether `unit` has no entries
    pub fn is_empty(&self, unit: UnitType) -> bool {
        self.len(unit) == 0
    }
}

impl Storer for InMemoryStorage {
    fn get(&self, unit: UnitType, key: &[u8]) -> SposResult<Bytes> {
        self.units
            .read()
            .get(&unit)
            .and_then(|entries| entries.get(&Bytes::copy_from_slice(key)))
            .cloned()
            .ok_or_else(|| SposError::KeyNotFound(format!("{unit:?}")))
    }

    fn put(&self, unit: UnitType, key: &[u8], value: Bytes) -> SposResult<()> {
        self.units.write().entry(unit).or_default().insert(Bytes::copy_from_slice(key), value);
        Ok(())
    }

    fn has(&self, unit: UnitType, key: &[u8]) -> bool {
        self.units
            .read()
            .get(&unit)
            .is_some_and(|entries| entries.contains_key(&Bytes::copy_from_slice(key)))
    }
}

/// Callback invoked for every header added to a pool
pub type HeaderHandler = Arc<dyn Fn(&BlockHeader, B256) + Send + Sync>;

/// Pool of received headers
pub trait HeadersPool: Send + Sync + fmt::Debug {
    /// Header stored under `hash`
    fn get_header_by_hash(&self, hash: &B256) -> SposResult<BlockHeader>;

    /// Add a header and notify subscribers
    fn add_header(&self, hash: B256, header: BlockHeader);

    /// Subscribe to added headers
    fn register_handler(&self, handler: HeaderHandler);
}

#[derive(Default)]
struct PoolState {
    headers: HashMap<B256, BlockHeader>,
    handlers: Vec<HeaderHandler>,
}

/// In-memory headers pool
#[derive(Default)]
pub struct InMemoryHeadersPool {
    state: RwLock<PoolState>,
}

impl InMemoryHeadersPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of headers in the pool
    pub fn len(&self) -> usize {
        self.state.read().headers.len()
    }

    /// Whether the pool holds no headers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InMemoryHeadersPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryHeadersPool")
            .field("headers", &state.headers.len())
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

impl HeadersPool for InMemoryHeadersPool {
    fn get_header_by_hash(&self, hash: &B256) -> SposResult<BlockHeader> {
        self.state.read().headers.get(hash).cloned().ok_or(SposError::MissingHeader)
    }

    fn add_header(&self, hash: B256, header: BlockHeader) {
        let handlers = {
            let mut state = self.state.write();
            state.headers.insert(hash, header.clone());
            state.handlers.clone()
        };
        for handler in handlers {
            handler(&header, hash);
        }
    }

    fn register_handler(&self, handler: HeaderHandler) {
        self.state.write().handlers.push(handler);
    }
}
