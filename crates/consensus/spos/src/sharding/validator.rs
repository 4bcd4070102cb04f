//! Validator entry of the nodes registry

use crate::errors::{SposError, SposResult};
use alloy_primitives::Bytes;

/// Validator in an epoch's registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Validator {
    pub_key: Bytes,
    chances: u32,
    index: u32,
}

impl Validator {
    /// Create a validator with selection weight `chances`
    pub fn new(pub_key: Bytes, chances: u32, index: u32) -> SposResult<Self> {
        if pub_key.is_empty() {
            return Err(SposError::InvalidPublicKey);
        }
        Ok(Self { pub_key, chances, index })
    }

    /// BLS public key
    pub const fn pub_key(&self) -> &Bytes {
        &self.pub_key
    }

    /// Selection weight
    pub const fn chances(&self) -> u32 {
        self.chances
    }

    /// Position in the shard's eligible list
    pub const fn index(&self) -> u32 {
        self.index
    }
}
