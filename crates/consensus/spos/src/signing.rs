//! BLS12-381 keys, peer signatures and multi-signature aggregation
//!
//! Keys are min-pk: 48-byte compressed public keys in G1 and 96-byte
//! compressed signatures in G2. All consensus signatures share one domain
//! separation tag, [`BLS_DST`].

use crate::{
    bitmap_len,
    constants::{BLS_DST, BLS_PUBLIC_KEY_SIZE},
    errors::{SposError, SposResult},
    is_bit_set,
};
use alloy_primitives::Bytes;
use blst::{
    min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature},
    BLST_ERROR,
};
use core::{fmt, num::NonZeroUsize};
use hashbrown::HashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use rayon::prelude::*;
use std::sync::Arc;

/// BLS secret key with its compressed public key
pub struct BlsKeyPair {
    secret: SecretKey,
    public: Bytes,
}

impl BlsKeyPair {
    /// Random key pair
    pub fn generate() -> SposResult<Self> {
        let mut ikm = [0u8; 32];
        rand::rng().fill_bytes(&mut ikm);
        Self::from_seed(&ikm)
    }

    /// Key pair derived from at least 32 bytes of keying material
    pub fn from_seed(ikm: &[u8]) -> SposResult<Self> {
        let secret = SecretKey::key_gen(ikm, &[]).map_err(|_| SposError::InvalidPrivateKey)?;
        let public = Bytes::copy_from_slice(&secret.sk_to_pk().to_bytes());
        Ok(Self { secret, public })
    }

    /// Compressed public key
    pub const fn public_key(&self) -> &Bytes {
        &self.public
    }

    /// Sign `message`
    pub fn sign(&self, message: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&self.secret.sign(message, BLS_DST, &[]).to_bytes())
    }
}

impl fmt::Debug for BlsKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

fn parse_public_key(pub_key: &[u8]) -> SposResult<PublicKey> {
    if pub_key.len() != BLS_PUBLIC_KEY_SIZE {
        return Err(SposError::InvalidPublicKeySize(pub_key.len()));
    }
    PublicKey::from_bytes(pub_key).map_err(|_| SposError::InvalidPublicKey)
}

fn parse_signature(signature: &[u8]) -> SposResult<Signature> {
    Signature::from_bytes(signature).map_err(|_| SposError::InvalidSignature)
}

/// Verify a single signature
pub fn verify_signature(pub_key: &[u8], message: &[u8], signature: &[u8]) -> SposResult<()> {
    let pk = parse_public_key(pub_key)?;
    let sig = parse_signature(signature)?;
    match sig.verify(true, message, BLS_DST, &[], &pk, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(SposError::InvalidSignature),
    }
}

/// Aggregate signatures over the same message
pub fn aggregate_signatures(signatures: &[Bytes]) -> SposResult<Bytes> {
    if signatures.is_empty() {
        return Err(SposError::InsufficientSignatures { have: 0, need: 1 });
    }
    let parsed = signatures.iter().map(|s| parse_signature(s)).collect::<SposResult<Vec<_>>>()?;
    let refs: Vec<&Signature> = parsed.iter().collect();
    let aggregated =
        AggregateSignature::aggregate(&refs, false).map_err(|_| SposError::InvalidSignature)?;
    Ok(Bytes::copy_from_slice(&aggregated.to_signature().to_bytes()))
}

/// Verify an aggregated signature of `pub_keys` over `message`
pub fn verify_aggregated_signature(
    pub_keys: &[Bytes],
    message: &[u8],
    aggregated: &[u8],
) -> SposResult<()> {
    if pub_keys.is_empty() {
        return Err(SposError::InsufficientSignatures { have: 0, need: 1 });
    }
    let parsed = pub_keys.iter().map(|pk| parse_public_key(pk)).collect::<SposResult<Vec<_>>>()?;
    let refs: Vec<&PublicKey> = parsed.iter().collect();
    let aggregated_key =
        AggregatePublicKey::aggregate(&refs, true).map_err(|_| SposError::InvalidPublicKey)?;
    let sig = parse_signature(aggregated)?;
    match sig.verify(true, message, BLS_DST, &[], &aggregated_key.to_public_key(), false) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(SposError::InvalidSignature),
    }
}

#[derive(Debug)]
struct ManagedKey {
    key: Arc<BlsKeyPair>,
    pid: Bytes,
}

/// Keys this node signs with
///
/// The original key belongs to the node itself. Managed keys are extra
/// validator keys hosted by the node; their messages go out under their own
/// peer ids.
#[derive(Debug)]
pub struct KeysHandler {
    own: Arc<BlsKeyPair>,
    own_pid: Bytes,
    managed: HashMap<Bytes, ManagedKey>,
}

impl KeysHandler {
    /// Handler for the node's own key and peer id
    pub fn new(own: BlsKeyPair, own_pid: Bytes) -> Self {
        Self { own: Arc::new(own), own_pid, managed: HashMap::new() }
    }

    /// Host an additional validator key
    pub fn with_managed_key(mut self, key: BlsKeyPair, pid: Bytes) -> Self {
        self.managed.insert(key.public_key().clone(), ManagedKey { key: Arc::new(key), pid });
        self
    }

    /// Public key of the node itself
    pub fn own_public_key(&self) -> &Bytes {
        self.own.public_key()
    }

    /// Peer id of the node itself
    pub const fn own_pid(&self) -> &Bytes {
        &self.own_pid
    }

    /// Whether `pub_key` is the node's own key
    pub fn is_original_public_key(&self, pub_key: &[u8]) -> bool {
        self.own.public_key().as_ref() == pub_key
    }

    /// Whether this node can sign for `pub_key`
    pub fn is_key_managed_by_current_node(&self, pub_key: &[u8]) -> bool {
        self.is_original_public_key(pub_key) ||
            self.managed.contains_key(&Bytes::copy_from_slice(pub_key))
    }

    /// Key pair for `pub_key`
    pub fn key_pair(&self, pub_key: &[u8]) -> Option<&Arc<BlsKeyPair>> {
        if self.is_original_public_key(pub_key) {
            return Some(&self.own);
        }
        self.managed.get(&Bytes::copy_from_slice(pub_key)).map(|managed| &managed.key)
    }

    /// Peer id messages for `pub_key` are sent under
    pub fn pid_for(&self, pub_key: &[u8]) -> Bytes {
        self.managed
            .get(&Bytes::copy_from_slice(pub_key))
            .map_or_else(|| self.own_pid.clone(), |managed| managed.pid.clone())
    }

    /// Hosted keys besides the original one
    pub fn managed_public_keys(&self) -> Vec<Bytes> {
        self.managed.keys().cloned().collect()
    }
}

/// Signs and verifies peer ids with validator keys
#[derive(Debug)]
pub struct PeerSignatureHandler {
    keys: Arc<KeysHandler>,
    verified: Mutex<LruCache<Bytes, (Bytes, Bytes)>>,
}

impl PeerSignatureHandler {
    /// Create a handler remembering up to `cache_size` verified signatures
    pub fn new(keys: Option<Arc<KeysHandler>>, cache_size: usize) -> SposResult<Self> {
        let keys = keys.ok_or(SposError::NilKeysHandler)?;
        let cache_size = NonZeroUsize::new(cache_size).ok_or(SposError::InvalidCacheSize)?;
        Ok(Self { keys, verified: Mutex::new(LruCache::new(cache_size)) })
    }

    /// Signature of `pid` by the key behind `pub_key`
    pub fn get_peer_signature(&self, pub_key: &[u8], pid: &[u8]) -> SposResult<Bytes> {
        let key = self.keys.key_pair(pub_key).ok_or(SposError::InvalidPrivateKey)?;
        Ok(key.sign(pid))
    }

    /// Check that `signature` is `pub_key` signing `pid`
    pub fn verify_peer_signature(
        &self,
        pub_key: &[u8],
        pid: &[u8],
        signature: &[u8],
    ) -> SposResult<()> {
        if pub_key.is_empty() {
            return Err(SposError::InvalidPublicKey);
        }
        if pid.is_empty() {
            return Err(SposError::OriginatorMismatch);
        }
        if signature.is_empty() {
            return Err(SposError::InvalidSignature);
        }

        let cache_key = Bytes::copy_from_slice(pub_key);
        if let Some((cached_pid, cached_sig)) = self.verified.lock().get(&cache_key) {
            if cached_pid.as_ref() == pid && cached_sig.as_ref() == signature {
                return Ok(());
            }
        }

        verify_signature(pub_key, pid, signature)?;
        self.verified
            .lock()
            .put(cache_key, (Bytes::copy_from_slice(pid), Bytes::copy_from_slice(signature)));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SigningState {
    pub_keys: Vec<Bytes>,
    shares: Vec<Option<Bytes>>,
    aggregated: Option<Bytes>,
}

/// Collects signature shares of one consensus group and aggregates them
#[derive(Debug)]
pub struct SigningHandler {
    keys: Arc<KeysHandler>,
    state: Mutex<SigningState>,
}

impl SigningHandler {
    /// Create a handler for the group `pub_keys`
    pub fn new(keys: Option<Arc<KeysHandler>>, pub_keys: Vec<Bytes>) -> SposResult<Self> {
        let keys = keys.ok_or(SposError::NilKeysHandler)?;
        let handler = Self { keys, state: Mutex::new(SigningState::default()) };
        handler.reset(pub_keys);
        Ok(handler)
    }

    /// Start over for a new consensus group
    pub fn reset(&self, pub_keys: Vec<Bytes>) {
        let mut state = self.state.lock();
        state.shares = vec![None; pub_keys.len()];
        state.pub_keys = pub_keys;
        state.aggregated = None;
    }

    /// Sign `message` as group member `index` holding `pub_key`, keeping the share
    pub fn create_signature_share_for_public_key(
        &self,
        message: &[u8],
        index: usize,
        pub_key: &[u8],
    ) -> SposResult<Bytes> {
        let key = self.keys.key_pair(pub_key).ok_or(SposError::InvalidPrivateKey)?;
        let mut state = self.state.lock();
        if index >= state.pub_keys.len() {
            return Err(SposError::InvalidIndex(index));
        }
        let share = key.sign(message);
        state.shares[index] = Some(share.clone());
        Ok(share)
    }

    /// Verify the share of group member `index`
    pub fn verify_signature_share(
        &self,
        index: usize,
        signature: &[u8],
        message: &[u8],
    ) -> SposResult<()> {
        let pub_key = {
            let state = self.state.lock();
            state.pub_keys.get(index).cloned().ok_or(SposError::InvalidIndex(index))?
        };
        verify_signature(&pub_key, message, signature)
    }

    /// Keep the share of group member `index`
    pub fn store_signature_share(&self, index: usize, signature: Bytes) -> SposResult<()> {
        let mut state = self.state.lock();
        let slot = state.shares.get_mut(index).ok_or(SposError::InvalidIndex(index))?;
        *slot = Some(signature);
        Ok(())
    }

    /// Share of group member `index`
    pub fn signature_share(&self, index: usize) -> SposResult<Bytes> {
        let state = self.state.lock();
        match state.shares.get(index) {
            None => Err(SposError::InvalidIndex(index)),
            Some(None) => Err(SposError::NilSignatureShare(index)),
            Some(Some(share)) => Ok(share.clone()),
        }
    }

    /// Number of stored shares
    pub fn shares_count(&self) -> usize {
        self.state.lock().shares.iter().filter(|s| s.is_some()).count()
    }

    /// Bitmap of members with a stored share
    pub fn shares_bitmap(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut bitmap = vec![0u8; bitmap_len(state.pub_keys.len())];
        for (index, share) in state.shares.iter().enumerate() {
            if share.is_some() {
                crate::set_bit(&mut bitmap, index);
            }
        }
        bitmap
    }

    /// Aggregate the shares of the members set in `bitmap` and keep the result
    pub fn aggregate_sigs(&self, bitmap: &[u8]) -> SposResult<Bytes> {
        if bitmap.is_empty() {
            return Err(SposError::NilBitmap);
        }
        let mut state = self.state.lock();
        if bitmap.len() < bitmap_len(state.pub_keys.len()) {
            return Err(SposError::InvalidPublicKeyBitmapSize(bitmap.len()));
        }

        let mut shares = Vec::new();
        for index in (0..state.pub_keys.len()).filter(|i| is_bit_set(bitmap, *i)) {
            let share = state.shares[index].clone().ok_or(SposError::NilSignatureShare(index))?;
            shares.push(share);
        }

        let aggregated = aggregate_signatures(&shares)?;
        state.aggregated = Some(aggregated.clone());
        Ok(aggregated)
    }

    /// Keep an aggregated signature received from the leader
    pub fn set_aggregated_sig(&self, aggregated: Bytes) {
        self.state.lock().aggregated = Some(aggregated);
    }

    /// Verify the kept aggregated signature for the members set in `bitmap`
    pub fn verify(&self, message: &[u8], bitmap: &[u8]) -> SposResult<()> {
        let (pub_keys, aggregated) = {
            let state = self.state.lock();
            let aggregated = state.aggregated.clone().ok_or(SposError::InvalidSignature)?;
            let pub_keys: Vec<Bytes> = state
                .pub_keys
                .iter()
                .enumerate()
                .filter(|(i, _)| is_bit_set(bitmap, *i))
                .map(|(_, pk)| pk.clone())
                .collect();
            (pub_keys, aggregated)
        };
        verify_aggregated_signature(&pub_keys, message, &aggregated)
    }

    /// Indexes of stored shares that do not verify over `message`
    pub fn invalid_signers(&self, message: &[u8]) -> Vec<usize> {
        let stored: Vec<(usize, Bytes, Bytes)> = {
            let state = self.state.lock();
            state
                .shares
                .iter()
                .enumerate()
                .filter_map(|(i, share)| {
                    share.as_ref().map(|s| (i, state.pub_keys[i].clone(), s.clone()))
                })
                .collect()
        };

        stored
            .par_iter()
            .filter(|(_, pub_key, share)| verify_signature(pub_key, message, share).is_err())
            .map(|(index, _, _)| *index)
            .collect()
    }
}
