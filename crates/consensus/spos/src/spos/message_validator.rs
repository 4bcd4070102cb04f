//! Consensus message validation
//!
//! Structural checks run first, then the eligible list and the round window,
//! then the per-key message limits, and the peer signature last.

use crate::{
    constants::{BLS_PUBLIC_KEY_SIZE, BLS_SIGNATURE_SIZE, MEGABYTE},
    errors::{SposError, SposResult},
    hashing::Hasher,
    signing::PeerSignatureHandler,
};
use alloy_primitives::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{trace, Span};

use super::{ConsensusCore, ConsensusMessage, MessageType, SharedConsensusState};

/// Construction arguments for [`ConsensusMessageValidator`]
#[derive(Debug, Default)]
pub struct ConsensusMessageValidatorArgs {
    /// Service defining message limits
    pub consensus_core: ConsensusCore,
    /// Verifies peer signatures
    pub peer_signature_handler: Option<Arc<PeerSignatureHandler>>,
    /// Round and eligible list source
    pub consensus_state: Option<SharedConsensusState>,
    /// Header hash size source
    pub hasher: Option<Arc<dyn Hasher>>,
    /// Expected chain id
    pub chain_id: Bytes,
}

type MessageCounter = HashMap<(Bytes, i64), HashMap<MessageType, u32>>;

/// Validates consensus messages before they reach the engine
#[derive(Debug)]
pub struct ConsensusMessageValidator {
    consensus_core: ConsensusCore,
    peer_signature_handler: Arc<PeerSignatureHandler>,
    consensus_state: SharedConsensusState,
    hasher: Arc<dyn Hasher>,
    chain_id: Bytes,
    counter: Mutex<MessageCounter>,
    span: Span,
}

impl ConsensusMessageValidator {
    /// Create a validator
    pub fn new(args: ConsensusMessageValidatorArgs) -> SposResult<Self> {
        if args.chain_id.is_empty() {
            return Err(SposError::InvalidChainId);
        }
        Ok(Self {
            consensus_core: args.consensus_core,
            peer_signature_handler: args
                .peer_signature_handler
                .ok_or(SposError::NilPeerSignatureHandler)?,
            consensus_state: args.consensus_state.ok_or(SposError::NilConsensusState)?,
            hasher: args.hasher.ok_or(SposError::NilHasher)?,
            chain_id: args.chain_id,
            counter: Mutex::new(HashMap::new()),
            span: Span::none(),
        })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Forget message counts of rounds before `current_round`
    pub fn reset_consensus_messages(&self, current_round: i64) {
        self.counter.lock().retain(|(_, round), _| *round >= current_round);
    }

    /// Check `msg` received from peer `originator`; an accepted message is counted
    pub fn check_consensus_message_validity(
        &self,
        msg: &ConsensusMessage,
        originator: &[u8],
    ) -> SposResult<()> {
        if msg.chain_id != self.chain_id {
            return Err(SposError::InvalidChainId);
        }

        self.check_message_with_type(msg)?;

        if msg.msg_type != MessageType::BlockBody &&
            msg.block_header_hash.len() != self.hasher.size()
        {
            return Err(SposError::InvalidHeaderHashSize(msg.block_header_hash.len()));
        }
        if msg.pub_key.len() != BLS_PUBLIC_KEY_SIZE {
            return Err(SposError::InvalidPublicKeySize(msg.pub_key.len()));
        }
        if msg.signature.len() != BLS_SIGNATURE_SIZE {
            return Err(SposError::InvalidSignatureSize(msg.signature.len()));
        }

        {
            let state = self.consensus_state.read();
            if !state.round_consensus.is_node_in_eligible_list(&msg.pub_key) {
                return Err(SposError::NodeIsNotInEligibleList);
            }
            if msg.round_index > state.round_index + 1 {
                return Err(SposError::MessageForFutureRound(msg.round_index));
            }
            if msg.round_index < state.round_index {
                return Err(SposError::MessageForPastRound(msg.round_index));
            }
            // the leader of the next round is only known once it starts
            if msg.round_index == state.round_index &&
                self.consensus_core.is_leader_only(msg.msg_type) &&
                !state.round_consensus.is_leader(&msg.pub_key)
            {
                return Err(SposError::NotLeader(hex::encode(&msg.pub_key)));
            }
        }

        let limit = self.consensus_core.message_type_limit(msg.msg_type);
        if self.message_count(&msg.pub_key, msg.round_index, msg.msg_type) >= limit {
            trace!(
                parent: &self.span,
                msg_type = %msg.msg_type,
                round = msg.round_index,
                "Message type limit reached"
            );
            return Err(SposError::MessageTypeLimitReached(hex::encode(&msg.pub_key)));
        }

        if msg.originator_pid.as_ref() != originator {
            return Err(SposError::OriginatorMismatch);
        }
        self.peer_signature_handler.verify_peer_signature(
            &msg.pub_key,
            &msg.originator_pid,
            &msg.signature,
        )?;

        self.increment_message_count(&msg.pub_key, msg.round_index, msg.msg_type);
        Ok(())
    }

    fn check_message_with_type(&self, msg: &ConsensusMessage) -> SposResult<()> {
        let invalid = || SposError::InvalidMessage(hex::encode(&msg.pub_key));
        let no_signature_fields = msg.signature_share.is_empty() &&
            msg.pub_keys_bitmap.is_empty() &&
            msg.aggregate_signature.is_empty() &&
            msg.leader_signature.is_empty();
        let no_block_fields = msg.body.is_empty() && msg.header.is_empty();

        match msg.msg_type {
            MessageType::BlockBodyAndHeader | MessageType::BlockBody | MessageType::BlockHeader => {
                if !no_signature_fields || !msg.invalid_signers.is_empty() {
                    return Err(invalid());
                }
                check_payload(msg.msg_type.carries_body(), &msg.body, SposError::InvalidBodySize)?;
                check_payload(
                    msg.msg_type.carries_header(),
                    &msg.header,
                    SposError::InvalidHeaderSize,
                )?;
            }
            MessageType::Signature => {
                if !no_block_fields ||
                    !msg.pub_keys_bitmap.is_empty() ||
                    !msg.aggregate_signature.is_empty() ||
                    !msg.leader_signature.is_empty()
                {
                    return Err(invalid());
                }
                if msg.signature_share.len() != BLS_SIGNATURE_SIZE {
                    return Err(SposError::InvalidSignatureSize(msg.signature_share.len()));
                }
            }
            MessageType::BlockHeaderFinalInfo => {
                if !no_block_fields || !msg.signature_share.is_empty() {
                    return Err(invalid());
                }
                if msg.pub_keys_bitmap.is_empty() {
                    return Err(SposError::InvalidPublicKeyBitmapSize(0));
                }
                if msg.aggregate_signature.len() != BLS_SIGNATURE_SIZE {
                    return Err(SposError::InvalidSignatureSize(msg.aggregate_signature.len()));
                }
                if msg.leader_signature.len() != BLS_SIGNATURE_SIZE {
                    return Err(SposError::InvalidSignatureSize(msg.leader_signature.len()));
                }
            }
            MessageType::InvalidSigners => {
                if !no_block_fields || !no_signature_fields || msg.invalid_signers.is_empty() {
                    return Err(invalid());
                }
            }
        }
        Ok(())
    }

    fn message_count(&self, pub_key: &Bytes, round: i64, msg_type: MessageType) -> u32 {
        self.counter
            .lock()
            .get(&(pub_key.clone(), round))
            .and_then(|per_type| per_type.get(&msg_type).copied())
            .unwrap_or_default()
    }

    fn increment_message_count(&self, pub_key: &Bytes, round: i64, msg_type: MessageType) {
        *self
            .counter
            .lock()
            .entry((pub_key.clone(), round))
            .or_default()
            .entry(msg_type)
            .or_default() += 1;
    }
}

fn check_payload(
    required: bool,
    payload: &Bytes,
    size_error: fn(usize) -> SposError,
) -> SposResult<()> {
    match (required, payload.len()) {
        (true, 0) => Err(size_error(0)),
        (true, len) if len > MEGABYTE => Err(size_error(len)),
        (false, len) if len > 0 => Err(size_error(len)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hashing::Keccak256Hasher,
        signing::KeysHandler,
        spos::ConsensusState,
        tests::helpers::mock_key,
    };
    use assert_matches::assert_matches;
    use hashbrown::HashSet;

    const PID: &[u8] = b"sender-pid";

    struct Fixture {
        validator: ConsensusMessageValidator,
        state: SharedConsensusState,
        sender: Arc<PeerSignatureHandler>,
    }

    fn fixture() -> Fixture {
        let sender_keys = Arc::new(KeysHandler::new(mock_key(1), Bytes::from_static(PID)));
        let sender = Arc::new(PeerSignatureHandler::new(Some(sender_keys.clone()), 16).unwrap());

        let own_keys = Arc::new(KeysHandler::new(mock_key(2), Bytes::from_static(b"own")));
        let eligible = HashSet::from([sender_keys.own_public_key().clone(), own_keys.own_public_key().clone()]);
        let state = ConsensusState::new(eligible, own_keys.own_public_key().clone()).shared();
        state.write().round_index = 10;

        let validator = ConsensusMessageValidator::new(ConsensusMessageValidatorArgs {
            consensus_core: ConsensusCore::default(),
            peer_signature_handler: Some(Arc::new(
                PeerSignatureHandler::new(Some(own_keys), 16).unwrap(),
            )),
            consensus_state: Some(state.clone()),
            hasher: Some(Arc::new(Keccak256Hasher)),
            chain_id: Bytes::from_static(b"1"),
        })
        .unwrap();
        Fixture { validator, state, sender }
    }

    fn signature_message(f: &Fixture, round: i64) -> ConsensusMessage {
        let pub_key = mock_key(1).public_key().clone();
        ConsensusMessage {
            block_header_hash: Bytes::from(vec![7u8; 32]),
            signature_share: Bytes::from(vec![1u8; BLS_SIGNATURE_SIZE]),
            signature: f.sender.get_peer_signature(&pub_key, PID).unwrap(),
            originator_pid: Bytes::from_static(PID),
            ..ConsensusMessage::new(MessageType::Signature, round, Bytes::from_static(b"1"), pub_key)
        }
    }

    #[test]
    fn test_valid_message_accepted_once() {
        let f = fixture();
        let msg = signature_message(&f, 10);
        assert!(f.validator.check_consensus_message_validity(&msg, PID).is_ok());
        assert_matches!(
            f.validator.check_consensus_message_validity(&msg, PID),
            Err(SposError::MessageTypeLimitReached(_))
        );

        f.validator.reset_consensus_messages(11);
        f.state.write().round_index = 11;
        let next = signature_message(&f, 11);
        assert!(f.validator.check_consensus_message_validity(&next, PID).is_ok());
    }

    #[test]
    fn test_round_window() {
        let f = fixture();
        assert!(f.validator.check_consensus_message_validity(&signature_message(&f, 11), PID).is_ok());
        assert_matches!(
            f.validator.check_consensus_message_validity(&signature_message(&f, 12), PID),
            Err(SposError::MessageForFutureRound(12))
        );
        assert_matches!(
            f.validator.check_consensus_message_validity(&signature_message(&f, 9), PID),
            Err(SposError::MessageForPastRound(9))
        );
    }

    #[test]
    fn test_structural_checks() {
        let f = fixture();
        let valid = signature_message(&f, 10);

        let wrong_chain = ConsensusMessage { chain_id: Bytes::from_static(b"2"), ..valid.clone() };
        assert_matches!(
            f.validator.check_consensus_message_validity(&wrong_chain, PID),
            Err(SposError::InvalidChainId)
        );

        let short_hash = ConsensusMessage { block_header_hash: Bytes::from(vec![1u8; 31]), ..valid.clone() };
        assert_matches!(
            f.validator.check_consensus_message_validity(&short_hash, PID),
            Err(SposError::InvalidHeaderHashSize(31))
        );

        let short_key = ConsensusMessage { pub_key: Bytes::from(vec![1u8; 47]), ..valid.clone() };
        assert_matches!(
            f.validator.check_consensus_message_validity(&short_key, PID),
            Err(SposError::InvalidPublicKeySize(47))
        );

        let with_body = ConsensusMessage { body: Bytes::from_static(b"body"), ..valid.clone() };
        assert_matches!(
            f.validator.check_consensus_message_validity(&with_body, PID),
            Err(SposError::InvalidMessage(_))
        );

        let oversized = ConsensusMessage {
            msg_type: MessageType::BlockBody,
            signature_share: Bytes::new(),
            body: Bytes::from(vec![0u8; MEGABYTE + 1]),
            ..valid.clone()
        };
        assert_matches!(
            f.validator.check_consensus_message_validity(&oversized, PID),
            Err(SposError::InvalidBodySize(_))
        );

        let stranger = mock_key(9).public_key().clone();
        let not_eligible = ConsensusMessage { pub_key: stranger, ..valid };
        assert_matches!(
            f.validator.check_consensus_message_validity(&not_eligible, PID),
            Err(SposError::NodeIsNotInEligibleList)
        );
    }

    #[test]
    fn test_leader_only_messages_of_current_round() {
        let f = fixture();
        let sender_key = mock_key(1).public_key().clone();
        let own_key = mock_key(2).public_key().clone();
        let header_message = |round| ConsensusMessage {
            msg_type: MessageType::BlockHeader,
            signature_share: Bytes::new(),
            header: Bytes::from_static(b"header"),
            ..signature_message(&f, round)
        };
        f.state
            .write()
            .round_consensus
            .set_consensus_group(vec![own_key.clone(), sender_key.clone()], own_key);

        assert_matches!(
            f.validator.check_consensus_message_validity(&header_message(10), PID),
            Err(SposError::NotLeader(_))
        );
        assert!(f.validator.check_consensus_message_validity(&signature_message(&f, 10), PID).is_ok());
        assert!(f.validator.check_consensus_message_validity(&header_message(11), PID).is_ok());

        f.state.write().round_consensus.set_consensus_group(vec![sender_key.clone()], sender_key);
        assert!(f.validator.check_consensus_message_validity(&header_message(10), PID).is_ok());
    }

    #[test]
    fn test_originator_and_peer_signature() {
        let f = fixture();
        let valid = signature_message(&f, 10);
        assert_matches!(
            f.validator.check_consensus_message_validity(&valid, b"someone-else"),
            Err(SposError::OriginatorMismatch)
        );

        let forged = ConsensusMessage {
            signature: Bytes::from(mock_key(3).sign(PID).to_vec()),
            ..valid
        };
        assert_matches!(
            f.validator.check_consensus_message_validity(&forged, PID),
            Err(SposError::InvalidSignature)
        );
    }
}
