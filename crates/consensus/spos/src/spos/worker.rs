//! Entry point for consensus messages received from the network

use crate::{
    errors::{SposError, SposResult},
    hashing::{Hasher, Marshalizer},
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn, Span};

use super::{ConsensusMessage, ConsensusMessageValidator, SharedConsensusState};

/// Construction arguments for [`Worker`]
#[derive(Debug, Default)]
pub struct WorkerArgs {
    /// Decodes payloads and proposal headers
    pub marshalizer: Option<Arc<dyn Marshalizer>>,
    /// Recomputes proposal header hashes
    pub hasher: Option<Arc<dyn Hasher>>,
    /// Validates decoded messages
    pub message_validator: Option<Arc<ConsensusMessageValidator>>,
    /// Records received proposals
    pub consensus_state: Option<SharedConsensusState>,
    /// Inbox of the running round
    pub sender: Option<UnboundedSender<ConsensusMessage>>,
}

/// Decodes, validates and forwards consensus messages
#[derive(Debug)]
pub struct Worker {
    marshalizer: Arc<dyn Marshalizer>,
    hasher: Arc<dyn Hasher>,
    message_validator: Arc<ConsensusMessageValidator>,
    consensus_state: SharedConsensusState,
    sender: UnboundedSender<ConsensusMessage>,
    span: Span,
}

impl Worker {
    /// Create a worker
    pub fn new(args: WorkerArgs) -> SposResult<Self> {
        Ok(Self {
            marshalizer: args.marshalizer.ok_or(SposError::NilMarshalizer)?,
            hasher: args.hasher.ok_or(SposError::NilHasher)?,
            message_validator: args.message_validator.ok_or(SposError::NilMessageValidator)?,
            consensus_state: args.consensus_state.ok_or(SposError::NilConsensusState)?,
            sender: args.sender.ok_or(SposError::NilChannel)?,
            span: Span::none(),
        })
    }

    /// Attach a tracing span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Handle a payload received on the consensus topic from peer `from`
    ///
    /// Proposals of the running round must come from its leader. A second,
    /// different proposal for a round already holding one is rejected with
    /// [`SposError::LowerRoundInBlock`]. Proposals of the next round are
    /// forwarded unrecorded; the engine checks them once that round started.
    pub fn process_received_message(&self, payload: &[u8], from: &[u8]) -> SposResult<()> {
        let msg = self.marshalizer.unmarshal_message(payload)?;
        self.message_validator.check_consensus_message_validity(&msg, from)?;

        if msg.msg_type.carries_header() {
            let header = self.marshalizer.unmarshal_header(&msg.header)?;
            let hash = header.hash(self.hasher.as_ref());
            if hash.as_slice() != msg.block_header_hash.as_ref() {
                return Err(SposError::InvalidMessage(hex::encode(&msg.pub_key)));
            }

            let mut state = self.consensus_state.write();
            if msg.round_index == state.round_index && !state.add_received_header(msg.round_index, hash)
            {
                warn!(
                    parent: &self.span,
                    round = msg.round_index,
                    header_hash = %hash,
                    pub_key = %hex::encode(&msg.pub_key),
                    "Received a second header for the same round"
                );
                return Err(SposError::LowerRoundInBlock);
            }
        }

        trace!(
            parent: &self.span,
            msg_type = %msg.msg_type,
            round = msg.round_index,
            pub_key = %hex::encode(&msg.pub_key),
            "Received consensus message"
        );
        self.sender.send(msg).map_err(|_| SposError::ChannelClosed)
    }
}
