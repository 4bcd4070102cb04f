//! SPoS consensus core
//!
//! Messages arrive through the [`Worker`], which validates them with the
//! [`ConsensusMessageValidator`] and forwards them to the [`SposConsensus`]
//! engine running the current round. Both share a single
//! [`ConsensusState`].

mod engine;
mod message;
mod message_validator;
mod service;
mod state;
mod worker;

pub use engine::{ConsensusStats, RoundOutcome, SposConsensus, SposConsensusArgs};
pub use message::{leader_signed_payload, ConsensusMessage, MessageType};
pub use message_validator::{ConsensusMessageValidator, ConsensusMessageValidatorArgs};
pub use service::{BlsConsensusService, ConsensusCore, Subround};
pub use state::{ConsensusState, RoundConsensus, SharedConsensusState, SubroundStatus};
pub use worker::{Worker, WorkerArgs};
