//! Test utilities and scenario tests for the SPoS consensus engine

pub mod helpers;
#[cfg(test)]
mod messenger_tests;

// Re-export commonly used test utilities
pub use helpers::{
    mock_genesis_header, mock_header_validator, mock_key, mock_keys, mock_nodes_coordinator,
    mock_signed_proof, mock_spos_config, MockConsensusNetwork,
};
