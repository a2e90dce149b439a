//! Zcash network parameters and constants
//!
//! This crate provides network-specific constants, network upgrade activation
//! heights and consensus branch IDs used by the light-client sync engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consensus;
pub mod network;

pub use consensus::{BranchId, NetworkUpgrade};
pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Invalid block height
    #[error("Invalid block height: {0}")]
    InvalidHeight(u64),

    /// Consensus branch ID could not be parsed
    #[error("Invalid consensus branch ID: {0}")]
    InvalidBranchId(String),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
