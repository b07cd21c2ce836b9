//! Commitment engine, virtual-transaction VM and proof builder for the
//! Taproot Assets protocol.

pub mod commitment;
pub mod proof;
pub mod split;
pub mod vm;

pub use commitment::{AssetCommitment, TapCommitment};

use thiserror::Error;

/// Errors returned by the core engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Commitment(#[from] commitment::CommitmentError),

    #[error(transparent)]
    Split(#[from] split::SplitError),

    #[error(transparent)]
    Vm(#[from] vm::VmError),

    #[error(transparent)]
    Proof(#[from] proof::ProofError),

    #[error("encoding error: {0}")]
    Encoding(#[from] taproot_assets_types::error::Error),
}

/// Result type for core engine operations.
pub type Result<T> = core::result::Result<T, Error>;
