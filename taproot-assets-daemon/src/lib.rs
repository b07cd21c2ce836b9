//! Minting and transfer state machines for Taproot Assets.
//!
//! Two long-lived actors run here: the chain planter batches minting
//! requests and walks each batch through a crash-recoverable genesis
//! pipeline, and the chain porter ships outbound asset parcels, anchoring
//! them into Bitcoin transactions. Both talk to their collaborators (chain
//! backend, wallet, key ring, stores, proof archive) exclusively through
//! the capability traits in [`chain`] and [`wallet`].

pub mod chain;
pub mod freighter;
pub mod garden;
pub mod mock;
pub mod wallet;

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the daemon subsystems. Transient backend failures
/// are retried with exponential backoff inside the actor loops; all other
/// errors surface to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The chain backend failed; retried locally.
    #[error("chain backend unavailable: {0}")]
    ChainBackendUnavailable(String),

    /// The wallet failed; retried locally.
    #[error("wallet unavailable: {0}")]
    WalletUnavailable(String),

    /// The durable store failed; retried locally.
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// A seedling referenced a group anchor in an empty batch.
    #[error("batch empty, group anchor \"{0}\" unusable")]
    BatchEmpty(String),

    /// The referenced group anchor seedling is missing from the batch.
    #[error("group anchor \"{0}\" not present in batch")]
    GroupAnchorMissing(String),

    /// The referenced group anchor seedling cannot issue new assets.
    #[error("group anchor \"{0}\" has emission disabled")]
    GroupAnchorEmissionDisabled(String),

    /// A seedling with the same name is already queued.
    #[error("seedling \"{0}\" already in batch")]
    SeedlingNameInUse(String),

    /// The batch has already been broadcast and can no longer be
    /// cancelled.
    #[error("batch not cancellable")]
    BatchNotCancellable,

    /// No batch is currently pending.
    #[error("no pending batch")]
    NoPendingBatch,

    /// Coin selection could not satisfy the requested constraints; the
    /// transfer terminates.
    #[error("failed to find coin(s) which satisfy given constraints")]
    MatchingAssetsNotFound,

    /// A proof failed to build or verify; fatal, does not advance state.
    #[error("proof invalid: {0}")]
    ProofInvalid(String),

    /// An address failed to decode.
    #[error(transparent)]
    Address(#[from] taproot_assets_types::address::AddressError),

    /// A core engine operation failed.
    #[error(transparent)]
    Core(taproot_assets_core::Error),

    /// A virtual packet operation failed.
    #[error(transparent)]
    Packet(#[from] taproot_assets_psbt::VPacketError),

    /// A wire encoding operation failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] taproot_assets_types::error::Error),

    /// The actor was shut down or an internal channel closed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors that are retried with backoff on the actor
    /// loop rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ChainBackendUnavailable(_)
                | Error::WalletUnavailable(_)
                | Error::StoreFailure(_)
        )
    }
}

impl From<taproot_assets_core::commitment::CommitmentError> for Error {
    fn from(err: taproot_assets_core::commitment::CommitmentError) -> Self {
        Error::Core(err.into())
    }
}

impl From<taproot_assets_core::split::SplitError> for Error {
    fn from(err: taproot_assets_core::split::SplitError) -> Self {
        Error::Core(err.into())
    }
}

impl From<taproot_assets_core::vm::VmError> for Error {
    fn from(err: taproot_assets_core::vm::VmError) -> Self {
        Error::Core(err.into())
    }
}

impl From<taproot_assets_core::proof::ProofError> for Error {
    fn from(err: taproot_assets_core::proof::ProofError) -> Self {
        Error::ProofInvalid(err.to_string())
    }
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum attempts for transient backend failures.
const MAX_RETRIES: u32 = 5;

/// Runs an operation, retrying transient failures with exponential
/// backoff.
pub(crate) async fn retry_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                log::warn!(
                    "{}: transient failure (attempt {}/{}): {}",
                    label,
                    attempt,
                    MAX_RETRIES,
                    err
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}
