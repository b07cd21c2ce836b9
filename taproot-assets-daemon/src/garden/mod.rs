//! The minting pipeline: seedlings, batches and their durable state.

mod caretaker;
mod planter;

pub use caretaker::GENESIS_AMT_SATS;
pub use planter::{CancelBatchResult, ChainPlanter, PlanterConfig};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{BlockHash, Transaction};

use taproot_assets_core::commitment::TapCommitment;
use taproot_assets_psbt::KeyDescriptor;
use taproot_assets_types::address::ChainParams;
use taproot_assets_types::asset::{Asset, AssetType};
use taproot_assets_types::proof::MetaReveal;

use crate::chain::ChainBridge;
use crate::wallet::{FundedPsbt, GenSigner, KeyRing, ProofArchive, WalletAnchor};
use crate::{Error, Result};

/// A minting request: what to call the asset, how much of it to create and
/// whether future re-issuance (emission) should be possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seedling {
    /// The type of asset to mint.
    pub asset_type: AssetType,
    /// The name/tag of the asset, unique within its batch.
    pub name: String,
    /// The meta data committed to by the genesis.
    pub meta: MetaReveal,
    /// Units to mint. Always 1 for collectibles.
    pub amount: u64,
    /// Whether a group key should be created, enabling future re-issuance.
    pub enable_emission: bool,
    /// Name of another seedling in the same batch whose group this asset
    /// should join.
    pub group_anchor: Option<String>,
}

/// The lifecycle states of a minting batch. Transitions are strictly
/// monotonic except for the two cancellation branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    /// The batch is accepting seedlings.
    Pending,
    /// The batch is frozen, a caretaker owns it now.
    Frozen,
    /// Assets are sprouted and committed to the genesis output.
    Committed,
    /// The genesis transaction has been broadcast.
    Broadcast,
    /// The genesis transaction is confirmed.
    Confirmed,
    /// Proofs are emitted, the batch is done.
    Finalized,
    /// The batch was cancelled before it was frozen.
    SeedlingCancelled,
    /// The batch was cancelled after freezing but before broadcast.
    SproutCancelled,
    /// A caretaker hit a fatal error; durable records are kept.
    Failed,
}

impl BatchState {
    /// Returns true for states that no caretaker will ever advance again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Finalized
                | BatchState::SeedlingCancelled
                | BatchState::SproutCancelled
                | BatchState::Failed
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Pending => "pending",
            BatchState::Frozen => "frozen",
            BatchState::Committed => "committed",
            BatchState::Broadcast => "broadcast",
            BatchState::Confirmed => "confirmed",
            BatchState::Finalized => "finalized",
            BatchState::SeedlingCancelled => "seedling_cancelled",
            BatchState::SproutCancelled => "sprout_cancelled",
            BatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One batch of seedlings riding a single genesis transaction. The batch
/// key doubles as the taproot internal key of the genesis output.
#[derive(Debug, Clone)]
pub struct MintingBatch {
    /// The key identifying the batch and anchoring its genesis output.
    pub batch_key: KeyDescriptor,
    /// Current lifecycle state.
    pub state: BatchState,
    /// The queued minting requests, keyed by name.
    pub seedlings: BTreeMap<String, Seedling>,
    /// The funded (and later signed) genesis PSBT.
    pub genesis_packet: Option<FundedPsbt>,
    /// The sprouted assets, set once the batch is committed.
    pub sprouted_assets: Vec<Asset>,
    /// The commitment the genesis output pays to.
    pub root_commitment: Option<TapCommitment>,
    /// The fully signed genesis transaction.
    pub final_tx: Option<Transaction>,
    /// Block height recorded before broadcast, used as the confirmation
    /// scan hint.
    pub height_hint: u32,
}

impl MintingBatch {
    pub fn new(batch_key: KeyDescriptor) -> Self {
        MintingBatch {
            batch_key,
            state: BatchState::Pending,
            seedlings: BTreeMap::new(),
            genesis_packet: None,
            sprouted_assets: Vec::new(),
            root_commitment: None,
            final_tx: None,
            height_hint: 0,
        }
    }

    /// Validates a new seedling against the batch contents.
    pub fn validate_seedling(&self, seedling: &Seedling) -> Result<()> {
        if self.seedlings.contains_key(&seedling.name) {
            return Err(Error::SeedlingNameInUse(seedling.name.clone()));
        }

        if let Some(anchor_name) = &seedling.group_anchor {
            if self.seedlings.is_empty() {
                return Err(Error::BatchEmpty(anchor_name.clone()));
            }
            let anchor = self
                .seedlings
                .get(anchor_name)
                .ok_or_else(|| Error::GroupAnchorMissing(anchor_name.clone()))?;
            if !anchor.enable_emission {
                return Err(Error::GroupAnchorEmissionDisabled(anchor_name.clone()));
            }
        }

        Ok(())
    }

    /// The serialized batch key, used as the durable identifier.
    pub fn key_bytes(&self) -> [u8; 33] {
        self.batch_key.pub_key.serialize()
    }
}

/// The collaborators every part of the minting pipeline needs.
#[derive(Clone)]
pub struct GardenKit {
    /// The wallet funding and signing genesis transactions.
    pub wallet: Arc<dyn WalletAnchor>,
    /// The chain backend for fees, broadcast and confirmations.
    pub chain_bridge: Arc<dyn ChainBridge>,
    /// The durable minting log.
    pub log: Arc<dyn MintingStore>,
    /// Derives batch, script and group keys.
    pub key_ring: Arc<dyn KeyRing>,
    /// Signs group key derivations and membership proofs.
    pub gen_signer: Arc<dyn GenSigner>,
    /// The provenance archive receiving genesis proofs.
    pub proof_archive: Arc<dyn ProofArchive>,
    /// Chain parameters of the network minted on.
    pub chain_params: &'static ChainParams,
}

/// The durable minting log. All calls are transactional: partial writes
/// are impossible.
#[async_trait]
pub trait MintingStore: Send + Sync {
    /// Creates or replaces a batch together with its seedlings.
    async fn commit_minting_batch(&self, batch: MintingBatch) -> Result<()>;

    /// Returns all batches that have not yet reached a terminal state.
    async fn fetch_non_final_batches(&self) -> Result<Vec<MintingBatch>>;

    /// Returns every batch ever logged, terminal ones included.
    async fn fetch_all_batches(&self) -> Result<Vec<MintingBatch>>;

    /// Advances the state of a batch.
    async fn update_batch_state(&self, batch_key: &PublicKey, new_state: BatchState)
        -> Result<()>;

    /// Persists the funded genesis packet, the sprouted assets and the
    /// root commitment of a batch in one transaction.
    async fn commit_batch_sprout(
        &self,
        batch_key: &PublicKey,
        genesis_packet: FundedPsbt,
        assets: Vec<Asset>,
        root_commitment: TapCommitment,
    ) -> Result<()>;

    /// Persists the signed genesis PSBT and the final transaction.
    async fn commit_signed_genesis_psbt(
        &self,
        batch_key: &PublicKey,
        signed_psbt: Psbt,
        final_tx: Transaction,
        height_hint: u32,
    ) -> Result<()>;

    /// Marks a batch confirmed at the given block.
    async fn mark_batch_confirmed(
        &self,
        batch_key: &PublicKey,
        block_hash: BlockHash,
        block_height: u32,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use taproot_assets_types::proof::MetaType;

    fn batch_key() -> KeyDescriptor {
        let secp = Secp256k1::new();
        KeyDescriptor {
            pub_key: SecretKey::from_slice(&[1u8; 32]).unwrap().public_key(&secp),
            family: 212,
            index: 0,
        }
    }

    fn seedling(name: &str, emission: bool, group_anchor: Option<&str>) -> Seedling {
        Seedling {
            asset_type: AssetType::Normal,
            name: name.to_string(),
            meta: MetaReveal {
                meta_type: MetaType::Opaque,
                data: vec![0x00],
            },
            amount: 10,
            enable_emission: emission,
            group_anchor: group_anchor.map(|name| name.to_string()),
        }
    }

    #[test]
    fn group_anchor_in_empty_batch_is_rejected() {
        let batch = MintingBatch::new(batch_key());
        let err = batch
            .validate_seedling(&seedling("tranche", false, Some("anchor")))
            .unwrap_err();
        assert!(err.to_string().contains("batch empty, group anchor"));
    }

    #[test]
    fn missing_group_anchor_is_rejected() {
        let mut batch = MintingBatch::new(batch_key());
        batch
            .seedlings
            .insert("other".to_string(), seedling("other", true, None));

        let err = batch
            .validate_seedling(&seedling("tranche", false, Some("anchor")))
            .unwrap_err();
        assert!(err.to_string().contains("not present in batch"));
    }

    #[test]
    fn emission_disabled_anchor_is_rejected() {
        let mut batch = MintingBatch::new(batch_key());
        batch
            .seedlings
            .insert("anchor".to_string(), seedling("anchor", false, None));

        let err = batch
            .validate_seedling(&seedling("tranche", false, Some("anchor")))
            .unwrap_err();
        assert!(err.to_string().contains("has emission disabled"));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut batch = MintingBatch::new(batch_key());
        batch
            .seedlings
            .insert("dupe".to_string(), seedling("dupe", false, None));

        let err = batch
            .validate_seedling(&seedling("dupe", false, None))
            .unwrap_err();
        assert!(err.to_string().contains("already in batch"));
    }
}
