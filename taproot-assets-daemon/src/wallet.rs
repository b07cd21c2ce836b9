//! Wallet, key ring, signer and proof archive capability traits.

use async_trait::async_trait;
use bitcoin::key::TapTweak;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{schnorr, PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::{Transaction, Witness};

use taproot_assets_psbt::KeyDescriptor;
use taproot_assets_types::asset::{Asset, AssetId};

use crate::Result;

/// The key family under which all Taproot Asset keys are derived.
pub const TAPROOT_ASSETS_KEY_FAMILY: u32 = 212;

/// A PSBT funded by the wallet.
#[derive(Debug, Clone)]
pub struct FundedPsbt {
    /// The funded packet, inputs added and change attached.
    pub psbt: Psbt,
    /// Index of the change output added by the wallet.
    pub change_output_index: u32,
    /// On-chain fees paid, in satoshis.
    pub chain_fees: i64,
}

impl FundedPsbt {
    /// The outpoint of the first input, used as the shared genesis point
    /// of a minting batch.
    pub fn genesis_point(&self) -> Option<bitcoin::OutPoint> {
        self.psbt
            .unsigned_tx
            .input
            .first()
            .map(|input| input.previous_output)
    }
}

/// The on-chain wallet backing both state machines. The wallet is
/// exclusive per call.
#[async_trait]
pub trait WalletAnchor: Send + Sync {
    /// Funds the template PSBT at the given fee rate, adding inputs and a
    /// change output. Funding the same template twice must yield an
    /// equivalent PSBT.
    async fn fund_psbt(&self, template: Psbt, fee_rate: u64) -> Result<FundedPsbt>;

    /// Signs and finalizes all wallet inputs of the PSBT.
    async fn sign_and_finalize_psbt(&self, psbt: Psbt) -> Result<Psbt>;

    /// Imports a taproot output key so the wallet watches the output.
    async fn import_taproot_output_key(&self, output_key: XOnlyPublicKey) -> Result<()>;
}

/// Derives fresh keys for batch internal keys, script keys and group keys.
#[async_trait]
pub trait KeyRing: Send + Sync {
    /// Derives the next key in the given key family.
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor>;
}

/// Signs genesis-level artifacts: group key derivation and membership
/// signatures.
#[async_trait]
pub trait GenSigner: Send + Sync {
    /// Derives the tweaked group key for a raw key and the group anchor's
    /// asset ID.
    async fn derive_group_key(
        &self,
        raw_key: &KeyDescriptor,
        anchor_asset_id: AssetId,
    ) -> Result<XOnlyPublicKey>;

    /// Signs a member asset ID under the tweaked group key, proving group
    /// membership.
    async fn sign_group_membership(
        &self,
        raw_key: &KeyDescriptor,
        anchor_asset_id: AssetId,
        member_asset_id: AssetId,
    ) -> Result<schnorr::Signature>;
}

/// Signs virtual transaction inputs under asset script keys.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Produces the key-spend witness for one input of a virtual
    /// transaction, signing under the input asset's script key.
    async fn sign_virtual_tx(
        &self,
        script_key: &XOnlyPublicKey,
        tx: &Transaction,
        input_asset: &Asset,
    ) -> Result<Witness>;
}

/// Identifies a proof file in the archive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProofLocator {
    /// The asset ID the proof file belongs to.
    pub asset_id: AssetId,
    /// The script key of the proven asset leaf.
    pub script_key: XOnlyPublicKey,
}

/// A proof file blob together with its locator.
#[derive(Debug, Clone)]
pub struct AnnotatedProof {
    /// Where the proof belongs in the archive.
    pub locator: ProofLocator,
    /// The serialized proof file.
    pub blob: Vec<u8>,
}

/// The append-only provenance archive.
#[async_trait]
pub trait ProofArchive: Send + Sync {
    /// Stores the given proof files.
    async fn import_proofs(&self, proofs: Vec<AnnotatedProof>) -> Result<()>;

    /// Fetches the proof file stored under the locator.
    async fn fetch_proof(&self, locator: &ProofLocator) -> Result<Vec<u8>>;
}

/// Derives the BIP-86 script key for a raw internal key: the taproot
/// output key with an empty script tree.
pub fn bip86_script_key(raw_key: &PublicKey) -> XOnlyPublicKey {
    let secp = Secp256k1::verification_only();
    let (xonly, _) = raw_key.x_only_public_key();
    let (tweaked, _) = xonly.tap_tweak(&secp, None);
    tweaked.to_x_only_public_key()
}
