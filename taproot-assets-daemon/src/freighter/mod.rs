//! The transfer pipeline: coin selection, outbound parcels and their
//! durable log.

mod porter;

pub use porter::{ChainPorter, Parcel, PorterConfig};

use std::fmt;

use async_trait::async_trait;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::{Amount, BlockHash, OutPoint, Transaction, Txid};

use taproot_assets_core::commitment::TapCommitment;
use taproot_assets_psbt::{KeyDescriptor, VOutputType, VPacket};
use taproot_assets_types::asset::{Asset, AssetId, PrevId, SerializedKey};
use taproot_assets_types::commitment::TapscriptPreimage;

use crate::wallet::AnnotatedProof;
use crate::{Error, Result};

/// Constraints on the commitments needed to satisfy a send request. Only
/// one of `asset_id` and `group_key` should be set.
#[derive(Debug, Clone)]
pub struct CommitmentConstraints {
    /// The required asset ID.
    pub asset_id: Option<AssetId>,
    /// The required group key. If set, matched assets may carry distinct
    /// asset IDs under this group.
    pub group_key: Option<XOnlyPublicKey>,
    /// The minimum total amount the selected commitments must hold.
    pub min_amt: u64,
}

/// One eligible input: the asset satisfying the constraints plus
/// everything needed to locate and spend its on-chain commitment.
#[derive(Debug, Clone)]
pub struct AnchoredCommitment {
    /// The outpoint the commitment is anchored at.
    pub anchor_point: OutPoint,
    /// Output value of the anchor output.
    pub anchor_output_value: Amount,
    /// The internal key anchoring the commitment.
    pub internal_key: KeyDescriptor,
    /// The tapscript sibling of the commitment, usually absent.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// The full Taproot Asset commitment at the anchor point, including
    /// any co-located passive assets.
    pub commitment: TapCommitment,
    /// The asset satisfying the constraints, to be used as an input.
    pub asset: Asset,
}

impl AnchoredCommitment {
    /// The previous ID consumed when this commitment's asset is spent.
    pub fn prev_id(&self) -> PrevId {
        PrevId {
            out_point: self.anchor_point,
            asset_id: self.asset.asset_id(),
            script_key: SerializedKey::from_xonly(&self.asset.script_key),
        }
    }
}

/// Enumerates commitments eligible for coin selection.
#[async_trait]
pub trait CoinLister: Send + Sync {
    /// Returns all anchored commitments satisfying the constraints. An
    /// empty result means coin selection fails with
    /// [`Error::MatchingAssetsNotFound`].
    async fn list_eligible_coins(
        &self,
        constraints: &CommitmentConstraints,
    ) -> Result<Vec<AnchoredCommitment>>;
}

/// Strategy used when preferentially selecting multiple commitments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiCommitmentSelectStrategy {
    /// Considers commitments in order of descending amounts and selects
    /// the first subset which cumulatively sums to at least the minimum
    /// target amount.
    PreferMaxAmount,
}

/// Selects the subset of commitments satisfying the minimum amount under
/// the given strategy.
pub fn select_for_amount(
    min_total_amount: u64,
    mut eligible: Vec<AnchoredCommitment>,
    strategy: MultiCommitmentSelectStrategy,
) -> Result<Vec<AnchoredCommitment>> {
    match strategy {
        MultiCommitmentSelectStrategy::PreferMaxAmount => {
            eligible.sort_by(|a, b| b.asset.amount.cmp(&a.asset.amount));

            let mut selected = Vec::new();
            let mut total: u64 = 0;
            for commitment in eligible {
                if total >= min_total_amount {
                    break;
                }
                total = total.saturating_add(commitment.asset.amount);
                selected.push(commitment);
            }

            if total < min_total_amount {
                return Err(Error::MatchingAssetsNotFound);
            }
            Ok(selected)
        }
    }
}

/// The states an outbound parcel advances through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendState {
    /// A shipment was requested.
    Requested,
    /// Input commitments are selected.
    InputsSelected,
    /// The virtual transaction is built and signed.
    VirtualSigned,
    /// The anchor transaction is funded.
    AnchorFunded,
    /// The anchor transaction is signed.
    AnchorSigned,
    /// The anchor transaction is broadcast, the parcel is durable.
    Broadcast,
    /// The anchor transaction confirmed.
    Confirmed,
    /// Proofs are written, the transfer is complete.
    ProofsDelivered,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendState::Requested => "requested",
            SendState::InputsSelected => "inputs_selected",
            SendState::VirtualSigned => "virtual_signed",
            SendState::AnchorFunded => "anchor_funded",
            SendState::AnchorSigned => "anchor_signed",
            SendState::Broadcast => "broadcast",
            SendState::Confirmed => "confirmed",
            SendState::ProofsDelivered => "proofs_delivered",
        };
        f.write_str(name)
    }
}

/// A spent input, as recorded in the durable parcel.
#[derive(Debug, Clone)]
pub struct TransferInput {
    /// Anchor point, asset ID and script key of the spent asset.
    pub prev_id: PrevId,
    /// The amount that was spent.
    pub amount: u64,
}

/// The new chain location of a transfer output.
#[derive(Debug, Clone)]
pub struct Anchor {
    /// The outpoint of the anchor output.
    pub outpoint: OutPoint,
    /// Output value of the anchor output.
    pub value: Amount,
    /// The internal key committing to the assets at this output.
    pub internal_key: KeyDescriptor,
    /// The Taproot Asset commitment root hash of the anchor output.
    pub taproot_asset_root: [u8; 32],
    /// The taproot merkle root of the anchor output. Without a tapscript
    /// sibling this equals the commitment leaf hash.
    pub merkle_root: Vec<u8>,
    /// The tapscript sibling of the commitment, if any.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// Number of passive assets re-anchored at this output.
    pub num_passive_assets: u32,
}

/// One new asset output produced by a transfer.
#[derive(Debug, Clone)]
pub struct TransferOutput {
    /// Where the output now lives on chain.
    pub anchor: Anchor,
    /// The kind of virtual output this was.
    pub output_type: VOutputType,
    /// The new script key.
    pub script_key: XOnlyPublicKey,
    /// Whether the script key belongs to the local wallet. Remote keys
    /// become outbound records instead of owned assets.
    pub script_key_local: bool,
    /// The new amount.
    pub amount: u64,
    /// The full new asset, including witness data and any split
    /// commitment root.
    pub asset: Option<Asset>,
    /// The serialized proof suffix, set once the transfer confirmed.
    pub proof_suffix: Vec<u8>,
}

/// A passive asset re-anchored alongside a transfer: co-located in a spent
/// commitment but untouched itself. Only its anchor metadata changes.
#[derive(Debug, Clone)]
pub struct PassiveAssetReAnchor {
    /// The lightweight re-anchoring virtual packet.
    pub packet: VPacket,
    /// Genesis ID of the passive asset.
    pub genesis_id: AssetId,
    /// The anchor point the passive asset lived at before the transfer.
    pub prev_anchor_point: OutPoint,
    /// The script key of the passive asset, unchanged by re-anchoring.
    pub script_key: XOnlyPublicKey,
    /// The anchor output index the asset is re-anchored at.
    pub new_anchor_output_index: u32,
    /// The passive asset itself; amount and witness set are unchanged.
    pub asset: Asset,
}

/// A non-asset taproot output the wallet added while funding the anchor
/// transaction, typically BIP-86 change. Exclusion proofs must account
/// for it.
#[derive(Debug, Clone)]
pub struct WalletOutput {
    /// Index of the output in the anchor transaction.
    pub output_index: u32,
    /// The wallet's internal key for the output.
    pub internal_key: bitcoin::secp256k1::PublicKey,
}

/// The durable record of an outbound transfer: the signed anchor
/// transaction, consumed inputs, produced outputs and re-anchored passive
/// assets.
#[derive(Debug, Clone)]
pub struct OutboundParcel {
    /// The signed Bitcoin transaction anchoring the transfer.
    pub anchor_tx: Transaction,
    /// Block height recorded before broadcast, the confirmation scan hint.
    pub anchor_tx_height_hint: u32,
    /// On-chain fees paid, in satoshis.
    pub chain_fees: i64,
    /// The previous assets consumed by this transfer.
    pub inputs: Vec<TransferInput>,
    /// The new assets created by this transfer.
    pub outputs: Vec<TransferOutput>,
    /// Taproot outputs the wallet added during funding.
    pub wallet_outputs: Vec<WalletOutput>,
    /// Passive assets re-anchored during confirmation.
    pub passive_assets: Vec<PassiveAssetReAnchor>,
}

impl OutboundParcel {
    /// The txid of the anchor transaction.
    pub fn anchor_txid(&self) -> Txid {
        self.anchor_tx.compute_txid()
    }
}

/// Marks a confirmed transfer on disk.
#[derive(Debug, Clone)]
pub struct AssetConfirmEvent {
    /// The anchor transaction's hash.
    pub anchor_txid: Txid,
    /// The confirming block hash. Confirmation handling is keyed by
    /// (anchor_txid, block_hash).
    pub block_hash: BlockHash,
    /// The confirming block height.
    pub block_height: u32,
    /// Position of the anchor transaction within the block.
    pub tx_index: u32,
    /// Final proof files for each new output.
    pub final_proofs: Vec<AnnotatedProof>,
    /// Updated proof files for every re-anchored passive asset.
    pub passive_asset_proof_files: Vec<AnnotatedProof>,
}

/// Tracks the state of outbound parcels. Used by the chain porter to mark
/// pending deliveries and finally confirm them. Finality is the single
/// monotonic signal downstream caches key off.
#[async_trait]
pub trait ExportLog: Send + Sync {
    /// Marks an outbound parcel as pending on disk before broadcast.
    async fn log_pending_parcel(&self, parcel: &OutboundParcel) -> Result<()>;

    /// Returns the parcels that have not been confirmed yet, for
    /// re-broadcast on startup.
    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>>;

    /// Marks a parcel delivery as confirmed, moving asset ownership to the
    /// asset store and proof archive.
    async fn confirm_parcel_delivery(&self, event: &AssetConfirmEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash};
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::Txid;
    use taproot_assets_types::asset::{AssetType, Genesis};

    fn commitment_with_amount(amount: u64, tag: u8) -> AnchoredCommitment {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[tag; 32]).unwrap();
        let script_key = secret.x_only_public_key(&secp).0;
        let genesis = Genesis {
            genesis_point: OutPoint {
                txid: Txid::from_byte_array([tag; 32]),
                vout: 0,
            },
            tag: "units".to_string(),
            meta_hash: Sha256Hash::hash(&[]),
            output_index: 0,
            asset_type: AssetType::Normal,
        };
        let asset = Asset::new_genesis(genesis, amount, script_key, None);
        let commitment = TapCommitment::from_assets(vec![asset.clone()]).unwrap();

        AnchoredCommitment {
            anchor_point: OutPoint {
                txid: Txid::from_byte_array([tag; 32]),
                vout: 0,
            },
            anchor_output_value: Amount::from_sat(1000),
            internal_key: KeyDescriptor {
                pub_key: secret.public_key(&secp),
                family: 212,
                index: tag as u32,
            },
            tapscript_sibling: None,
            commitment,
            asset,
        }
    }

    #[test]
    fn prefers_largest_commitments_first() {
        let eligible = vec![
            commitment_with_amount(10, 1),
            commitment_with_amount(100, 2),
            commitment_with_amount(50, 3),
        ];

        let selected =
            select_for_amount(120, eligible, MultiCommitmentSelectStrategy::PreferMaxAmount)
                .unwrap();
        let amounts: Vec<u64> = selected.iter().map(|c| c.asset.amount).collect();
        assert_eq!(amounts, vec![100, 50]);
    }

    #[test]
    fn exact_single_commitment_is_enough() {
        let eligible = vec![commitment_with_amount(10, 1), commitment_with_amount(100, 2)];
        let selected =
            select_for_amount(100, eligible, MultiCommitmentSelectStrategy::PreferMaxAmount)
                .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].asset.amount, 100);
    }

    #[test]
    fn insufficient_funds_fail_selection() {
        let eligible = vec![commitment_with_amount(10, 1), commitment_with_amount(20, 2)];
        assert!(matches!(
            select_for_amount(100, eligible, MultiCommitmentSelectStrategy::PreferMaxAmount),
            Err(Error::MatchingAssetsNotFound)
        ));
    }
}
