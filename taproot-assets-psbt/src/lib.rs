//! Virtual packets: the asset-layer PSBT extension.
//!
//! A `VPacket` describes one asset state transition as it will be
//! validated by the asset VM. Elements of the packet refer to on-chain
//! context (the anchor transaction of the spent input, the anchor outputs
//! the new assets commit into), but a virtual transaction does not map
//! one-to-one onto a BTC transaction: several virtual packets may be
//! anchored within the same BTC transaction.
//!
//! NOTE: A virtual transaction carries the state transition for a single
//! asset ID only. An anchor output carrying commitments for several assets
//! needs one virtual packet per asset ID.

pub mod codec;

use bitcoin::secp256k1::{PublicKey, XOnlyPublicKey};
use bitcoin::{Amount, OutPoint, ScriptBuf};
use thiserror::Error;

use taproot_assets_core::split::SplitLocator;
use taproot_assets_types::asset::{Asset, AssetId, PrevId};
use taproot_assets_types::commitment::TapscriptPreimage;

/// Errors raised while assembling or mapping virtual packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VPacketError {
    /// The packet mixes more than one asset ID.
    #[error("virtual packet: multiple asset ids in one packet")]
    MultipleAssetIds,
    /// The packet carries no inputs.
    #[error("virtual packet: no inputs")]
    NoInputs,
    /// An expected output kind is absent or duplicated.
    #[error("virtual packet: {0}")]
    OutputShape(&'static str),
    /// A PSBT field failed to encode or decode.
    #[error("virtual packet: invalid psbt field: {0}")]
    InvalidPsbtField(String),
    /// A BIP-32 derivation path is malformed.
    #[error("virtual packet: invalid derivation path")]
    InvalidDerivationPath,
}

/// BIP-43 purpose used for all asset key derivations.
pub const BIP43_ASSET_PURPOSE: u32 = 1017;

const HARDENED: u32 = 0x8000_0000;

/// A key plus the wallet location it was derived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// The derived public key.
    pub pub_key: PublicKey,
    /// The key family the key was derived from.
    pub family: u32,
    /// The index within the key family.
    pub index: u32,
}

impl KeyDescriptor {
    /// The five-element derivation path
    /// m/1017'/coin_type'/key_family'/0/index.
    pub fn to_path(&self, coin_type: u32) -> [u32; 5] {
        [
            BIP43_ASSET_PURPOSE | HARDENED,
            coin_type | HARDENED,
            self.family | HARDENED,
            0,
            self.index,
        ]
    }

    /// Extracts the key family and index back out of a derivation path.
    /// The path must have exactly five elements with the first three
    /// hardened.
    pub fn locator_from_path(path: &[u32]) -> Result<(u32, u32), VPacketError> {
        if path.len() != 5 {
            return Err(VPacketError::InvalidDerivationPath);
        }
        if path[0] != BIP43_ASSET_PURPOSE | HARDENED {
            return Err(VPacketError::InvalidDerivationPath);
        }
        if path[1] & HARDENED == 0 || path[2] & HARDENED == 0 {
            return Err(VPacketError::InvalidDerivationPath);
        }
        Ok((path[2] & !HARDENED, path[4]))
    }
}

/// On-chain context of the anchor output an input is spending from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Output value of the anchor output.
    pub value: Amount,
    /// The output script of the anchor output.
    pub pk_script: ScriptBuf,
    /// The signature hash type to use when spending the anchor output.
    pub sighash_type: u32,
    /// The internal key of the anchor output.
    pub internal_key: Option<PublicKey>,
    /// The taproot merkle root of the anchor output. If there is no
    /// tapscript sibling this equals the Taproot Asset root commitment
    /// hash.
    pub merkle_root: Vec<u8>,
    /// The tapscript sibling of the Taproot Asset commitment, if any.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// Derivation of the anchor output's internal key.
    pub derivation: Option<KeyDescriptor>,
}

impl Anchor {
    pub fn empty() -> Self {
        Anchor {
            value: Amount::ZERO,
            pk_script: ScriptBuf::new(),
            sighash_type: 0,
            internal_key: None,
            merkle_root: Vec::new(),
            tapscript_sibling: None,
            derivation: None,
        }
    }
}

/// An input to a virtual asset state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VInput {
    /// The previous ID of the asset being spent.
    pub prev_id: PrevId,
    /// The BTC-level anchor context of the spent asset.
    pub anchor: Anchor,
    /// The full instance of the asset being spent.
    pub asset: Option<Asset>,
    /// Serialized proof file proving the spent asset's provenance.
    pub proof: Vec<u8>,
    /// Derivation of the spent asset's script key.
    pub script_key_derivation: Option<KeyDescriptor>,
}

/// The type of a virtual output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VOutputType {
    /// A plain full-value or split output that is not a split root and
    /// does not carry passive assets. In case of a split, the asset of
    /// this output has a split commitment witness.
    Simple = 0,
    /// A split root output carrying the change from a split or a tombstone
    /// from a non-interactive full value send. The asset of this output
    /// has a tx witness.
    SplitRoot = 1,
    /// An output carrying only re-anchored passive assets; the asset of
    /// this output is nil.
    PassiveAssetsOnly = 2,
    /// A split root output that additionally carries passive assets.
    PassiveSplitRoot = 3,
}

impl VOutputType {
    /// Returns true if the output holds the asset with a tx witness
    /// instead of a split witness.
    pub fn is_split_root(self) -> bool {
        matches!(self, VOutputType::SplitRoot | VOutputType::PassiveSplitRoot)
    }

    /// Returns true if the output may carry passive assets.
    pub fn can_carry_passive(self) -> bool {
        matches!(
            self,
            VOutputType::PassiveAssetsOnly | VOutputType::PassiveSplitRoot
        )
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(val: u8) -> Result<Self, VPacketError> {
        match val {
            0 => Ok(VOutputType::Simple),
            1 => Ok(VOutputType::SplitRoot),
            2 => Ok(VOutputType::PassiveAssetsOnly),
            3 => Ok(VOutputType::PassiveSplitRoot),
            other => Err(VPacketError::InvalidPsbtField(format!(
                "unknown output type {}",
                other
            ))),
        }
    }
}

/// An output of a virtual asset state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VOutput {
    /// The amount of asset units this output creates. Zero for tombstones.
    pub amount: u64,
    /// What kind of output this is.
    pub output_type: VOutputType,
    /// Whether the receiver is aware of the transfer. Interactive
    /// full-value sends skip the tombstone split root.
    pub interactive: bool,
    /// The BTC anchor output index this asset output commits into.
    /// Multiple asset outputs can commit into the same BTC output.
    pub anchor_output_index: u32,
    /// The internal key of the anchor output.
    pub anchor_internal_key: Option<PublicKey>,
    /// Derivation of the anchor output's internal key.
    pub anchor_derivation: Option<KeyDescriptor>,
    /// The tapscript sibling of the anchor output, if any.
    pub anchor_tapscript_sibling: Option<TapscriptPreimage>,
    /// The committed asset of this output, set once the packet is
    /// prepared.
    pub asset: Option<Asset>,
    /// The original split asset, set only when `asset` is the root asset
    /// of a split.
    pub split_asset: Option<Asset>,
    /// The new script key of the recipient.
    pub script_key: XOnlyPublicKey,
    /// Derivation of the script key, when it belongs to the local wallet.
    pub script_key_derivation: Option<KeyDescriptor>,
}

impl VOutput {
    /// The locator of this output in a split commitment.
    pub fn split_locator(&self, asset_id: AssetId) -> SplitLocator {
        SplitLocator {
            output_index: self.anchor_output_index,
            asset_id,
            script_key: self.script_key,
            amount: self.amount,
        }
    }
}

/// A PSBT extension packet for a virtual transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VPacket {
    /// The asset inputs being spent.
    pub inputs: Vec<VInput>,
    /// The asset outputs created by this transition.
    pub outputs: Vec<VOutput>,
    /// The address HRP naming the chain this packet belongs to.
    pub chain_params_hrp: String,
    /// Virtual packet format version.
    pub version: u8,
}

impl VPacket {
    /// The single asset ID this packet moves. Mixing IDs is rejected.
    pub fn asset_id(&self) -> Result<AssetId, VPacketError> {
        let first = self
            .inputs
            .first()
            .map(|input| input.prev_id.asset_id)
            .ok_or(VPacketError::NoInputs)?;
        if self
            .inputs
            .iter()
            .any(|input| input.prev_id.asset_id != first)
        {
            return Err(VPacketError::MultipleAssetIds);
        }
        Ok(first)
    }

    /// Sets the asset (and its provenance proof) spent by input `index`.
    pub fn set_input_asset(&mut self, index: usize, asset: Asset, proof: Vec<u8>) {
        while self.inputs.len() <= index {
            self.inputs.push(VInput {
                prev_id: PrevId::zero(),
                anchor: Anchor::empty(),
                asset: None,
                proof: Vec::new(),
                script_key_derivation: None,
            });
        }
        self.inputs[index].prev_id = PrevId {
            out_point: self.inputs[index].prev_id.out_point,
            asset_id: asset.asset_id(),
            script_key: taproot_assets_types::asset::SerializedKey::from_xonly(
                &asset.script_key,
            ),
        };
        self.inputs[index].asset = Some(asset);
        self.inputs[index].proof = proof;
    }

    /// Returns true if any of the outputs carries a split commitment
    /// witness.
    pub fn has_split_commitment(&self) -> bool {
        self.outputs
            .iter()
            .filter(|output| !output.output_type.is_split_root())
            .any(|output| {
                output
                    .asset
                    .as_ref()
                    .map_or(false, Asset::has_split_commitment_witness)
            })
    }

    /// Returns true if one of the outputs is a split root.
    pub fn has_split_root_output(&self) -> bool {
        self.outputs
            .iter()
            .any(|output| output.output_type.is_split_root())
    }

    /// Returns the unique split root output, if exactly one exists.
    pub fn split_root_output(&self) -> Result<&VOutput, VPacketError> {
        let mut split_roots = self
            .outputs
            .iter()
            .filter(|output| output.output_type.is_split_root());
        let first = split_roots
            .next()
            .ok_or(VPacketError::OutputShape("expected 1 split root output"))?;
        if split_roots.next().is_some() {
            return Err(VPacketError::OutputShape("multiple split root outputs"));
        }
        Ok(first)
    }

    /// Returns the first non-split-root output.
    pub fn first_non_split_root_output(&self) -> Result<&VOutput, VPacketError> {
        self.outputs
            .iter()
            .find(|output| !output.output_type.is_split_root())
            .ok_or(VPacketError::OutputShape("no non split root output found"))
    }

    /// Returns true if any output is interactive.
    pub fn has_interactive_output(&self) -> bool {
        self.outputs.iter().any(|output| output.interactive)
    }

    /// Total asset units produced across all outputs.
    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    /// Total asset units consumed across all inputs.
    pub fn input_sum(&self) -> u64 {
        self.inputs
            .iter()
            .filter_map(|input| input.asset.as_ref())
            .map(|asset| asset.amount)
            .sum()
    }

    /// The outpoint spent by each input.
    pub fn input_outpoints(&self) -> Vec<OutPoint> {
        self.inputs
            .iter()
            .map(|input| input.prev_id.out_point)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_path_round_trip() {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let key = bitcoin::secp256k1::SecretKey::from_slice(&[1u8; 32])
            .unwrap()
            .public_key(&secp);
        let desc = KeyDescriptor {
            pub_key: key,
            family: 212,
            index: 7,
        };

        let path = desc.to_path(0);
        assert_eq!(path.len(), 5);
        assert_eq!(path[3], 0);
        assert_eq!(KeyDescriptor::locator_from_path(&path).unwrap(), (212, 7));
    }

    #[test]
    fn bad_paths_are_rejected() {
        // Too short.
        assert!(KeyDescriptor::locator_from_path(&[1017 | HARDENED, 0, 0]).is_err());
        // Wrong purpose.
        assert!(KeyDescriptor::locator_from_path(&[86 | HARDENED, HARDENED, HARDENED, 0, 1])
            .is_err());
        // Key family not hardened.
        assert!(
            KeyDescriptor::locator_from_path(&[1017 | HARDENED, HARDENED, 212, 0, 1]).is_err()
        );
    }
}
