//! Split commitments.
//!
//! A send that does not hand over the whole input balance splits the input
//! into a root asset (the change holder, possibly a zero-amount tombstone)
//! and a set of split outputs. The split parts are committed to in an
//! MS-SMT keyed by split locators; the root asset carries the tree root and
//! the transfer witness, each split output carries an inclusion proof
//! pointing back at the root.

use std::collections::BTreeMap;

use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash, HashEngine};
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::Witness;
use thiserror::Error;

use taproot_assets_types::asset::{
    Asset, AssetId, AssetType, PrevId, PrevWitness, SplitCommitmentWitness,
};
use taproot_assets_types::mssmt::{CompactedTree, LeafNode, Node, TreeError};

/// Identifies one split part: the anchor output it lands on, the asset and
/// the receiving script key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SplitLocator {
    /// The anchor output index the split part is committed at.
    pub output_index: u32,
    /// The asset ID of the split asset.
    pub asset_id: AssetId,
    /// The receiving script key.
    pub script_key: XOnlyPublicKey,
    /// The amount carried by this split part. Zero for tombstones.
    pub amount: u64,
}

impl SplitLocator {
    /// The split tree insertion key:
    /// H(output_index || asset_id || script_key).
    pub fn key(&self) -> [u8; 32] {
        let mut engine = Sha256Hash::engine();
        engine.input(&self.output_index.to_be_bytes());
        engine.input(&self.asset_id.to_byte_array());
        engine.input(&self.script_key.serialize());
        Sha256Hash::from_engine(engine).to_byte_array()
    }
}

/// Errors returned during split commitment construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    /// A split requires at least the root locator.
    #[error("split commitment: no split locators")]
    NoSplitLocators,
    /// Two locators collide on the same split tree key. Within one parcel
    /// this is a programming error.
    #[error("split commitment: duplicate split locator")]
    DuplicateSplitLocator,
    /// The split amounts do not add up to the input amount.
    #[error("split commitment: split total {split_total} != input amount {input_amount}")]
    InvalidSplitAmount {
        /// Total input amount consumed.
        input_amount: u64,
        /// Sum of all locator amounts.
        split_total: u64,
    },
    /// Collectibles can never be split.
    #[error("split commitment: collectibles cannot be split")]
    CollectibleSplit,
    /// The requested locator is not part of this split.
    #[error("split commitment: unknown locator")]
    UnknownLocator,
    /// The underlying tree operation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// An MS-SMT over split locators binding a root asset to its split parts.
#[derive(Debug, Clone)]
pub struct SplitCommitment {
    /// The root asset: carries the change (or tombstone) amount, the split
    /// commitment root and, once signed, the transfer witness.
    pub root_asset: Asset,
    split_assets: BTreeMap<[u8; 32], Asset>,
    tree: CompactedTree,
    prev_ids: Vec<PrevId>,
}

impl SplitCommitment {
    /// Builds the split commitment for spending the given inputs into the
    /// root locator plus the external locators. All inputs must carry the
    /// same asset; the locator amounts must sum to the total input amount.
    pub fn new(
        inputs: &[(PrevId, Asset)],
        root_locator: &SplitLocator,
        external_locators: &[SplitLocator],
    ) -> Result<Self, SplitError> {
        let (_, first_input) = inputs.first().ok_or(SplitError::NoSplitLocators)?;
        if first_input.genesis.asset_type == AssetType::Collectible {
            return Err(SplitError::CollectibleSplit);
        }
        if external_locators.is_empty() {
            return Err(SplitError::NoSplitLocators);
        }

        let mut input_total: u64 = 0;
        for (_, input) in inputs {
            input_total = input_total
                .checked_add(input.amount)
                .ok_or(TreeError::SumOverflow)?;
        }

        let mut split_total: u64 = 0;
        let mut split_assets: BTreeMap<[u8; 32], Asset> = BTreeMap::new();
        let mut tree = CompactedTree::new();

        let all_locators = core::iter::once(root_locator).chain(external_locators.iter());
        for locator in all_locators {
            let key = locator.key();
            if split_assets.contains_key(&key) {
                return Err(SplitError::DuplicateSplitLocator);
            }

            let split_asset = split_leaf_asset(first_input, locator);
            split_total = split_total
                .checked_add(locator.amount)
                .ok_or(TreeError::SumOverflow)?;
            tree.insert(key, split_asset.leaf())?;
            split_assets.insert(key, split_asset);
        }

        if split_total != input_total {
            return Err(SplitError::InvalidSplitAmount {
                input_amount: input_total,
                split_total,
            });
        }

        let prev_ids: Vec<PrevId> = inputs.iter().map(|(prev_id, _)| *prev_id).collect();
        let mut root_asset = split_assets
            .get(&root_locator.key())
            .cloned()
            .ok_or(SplitError::UnknownLocator)?;
        root_asset.prev_witnesses = prev_ids
            .iter()
            .map(|prev_id| PrevWitness {
                prev_id: Some(*prev_id),
                tx_witness: Witness::new(),
                split_commitment: None,
            })
            .collect();
        root_asset.split_commitment_root = Some(tree.root());

        Ok(SplitCommitment {
            root_asset,
            split_assets,
            tree,
            prev_ids,
        })
    }

    /// Root summary of the split tree; its sum equals the input amount.
    pub fn root(&self) -> Node {
        self.tree.root()
    }

    /// Returns the deliverable split asset for a locator: the committed
    /// leaf asset rewired with a split commitment witness pointing at the
    /// (by now signed) root asset.
    pub fn split_asset(&self, locator: &SplitLocator) -> Result<Asset, SplitError> {
        let key = locator.key();
        let mut asset = self
            .split_assets
            .get(&key)
            .cloned()
            .ok_or(SplitError::UnknownLocator)?;

        // A split asset carries exactly one witness: the split commitment
        // witness referencing the root. The root asset holds the per-input
        // transfer witnesses.
        let first_prev_id = self.prev_ids.first().copied().unwrap_or_else(PrevId::zero);
        asset.prev_witnesses = vec![PrevWitness {
            prev_id: Some(first_prev_id),
            tx_witness: Witness::new(),
            split_commitment: Some(SplitCommitmentWitness {
                proof: self.tree.merkle_proof(&key),
                root_asset: Box::new(self.root_asset.clone()),
            }),
        }];
        Ok(asset)
    }

    /// Re-derives the leaf committed in the split tree for a delivered
    /// split asset, i.e. the asset without its split witness.
    pub fn rebuild_split_leaf(asset: &Asset) -> LeafNode {
        let mut leaf_asset = asset.clone();
        leaf_asset.prev_witnesses = vec![PrevWitness {
            prev_id: Some(PrevId::zero()),
            tx_witness: Witness::new(),
            split_commitment: None,
        }];
        leaf_asset.split_commitment_root = None;
        leaf_asset.leaf()
    }
}

/// The asset committed in the split tree under a locator: same genesis and
/// group as the input, the locator's amount and script key, and a
/// placeholder witness.
fn split_leaf_asset(input: &Asset, locator: &SplitLocator) -> Asset {
    Asset {
        version: input.version,
        genesis: input.genesis.clone(),
        amount: locator.amount,
        script_version: input.script_version,
        script_key: locator.script_key,
        group_key: input.group_key,
        prev_witnesses: vec![PrevWitness {
            prev_id: Some(PrevId::zero()),
            tx_witness: Witness::new(),
            split_commitment: None,
        }],
        split_commitment_root: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{OutPoint, Txid};
    use taproot_assets_types::asset::Genesis;

    fn script_key(tag: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[tag; 32])
            .unwrap()
            .x_only_public_key(&secp)
            .0
    }

    fn input_asset(amount: u64, asset_type: AssetType) -> Asset {
        let genesis = Genesis {
            genesis_point: OutPoint {
                txid: Txid::from_byte_array([1u8; 32]),
                vout: 0,
            },
            tag: "units".to_string(),
            meta_hash: Sha256Hash::hash(&[]),
            output_index: 0,
            asset_type,
        };
        Asset::new_genesis(genesis, amount, script_key(1), None)
    }

    fn prev_id(asset: &Asset) -> PrevId {
        PrevId {
            out_point: OutPoint {
                txid: Txid::from_byte_array([2u8; 32]),
                vout: 0,
            },
            asset_id: asset.asset_id(),
            script_key: taproot_assets_types::asset::SerializedKey::from_xonly(
                &asset.script_key,
            ),
        }
    }

    fn locator(asset: &Asset, output_index: u32, key_tag: u8, amount: u64) -> SplitLocator {
        SplitLocator {
            output_index,
            asset_id: asset.asset_id(),
            script_key: script_key(key_tag),
            amount,
        }
    }

    #[test]
    fn partial_send_preserves_total() {
        let input = input_asset(1000, AssetType::Normal);
        let root = locator(&input, 0, 2, 700);
        let recipient = locator(&input, 1, 3, 300);

        let split =
            SplitCommitment::new(&[(prev_id(&input), input.clone())], &root, &[recipient])
                .unwrap();
        assert_eq!(split.root().sum, 1000);
        assert_eq!(split.root_asset.amount, 700);
        assert_eq!(
            split.root_asset.split_commitment_root.as_ref().unwrap().sum,
            1000
        );

        let delivered = split.split_asset(&recipient).unwrap();
        assert_eq!(delivered.amount, 300);
        assert!(delivered.has_split_commitment_witness());
    }

    #[test]
    fn tombstone_contributes_zero() {
        let input = input_asset(100, AssetType::Normal);
        let tombstone = locator(&input, 0, 2, 0);
        let recipient = locator(&input, 1, 3, 100);

        let split =
            SplitCommitment::new(&[(prev_id(&input), input.clone())], &tombstone, &[recipient])
                .unwrap();
        assert_eq!(split.root().sum, 100);
        assert_eq!(split.root_asset.amount, 0);
    }

    #[test]
    fn split_proof_verifies_into_root() {
        let input = input_asset(1000, AssetType::Normal);
        let root = locator(&input, 0, 2, 700);
        let recipient = locator(&input, 1, 3, 300);

        let split =
            SplitCommitment::new(&[(prev_id(&input), input.clone())], &root, &[recipient])
                .unwrap();
        let delivered = split.split_asset(&recipient).unwrap();

        let witness = delivered.prev_witnesses[0]
            .split_commitment
            .as_ref()
            .unwrap();
        let leaf = SplitCommitment::rebuild_split_leaf(&delivered);
        let expected_root = witness.root_asset.split_commitment_root.clone().unwrap();
        assert!(witness
            .proof
            .verify_inclusion(&recipient.key(), &leaf, &expected_root));
    }

    #[test]
    fn wrong_amounts_are_rejected() {
        let input = input_asset(1000, AssetType::Normal);
        let root = locator(&input, 0, 2, 600);
        let recipient = locator(&input, 1, 3, 300);

        assert_eq!(
            SplitCommitment::new(&[(prev_id(&input), input.clone())], &root, &[recipient])
                .unwrap_err(),
            SplitError::InvalidSplitAmount {
                input_amount: 1000,
                split_total: 900,
            }
        );
    }

    #[test]
    fn duplicate_locators_are_rejected() {
        let input = input_asset(1000, AssetType::Normal);
        let root = locator(&input, 0, 2, 700);
        let duplicate = locator(&input, 0, 2, 300);

        assert_eq!(
            SplitCommitment::new(&[(prev_id(&input), input.clone())], &root, &[duplicate])
                .unwrap_err(),
            SplitError::DuplicateSplitLocator
        );
    }

    #[test]
    fn collectibles_cannot_be_split() {
        let input = input_asset(1, AssetType::Collectible);
        let root = locator(&input, 0, 2, 0);
        let recipient = locator(&input, 1, 3, 1);

        assert_eq!(
            SplitCommitment::new(&[(prev_id(&input), input.clone())], &root, &[recipient])
                .unwrap_err(),
            SplitError::CollectibleSplit
        );
    }
}
