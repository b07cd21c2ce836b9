//! Asset-level and taproot-asset-level commitment trees.
//!
//! Assets sharing a commitment identifier form an inner MS-SMT
//! (AssetCommitment); the outer MS-SMT (TapCommitment) holds one leaf per
//! inner commitment and is bound into the on-chain taproot output key
//! through a tapscript leaf.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Message, Parity, PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::{LeafVersion, TapNodeHash};
use bitcoin::ScriptBuf;
use thiserror::Error;

use taproot_assets_types::asset::{Asset, AssetVersion};
use taproot_assets_types::commitment::{
    AssetProof, Proof, TapCommitmentVersion, TaprootAssetProof, TapscriptPreimage,
    TapscriptPreimageType,
};
use taproot_assets_types::mssmt::{CompactedTree, LeafNode, Node, TreeError};

/// Tapscript leaf version carrying a Taproot Asset commitment.
pub const TAPROOT_ASSET_LEAF_VERSION: u8 = 0x0c;

/// Size in bytes of a Taproot Asset commitment leaf script:
/// OP_RETURN || version || root_hash || root_sum.
pub const TAPROOT_ASSET_COMMITMENT_SCRIPT_SIZE: usize = 1 + 1 + 32 + 8;

/// Length in bytes of a TapBranch preimage.
const TAP_BRANCH_PREIMAGE_LEN: usize = 64;

/// Errors returned during commitment construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    /// Commitment construction was attempted without any assets.
    #[error("asset commitment: no assets provided")]
    NoAssets,
    /// Two ungrouped assets disagree on their genesis.
    #[error("asset commitment: genesis mismatch")]
    GenesisMismatch,
    /// Two assets disagree on their group key.
    #[error("asset commitment: group key mismatch")]
    GroupKeyMismatch,
    /// An upserted asset's type does not match the committed assets.
    #[error("asset commitment: asset type mismatch")]
    AssetTypeMismatch,
    /// Two assets share the same script key.
    #[error("asset commitment: duplicate script key")]
    DuplicateScriptKey,
    /// A grouped asset's membership signature does not verify.
    #[error("asset commitment: invalid genesis signature")]
    InvalidGenesisSignature,
    /// A tapscript sibling preimage is malformed.
    #[error("invalid tapscript sibling preimage")]
    InvalidTapscriptSibling,
    /// A tapscript sibling is itself a Taproot Asset commitment leaf.
    #[error("tapscript sibling is a taproot asset commitment")]
    SiblingIsTapCommitment,
    /// The underlying tree operation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// The inner MS-SMT committing to a set of assets under the same
/// commitment identifier, keyed by `asset_commitment_key`.
#[derive(Debug, Clone)]
pub struct AssetCommitment {
    /// Max version of the assets committed.
    pub version: AssetVersion,
    /// Common identifier for all assets in this commitment: the asset ID
    /// when ungrouped, else the hash of the group key.
    pub tap_key: [u8; 32],
    tree: CompactedTree,
    assets: BTreeMap<[u8; 32], Asset>,
}

impl AssetCommitment {
    /// Constructs a new commitment for the given assets. All assets must be
    /// related: their asset ID or group key must match.
    pub fn new(assets: Vec<Asset>) -> Result<Self, CommitmentError> {
        let (group_key, genesis_id, tap_key) = {
            let first = assets.first().ok_or(CommitmentError::NoAssets)?;
            (
                first.group_key.map(|group| group.group_pubkey),
                first.asset_id(),
                first.tap_commitment_key(),
            )
        };

        let secp = Secp256k1::verification_only();
        let mut version = AssetVersion::V0;
        let mut asset_map: BTreeMap<[u8; 32], Asset> = BTreeMap::new();
        for asset in assets {
            match (&group_key, &asset.group_key) {
                (None, None) => {
                    if asset.asset_id() != genesis_id {
                        return Err(CommitmentError::GenesisMismatch);
                    }
                }
                (Some(expected), Some(group)) if *expected == group.group_pubkey => {
                    // Membership in the group requires a valid schnorr
                    // signature over the member's asset ID.
                    let msg = Message::from_digest(asset.asset_id().to_byte_array());
                    if secp
                        .verify_schnorr(&group.sig, &msg, &group.group_pubkey)
                        .is_err()
                    {
                        return Err(CommitmentError::InvalidGenesisSignature);
                    }
                }
                _ => return Err(CommitmentError::GroupKeyMismatch),
            }

            let key = asset.asset_commitment_key();
            if asset_map.contains_key(&key) {
                return Err(CommitmentError::DuplicateScriptKey);
            }
            if asset.version > version {
                version = asset.version;
            }
            asset_map.insert(key, asset);
        }

        let mut tree = CompactedTree::new();
        for (key, asset) in &asset_map {
            tree.insert(*key, asset.leaf())?;
        }

        Ok(AssetCommitment {
            version,
            tap_key,
            tree,
            assets: asset_map,
        })
    }

    /// Inserts or updates one asset in the commitment.
    pub fn upsert(&mut self, asset: Asset) -> Result<(), CommitmentError> {
        if let Some(existing) = self.assets.values().next() {
            if existing.genesis.asset_type != asset.genesis.asset_type {
                return Err(CommitmentError::AssetTypeMismatch);
            }
        }

        if asset.tap_commitment_key() != self.tap_key {
            return Err(match asset.group_key {
                Some(_) => CommitmentError::GroupKeyMismatch,
                None => CommitmentError::GenesisMismatch,
            });
        }

        if let Some(group) = &asset.group_key {
            let secp = Secp256k1::verification_only();
            let msg = Message::from_digest(asset.asset_id().to_byte_array());
            if secp
                .verify_schnorr(&group.sig, &msg, &group.group_pubkey)
                .is_err()
            {
                return Err(CommitmentError::InvalidGenesisSignature);
            }
        }

        let key = asset.asset_commitment_key();
        self.tree.insert(key, asset.leaf())?;
        if asset.version > self.version {
            self.version = asset.version;
        }
        self.assets.insert(key, asset);
        Ok(())
    }

    /// Removes one asset from the commitment.
    pub fn delete(&mut self, asset: &Asset) -> Result<(), CommitmentError> {
        if asset.tap_commitment_key() != self.tap_key {
            return Err(match asset.group_key {
                Some(_) => CommitmentError::GroupKeyMismatch,
                None => CommitmentError::GenesisMismatch,
            });
        }

        let key = asset.asset_commitment_key();
        self.tree.delete(&key)?;
        self.assets.remove(&key);
        Ok(())
    }

    /// Merges the other commitment into this one.
    pub fn merge(&mut self, other: &AssetCommitment) -> Result<(), CommitmentError> {
        for asset in other.assets.values() {
            self.upsert(asset.clone())?;
        }
        Ok(())
    }

    /// Root summary of the inner MS-SMT.
    pub fn root(&self) -> Node {
        self.tree.root()
    }

    /// The insertion key of this commitment in the TapCommitment MS-SMT.
    pub fn tap_commitment_key(&self) -> [u8; 32] {
        self.tap_key
    }

    /// The leaf node committing to this inner tree inside the
    /// TapCommitment: version || root_hash || root_sum.
    pub fn tap_commitment_leaf(&self) -> LeafNode {
        let root = self.root();
        LeafNode::new(asset_commitment_leaf_value(self.version, &root), root.sum)
    }

    /// Merkle proof of the asset stored under `key`. Returns the asset if
    /// present; the proof doubles as a non-inclusion proof otherwise.
    pub fn asset_proof(&self, key: [u8; 32]) -> (Option<&Asset>, taproot_assets_types::mssmt::Proof) {
        (self.assets.get(&key), self.tree.merkle_proof(&key))
    }

    /// The set of assets committed to.
    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    /// The committed asset under the given commitment key, if any.
    pub fn asset(&self, key: [u8; 32]) -> Option<&Asset> {
        self.assets.get(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Encodes an inner commitment root as the outer tree's leaf payload.
fn asset_commitment_leaf_value(version: AssetVersion, root: &Node) -> Vec<u8> {
    let mut value = Vec::with_capacity(1 + 32 + 8);
    value.push(version as u8);
    value.extend_from_slice(&root.hash.to_byte_array());
    value.extend_from_slice(&root.sum.to_be_bytes());
    value
}

/// The outer MS-SMT with one leaf per inner AssetCommitment, bound into a
/// taproot output via a tapscript leaf.
#[derive(Debug, Clone)]
pub struct TapCommitment {
    /// Version of the TapCommitment.
    pub version: TapCommitmentVersion,
    tree: CompactedTree,
    commitments: BTreeMap<[u8; 32], AssetCommitment>,
}

impl TapCommitment {
    /// Constructs a TapCommitment over the given inner commitments.
    pub fn new(commitments: Vec<AssetCommitment>) -> Result<Self, CommitmentError> {
        let mut commitment = TapCommitment {
            version: TapCommitmentVersion::V1,
            tree: CompactedTree::new(),
            commitments: BTreeMap::new(),
        };
        for inner in commitments {
            commitment.upsert(inner)?;
        }
        Ok(commitment)
    }

    /// Groups the assets by commitment identifier and builds the full
    /// two-level commitment.
    pub fn from_assets(assets: Vec<Asset>) -> Result<Self, CommitmentError> {
        let mut grouped: BTreeMap<[u8; 32], Vec<Asset>> = BTreeMap::new();
        for asset in assets {
            grouped
                .entry(asset.tap_commitment_key())
                .or_default()
                .push(asset);
        }

        let mut commitments = Vec::with_capacity(grouped.len());
        for (_, group) in grouped {
            commitments.push(AssetCommitment::new(group)?);
        }
        Self::new(commitments)
    }

    /// Inserts or replaces one inner commitment. Empty inner commitments
    /// are deleted instead of committed.
    pub fn upsert(&mut self, inner: AssetCommitment) -> Result<(), CommitmentError> {
        let key = inner.tap_commitment_key();
        if inner.is_empty() {
            self.tree.delete(&key)?;
            self.commitments.remove(&key);
            return Ok(());
        }

        self.tree.insert(key, inner.tap_commitment_leaf())?;
        self.commitments.insert(key, inner);
        Ok(())
    }

    /// Removes the inner commitment stored under `tap_key`.
    pub fn delete(&mut self, tap_key: &[u8; 32]) -> Result<(), CommitmentError> {
        self.tree.delete(tap_key)?;
        self.commitments.remove(tap_key);
        Ok(())
    }

    /// Merges all inner commitments of the other TapCommitment into this
    /// one. Assets living under the same commitment identifier are merged
    /// into a single inner tree.
    pub fn merge(&mut self, other: &TapCommitment) -> Result<(), CommitmentError> {
        for (key, other_inner) in &other.commitments {
            match self.commitments.remove(key) {
                Some(mut inner) => {
                    inner.merge(other_inner)?;
                    self.upsert(inner)?;
                }
                None => {
                    self.upsert(other_inner.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Root summary of the outer MS-SMT.
    pub fn root(&self) -> Node {
        self.tree.root()
    }

    /// The inner commitment stored under `tap_key`, if any.
    pub fn asset_commitment(&self, tap_key: &[u8; 32]) -> Option<&AssetCommitment> {
        self.commitments.get(tap_key)
    }

    /// All inner commitments.
    pub fn asset_commitments(&self) -> impl Iterator<Item = &AssetCommitment> {
        self.commitments.values()
    }

    /// Every asset committed across all inner commitments.
    pub fn committed_assets(&self) -> Vec<&Asset> {
        self.commitments
            .values()
            .flat_map(|inner| inner.assets())
            .collect()
    }

    /// The tapscript leaf script committing to the outer root:
    /// OP_RETURN || version || root_hash || root_sum.
    pub fn tap_leaf_script(&self) -> Vec<u8> {
        let root = self.root();
        let mut script = Vec::with_capacity(TAPROOT_ASSET_COMMITMENT_SCRIPT_SIZE);
        script.push(bitcoin::opcodes::all::OP_RETURN.to_u8());
        script.push(self.version as u8);
        script.extend_from_slice(&root.hash.to_byte_array());
        script.extend_from_slice(&root.sum.to_be_bytes());
        script
    }

    /// The tap leaf hash of the commitment leaf under leaf version 0x0c.
    pub fn tap_leaf_hash(&self) -> Result<TapNodeHash, CommitmentError> {
        tap_leaf_hash_of(&self.tap_leaf_script())
    }

    /// The tapscript merkle root given an optional non-asset sibling. With
    /// a sibling the two leaf hashes are combined as a lexicographic pair;
    /// without one the commitment leaf hash is the merkle root.
    pub fn tapscript_root(
        &self,
        sibling: Option<&TapscriptPreimage>,
    ) -> Result<TapNodeHash, CommitmentError> {
        let commitment_hash = self.tap_leaf_hash()?;
        match sibling {
            Some(preimage) => {
                let sibling_hash = tapscript_preimage_hash(preimage)?;
                Ok(TapNodeHash::from_node_hashes(commitment_hash, sibling_hash))
            }
            None => Ok(commitment_hash),
        }
    }

    /// The taproot output key `Q = P + t*G` committing to this tree under
    /// the given internal key and optional tapscript sibling.
    pub fn output_key(
        &self,
        internal_key: &PublicKey,
        sibling: Option<&TapscriptPreimage>,
    ) -> Result<(XOnlyPublicKey, Parity), CommitmentError> {
        let merkle_root = self.tapscript_root(sibling)?;
        Ok(taproot_output_key(internal_key, Some(merkle_root)))
    }

    /// Builds a full commitment proof for the asset identified by
    /// (tap_key, asset_key). If the asset or its commitment is absent the
    /// proof is a non-inclusion proof.
    pub fn commitment_proof(
        &self,
        tap_key: [u8; 32],
        asset_key: [u8; 32],
    ) -> (Option<&Asset>, Proof) {
        match self.commitments.get(&tap_key) {
            Some(inner) => {
                let (asset, inner_proof) = inner.asset_proof(asset_key);
                let proof = Proof {
                    asset_proof: Some(AssetProof {
                        proof: inner_proof,
                        version: inner.version,
                        tap_key,
                    }),
                    taproot_asset_proof: TaprootAssetProof {
                        proof: self.tree.merkle_proof(&tap_key),
                        version: self.version,
                    },
                };
                (asset, proof)
            }
            None => {
                let proof = Proof {
                    asset_proof: None,
                    taproot_asset_proof: TaprootAssetProof {
                        proof: self.tree.merkle_proof(&tap_key),
                        version: self.version,
                    },
                };
                (None, proof)
            }
        }
    }
}

/// Computes the tap leaf hash of a commitment script under the Taproot
/// Asset leaf version.
pub fn tap_leaf_hash_of(script: &[u8]) -> Result<TapNodeHash, CommitmentError> {
    let leaf_version = LeafVersion::from_consensus(TAPROOT_ASSET_LEAF_VERSION)
        .map_err(|_| CommitmentError::InvalidTapscriptSibling)?;
    let script = ScriptBuf::from_bytes(script.to_vec());
    Ok(TapNodeHash::from_script(script.as_script(), leaf_version))
}

/// Derives the taproot output key for an internal key and optional merkle
/// root: `Q = P + taggedHash("TapTweak", P || merkle_root) * G`.
pub fn taproot_output_key(
    internal_key: &PublicKey,
    merkle_root: Option<TapNodeHash>,
) -> (XOnlyPublicKey, Parity) {
    let secp = Secp256k1::verification_only();
    let (xonly, _) = internal_key.x_only_public_key();
    let (tweaked, parity) = xonly.tap_tweak(&secp, merkle_root);
    (tweaked.to_x_only_public_key(), parity)
}

/// Returns true if the script matches the Taproot Asset commitment leaf
/// pattern.
pub fn is_taproot_asset_commitment_script(script: &[u8]) -> bool {
    script.len() == TAPROOT_ASSET_COMMITMENT_SCRIPT_SIZE
        && script[0] == bitcoin::opcodes::all::OP_RETURN.to_u8()
}

/// Computes the tap hash for a tapscript sibling preimage.
pub fn tapscript_preimage_hash(
    preimage: &TapscriptPreimage,
) -> Result<TapNodeHash, CommitmentError> {
    if preimage.sibling_preimage.is_empty() {
        return Err(CommitmentError::InvalidTapscriptSibling);
    }

    match preimage.sibling_type {
        TapscriptPreimageType::LeafPreimage => {
            if is_taproot_asset_commitment_script(&preimage.sibling_preimage) {
                return Err(CommitmentError::SiblingIsTapCommitment);
            }
            let script = ScriptBuf::from_bytes(preimage.sibling_preimage.clone());
            Ok(TapNodeHash::from_script(
                script.as_script(),
                LeafVersion::TapScript,
            ))
        }
        TapscriptPreimageType::BranchPreimage => {
            if preimage.sibling_preimage.len() != TAP_BRANCH_PREIMAGE_LEN {
                return Err(CommitmentError::InvalidTapscriptSibling);
            }
            let mut left = [0u8; 32];
            left.copy_from_slice(&preimage.sibling_preimage[..32]);
            let mut right = [0u8; 32];
            right.copy_from_slice(&preimage.sibling_preimage[32..]);
            Ok(TapNodeHash::from_node_hashes(
                TapNodeHash::from_byte_array(left),
                TapNodeHash::from_byte_array(right),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256::Hash as Sha256Hash;
    use bitcoin::secp256k1::{Keypair, SecretKey};
    use bitcoin::{OutPoint, Txid};
    use taproot_assets_types::asset::{AssetType, Genesis, GroupKey};

    fn secp() -> Secp256k1<bitcoin::secp256k1::All> {
        Secp256k1::new()
    }

    fn script_key(tag: u8) -> XOnlyPublicKey {
        SecretKey::from_slice(&[tag; 32])
            .unwrap()
            .x_only_public_key(&secp())
            .0
    }

    fn internal_key(tag: u8) -> PublicKey {
        SecretKey::from_slice(&[tag; 32]).unwrap().public_key(&secp())
    }

    fn genesis(tag: &str) -> Genesis {
        Genesis {
            genesis_point: OutPoint {
                txid: Txid::from_byte_array([9u8; 32]),
                vout: 0,
            },
            tag: tag.to_string(),
            meta_hash: Sha256Hash::hash(&[0x00]),
            output_index: 0,
            asset_type: AssetType::Normal,
        }
    }

    fn plain_asset(tag: &str, amount: u64, key_tag: u8) -> Asset {
        Asset::new_genesis(genesis(tag), amount, script_key(key_tag), None)
    }

    fn grouped_asset(tag: &str, amount: u64, key_tag: u8, group_secret: u8) -> Asset {
        let secp = secp();
        let keypair = Keypair::from_secret_key(
            &secp,
            &SecretKey::from_slice(&[group_secret; 32]).unwrap(),
        );
        let mut asset = Asset::new_genesis(genesis(tag), amount, script_key(key_tag), None);
        let msg = Message::from_digest(asset.asset_id().to_byte_array());
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
        asset.group_key = Some(GroupKey {
            group_pubkey: keypair.x_only_public_key().0,
            sig,
        });
        asset
    }

    #[test]
    fn no_assets_is_rejected() {
        assert_eq!(
            AssetCommitment::new(Vec::new()).unwrap_err(),
            CommitmentError::NoAssets
        );
    }

    #[test]
    fn duplicate_script_key_is_rejected() {
        let assets = vec![plain_asset("a", 10, 1), plain_asset("a", 20, 1)];
        assert_eq!(
            AssetCommitment::new(assets).unwrap_err(),
            CommitmentError::DuplicateScriptKey
        );
    }

    #[test]
    fn genesis_mismatch_is_rejected() {
        let assets = vec![plain_asset("a", 10, 1), plain_asset("b", 20, 2)];
        assert_eq!(
            AssetCommitment::new(assets).unwrap_err(),
            CommitmentError::GenesisMismatch
        );
    }

    #[test]
    fn invalid_group_signature_is_rejected() {
        let mut member = grouped_asset("a", 10, 1, 7);
        // Re-sign over a different message so the membership proof breaks.
        let secp = secp();
        let keypair =
            Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[7u8; 32]).unwrap());
        let msg = Message::from_digest([0xAB; 32]);
        member.group_key = Some(GroupKey {
            group_pubkey: keypair.x_only_public_key().0,
            sig: secp.sign_schnorr_no_aux_rand(&msg, &keypair),
        });

        assert_eq!(
            AssetCommitment::new(vec![member]).unwrap_err(),
            CommitmentError::InvalidGenesisSignature
        );
    }

    #[test]
    fn grouped_assets_with_valid_signatures_commit() {
        let members = vec![
            grouped_asset("a", 100, 1, 7),
            grouped_asset("b", 50, 2, 7),
            grouped_asset("c", 25, 3, 7),
        ];
        let commitment = AssetCommitment::new(members).unwrap();
        assert_eq!(commitment.root().sum, 175);
    }

    #[test]
    fn commitment_is_deterministic() {
        let build = || {
            let assets = vec![plain_asset("a", 10, 1), plain_asset("a", 20, 2)];
            let inner = AssetCommitment::new(assets).unwrap();
            TapCommitment::new(vec![inner]).unwrap()
        };

        let first = build();
        let second = build();

        assert_eq!(first.root(), second.root());
        assert_eq!(first.tap_leaf_script(), second.tap_leaf_script());

        let key = internal_key(5);
        let (q1, _) = first.output_key(&key, None).unwrap();
        let (q2, _) = second.output_key(&key, None).unwrap();
        assert_eq!(q1, q2);
    }

    #[test]
    fn tap_leaf_script_layout() {
        let inner = AssetCommitment::new(vec![plain_asset("a", 10, 1)]).unwrap();
        let commitment = TapCommitment::new(vec![inner]).unwrap();

        let script = commitment.tap_leaf_script();
        assert_eq!(script.len(), TAPROOT_ASSET_COMMITMENT_SCRIPT_SIZE);
        assert_eq!(script[0], bitcoin::opcodes::all::OP_RETURN.to_u8());
        assert_eq!(script[1], commitment.version as u8);
        let root = commitment.root();
        assert_eq!(&script[2..34], &root.hash.to_byte_array());
        assert_eq!(&script[34..], &root.sum.to_be_bytes());
    }

    #[test]
    fn sibling_changes_output_key() {
        let inner = AssetCommitment::new(vec![plain_asset("a", 10, 1)]).unwrap();
        let commitment = TapCommitment::new(vec![inner]).unwrap();
        let key = internal_key(5);

        let sibling = TapscriptPreimage {
            // OP_TRUE script as a leaf preimage.
            sibling_preimage: vec![0x51],
            sibling_type: TapscriptPreimageType::LeafPreimage,
        };

        let (bare, _) = commitment.output_key(&key, None).unwrap();
        let (with_sibling, _) = commitment.output_key(&key, Some(&sibling)).unwrap();
        assert_ne!(bare, with_sibling);
    }

    #[test]
    fn inclusion_and_non_inclusion_proofs() {
        let asset = plain_asset("a", 10, 1);
        let asset_key = asset.asset_commitment_key();
        let tap_key = asset.tap_commitment_key();
        let commitment = TapCommitment::from_assets(vec![asset.clone()]).unwrap();

        let (found, proof) = commitment.commitment_proof(tap_key, asset_key);
        assert_eq!(found, Some(&asset));

        // Inner proof verifies the asset leaf into the inner root.
        let inner = commitment.asset_commitment(&tap_key).unwrap();
        let inner_root = inner.root();
        assert!(proof
            .asset_proof
            .as_ref()
            .unwrap()
            .proof
            .verify_inclusion(&asset_key, &asset.leaf(), &inner_root));

        // Outer proof verifies the commitment leaf into the outer root.
        assert!(proof.taproot_asset_proof.proof.verify_inclusion(
            &tap_key,
            &inner.tap_commitment_leaf(),
            &commitment.root()
        ));

        // A foreign asset key yields a non-inclusion proof.
        let absent = plain_asset("a", 10, 9);
        let (missing, proof) =
            commitment.commitment_proof(tap_key, absent.asset_commitment_key());
        assert!(missing.is_none());
        assert!(proof
            .asset_proof
            .unwrap()
            .proof
            .verify_non_inclusion(&absent.asset_commitment_key(), &inner_root));
    }

    #[test]
    fn merge_combines_commitments() {
        let first = TapCommitment::from_assets(vec![plain_asset("a", 10, 1)]).unwrap();
        let mut merged = TapCommitment::from_assets(vec![plain_asset("b", 5, 2)]).unwrap();
        merged.merge(&first).unwrap();

        assert_eq!(merged.root().sum, 15);
        assert_eq!(merged.committed_assets().len(), 2);
    }
}
