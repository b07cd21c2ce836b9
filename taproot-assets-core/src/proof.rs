//! Proof construction and verification.
//!
//! A proof binds one asset state transition to a confirmed Bitcoin
//! transaction: the anchor transaction and its block merkle proof, the
//! resulting asset, an inclusion proof into the anchor output's
//! TapCommitment and exclusion proofs for every other taproot output.
//! Proofs chain into an append-only file, one transition per entry.

use std::collections::BTreeMap;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::{OutPoint, Transaction, Txid};
use thiserror::Error;

use crate::commitment::{
    tap_leaf_hash_of, tapscript_preimage_hash, taproot_output_key, CommitmentError,
    TapCommitment, TAPROOT_ASSET_COMMITMENT_SCRIPT_SIZE,
};
use crate::vm::{self, VmError};
use taproot_assets_types::asset::{Asset, PrevId, SerializedKey};
use taproot_assets_types::commitment::TapCommitmentVersion;
use taproot_assets_types::error::Error as EncodingError;
use taproot_assets_types::mssmt::{LeafNode, Node, TreeError};
use taproot_assets_types::proof::{
    CommitmentProof, File, MetaReveal, Proof, TapscriptProof, TaprootProof, TxMerkleProof,
};
use taproot_assets_types::commitment::TapscriptPreimage;

/// Errors returned during proof construction or verification.
#[derive(Debug, Error)]
pub enum ProofError {
    /// The anchor transaction is not committed to by the block header.
    #[error("proof: invalid tx merkle proof")]
    InvalidMerkleProof,
    /// The proof's previous outpoint does not line up with the prior proof
    /// or is not spent by the anchor transaction.
    #[error("proof: previous outpoint mismatch")]
    PrevOutMismatch,
    /// The referenced output does not exist or is not a taproot output.
    #[error("proof: invalid taproot output {output_index}")]
    InvalidTaprootOutput {
        /// Output index cited by the proof.
        output_index: u32,
    },
    /// The inclusion proof does not derive the anchor output key.
    #[error("proof: invalid inclusion proof")]
    InvalidInclusionProof,
    /// An exclusion proof does not derive its output key.
    #[error("proof: invalid exclusion proof for output {output_index}")]
    InvalidExclusionProof {
        /// Output index cited by the proof.
        output_index: u32,
    },
    /// A taproot output carries no exclusion proof.
    #[error("proof: missing exclusion proof for output {output_index}")]
    MissingExclusionProof {
        /// Output index lacking a proof.
        output_index: u32,
    },
    /// A genesis proof is malformed.
    #[error("proof: invalid genesis proof")]
    InvalidGenesisProof,
    /// The meta reveal does not hash to the genesis meta hash.
    #[error("proof: meta reveal does not match genesis meta hash")]
    MetaHashMismatch,
    /// A split asset proof lacks the split root proof.
    #[error("proof: missing split root proof")]
    MissingSplitRootProof,
    /// The proof file is empty.
    #[error("proof: empty proof file")]
    EmptyFile,
    #[error(transparent)]
    Commitment(#[from] CommitmentError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("proof: encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

/// Everything needed to prove one asset into one anchor output.
pub struct BaseProofParams<'a> {
    /// Header of the confirming block.
    pub block_header: bitcoin::block::Header,
    /// Height of the confirming block.
    pub block_height: u32,
    /// All txids of the confirming block, in block order.
    pub block_txids: &'a [Txid],
    /// Index of the anchor transaction within the block.
    pub tx_index: usize,
    /// The confirmed anchor transaction.
    pub anchor_tx: Transaction,
    /// The anchor output committing to the asset.
    pub output_index: u32,
    /// Internal key of the anchor output.
    pub internal_key: PublicKey,
    /// The TapCommitment held by the anchor output.
    pub commitment: &'a TapCommitment,
    /// Optional non-asset tapscript sibling of the commitment leaf.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// Exclusion data for every other taproot output of the anchor tx.
    pub exclusions: Vec<ExclusionProofSpec<'a>>,
}

/// How to prove the asset absent from one non-anchor output.
pub enum ExclusionProofSpec<'a> {
    /// The output holds another TapCommitment that does not include the
    /// asset.
    Commitment {
        output_index: u32,
        internal_key: PublicKey,
        commitment: &'a TapCommitment,
        tapscript_sibling: Option<TapscriptPreimage>,
    },
    /// The output is a plain BIP-86 wallet output.
    Bip86 {
        output_index: u32,
        internal_key: PublicKey,
    },
}

/// Inclusion context for the root asset of a split.
pub struct SplitRootParams<'a> {
    /// Anchor output of the split root asset.
    pub output_index: u32,
    /// Internal key of that output.
    pub internal_key: PublicKey,
    /// The TapCommitment of that output.
    pub commitment: &'a TapCommitment,
    /// Optional tapscript sibling of that output.
    pub tapscript_sibling: Option<TapscriptPreimage>,
}

/// Builds the genesis proof for a freshly minted asset.
pub fn create_genesis_proof(
    params: &BaseProofParams<'_>,
    asset: &Asset,
    meta_reveal: Option<MetaReveal>,
) -> Result<Proof, ProofError> {
    create_proof(
        params,
        asset,
        asset.genesis.genesis_point,
        meta_reveal,
        None,
        Vec::new(),
    )
}

/// Builds a transition proof for a transferred asset. `prev_out` points at
/// the input whose proof chain this proof extends; the provenance of every
/// further consumed input rides along as a nested file.
pub fn create_transition_proof(
    params: &BaseProofParams<'_>,
    asset: &Asset,
    prev_out: OutPoint,
    split_root: Option<&SplitRootParams<'_>>,
    additional_inputs: Vec<File>,
) -> Result<Proof, ProofError> {
    create_proof(params, asset, prev_out, None, split_root, additional_inputs)
}

fn create_proof(
    params: &BaseProofParams<'_>,
    asset: &Asset,
    prev_out: OutPoint,
    meta_reveal: Option<MetaReveal>,
    split_root: Option<&SplitRootParams<'_>>,
    additional_inputs: Vec<File>,
) -> Result<Proof, ProofError> {
    let tx_merkle_proof = TxMerkleProof::from_txids(params.block_txids, params.tx_index)?;

    let inclusion_proof = inclusion_taproot_proof(
        params.output_index,
        params.internal_key,
        params.commitment,
        params.tapscript_sibling.clone(),
        asset,
    );

    let split_root_proof = match split_root {
        Some(root_params) => {
            let root_asset = asset.prev_witnesses[0]
                .split_commitment
                .as_ref()
                .map(|witness| witness.root_asset.as_ref())
                .ok_or(ProofError::MissingSplitRootProof)?;
            Some(inclusion_taproot_proof(
                root_params.output_index,
                root_params.internal_key,
                root_params.commitment,
                root_params.tapscript_sibling.clone(),
                root_asset,
            ))
        }
        None => None,
    };

    let mut exclusion_proofs = Vec::with_capacity(params.exclusions.len());
    for spec in &params.exclusions {
        exclusion_proofs.push(exclusion_taproot_proof(spec, asset));
    }

    Ok(Proof {
        version: 0,
        prev_out,
        block_header: params.block_header,
        block_height: params.block_height,
        anchor_tx: params.anchor_tx.clone(),
        tx_merkle_proof,
        asset: asset.clone(),
        inclusion_proof,
        exclusion_proofs,
        split_root_proof,
        meta_reveal,
        additional_inputs,
    })
}

fn inclusion_taproot_proof(
    output_index: u32,
    internal_key: PublicKey,
    commitment: &TapCommitment,
    tapscript_sibling: Option<TapscriptPreimage>,
    asset: &Asset,
) -> TaprootProof {
    let (_, proof) =
        commitment.commitment_proof(asset.tap_commitment_key(), asset.asset_commitment_key());
    TaprootProof {
        output_index,
        internal_key,
        commitment_proof: Some(CommitmentProof {
            proof,
            tap_sibling_preimage: tapscript_sibling,
        }),
        tapscript_proof: None,
    }
}

fn exclusion_taproot_proof(spec: &ExclusionProofSpec<'_>, asset: &Asset) -> TaprootProof {
    match spec {
        ExclusionProofSpec::Commitment {
            output_index,
            internal_key,
            commitment,
            tapscript_sibling,
        } => {
            let (_, proof) = commitment
                .commitment_proof(asset.tap_commitment_key(), asset.asset_commitment_key());
            TaprootProof {
                output_index: *output_index,
                internal_key: *internal_key,
                commitment_proof: Some(CommitmentProof {
                    proof,
                    tap_sibling_preimage: tapscript_sibling.clone(),
                }),
                tapscript_proof: None,
            }
        }
        ExclusionProofSpec::Bip86 {
            output_index,
            internal_key,
        } => TaprootProof {
            output_index: *output_index,
            internal_key: *internal_key,
            commitment_proof: None,
            tapscript_proof: Some(TapscriptProof {
                tap_preimage1: None,
                tap_preimage2: None,
                bip86: true,
            }),
        },
    }
}

/// Verifies one proof, optionally against the previous proof in its chain.
/// A `None` previous proof means this must be a genesis proof.
pub fn verify_proof(proof: &Proof, prev: Option<&Proof>) -> Result<(), ProofError> {
    let anchor_txid = proof.anchor_tx.compute_txid();
    if !proof
        .tx_merkle_proof
        .verify(&anchor_txid, &proof.block_header.merkle_root)
    {
        return Err(ProofError::InvalidMerkleProof);
    }

    let mut prev_assets: BTreeMap<PrevId, Asset> = BTreeMap::new();
    match prev {
        Some(prev_proof) => {
            let prev_outpoint = prev_proof.anchor_outpoint();
            if proof.prev_out != prev_outpoint {
                return Err(ProofError::PrevOutMismatch);
            }
            if !proof
                .anchor_tx
                .input
                .iter()
                .any(|input| input.previous_output == proof.prev_out)
            {
                return Err(ProofError::PrevOutMismatch);
            }

            let prev_id = PrevId {
                out_point: prev_outpoint,
                asset_id: prev_proof.asset.asset_id(),
                script_key: SerializedKey::from_xonly(&prev_proof.asset.script_key),
            };
            prev_assets.insert(prev_id, prev_proof.asset.clone());

            // Every further consumed input carries its full provenance as
            // a nested file: verify each chain and require the anchor
            // transaction to spend its final outpoint.
            for additional in &proof.additional_inputs {
                let final_proof = verify_file(additional)?;
                let additional_outpoint = final_proof.anchor_outpoint();
                if !proof
                    .anchor_tx
                    .input
                    .iter()
                    .any(|input| input.previous_output == additional_outpoint)
                {
                    return Err(ProofError::PrevOutMismatch);
                }

                let prev_id = PrevId {
                    out_point: additional_outpoint,
                    asset_id: final_proof.asset.asset_id(),
                    script_key: SerializedKey::from_xonly(&final_proof.asset.script_key),
                };
                prev_assets.insert(prev_id, final_proof.asset);
            }
        }
        None => {
            // Genesis proofs mint the asset: the genesis point is the first
            // input of the anchor transaction.
            if !proof.asset.is_genesis_asset() || !proof.additional_inputs.is_empty() {
                return Err(ProofError::InvalidGenesisProof);
            }
            if proof.prev_out != proof.asset.genesis.genesis_point {
                return Err(ProofError::InvalidGenesisProof);
            }
            let first_input = proof
                .anchor_tx
                .input
                .first()
                .ok_or(ProofError::InvalidGenesisProof)?;
            if first_input.previous_output != proof.asset.genesis.genesis_point {
                return Err(ProofError::InvalidGenesisProof);
            }
            if let Some(meta_reveal) = &proof.meta_reveal {
                if meta_reveal.meta_hash() != proof.asset.genesis.meta_hash {
                    return Err(ProofError::MetaHashMismatch);
                }
            }
        }
    }

    // The witness set must validate under the asset VM.
    let secp = Secp256k1::verification_only();
    vm::verify(
        &secp,
        &proof.asset,
        proof.inclusion_proof.output_index,
        &prev_assets,
    )?;

    // Inclusion: the derived output key must match the anchor output.
    verify_taproot_proof(&proof.inclusion_proof, &proof.asset, &proof.anchor_tx, true)?;

    // Split assets additionally prove their root asset's inclusion.
    if proof.asset.has_split_commitment_witness() {
        let split_root_proof = proof
            .split_root_proof
            .as_ref()
            .ok_or(ProofError::MissingSplitRootProof)?;
        let root_asset = proof.asset.prev_witnesses[0]
            .split_commitment
            .as_ref()
            .map(|witness| witness.root_asset.as_ref())
            .ok_or(ProofError::MissingSplitRootProof)?;
        verify_taproot_proof(split_root_proof, root_asset, &proof.anchor_tx, true)?;
    }

    // Exclusion: every other taproot output must prove the asset absent.
    for (index, output) in proof.anchor_tx.output.iter().enumerate() {
        let index = index as u32;
        if index == proof.inclusion_proof.output_index || !output.script_pubkey.is_p2tr() {
            continue;
        }

        let exclusion = proof
            .exclusion_proofs
            .iter()
            .find(|candidate| candidate.output_index == index)
            .ok_or(ProofError::MissingExclusionProof {
                output_index: index,
            })?;
        verify_taproot_proof(exclusion, &proof.asset, &proof.anchor_tx, false)?;
    }

    Ok(())
}

/// Verifies a whole proof file from genesis onward and returns the final
/// proof.
pub fn verify_file(file: &File) -> Result<Proof, ProofError> {
    if file.is_empty() {
        return Err(ProofError::EmptyFile);
    }

    let mut prev: Option<Proof> = None;
    for index in 0..file.num_proofs() {
        let proof = file.proof_at(index)?;
        verify_proof(&proof, prev.as_ref())?;
        prev = Some(proof);
    }

    // The loop ran at least once, so prev is always set here.
    prev.ok_or(ProofError::EmptyFile)
}

/// Verifies a transition proof against the file's current tip and appends
/// it.
pub fn append_transition(file: &mut File, proof: &Proof) -> Result<(), ProofError> {
    let last = file.last_proof().map_err(ProofError::Encoding)?;
    verify_proof(proof, Some(&last))?;
    file.append(proof.to_bytes()?);
    Ok(())
}

/// Summary of the TapCommitment derived while walking a commitment proof.
struct DerivedCommitment {
    version: TapCommitmentVersion,
    root: Node,
}

fn verify_taproot_proof(
    taproot_proof: &TaprootProof,
    asset: &Asset,
    anchor_tx: &Transaction,
    inclusion: bool,
) -> Result<(), ProofError> {
    let expected_key = anchor_output_key(anchor_tx, taproot_proof.output_index)?;

    let invalid = || {
        if inclusion {
            ProofError::InvalidInclusionProof
        } else {
            ProofError::InvalidExclusionProof {
                output_index: taproot_proof.output_index,
            }
        }
    };

    match (&taproot_proof.commitment_proof, &taproot_proof.tapscript_proof) {
        (Some(commitment_proof), None) => {
            let derived = if inclusion {
                derive_by_asset_inclusion(commitment_proof, asset)?
            } else {
                derive_by_asset_exclusion(commitment_proof, asset)?
            };

            let script = tap_leaf_script_for(derived.version, &derived.root);
            let leaf_hash = tap_leaf_hash_of(&script)?;
            let merkle_root = match commitment_proof.tap_sibling_preimage.as_ref() {
                Some(preimage) => bitcoin::taproot::TapNodeHash::from_node_hashes(
                    leaf_hash,
                    tapscript_preimage_hash(preimage)?,
                ),
                None => leaf_hash,
            };
            let (derived_key, _) =
                taproot_output_key(&taproot_proof.internal_key, Some(merkle_root));
            if derived_key != expected_key {
                return Err(invalid());
            }
            Ok(())
        }
        (None, Some(tapscript_proof)) => {
            if inclusion {
                return Err(invalid());
            }
            let merkle_root = tapscript_proof_root(tapscript_proof)?;
            let (derived_key, _) = taproot_output_key(&taproot_proof.internal_key, merkle_root);
            if derived_key != expected_key {
                return Err(invalid());
            }
            Ok(())
        }
        _ => Err(invalid()),
    }
}

fn derive_by_asset_inclusion(
    commitment_proof: &CommitmentProof,
    asset: &Asset,
) -> Result<DerivedCommitment, ProofError> {
    let asset_proof = commitment_proof
        .proof
        .asset_proof
        .as_ref()
        .ok_or(ProofError::InvalidInclusionProof)?;
    if asset_proof.tap_key != asset.tap_commitment_key() {
        return Err(ProofError::InvalidInclusionProof);
    }

    let asset_key = asset.asset_commitment_key();
    let inner_root = asset_proof.proof.root(&asset_key, &asset.leaf())?;
    let commitment_leaf = asset_commitment_leaf(asset_proof.version as u8, &inner_root);
    let outer_root = commitment_proof
        .proof
        .taproot_asset_proof
        .proof
        .root(&asset_proof.tap_key, &commitment_leaf)?;

    Ok(DerivedCommitment {
        version: commitment_proof.proof.taproot_asset_proof.version,
        root: outer_root,
    })
}

fn derive_by_asset_exclusion(
    commitment_proof: &CommitmentProof,
    asset: &Asset,
) -> Result<DerivedCommitment, ProofError> {
    let tap_key = asset.tap_commitment_key();
    let taproot_asset_proof = &commitment_proof.proof.taproot_asset_proof;

    let outer_root = match commitment_proof.proof.asset_proof.as_ref() {
        // The asset commitment exists but our asset is absent from it.
        Some(asset_proof) => {
            let asset_key = asset.asset_commitment_key();
            let inner_root = asset_proof.proof.root(&asset_key, &LeafNode::empty())?;
            let commitment_leaf = asset_commitment_leaf(asset_proof.version as u8, &inner_root);
            taproot_asset_proof
                .proof
                .root(&asset_proof.tap_key, &commitment_leaf)?
        }
        // No commitment exists for the asset's identifier at all.
        None => taproot_asset_proof.proof.root(&tap_key, &LeafNode::empty())?,
    };

    Ok(DerivedCommitment {
        version: taproot_asset_proof.version,
        root: outer_root,
    })
}

/// The outer-tree leaf payload for an inner commitment root.
fn asset_commitment_leaf(version: u8, inner_root: &Node) -> LeafNode {
    let mut value = Vec::with_capacity(1 + 32 + 8);
    value.push(version);
    value.extend_from_slice(&inner_root.hash.to_byte_array());
    value.extend_from_slice(&inner_root.sum.to_be_bytes());
    LeafNode::new(value, inner_root.sum)
}

/// The tapscript leaf script for a commitment version and outer root.
fn tap_leaf_script_for(version: TapCommitmentVersion, root: &Node) -> Vec<u8> {
    let mut script = Vec::with_capacity(TAPROOT_ASSET_COMMITMENT_SCRIPT_SIZE);
    script.push(bitcoin::opcodes::all::OP_RETURN.to_u8());
    script.push(version as u8);
    script.extend_from_slice(&root.hash.to_byte_array());
    script.extend_from_slice(&root.sum.to_be_bytes());
    script
}

fn tapscript_proof_root(
    proof: &TapscriptProof,
) -> Result<Option<bitcoin::taproot::TapNodeHash>, ProofError> {
    match (&proof.tap_preimage1, &proof.tap_preimage2) {
        (Some(first), Some(second)) => Ok(Some(bitcoin::taproot::TapNodeHash::from_node_hashes(
            tapscript_preimage_hash(first)?,
            tapscript_preimage_hash(second)?,
        ))),
        (Some(first), None) => Ok(Some(tapscript_preimage_hash(first)?)),
        (None, None) if proof.bip86 => Ok(None),
        _ => Err(ProofError::InvalidExclusionProof { output_index: 0 }),
    }
}

/// Extracts the x-only output key of a taproot output.
pub fn anchor_output_key(
    anchor_tx: &Transaction,
    output_index: u32,
) -> Result<XOnlyPublicKey, ProofError> {
    let output = anchor_tx
        .output
        .get(output_index as usize)
        .ok_or(ProofError::InvalidTaprootOutput { output_index })?;
    if !output.script_pubkey.is_p2tr() {
        return Err(ProofError::InvalidTaprootOutput { output_index });
    }

    let bytes = output.script_pubkey.as_bytes();
    XOnlyPublicKey::from_slice(&bytes[2..34])
        .map_err(|_| ProofError::InvalidTaprootOutput { output_index })
}
