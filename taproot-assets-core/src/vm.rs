//! The asset VM.
//!
//! Asset state transitions are validated against a synthetic one-input,
//! one-output Bitcoin transaction. The sighash is the BIP-341 key-spend
//! sighash of that synthetic transaction, so every previous witness is a
//! plain schnorr signature under the spent asset's script key.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash, HashEngine};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, Signing, Verification};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use thiserror::Error;

use crate::split::{SplitCommitment, SplitLocator};
use taproot_assets_types::asset::{Asset, AssetType, PrevId};

/// Errors returned by the asset VM.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// A transfer references no inputs.
    #[error("virtual tx: no inputs")]
    NoInputs,
    /// A previous witness references an input asset that was not supplied.
    #[error("virtual tx: missing input asset")]
    MissingInputAsset,
    /// Input and output amounts disagree.
    #[error("virtual tx: input amount {input_amount} != output amount {output_amount}")]
    AmountMismatch {
        /// Total amount consumed.
        input_amount: u64,
        /// Total amount produced.
        output_amount: u64,
    },
    /// A previous witness is malformed or its signature does not verify.
    #[error("virtual tx: invalid transfer witness")]
    InvalidTransferWitness,
    /// A split witness does not prove its leaf into the root asset.
    #[error("virtual tx: invalid split commitment proof")]
    InvalidSplitCommitmentProof,
    /// A genesis asset carries a non-genesis witness layout.
    #[error("virtual tx: invalid genesis witness")]
    InvalidGenesisWitness,
    /// A grouped asset's membership signature does not verify.
    #[error("virtual tx: invalid group membership signature")]
    InvalidGroupSignature,
    /// Only script version 0 is defined.
    #[error("virtual tx: unknown script version {0}")]
    InvalidScriptVersion(u16),
    /// Collectibles have amount one and are never split.
    #[error("virtual tx: invalid collectible amount")]
    InvalidCollectibleAmount,
    /// Sighash computation failed.
    #[error("virtual tx: sighash failed: {0}")]
    Sighash(String),
}

/// Builds the synthetic transaction representing the state transition into
/// `new_asset`. All inputs are aggregated into a single synthetic txin
/// whose outpoint commits to the sorted previous IDs and amounts; the
/// single output commits to the new asset minus its witness data.
pub fn virtual_tx(
    new_asset: &Asset,
    prev_assets: &BTreeMap<PrevId, Asset>,
) -> Result<Transaction, VmError> {
    if prev_assets.is_empty() {
        return Err(VmError::NoInputs);
    }

    let mut engine = Sha256Hash::engine();
    for (prev_id, prev_asset) in prev_assets {
        let mut bytes = Vec::new();
        encode_prev_id(prev_id, &mut bytes);
        engine.input(&bytes);
        engine.input(&prev_asset.amount.to_be_bytes());
    }
    let input_digest = Sha256Hash::from_engine(engine).to_byte_array();

    let output_amount = virtual_output_amount(new_asset);
    let output_digest =
        Sha256Hash::hash(&new_asset.encode_tlv(false)).to_byte_array();

    Ok(Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array(input_digest),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(output_amount),
            script_pubkey: synthetic_p2tr(&output_digest),
        }],
    })
}

/// The full amount moved by the transition: the split tree sum for split
/// roots, the plain asset amount otherwise.
fn virtual_output_amount(asset: &Asset) -> u64 {
    asset
        .split_commitment_root
        .as_ref()
        .map(|root| root.sum)
        .unwrap_or(asset.amount)
}

/// A synthetic P2TR-shaped script wrapping a 32-byte digest.
fn synthetic_p2tr(digest: &[u8; 32]) -> ScriptBuf {
    let mut script = Vec::with_capacity(34);
    script.push(0x51); // OP_1
    script.push(0x20); // OP_PUSHBYTES_32
    script.extend_from_slice(digest);
    ScriptBuf::from_bytes(script)
}

/// Computes the BIP-341 style key-spend sighash of the virtual transaction
/// for one of its previous inputs.
pub fn sighash(tx: &Transaction, input_asset: &Asset) -> Result<[u8; 32], VmError> {
    let prevout = TxOut {
        value: Amount::from_sat(input_asset.amount),
        script_pubkey: synthetic_p2tr(&input_asset.script_key.serialize()),
    };

    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(0, &Prevouts::All(&[prevout]), TapSighashType::Default)
        .map_err(|e| VmError::Sighash(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

/// Produces the key-spend witness for one previous input: a single schnorr
/// signature under the owner's script key.
pub fn sign_key_spend<C: Signing>(
    secp: &Secp256k1<C>,
    keypair: &Keypair,
    tx: &Transaction,
    input_asset: &Asset,
) -> Result<Witness, VmError> {
    let digest = sighash(tx, input_asset)?;
    let msg = Message::from_digest(digest);
    let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);
    Ok(Witness::from_slice(&[sig.serialize()]))
}

/// Validates an asset state transition.
///
/// Genesis assets need a genesis witness layout (and a valid group
/// membership signature when grouped). Split assets are traced back to
/// their root asset via the split commitment proof; the root's transfer
/// witness is then validated like any other transfer. Failure is fatal for
/// the transfer.
pub fn verify<C: Verification>(
    secp: &Secp256k1<C>,
    asset: &Asset,
    output_index: u32,
    prev_assets: &BTreeMap<PrevId, Asset>,
) -> Result<(), VmError> {
    if asset.script_version != 0 {
        return Err(VmError::InvalidScriptVersion(asset.script_version));
    }
    if asset.genesis.asset_type == AssetType::Collectible
        && (asset.amount != 1 || asset.split_commitment_root.is_some())
    {
        return Err(VmError::InvalidCollectibleAmount);
    }

    if asset.is_genesis_asset() {
        return verify_genesis(secp, asset);
    }

    if asset.has_split_commitment_witness() {
        return verify_split(secp, asset, output_index, prev_assets);
    }

    verify_transfer(secp, asset, prev_assets)
}

fn verify_genesis<C: Verification>(secp: &Secp256k1<C>, asset: &Asset) -> Result<(), VmError> {
    if asset.prev_witnesses.len() != 1 {
        return Err(VmError::InvalidGenesisWitness);
    }

    if let Some(group) = &asset.group_key {
        let msg = Message::from_digest(asset.asset_id().to_byte_array());
        secp.verify_schnorr(&group.sig, &msg, &group.group_pubkey)
            .map_err(|_| VmError::InvalidGroupSignature)?;
    }
    Ok(())
}

fn verify_split<C: Verification>(
    secp: &Secp256k1<C>,
    asset: &Asset,
    output_index: u32,
    prev_assets: &BTreeMap<PrevId, Asset>,
) -> Result<(), VmError> {
    let witness = asset.prev_witnesses[0]
        .split_commitment
        .as_ref()
        .ok_or(VmError::InvalidTransferWitness)?;

    let root_asset = witness.root_asset.as_ref();
    let split_root = root_asset
        .split_commitment_root
        .as_ref()
        .ok_or(VmError::InvalidSplitCommitmentProof)?;

    // The committed leaf is the split asset without its split witness,
    // keyed by its locator.
    let locator = SplitLocator {
        output_index,
        asset_id: asset.asset_id(),
        script_key: asset.script_key,
        amount: asset.amount,
    };
    let leaf = SplitCommitment::rebuild_split_leaf(asset);
    if !witness.proof.verify_inclusion(&locator.key(), &leaf, split_root) {
        return Err(VmError::InvalidSplitCommitmentProof);
    }

    // The root asset must itself be a valid transfer.
    verify_transfer(secp, root_asset, prev_assets)
}

fn verify_transfer<C: Verification>(
    secp: &Secp256k1<C>,
    asset: &Asset,
    prev_assets: &BTreeMap<PrevId, Asset>,
) -> Result<(), VmError> {
    if asset.prev_witnesses.is_empty() {
        return Err(VmError::InvalidTransferWitness);
    }

    let mut input_amount: u64 = 0;
    for witness in &asset.prev_witnesses {
        let prev_id = witness.prev_id.ok_or(VmError::InvalidTransferWitness)?;
        let prev_asset = prev_assets
            .get(&prev_id)
            .ok_or(VmError::MissingInputAsset)?;
        input_amount = input_amount
            .checked_add(prev_asset.amount)
            .ok_or(VmError::InvalidTransferWitness)?;
    }

    let output_amount = virtual_output_amount(asset);
    if input_amount != output_amount {
        return Err(VmError::AmountMismatch {
            input_amount,
            output_amount,
        });
    }

    let tx = virtual_tx(asset, prev_assets)?;
    for witness in &asset.prev_witnesses {
        let prev_id = witness.prev_id.ok_or(VmError::InvalidTransferWitness)?;
        let prev_asset = prev_assets
            .get(&prev_id)
            .ok_or(VmError::MissingInputAsset)?;

        // One 64-byte schnorr signature per previous input.
        if witness.tx_witness.len() != 1 {
            return Err(VmError::InvalidTransferWitness);
        }
        let sig_bytes = witness
            .tx_witness
            .nth(0)
            .ok_or(VmError::InvalidTransferWitness)?;
        let sig = bitcoin::secp256k1::schnorr::Signature::from_slice(sig_bytes)
            .map_err(|_| VmError::InvalidTransferWitness)?;

        let digest = sighash(&tx, prev_asset)?;
        let msg = Message::from_digest(digest);
        secp.verify_schnorr(&sig, &msg, &prev_asset.script_key)
            .map_err(|_| VmError::InvalidTransferWitness)?;
    }

    Ok(())
}

fn encode_prev_id(prev_id: &PrevId, out: &mut Vec<u8>) {
    out.extend_from_slice(&prev_id.out_point.txid.to_byte_array());
    out.extend_from_slice(&prev_id.out_point.vout.to_be_bytes());
    out.extend_from_slice(&prev_id.asset_id.to_byte_array());
    out.extend_from_slice(&prev_id.script_key.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{All, SecretKey};
    use taproot_assets_types::asset::{Genesis, PrevWitness, SerializedKey};

    fn secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    fn keypair(tag: u8) -> Keypair {
        Keypair::from_secret_key(&secp(), &SecretKey::from_slice(&[tag; 32]).unwrap())
    }

    fn genesis_asset(amount: u64, owner: &Keypair) -> Asset {
        let genesis = Genesis {
            genesis_point: OutPoint {
                txid: Txid::from_byte_array([1u8; 32]),
                vout: 0,
            },
            tag: "units".to_string(),
            meta_hash: Sha256Hash::hash(&[]),
            output_index: 0,
            asset_type: AssetType::Normal,
        };
        Asset::new_genesis(genesis, amount, owner.x_only_public_key().0, None)
    }

    fn transfer_setup(owner: &Keypair, receiver: &Keypair) -> (Asset, BTreeMap<PrevId, Asset>) {
        let input = genesis_asset(500, owner);
        let prev_id = PrevId {
            out_point: OutPoint {
                txid: Txid::from_byte_array([2u8; 32]),
                vout: 0,
            },
            asset_id: input.asset_id(),
            script_key: SerializedKey::from_xonly(&input.script_key),
        };

        let mut moved = input.clone();
        moved.script_key = receiver.x_only_public_key().0;
        moved.prev_witnesses = vec![PrevWitness {
            prev_id: Some(prev_id),
            tx_witness: Witness::new(),
            split_commitment: None,
        }];

        let mut inputs = BTreeMap::new();
        inputs.insert(prev_id, input);
        (moved, inputs)
    }

    #[test]
    fn genesis_asset_verifies() {
        let owner = keypair(1);
        let asset = genesis_asset(100, &owner);
        verify(&secp(), &asset, 0, &BTreeMap::new()).unwrap();
    }

    #[test]
    fn signed_transfer_verifies() {
        let owner = keypair(1);
        let receiver = keypair(2);
        let (mut moved, inputs) = transfer_setup(&owner, &receiver);

        let tx = virtual_tx(&moved, &inputs).unwrap();
        let input_asset = inputs.values().next().unwrap();
        let witness = sign_key_spend(&secp(), &owner, &tx, input_asset).unwrap();
        moved.prev_witnesses[0].tx_witness = witness;

        verify(&secp(), &moved, 0, &inputs).unwrap();
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let owner = keypair(1);
        let receiver = keypair(2);
        let intruder = keypair(3);
        let (mut moved, inputs) = transfer_setup(&owner, &receiver);

        let tx = virtual_tx(&moved, &inputs).unwrap();
        let input_asset = inputs.values().next().unwrap();
        let witness = sign_key_spend(&secp(), &intruder, &tx, input_asset).unwrap();
        moved.prev_witnesses[0].tx_witness = witness;

        assert_eq!(
            verify(&secp(), &moved, 0, &inputs).unwrap_err(),
            VmError::InvalidTransferWitness
        );
    }

    #[test]
    fn amount_inflation_is_rejected() {
        let owner = keypair(1);
        let receiver = keypair(2);
        let (mut moved, inputs) = transfer_setup(&owner, &receiver);
        moved.amount = 501;

        let tx = virtual_tx(&moved, &inputs).unwrap();
        let input_asset = inputs.values().next().unwrap();
        moved.prev_witnesses[0].tx_witness =
            sign_key_spend(&secp(), &owner, &tx, input_asset).unwrap();

        assert_eq!(
            verify(&secp(), &moved, 0, &inputs).unwrap_err(),
            VmError::AmountMismatch {
                input_amount: 500,
                output_amount: 501,
            }
        );
    }

    #[test]
    fn witness_mutation_invalidates_signature() {
        let owner = keypair(1);
        let receiver = keypair(2);
        let (mut moved, inputs) = transfer_setup(&owner, &receiver);

        let tx = virtual_tx(&moved, &inputs).unwrap();
        let input_asset = inputs.values().next().unwrap();
        moved.prev_witnesses[0].tx_witness =
            sign_key_spend(&secp(), &owner, &tx, input_asset).unwrap();

        // Re-route the output to a different script key after signing.
        moved.script_key = keypair(9).x_only_public_key().0;
        assert_eq!(
            verify(&secp(), &moved, 0, &inputs).unwrap_err(),
            VmError::InvalidTransferWitness
        );
    }
}
