//! End-to-end core flow: mint a genesis asset, split it in a transfer,
//! anchor both sides, and verify the resulting proof chains.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash};
use bitcoin::key::TweakedPublicKey;
use bitcoin::pow::CompactTarget;
use bitcoin::secp256k1::{All, Keypair, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut,
    Txid, Witness,
};

use taproot_assets_core::commitment::TapCommitment;
use taproot_assets_core::proof::{
    create_genesis_proof, create_transition_proof, verify_file, verify_proof, BaseProofParams,
    ExclusionProofSpec, SplitRootParams,
};
use taproot_assets_core::split::{SplitCommitment, SplitLocator};
use taproot_assets_core::vm;
use taproot_assets_types::asset::{Asset, AssetType, Genesis, PrevId, SerializedKey};
use taproot_assets_types::proof::{File, MetaReveal, MetaType};

fn secp() -> Secp256k1<All> {
    Secp256k1::new()
}

fn keypair(tag: u8) -> Keypair {
    Keypair::from_secret_key(&secp(), &SecretKey::from_slice(&[tag; 32]).unwrap())
}

fn internal_key(tag: u8) -> bitcoin::secp256k1::PublicKey {
    SecretKey::from_slice(&[tag; 32]).unwrap().public_key(&secp())
}

fn fake_header(txid: Txid) -> Header {
    Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::from_raw_hash(txid.to_raw_hash()),
        time: 0,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: 0,
    }
}

fn p2tr_output(commitment: &TapCommitment, internal: &bitcoin::secp256k1::PublicKey) -> TxOut {
    let (output_key, _) = commitment.output_key(internal, None).unwrap();
    TxOut {
        value: Amount::from_sat(1000),
        script_pubkey: ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(
            output_key,
        )),
    }
}

fn spending_tx(prev_outs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: prev_outs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

#[test]
fn mint_split_and_verify_proof_chain() {
    let owner = keypair(1);
    let receiver_script_key = keypair(2).x_only_public_key().0;
    let change = keypair(3);

    // Mint: a 1000-unit genesis asset anchored at output 0.
    let genesis_point = OutPoint {
        txid: Txid::from_byte_array([0x11; 32]),
        vout: 0,
    };
    let meta = MetaReveal {
        meta_type: MetaType::Opaque,
        data: vec![0x00],
    };
    let genesis = Genesis {
        genesis_point,
        tag: "units".to_string(),
        meta_hash: meta.meta_hash(),
        output_index: 0,
        asset_type: AssetType::Normal,
    };
    let minted = Asset::new_genesis(genesis, 1000, owner.x_only_public_key().0, None);

    let mint_commitment = TapCommitment::from_assets(vec![minted.clone()]).unwrap();
    let mint_internal = internal_key(10);
    let mint_tx = spending_tx(
        vec![genesis_point],
        vec![p2tr_output(&mint_commitment, &mint_internal)],
    );
    let mint_txid = mint_tx.compute_txid();

    let mint_params = BaseProofParams {
        block_header: fake_header(mint_txid),
        block_height: 100,
        block_txids: &[mint_txid],
        tx_index: 0,
        anchor_tx: mint_tx.clone(),
        output_index: 0,
        internal_key: mint_internal,
        commitment: &mint_commitment,
        tapscript_sibling: None,
        exclusions: Vec::new(),
    };
    let genesis_proof = create_genesis_proof(&mint_params, &minted, Some(meta)).unwrap();
    verify_proof(&genesis_proof, None).unwrap();

    let mut file = File::new();
    file.append(genesis_proof.to_bytes().unwrap());

    // Transfer: 300 units to the receiver, 700 back as change.
    let prev_id = PrevId {
        out_point: OutPoint {
            txid: mint_txid,
            vout: 0,
        },
        asset_id: minted.asset_id(),
        script_key: SerializedKey::from_xonly(&minted.script_key),
    };
    let inputs = vec![(prev_id, minted.clone())];
    let mut prev_assets = BTreeMap::new();
    prev_assets.insert(prev_id, minted.clone());

    let root_locator = SplitLocator {
        output_index: 0,
        asset_id: minted.asset_id(),
        script_key: change.x_only_public_key().0,
        amount: 700,
    };
    let recipient_locator = SplitLocator {
        output_index: 1,
        asset_id: minted.asset_id(),
        script_key: receiver_script_key,
        amount: 300,
    };

    let mut split = SplitCommitment::new(&inputs, &root_locator, &[recipient_locator]).unwrap();
    let virtual_tx = vm::virtual_tx(&split.root_asset, &prev_assets).unwrap();
    let witness = vm::sign_key_spend(&secp(), &owner, &virtual_tx, &minted).unwrap();
    split.root_asset.prev_witnesses[0].tx_witness = witness;

    let recipient_asset = split.split_asset(&recipient_locator).unwrap();
    vm::verify(&secp(), &recipient_asset, 1, &prev_assets).unwrap();

    // Anchor both sides of the split into one transaction.
    let change_commitment = TapCommitment::from_assets(vec![split.root_asset.clone()]).unwrap();
    let recipient_commitment = TapCommitment::from_assets(vec![recipient_asset.clone()]).unwrap();
    let change_internal = internal_key(11);
    let recipient_internal = internal_key(12);

    let transfer_tx = spending_tx(
        vec![prev_id.out_point],
        vec![
            p2tr_output(&change_commitment, &change_internal),
            p2tr_output(&recipient_commitment, &recipient_internal),
        ],
    );
    let transfer_txid = transfer_tx.compute_txid();

    let recipient_params = BaseProofParams {
        block_header: fake_header(transfer_txid),
        block_height: 101,
        block_txids: &[transfer_txid],
        tx_index: 0,
        anchor_tx: transfer_tx.clone(),
        output_index: 1,
        internal_key: recipient_internal,
        commitment: &recipient_commitment,
        tapscript_sibling: None,
        exclusions: vec![ExclusionProofSpec::Commitment {
            output_index: 0,
            internal_key: change_internal,
            commitment: &change_commitment,
            tapscript_sibling: None,
        }],
    };
    let split_root_params = SplitRootParams {
        output_index: 0,
        internal_key: change_internal,
        commitment: &change_commitment,
        tapscript_sibling: None,
    };
    let transition_proof = create_transition_proof(
        &recipient_params,
        &recipient_asset,
        prev_id.out_point,
        Some(&split_root_params),
        Vec::new(),
    )
    .unwrap();

    // Appending validates the transition against the file tip; the whole
    // chain then verifies from genesis.
    taproot_assets_core::proof::append_transition(&mut file, &transition_proof).unwrap();
    let final_proof = verify_file(&file).unwrap();
    assert_eq!(final_proof.asset.amount, 300);
    assert_eq!(final_proof.asset.asset_id(), minted.asset_id());
    assert_eq!(
        final_proof.anchor_outpoint(),
        OutPoint {
            txid: transfer_txid,
            vout: 1,
        }
    );

    // A decoded copy of the file still verifies after a wire round trip.
    let decoded = File::from_bytes(&file.to_bytes()).unwrap();
    verify_file(&decoded).unwrap();
}

#[test]
fn tampered_transition_is_rejected() {
    let owner = keypair(1);

    let genesis_point = OutPoint {
        txid: Txid::from_byte_array([0x22; 32]),
        vout: 0,
    };
    let genesis = Genesis {
        genesis_point,
        tag: "units".to_string(),
        meta_hash: Sha256Hash::hash(&[0x00]),
        output_index: 0,
        asset_type: AssetType::Normal,
    };
    let minted = Asset::new_genesis(genesis, 100, owner.x_only_public_key().0, None);

    let commitment = TapCommitment::from_assets(vec![minted.clone()]).unwrap();
    let internal = internal_key(10);
    let mint_tx = spending_tx(vec![genesis_point], vec![p2tr_output(&commitment, &internal)]);
    let mint_txid = mint_tx.compute_txid();

    let params = BaseProofParams {
        block_header: fake_header(mint_txid),
        block_height: 100,
        block_txids: &[mint_txid],
        tx_index: 0,
        anchor_tx: mint_tx,
        output_index: 0,
        internal_key: internal,
        commitment: &commitment,
        tapscript_sibling: None,
        exclusions: Vec::new(),
    };
    let mut proof = create_genesis_proof(&params, &minted, None).unwrap();
    verify_proof(&proof, None).unwrap();

    // Inflating the committed amount breaks the inclusion proof.
    proof.asset.amount = 101;
    assert!(verify_proof(&proof, None).is_err());
}
