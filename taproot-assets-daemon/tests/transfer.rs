//! Outbound transfer tests, driving the chain porter through mock
//! backends: splits, tombstones, passive re-anchoring and parcel replay.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash};
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use tokio::sync::watch;

use taproot_assets_core::commitment::TapCommitment;
use taproot_assets_core::proof::{create_genesis_proof, verify_file, verify_proof, BaseProofParams};
use taproot_assets_core::split::SplitCommitment;
use taproot_assets_daemon::freighter::{ChainPorter, Parcel, PorterConfig};
use taproot_assets_daemon::mock::{
    MockChainBridge, MockCoinLister, MockExportLog, MockKeyRing, MockProofArchive, MockSigner,
    MockWalletAnchor,
};
use taproot_assets_daemon::wallet::{
    bip86_script_key, AnnotatedProof, KeyRing, ProofArchive, ProofLocator,
    TAPROOT_ASSETS_KEY_FAMILY,
};
use taproot_assets_daemon::Error;
use taproot_assets_psbt::VOutputType;
use taproot_assets_types::address::{TapAddress, MAINNET};
use taproot_assets_types::asset::{Asset, AssetType, Genesis};
use taproot_assets_types::proof::{File, MetaReveal, MetaType};

use taproot_assets_daemon::freighter::AnchoredCommitment;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TransferHarness {
    chain: Arc<MockChainBridge>,
    wallet: Arc<MockWalletAnchor>,
    key_ring: Arc<MockKeyRing>,
    archive: Arc<MockProofArchive>,
    coins: Arc<MockCoinLister>,
    export_log: Arc<MockExportLog>,
    porter: Option<Arc<ChainPorter>>,
}

impl TransferHarness {
    fn new() -> Self {
        let coins = Arc::new(MockCoinLister::new());
        TransferHarness {
            chain: Arc::new(MockChainBridge::new()),
            wallet: Arc::new(MockWalletAnchor::new()),
            key_ring: Arc::new(MockKeyRing::new()),
            archive: Arc::new(MockProofArchive::new()),
            export_log: Arc::new(MockExportLog::new(coins.clone())),
            coins,
            porter: None,
        }
    }

    async fn start_porter(&mut self) {
        if let Some(porter) = self.porter.take() {
            // Clones of the handle may still sit in in-flight shipment
            // tasks; signalling shutdown is enough to unblock them.
            porter.stop();
        }

        let porter = ChainPorter::start(PorterConfig {
            coin_lister: self.coins.clone(),
            signer: Arc::new(MockSigner::new(self.key_ring.clone())),
            chain_bridge: self.chain.clone(),
            wallet: self.wallet.clone(),
            export_log: self.export_log.clone(),
            proof_archive: self.archive.clone(),
            key_ring: self.key_ring.clone(),
            chain_params: &MAINNET,
        })
        .await
        .expect("porter start");
        self.porter = Some(Arc::new(porter));
    }

    fn porter(&self) -> Arc<ChainPorter> {
        self.porter.clone().expect("porter running")
    }

    /// Mints the given assets directly into one shared anchor outpoint:
    /// genesis proofs land in the archive, the commitments in the coin
    /// store.
    async fn seed_assets(&self, specs: &[(&str, u64)]) -> Vec<Asset> {
        let genesis_point = OutPoint {
            txid: bitcoin::Txid::from_byte_array([0x77; 32]),
            vout: 0,
        };

        let mut assets = Vec::new();
        for (tag, amount) in specs {
            let script_key_desc = self
                .key_ring
                .derive_next_key(TAPROOT_ASSETS_KEY_FAMILY)
                .await
                .expect("derive script key");
            let genesis = Genesis {
                genesis_point,
                tag: tag.to_string(),
                meta_hash: Sha256Hash::hash(&[0x00]),
                output_index: 0,
                asset_type: AssetType::Normal,
            };
            assets.push(Asset::new_genesis(
                genesis,
                *amount,
                bip86_script_key(&script_key_desc.pub_key),
                None,
            ));
        }

        let internal_desc = self
            .key_ring
            .derive_next_key(TAPROOT_ASSETS_KEY_FAMILY)
            .await
            .expect("derive internal key");
        let commitment = TapCommitment::from_assets(assets.clone()).expect("commitment");
        let (output_key, _) = commitment
            .output_key(&internal_desc.pub_key, None)
            .expect("output key");

        let genesis_tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: genesis_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: ScriptBuf::new_p2tr_tweaked(
                    TweakedPublicKey::dangerous_assume_tweaked(output_key),
                ),
            }],
        };
        let confirmation = self.chain.confirm_tx(&genesis_tx);

        for asset in &assets {
            let params = BaseProofParams {
                block_header: confirmation.block_header,
                block_height: confirmation.block_height,
                block_txids: &confirmation.block_txids,
                tx_index: confirmation.tx_index,
                anchor_tx: genesis_tx.clone(),
                output_index: 0,
                internal_key: internal_desc.pub_key,
                commitment: &commitment,
                tapscript_sibling: None,
                exclusions: Vec::new(),
            };
            let proof = create_genesis_proof(
                &params,
                asset,
                Some(MetaReveal {
                    meta_type: MetaType::Opaque,
                    data: vec![0x00],
                }),
            )
            .expect("genesis proof");
            verify_proof(&proof, None).expect("genesis proof verifies");

            let mut file = File::new();
            file.append(proof.to_bytes().expect("proof bytes"));
            self.archive
                .import_proofs(vec![AnnotatedProof {
                    locator: ProofLocator {
                        asset_id: asset.asset_id(),
                        script_key: asset.script_key,
                    },
                    blob: file.to_bytes(),
                }])
                .await
                .expect("archive import");
        }

        let anchor_point = OutPoint {
            txid: genesis_tx.compute_txid(),
            vout: 0,
        };
        for asset in &assets {
            self.coins.add_commitment(AnchoredCommitment {
                anchor_point,
                anchor_output_value: Amount::from_sat(1000),
                internal_key: internal_desc,
                tapscript_sibling: None,
                commitment: commitment.clone(),
                asset: asset.clone(),
            });
        }

        assets
    }

    /// Mints several tranches of one fungible asset, each under its own
    /// script key and anchored at its own outpoint, so coin selection has
    /// to merge them.
    async fn seed_fungible_commitments(&self, tag: &str, amounts: &[u64]) -> Vec<Asset> {
        let genesis_point = OutPoint {
            txid: bitcoin::Txid::from_byte_array([0x66; 32]),
            vout: 0,
        };

        let mut assets = Vec::new();
        for amount in amounts {
            let script_key_desc = self
                .key_ring
                .derive_next_key(TAPROOT_ASSETS_KEY_FAMILY)
                .await
                .expect("derive script key");
            let genesis = Genesis {
                genesis_point,
                tag: tag.to_string(),
                meta_hash: Sha256Hash::hash(&[0x00]),
                output_index: 0,
                asset_type: AssetType::Normal,
            };
            let asset = Asset::new_genesis(
                genesis,
                *amount,
                bip86_script_key(&script_key_desc.pub_key),
                None,
            );

            let internal_desc = self
                .key_ring
                .derive_next_key(TAPROOT_ASSETS_KEY_FAMILY)
                .await
                .expect("derive internal key");
            let commitment = TapCommitment::from_assets(vec![asset.clone()]).expect("commitment");
            let (output_key, _) = commitment
                .output_key(&internal_desc.pub_key, None)
                .expect("output key");

            let seed_tx = Transaction {
                version: Version(2),
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: genesis_point,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                }],
                output: vec![TxOut {
                    value: Amount::from_sat(1000),
                    script_pubkey: ScriptBuf::new_p2tr_tweaked(
                        TweakedPublicKey::dangerous_assume_tweaked(output_key),
                    ),
                }],
            };
            let confirmation = self.chain.confirm_tx(&seed_tx);

            let params = BaseProofParams {
                block_header: confirmation.block_header,
                block_height: confirmation.block_height,
                block_txids: &confirmation.block_txids,
                tx_index: confirmation.tx_index,
                anchor_tx: seed_tx.clone(),
                output_index: 0,
                internal_key: internal_desc.pub_key,
                commitment: &commitment,
                tapscript_sibling: None,
                exclusions: Vec::new(),
            };
            let proof = create_genesis_proof(
                &params,
                &asset,
                Some(MetaReveal {
                    meta_type: MetaType::Opaque,
                    data: vec![0x00],
                }),
            )
            .expect("genesis proof");
            verify_proof(&proof, None).expect("genesis proof verifies");

            let mut file = File::new();
            file.append(proof.to_bytes().expect("proof bytes"));
            self.archive
                .import_proofs(vec![AnnotatedProof {
                    locator: ProofLocator {
                        asset_id: asset.asset_id(),
                        script_key: asset.script_key,
                    },
                    blob: file.to_bytes(),
                }])
                .await
                .expect("archive import");

            self.coins.add_commitment(AnchoredCommitment {
                anchor_point: OutPoint {
                    txid: seed_tx.compute_txid(),
                    vout: 0,
                },
                anchor_output_value: Amount::from_sat(1000),
                internal_key: internal_desc,
                tapscript_sibling: None,
                commitment,
                asset: asset.clone(),
            });
            assets.push(asset);
        }

        assets
    }
}

fn remote_key(tag: u8) -> XOnlyPublicKey {
    let secp = Secp256k1::new();
    SecretKey::from_slice(&[tag; 32])
        .unwrap()
        .x_only_public_key(&secp)
        .0
}

fn address_for(asset: &Asset, amount: u64) -> TapAddress {
    TapAddress {
        version: 0,
        asset_id: asset.asset_id(),
        group_key: None,
        script_key: remote_key(0xA1),
        internal_key: remote_key(0xA2),
        tapscript_sibling: None,
        amount,
        asset_type: Some(AssetType::Normal),
    }
}

/// Drives a shipment to completion: waits for the anchor broadcast,
/// confirms it, and returns the finished parcel.
async fn drive_shipment(
    harness: &TransferHarness,
    parcel: Parcel,
) -> taproot_assets_daemon::freighter::OutboundParcel {
    let porter = harness.porter();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let shipment =
        tokio::spawn(async move { porter.request_shipment(parcel, cancel_rx).await });

    let anchor_tx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("anchor broadcast");
    harness.chain.confirm_tx(&anchor_tx);

    tokio::time::timeout(TIMEOUT, shipment)
        .await
        .expect("shipment completes")
        .expect("shipment task")
        .expect("shipment succeeds")
}

/// A non-interactive full-value send produces a zero-amount tombstone
/// split root plus a simple output carrying the whole balance.
#[tokio::test]
async fn non_interactive_full_value_send() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_assets(&[("units", 100)]).await;
    let address = address_for(&assets[0], 100);

    let parcel = drive_shipment(
        &harness,
        Parcel {
            address: address.clone(),
            interactive: false,
        },
    )
    .await;

    assert_eq!(parcel.outputs.len(), 2);

    let tombstone = &parcel.outputs[0];
    assert_eq!(tombstone.output_type, VOutputType::SplitRoot);
    assert_eq!(tombstone.amount, 0);
    let tombstone_asset = tombstone.asset.as_ref().expect("tombstone asset");
    assert!(!tombstone_asset.prev_witnesses[0].tx_witness.is_empty());
    assert!(tombstone_asset.split_commitment_root.is_some());

    let simple = &parcel.outputs[1];
    assert_eq!(simple.output_type, VOutputType::Simple);
    assert_eq!(simple.amount, 100);
    let simple_asset = simple.asset.as_ref().expect("recipient asset");
    assert!(simple_asset.has_split_commitment_witness());

    // The split witness is keyed by H(output_index || asset_id ||
    // recipient script key) and proves into the tombstone's split root.
    let witness = simple_asset.prev_witnesses[0]
        .split_commitment
        .as_ref()
        .expect("split witness");
    let locator = taproot_assets_core::split::SplitLocator {
        output_index: 1,
        asset_id: simple_asset.asset_id(),
        script_key: address.script_key,
        amount: 100,
    };
    let leaf = SplitCommitment::rebuild_split_leaf(simple_asset);
    let split_root = witness
        .root_asset
        .split_commitment_root
        .clone()
        .expect("split root");
    assert!(witness.proof.verify_inclusion(&locator.key(), &leaf, &split_root));

    // Output amounts balance the input; the tombstone contributes zero.
    let total: u64 = parcel.outputs.iter().map(|output| output.amount).sum();
    assert_eq!(total, 100);
}

/// A partial send keeps the change in the split root; amounts balance.
#[tokio::test]
async fn partial_send_with_change() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_assets(&[("units", 1000)]).await;
    let address = address_for(&assets[0], 300);

    let parcel = drive_shipment(
        &harness,
        Parcel {
            address,
            interactive: false,
        },
    )
    .await;

    assert_eq!(parcel.outputs.len(), 2);
    assert_eq!(parcel.outputs[0].output_type, VOutputType::SplitRoot);
    assert_eq!(parcel.outputs[0].amount, 700);
    assert!(parcel.outputs[0].script_key_local);
    assert_eq!(parcel.outputs[1].output_type, VOutputType::Simple);
    assert_eq!(parcel.outputs[1].amount, 300);
    assert!(!parcel.outputs[1].script_key_local);

    let total: u64 = parcel.outputs.iter().map(|output| output.amount).sum();
    assert_eq!(total, 1000);

    // The recipient's proof file verifies from genesis through the split.
    let blob = harness
        .archive
        .proof_blob(&ProofLocator {
            asset_id: assets[0].asset_id(),
            script_key: parcel.outputs[1].script_key,
        })
        .expect("recipient proof");
    let final_proof = verify_file(&File::from_bytes(&blob).unwrap()).expect("chain verifies");
    assert_eq!(final_proof.asset.amount, 300);

    // The change came back into the asset store.
    let change = harness
        .coins
        .all_commitments()
        .into_iter()
        .find(|commitment| commitment.asset.amount == 700)
        .expect("change commitment");
    assert_eq!(change.anchor_point.txid, parcel.anchor_txid());
}

/// An interactive full-value send needs neither a split nor a tombstone.
#[tokio::test]
async fn interactive_full_value_send() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_assets(&[("units", 250)]).await;
    let address = address_for(&assets[0], 250);

    let parcel = drive_shipment(
        &harness,
        Parcel {
            address,
            interactive: true,
        },
    )
    .await;

    assert_eq!(parcel.outputs.len(), 1);
    let output = &parcel.outputs[0];
    assert_eq!(output.output_type, VOutputType::Simple);
    assert_eq!(output.amount, 250);
    let moved = output.asset.as_ref().expect("moved asset");
    assert!(!moved.has_split_commitment_witness());
    assert!(!moved.prev_witnesses[0].tx_witness.is_empty());
    assert!(moved.split_commitment_root.is_none());
}

/// Passive assets co-located in a spent commitment are re-anchored with
/// unchanged asset ID, amount and witness set.
#[tokio::test]
async fn passive_assets_are_reanchored() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_assets(&[("passive-a", 50), ("spent-b", 100)]).await;
    let passive_before = assets[0].clone();
    let address = address_for(&assets[1], 100);

    let parcel = drive_shipment(
        &harness,
        Parcel {
            address,
            interactive: false,
        },
    )
    .await;

    assert_eq!(parcel.passive_assets.len(), 1);
    let reanchor = &parcel.passive_assets[0];
    assert_eq!(reanchor.genesis_id, passive_before.asset_id());
    assert_eq!(reanchor.asset, passive_before);
    assert_eq!(reanchor.new_anchor_output_index, 0);

    // The passive asset's updated proof file proves inclusion under the
    // new anchor with everything but the anchor metadata unchanged.
    let blob = harness
        .archive
        .proof_blob(&ProofLocator {
            asset_id: passive_before.asset_id(),
            script_key: passive_before.script_key,
        })
        .expect("passive proof");
    let file = File::from_bytes(&blob).unwrap();
    assert_eq!(file.num_proofs(), 2);
    let final_proof = verify_file(&file).expect("passive chain verifies");
    assert_eq!(final_proof.asset.asset_id(), passive_before.asset_id());
    assert_eq!(final_proof.asset.amount, passive_before.amount);
    assert_eq!(final_proof.asset.prev_witnesses, passive_before.prev_witnesses);
    assert_eq!(final_proof.anchor_outpoint().txid, parcel.anchor_txid());

    // And it is spendable from its new anchor.
    let relocated = harness
        .coins
        .all_commitments()
        .into_iter()
        .find(|commitment| commitment.asset.asset_id() == passive_before.asset_id())
        .expect("passive back in store");
    assert_eq!(relocated.anchor_point.txid, parcel.anchor_txid());
}

/// A send consuming several commitments merges them into one transition;
/// the recipient's proof nests the provenance of every input beyond the
/// first.
#[tokio::test]
async fn multi_input_send_merges_commitments() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_fungible_commitments("units", &[600, 400]).await;
    let address = address_for(&assets[0], 1000);

    let parcel = drive_shipment(
        &harness,
        Parcel {
            address: address.clone(),
            interactive: false,
        },
    )
    .await;

    assert_eq!(parcel.inputs.len(), 2);
    let consumed: u64 = parcel.inputs.iter().map(|input| input.amount).sum();
    assert_eq!(consumed, 1000);

    // A full-value fan-in still needs the tombstone split root.
    assert_eq!(parcel.outputs[0].output_type, VOutputType::SplitRoot);
    assert_eq!(parcel.outputs[0].amount, 0);
    assert_eq!(parcel.outputs[1].amount, 1000);

    // The root asset spends both inputs, each with its own signature.
    let root = parcel.outputs[0].asset.as_ref().expect("root asset");
    assert_eq!(root.prev_witnesses.len(), 2);
    assert!(root
        .prev_witnesses
        .iter()
        .all(|witness| !witness.tx_witness.is_empty()));

    // The recipient's proof chains onto the first input and carries the
    // second input's full provenance as a nested file.
    let blob = harness
        .archive
        .proof_blob(&ProofLocator {
            asset_id: assets[0].asset_id(),
            script_key: address.script_key,
        })
        .expect("recipient proof");
    let file = File::from_bytes(&blob).unwrap();
    let final_proof = verify_file(&file).expect("fan-in chain verifies");
    assert_eq!(final_proof.asset.amount, 1000);
    assert_eq!(final_proof.additional_inputs.len(), 1);

    // Both spent anchor points left the store.
    assert!(harness
        .coins
        .all_commitments()
        .iter()
        .all(|commitment| commitment.anchor_point.txid == parcel.anchor_txid()));
}

/// Coin selection failure terminates the transfer with a stable error.
#[tokio::test]
async fn insufficient_assets_fail_shipment() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_assets(&[("units", 10)]).await;
    let address = address_for(&assets[0], 1000);

    let porter = harness.porter();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let err = tokio::time::timeout(
        TIMEOUT,
        porter.request_shipment(
            Parcel {
                address,
                interactive: false,
            },
            cancel_rx,
        ),
    )
    .await
    .expect("fails fast")
    .unwrap_err();
    assert!(matches!(err, Error::MatchingAssetsNotFound));
}

/// Pending parcels survive a restart: they are re-broadcast and converge
/// to confirmed once the chain delivers the notification.
#[tokio::test]
async fn parcel_replay_after_restart() {
    let mut harness = TransferHarness::new();
    harness.start_porter().await;
    let assets = harness.seed_assets(&[("units", 400)]).await;
    let address = address_for(&assets[0], 150);

    let porter = harness.porter();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let shipment = tokio::spawn(async move {
        porter
            .request_shipment(
                Parcel {
                    address,
                    interactive: false,
                },
                cancel_rx,
            )
            .await
    });

    // The parcel goes out but never confirms before the restart.
    let anchor_tx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("anchor broadcast");
    assert_eq!(harness.export_log.num_pending(), 1);

    harness.start_porter().await;
    let shipment_result = tokio::time::timeout(TIMEOUT, shipment)
        .await
        .expect("old shipment unblocks")
        .expect("task join");
    assert!(shipment_result.is_err());

    // The restarted porter re-broadcasts the pending parcel.
    let rebroadcast = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("re-broadcast");
    assert_eq!(rebroadcast.compute_txid(), anchor_tx.compute_txid());

    harness.chain.confirm_tx(&rebroadcast);
    let confirmed_txid = tokio::time::timeout(TIMEOUT, harness.export_log.next_confirmed())
        .await
        .expect("parcel confirmed");
    assert_eq!(confirmed_txid, anchor_tx.compute_txid());
    assert_eq!(harness.export_log.num_pending(), 0);
}
