//! Batched asset issuance tests, driving the planter and its caretakers
//! through mock backends.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash};
use bitcoin::secp256k1::{Message, Secp256k1};

use taproot_assets_core::proof::verify_file;
use taproot_assets_daemon::garden::{
    BatchState, ChainPlanter, GardenKit, MintingBatch, PlanterConfig, Seedling, GENESIS_AMT_SATS,
};
use taproot_assets_daemon::mock::{
    MockChainBridge, MockGenSigner, MockKeyRing, MockMintingStore, MockProofArchive,
    MockWalletAnchor,
};
use taproot_assets_daemon::wallet::ProofLocator;
use taproot_assets_types::address::MAINNET;
use taproot_assets_types::asset::{AssetType, Genesis};
use taproot_assets_types::proof::{File, MetaReveal, MetaType};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Default to a very large interval so the planter never ticks on its own
/// and tests only rely on explicit finalization.
const NO_TICK: Duration = Duration::from_secs(24 * 60 * 60);

struct MintingHarness {
    wallet: Arc<MockWalletAnchor>,
    chain: Arc<MockChainBridge>,
    store: Arc<MockMintingStore>,
    key_ring: Arc<MockKeyRing>,
    archive: Arc<MockProofArchive>,
    planter: Option<ChainPlanter>,
}

impl MintingHarness {
    fn new() -> Self {
        let key_ring = Arc::new(MockKeyRing::new());
        MintingHarness {
            wallet: Arc::new(MockWalletAnchor::new()),
            chain: Arc::new(MockChainBridge::new()),
            store: Arc::new(MockMintingStore::new()),
            key_ring,
            archive: Arc::new(MockProofArchive::new()),
            planter: None,
        }
    }

    /// (Re-)creates the planter over the shared stores, simulating a
    /// daemon restart.
    async fn refresh_planter(&mut self) {
        if let Some(planter) = self.planter.take() {
            planter.stop_and_wait().await;
        }

        let kit = GardenKit {
            wallet: self.wallet.clone(),
            chain_bridge: self.chain.clone(),
            log: self.store.clone(),
            key_ring: self.key_ring.clone(),
            gen_signer: Arc::new(MockGenSigner::new(self.key_ring.clone())),
            proof_archive: self.archive.clone(),
            chain_params: &MAINNET,
        };
        let planter = ChainPlanter::start(PlanterConfig {
            garden: kit,
            batch_tick_interval: NO_TICK,
        })
        .await
        .expect("planter start");
        self.planter = Some(planter);
    }

    fn planter(&self) -> &ChainPlanter {
        self.planter.as_ref().expect("planter running")
    }

    async fn queue(&self, seedling: Seedling) -> taproot_assets_daemon::Result<BatchState> {
        tokio::time::timeout(TIMEOUT, self.planter().queue_new_seedling(seedling))
            .await
            .expect("queue timed out")
    }

    async fn batch_state(&self, batch_key: &bitcoin::secp256k1::PublicKey) -> BatchState {
        let batches = self
            .planter()
            .list_batches(Some(*batch_key))
            .await
            .expect("list batches");
        assert_eq!(batches.len(), 1);
        batches[0].state
    }

    async fn batch(&self, batch_key: &bitcoin::secp256k1::PublicKey) -> MintingBatch {
        let batches = self
            .planter()
            .list_batches(Some(*batch_key))
            .await
            .expect("list batches");
        assert_eq!(batches.len(), 1);
        batches[0].clone()
    }

    async fn wait_for_state(
        &self,
        batch_key: &bitcoin::secp256k1::PublicKey,
        target: BatchState,
    ) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if self.batch_state(batch_key).await == target {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "batch never reached state {}",
                target
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_no_active_caretakers(&self) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let active = self
                .planter()
                .num_active_batches()
                .await
                .expect("num active");
            if active == 0 {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "caretakers never wound down"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn seedling(name: &str, amount: u64, emission: bool, group_anchor: Option<&str>) -> Seedling {
    Seedling {
        asset_type: AssetType::Normal,
        name: name.to_string(),
        meta: MetaReveal {
            meta_type: MetaType::Opaque,
            data: vec![0x00],
        },
        amount,
        enable_emission: emission,
        group_anchor: group_anchor.map(|anchor| anchor.to_string()),
    }
}

fn anchor_output_key(tx: &bitcoin::Transaction, vout: usize) -> bitcoin::secp256k1::XOnlyPublicKey {
    let script = tx.output[vout].script_pubkey.as_bytes();
    assert_eq!(script.len(), 34, "not a taproot output");
    bitcoin::secp256k1::XOnlyPublicKey::from_slice(&script[2..34]).expect("output key")
}

/// A single-asset mint: one seedling, one caretaker, one genesis output
/// whose key matches the computed commitment output key, and a genesis
/// proof with the expected asset ID.
#[tokio::test]
async fn single_asset_mint() {
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;

    let state = harness
        .queue(seedling("a", 1000, false, None))
        .await
        .expect("seedling accepted");
    assert_eq!(state, BatchState::Pending);

    let pending = harness
        .planter()
        .pending_batch()
        .await
        .expect("pending batch query");
    assert_eq!(pending.expect("pending batch").seedlings.len(), 1);

    let batch_key = harness.planter().finalize_batch().await.expect("finalize");
    assert!(harness.planter().pending_batch().await.unwrap().is_none());

    // Exactly one caretaker funds the genesis transaction.
    let conf_target = tokio::time::timeout(TIMEOUT, harness.chain.next_fee_request())
        .await
        .expect("fee estimated");
    assert!(conf_target > 0);
    let funded = tokio::time::timeout(TIMEOUT, harness.wallet.next_funded())
        .await
        .expect("genesis funded");
    let genesis_point = funded.genesis_point().expect("genesis point");

    let imported = tokio::time::timeout(TIMEOUT, harness.wallet.next_imported_key())
        .await
        .expect("output key imported");
    tokio::time::timeout(TIMEOUT, harness.wallet.next_signed())
        .await
        .expect("genesis signed");

    let tx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("genesis broadcast");
    assert_eq!(tx.output[0].value.to_sat(), GENESIS_AMT_SATS);

    // The taproot output key equals the commitment output key Q.
    assert_eq!(anchor_output_key(&tx, 0), imported);
    let batch = harness.batch(&batch_key).await;
    let commitment = batch.root_commitment.as_ref().expect("commitment");
    let (expected_q, _) = commitment
        .output_key(&batch.batch_key.pub_key, None)
        .expect("output key");
    assert_eq!(anchor_output_key(&tx, 0), expected_q);

    let conf_txid = tokio::time::timeout(TIMEOUT, harness.chain.next_conf_request())
        .await
        .expect("confirmation requested");
    assert_eq!(conf_txid, tx.compute_txid());

    harness.chain.confirm_tx(&tx);
    let imported_proofs = tokio::time::timeout(TIMEOUT, harness.archive.next_import())
        .await
        .expect("proofs imported");
    assert_eq!(imported_proofs, 1);

    harness.wait_for_state(&batch_key, BatchState::Finalized).await;
    harness.wait_for_no_active_caretakers().await;

    // The asset ID commits to the real genesis context.
    let batch = harness.batch(&batch_key).await;
    let asset = &batch.sprouted_assets[0];
    let expected_genesis = Genesis {
        genesis_point,
        tag: "a".to_string(),
        meta_hash: Sha256Hash::hash(&[0x00]),
        output_index: 0,
        asset_type: AssetType::Normal,
    };
    assert_eq!(asset.asset_id(), expected_genesis.asset_id());
    assert_eq!(asset.amount, 1000);

    // The emitted proof file verifies end to end.
    let blob = harness
        .archive
        .proof_blob(&ProofLocator {
            asset_id: asset.asset_id(),
            script_key: asset.script_key,
        })
        .expect("proof archived");
    let file = File::from_bytes(&blob).expect("proof file decodes");
    let proof = verify_file(&file).expect("proof file verifies");
    assert_eq!(proof.asset.asset_id(), asset.asset_id());
}

/// A multi-asset group mint: the anchor plus two tranches share one group
/// key, each tranche carries its own membership signature, and the group
/// balance adds up.
#[tokio::test]
async fn multi_asset_group_mint() {
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;

    harness
        .queue(seedling("g", 100, true, None))
        .await
        .expect("anchor accepted");
    harness
        .queue(seedling("g-tranche-1", 50, false, Some("g")))
        .await
        .expect("tranche 1 accepted");
    harness
        .queue(seedling("g-tranche-2", 25, false, Some("g")))
        .await
        .expect("tranche 2 accepted");

    let batch_key = harness.planter().finalize_batch().await.expect("finalize");

    let tx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("genesis broadcast");
    harness.chain.confirm_tx(&tx);
    harness.wait_for_state(&batch_key, BatchState::Finalized).await;

    let batch = harness.batch(&batch_key).await;
    assert_eq!(batch.sprouted_assets.len(), 3);

    // One group key shared by all three assets.
    let group_keys: Vec<_> = batch
        .sprouted_assets
        .iter()
        .map(|asset| asset.group_key.expect("grouped").group_pubkey)
        .collect();
    assert!(group_keys.windows(2).all(|pair| pair[0] == pair[1]));

    // Every member carries a valid schnorr signature over its own asset
    // ID under the group key.
    let secp = Secp256k1::verification_only();
    for asset in &batch.sprouted_assets {
        let group = asset.group_key.expect("grouped");
        let msg = Message::from_digest(asset.asset_id().to_byte_array());
        secp.verify_schnorr(&group.sig, &msg, &group.group_pubkey)
            .expect("membership signature verifies");
    }

    // Total group balance: all three assets live in one inner commitment.
    let commitment = batch.root_commitment.as_ref().expect("commitment");
    assert_eq!(commitment.root().sum, 175);
    let tap_key = batch.sprouted_assets[0].tap_commitment_key();
    let inner = commitment
        .asset_commitment(&tap_key)
        .expect("group commitment");
    assert_eq!(inner.root().sum, 175);
    assert_eq!(inner.assets().count(), 3);
}

/// Seedling validation: the four rejection cases of the minting pipeline.
#[tokio::test]
async fn seedling_validation_errors() {
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;

    harness
        .queue(seedling("anchor", 100, true, None))
        .await
        .expect("anchor accepted");
    harness
        .queue(seedling("muted", 10, false, None))
        .await
        .expect("second accepted");

    let err = harness
        .queue(seedling("anchor", 5, false, None))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already in batch"));

    let err = harness
        .queue(seedling("tranche", 5, false, Some("missing")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not present in batch"));

    let err = harness
        .queue(seedling("tranche", 5, false, Some("muted")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("has emission disabled"));

    // A fresh planter with an empty batch rejects group anchor references
    // outright.
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;
    let err = harness
        .queue(seedling("tranche", 5, false, Some("anchor")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("batch empty, group anchor"));
}

/// Cancellation races: before freezing, after freezing and after
/// broadcast.
#[tokio::test]
async fn cancellation_races() {
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;

    // Cancel before the batch is frozen: seedlings stay queryable under
    // the cancelled batch.
    harness
        .queue(seedling("early", 10, false, None))
        .await
        .expect("accepted");
    let cancel = harness.planter().cancel_batch().await.expect("cancel");
    let first_key = cancel.batch_key.expect("batch key");
    cancel.result.expect("pending cancel succeeds");
    assert_eq!(
        harness.batch_state(&first_key).await,
        BatchState::SeedlingCancelled
    );
    assert_eq!(harness.batch(&first_key).await.seedlings.len(), 1);
    assert!(harness.planter().pending_batch().await.unwrap().is_none());

    // Cancel after freezing but before broadcast: hold the wallet so the
    // caretaker cannot progress past funding.
    harness
        .queue(seedling("mid", 10, false, None))
        .await
        .expect("accepted");
    let gate = harness.wallet.hold_funding().await;
    let second_key = harness.planter().finalize_batch().await.expect("finalize");
    let cancel = harness.planter().cancel_batch().await.expect("cancel");
    assert_eq!(cancel.batch_key, Some(second_key));
    cancel.result.expect("sprout cancel accepted");
    drop(gate);
    harness
        .wait_for_state(&second_key, BatchState::SproutCancelled)
        .await;

    // Cancel after broadcast: the batch key is returned but the state
    // stays broadcast.
    harness
        .queue(seedling("late", 10, false, None))
        .await
        .expect("accepted");
    let third_key = harness.planter().finalize_batch().await.expect("finalize");
    let tx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("broadcast");
    tokio::time::timeout(TIMEOUT, harness.chain.next_conf_request())
        .await
        .expect("confirmation registered");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel = harness.planter().cancel_batch().await.expect("cancel");
    assert_eq!(cancel.batch_key, Some(third_key));
    let err = cancel.result.unwrap_err();
    assert!(err.to_string().contains("batch not cancellable"));
    assert_eq!(harness.batch_state(&third_key).await, BatchState::Broadcast);

    // The broadcast batch still confirms and finalizes normally.
    harness.chain.confirm_tx(&tx);
    harness.wait_for_state(&third_key, BatchState::Finalized).await;
}

/// Finalizing or cancelling without a pending batch fails without
/// touching the planter.
#[tokio::test]
async fn no_pending_batch_errors() {
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;

    let err = harness.planter().finalize_batch().await.unwrap_err();
    assert!(err.to_string().contains("no pending batch"));

    let cancel = harness.planter().cancel_batch().await.expect("cancel");
    assert!(cancel.batch_key.is_none());
    assert!(cancel.result.is_err());
}

/// Batch replay: restarting the planter mid-pipeline resumes the batch
/// from its durable state and converges to the same finalized batch.
#[tokio::test]
async fn batch_replay_across_restarts() {
    let mut harness = MintingHarness::new();
    harness.refresh_planter().await;

    harness
        .queue(seedling("replayed", 500, false, None))
        .await
        .expect("accepted");
    let batch_key = harness.planter().finalize_batch().await.expect("finalize");

    // Let the caretaker fund, then restart before it gets further.
    tokio::time::timeout(TIMEOUT, harness.wallet.next_funded())
        .await
        .expect("funded");
    harness.refresh_planter().await;

    // The resumed caretaker drives the batch to broadcast.
    let tx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("broadcast after restart");

    // Restart once more after broadcast: the transaction is re-published.
    harness.refresh_planter().await;
    let retx = tokio::time::timeout(TIMEOUT, harness.chain.next_published())
        .await
        .expect("re-broadcast after restart");
    assert_eq!(tx.compute_txid(), retx.compute_txid());

    harness.chain.confirm_tx(&retx);
    harness.wait_for_state(&batch_key, BatchState::Finalized).await;

    // The terminal batch carries the same key and exactly one sprouted
    // asset.
    let batch = harness.batch(&batch_key).await;
    assert_eq!(batch.batch_key.pub_key, batch_key);
    assert_eq!(batch.sprouted_assets.len(), 1);
    assert_eq!(harness.archive.num_files(), 1);
}
