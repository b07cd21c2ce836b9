//! Mock collaborators driving the state machines in tests.
//!
//! Each mock mirrors the contract of its trait and additionally exposes
//! signal channels so tests can assert that a specific interaction
//! happened, in the order it happened.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash, HashEngine};
use bitcoin::key::TweakedPublicKey;
use bitcoin::pow::CompactTarget;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{
    schnorr, All, Keypair, Scalar, Secp256k1, SecretKey, XOnlyPublicKey,
};
use bitcoin::taproot::TapTweakHash;
use bitcoin::{
    Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut,
    Txid, Witness,
};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use taproot_assets_core::vm;
use taproot_assets_psbt::KeyDescriptor;
use taproot_assets_types::asset::{Asset, AssetId};

use crate::chain::{ChainBridge, TxConfirmation};
use crate::freighter::{
    AnchoredCommitment, AssetConfirmEvent, CoinLister, CommitmentConstraints, ExportLog,
    OutboundParcel,
};
use crate::garden::{BatchState, MintingBatch, MintingStore};
use crate::wallet::{
    bip86_script_key, AnnotatedProof, FundedPsbt, GenSigner, KeyRing, ProofArchive, ProofLocator,
    Signer, WalletAnchor,
};
use crate::{Error, Result};

fn secp() -> Secp256k1<All> {
    Secp256k1::new()
}

/// Chain backend mock: remembers published transactions and hands out
/// confirmation notifications when the test mines them.
pub struct MockChainBridge {
    height: AtomicU32,
    confirmed: Mutex<HashMap<Txid, TxConfirmation>>,
    pending_subs: Mutex<Vec<(Txid, oneshot::Sender<TxConfirmation>)>>,
    publish_tx: mpsc::UnboundedSender<Transaction>,
    publish_rx: AsyncMutex<mpsc::UnboundedReceiver<Transaction>>,
    fee_req_tx: mpsc::UnboundedSender<u32>,
    fee_req_rx: AsyncMutex<mpsc::UnboundedReceiver<u32>>,
    conf_req_tx: mpsc::UnboundedSender<Txid>,
    conf_req_rx: AsyncMutex<mpsc::UnboundedReceiver<Txid>>,
}

impl MockChainBridge {
    pub fn new() -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (fee_req_tx, fee_req_rx) = mpsc::unbounded_channel();
        let (conf_req_tx, conf_req_rx) = mpsc::unbounded_channel();
        MockChainBridge {
            height: AtomicU32::new(100),
            confirmed: Mutex::new(HashMap::new()),
            pending_subs: Mutex::new(Vec::new()),
            publish_tx,
            publish_rx: AsyncMutex::new(publish_rx),
            fee_req_tx,
            fee_req_rx: AsyncMutex::new(fee_req_rx),
            conf_req_tx,
            conf_req_rx: AsyncMutex::new(conf_req_rx),
        }
    }

    /// Awaits the next published transaction.
    pub async fn next_published(&self) -> Transaction {
        self.publish_rx
            .lock()
            .await
            .recv()
            .await
            .expect("publish channel closed")
    }

    /// Awaits the next fee estimation request.
    pub async fn next_fee_request(&self) -> u32 {
        self.fee_req_rx
            .lock()
            .await
            .recv()
            .await
            .expect("fee channel closed")
    }

    /// Awaits the next confirmation registration.
    pub async fn next_conf_request(&self) -> Txid {
        self.conf_req_rx
            .lock()
            .await
            .recv()
            .await
            .expect("conf channel closed")
    }

    /// Mines a block containing the transaction and notifies every waiting
    /// subscriber. Confirmation is sticky: later registrations for the
    /// same txid are answered immediately, keyed by (txid, block hash).
    pub fn confirm_tx(&self, tx: &Transaction) -> TxConfirmation {
        let txid = tx.compute_txid();
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        let header = Header {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::from_raw_hash(txid.to_raw_hash()),
            time: height,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        };
        let confirmation = TxConfirmation {
            block_header: header,
            block_height: height,
            tx_index: 0,
            block_txids: vec![txid],
        };

        self.confirmed
            .lock()
            .expect("poisoned")
            .insert(txid, confirmation.clone());

        let mut subs = self.pending_subs.lock().expect("poisoned");
        let mut remaining = Vec::new();
        for (sub_txid, sender) in subs.drain(..) {
            if sub_txid == txid {
                let _ = sender.send(confirmation.clone());
            } else {
                remaining.push((sub_txid, sender));
            }
        }
        *subs = remaining;

        confirmation
    }
}

impl Default for MockChainBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainBridge for MockChainBridge {
    async fn best_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn estimate_fee_rate(&self, conf_target: u32) -> Result<u64> {
        let _ = self.fee_req_tx.send(conf_target);
        Ok(2)
    }

    async fn publish_transaction(&self, tx: &Transaction) -> Result<()> {
        let _ = self.publish_tx.send(tx.clone());
        Ok(())
    }

    async fn register_confirmation_ntfn(
        &self,
        txid: Txid,
        _height_hint: u32,
    ) -> Result<oneshot::Receiver<TxConfirmation>> {
        let _ = self.conf_req_tx.send(txid);
        let (sender, receiver) = oneshot::channel();

        let already_confirmed = self
            .confirmed
            .lock()
            .expect("poisoned")
            .get(&txid)
            .cloned();
        match already_confirmed {
            Some(confirmation) => {
                let _ = sender.send(confirmation);
            }
            None => {
                self.pending_subs
                    .lock()
                    .expect("poisoned")
                    .push((txid, sender));
            }
        }
        Ok(receiver)
    }
}

/// Wallet mock: deterministic funding so that re-funding the same template
/// yields an equivalent PSBT, and pass-through signing.
pub struct MockWalletAnchor {
    fund_gate: AsyncMutex<()>,
    fund_tx: mpsc::UnboundedSender<FundedPsbt>,
    fund_rx: AsyncMutex<mpsc::UnboundedReceiver<FundedPsbt>>,
    sign_tx: mpsc::UnboundedSender<Txid>,
    sign_rx: AsyncMutex<mpsc::UnboundedReceiver<Txid>>,
    import_tx: mpsc::UnboundedSender<XOnlyPublicKey>,
    import_rx: AsyncMutex<mpsc::UnboundedReceiver<XOnlyPublicKey>>,
}

impl MockWalletAnchor {
    pub fn new() -> Self {
        let (fund_tx, fund_rx) = mpsc::unbounded_channel();
        let (sign_tx, sign_rx) = mpsc::unbounded_channel();
        let (import_tx, import_rx) = mpsc::unbounded_channel();
        MockWalletAnchor {
            fund_gate: AsyncMutex::new(()),
            fund_tx,
            fund_rx: AsyncMutex::new(fund_rx),
            sign_tx,
            sign_rx: AsyncMutex::new(sign_rx),
            import_tx,
            import_rx: AsyncMutex::new(import_rx),
        }
    }

    pub async fn next_funded(&self) -> FundedPsbt {
        self.fund_rx
            .lock()
            .await
            .recv()
            .await
            .expect("fund channel closed")
    }

    pub async fn next_signed(&self) -> Txid {
        self.sign_rx
            .lock()
            .await
            .recv()
            .await
            .expect("sign channel closed")
    }

    pub async fn next_imported_key(&self) -> XOnlyPublicKey {
        self.import_rx
            .lock()
            .await
            .recv()
            .await
            .expect("import channel closed")
    }

    /// Blocks all funding calls until the returned guard is dropped. Used
    /// to pace state machines in cancellation tests.
    pub async fn hold_funding(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.fund_gate.lock().await
    }
}

impl Default for MockWalletAnchor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletAnchor for MockWalletAnchor {
    async fn fund_psbt(&self, template: Psbt, _fee_rate: u64) -> Result<FundedPsbt> {
        let _gate = self.fund_gate.lock().await;
        let mut tx = template.unsigned_tx.clone();
        let template_txid = tx.compute_txid();

        // The funding input is derived from the template itself, making
        // repeated funding of the same batch deterministic.
        let mut engine = Sha256Hash::engine();
        engine.input(b"mock-funding-utxo");
        engine.input(&template_txid.to_byte_array());
        let funding_txid = Txid::from_byte_array(Sha256Hash::from_engine(engine).to_byte_array());

        tx.input.push(TxIn {
            previous_output: OutPoint {
                txid: funding_txid,
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });

        // A BIP-86 taproot change output, like a real wallet would add.
        // Its internal key rides in the PSBT output metadata so exclusion
        // proofs can account for the output.
        let mut engine = Sha256Hash::engine();
        engine.input(b"mock-change-key");
        engine.input(&template_txid.to_byte_array());
        let change_secret =
            SecretKey::from_slice(&Sha256Hash::from_engine(engine).to_byte_array())
                .map_err(|e| Error::WalletUnavailable(format!("bad change key: {}", e)))?;
        let change_pub = change_secret.public_key(&secp());
        let change_output_key = bip86_script_key(&change_pub);
        tx.output.push(TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2tr_tweaked(
                TweakedPublicKey::dangerous_assume_tweaked(change_output_key),
            ),
        });

        let change_output_index = (tx.output.len() - 1) as u32;
        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| Error::WalletUnavailable(format!("funding failed: {}", e)))?;
        psbt.outputs[change_output_index as usize].tap_internal_key =
            Some(change_pub.x_only_public_key().0);
        let funded = FundedPsbt {
            psbt,
            change_output_index,
            chain_fees: 500,
        };
        let _ = self.fund_tx.send(funded.clone());
        Ok(funded)
    }

    async fn sign_and_finalize_psbt(&self, psbt: Psbt) -> Result<Psbt> {
        let _ = self.sign_tx.send(psbt.unsigned_tx.compute_txid());
        Ok(psbt)
    }

    async fn import_taproot_output_key(&self, output_key: XOnlyPublicKey) -> Result<()> {
        let _ = self.import_tx.send(output_key);
        Ok(())
    }
}

/// Key ring mock deriving deterministic keys per (family, index).
pub struct MockKeyRing {
    state: Mutex<KeyRingState>,
    req_tx: mpsc::UnboundedSender<KeyDescriptor>,
    req_rx: AsyncMutex<mpsc::UnboundedReceiver<KeyDescriptor>>,
}

struct KeyRingState {
    next_index: HashMap<u32, u32>,
    secrets: Vec<(KeyDescriptor, SecretKey)>,
}

impl MockKeyRing {
    pub fn new() -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        MockKeyRing {
            state: Mutex::new(KeyRingState {
                next_index: HashMap::new(),
                secrets: Vec::new(),
            }),
            req_tx,
            req_rx: AsyncMutex::new(req_rx),
        }
    }

    /// Awaits the next key derivation request.
    pub async fn next_derived_key(&self) -> KeyDescriptor {
        self.req_rx
            .lock()
            .await
            .recv()
            .await
            .expect("key channel closed")
    }

    /// Returns the secret backing a derived raw public key.
    pub fn secret_for(&self, pub_key: &bitcoin::secp256k1::PublicKey) -> Option<SecretKey> {
        self.state
            .lock()
            .expect("poisoned")
            .secrets
            .iter()
            .find(|(desc, _)| desc.pub_key == *pub_key)
            .map(|(_, secret)| *secret)
    }

    /// Finds the tweaked keypair whose BIP-86 output key equals the given
    /// script key.
    pub fn tweaked_keypair_for_script_key(&self, script_key: &XOnlyPublicKey) -> Option<Keypair> {
        let secp = secp();
        let state = self.state.lock().expect("poisoned");
        for (_, secret) in &state.secrets {
            let keypair = Keypair::from_secret_key(&secp, secret);
            let (xonly, _) = keypair.x_only_public_key();
            let tweak = TapTweakHash::from_key_and_tweak(xonly, None).to_scalar();
            if let Ok(tweaked) = keypair.add_xonly_tweak(&secp, &tweak) {
                if tweaked.x_only_public_key().0 == *script_key {
                    return Some(tweaked);
                }
            }
        }
        None
    }
}

impl Default for MockKeyRing {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyRing for MockKeyRing {
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor> {
        let descriptor = {
            let mut state = self.state.lock().expect("poisoned");
            let index = state.next_index.entry(family).or_insert(0);
            let current = *index;
            *index += 1;

            let mut engine = Sha256Hash::engine();
            engine.input(b"mock-key-ring");
            engine.input(&family.to_be_bytes());
            engine.input(&current.to_be_bytes());
            let secret = SecretKey::from_slice(&Sha256Hash::from_engine(engine).to_byte_array())
                .map_err(|e| Error::WalletUnavailable(format!("bad mock key: {}", e)))?;

            let descriptor = KeyDescriptor {
                pub_key: secret.public_key(&secp()),
                family,
                index: current,
            };
            state.secrets.push((descriptor, secret));
            descriptor
        };

        let _ = self.req_tx.send(descriptor);
        Ok(descriptor)
    }
}

/// Genesis signer mock: derives tweaked group keys from the key ring's
/// secrets and signs membership proofs under them.
pub struct MockGenSigner {
    key_ring: Arc<MockKeyRing>,
}

impl MockGenSigner {
    pub fn new(key_ring: Arc<MockKeyRing>) -> Self {
        MockGenSigner { key_ring }
    }

    fn group_keypair(
        &self,
        raw_key: &KeyDescriptor,
        anchor_asset_id: AssetId,
    ) -> Result<Keypair> {
        let secret = self
            .key_ring
            .secret_for(&raw_key.pub_key)
            .ok_or_else(|| Error::WalletUnavailable("unknown raw group key".to_string()))?;

        // First tweak the raw key with the anchor asset ID, then apply the
        // taproot output tweak with an empty script tree.
        let id_tweak = Scalar::from_be_bytes(anchor_asset_id.to_byte_array())
            .map_err(|_| Error::WalletUnavailable("asset id tweak out of range".to_string()))?;
        let tweaked_secret = secret
            .add_tweak(&id_tweak)
            .map_err(|e| Error::WalletUnavailable(format!("group key tweak failed: {}", e)))?;

        let secp = secp();
        let keypair = Keypair::from_secret_key(&secp, &tweaked_secret);
        let (internal, _) = keypair.x_only_public_key();
        let tap_tweak = TapTweakHash::from_key_and_tweak(internal, None).to_scalar();
        keypair
            .add_xonly_tweak(&secp, &tap_tweak)
            .map_err(|e| Error::WalletUnavailable(format!("group tap tweak failed: {}", e)))
    }
}

#[async_trait]
impl GenSigner for MockGenSigner {
    async fn derive_group_key(
        &self,
        raw_key: &KeyDescriptor,
        anchor_asset_id: AssetId,
    ) -> Result<XOnlyPublicKey> {
        Ok(self.group_keypair(raw_key, anchor_asset_id)?.x_only_public_key().0)
    }

    async fn sign_group_membership(
        &self,
        raw_key: &KeyDescriptor,
        anchor_asset_id: AssetId,
        member_asset_id: AssetId,
    ) -> Result<schnorr::Signature> {
        let keypair = self.group_keypair(raw_key, anchor_asset_id)?;
        let msg = bitcoin::secp256k1::Message::from_digest(member_asset_id.to_byte_array());
        Ok(secp().sign_schnorr_no_aux_rand(&msg, &keypair))
    }
}

/// Virtual transaction signer mock backed by the key ring's secrets.
pub struct MockSigner {
    key_ring: Arc<MockKeyRing>,
}

impl MockSigner {
    pub fn new(key_ring: Arc<MockKeyRing>) -> Self {
        MockSigner { key_ring }
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn sign_virtual_tx(
        &self,
        script_key: &XOnlyPublicKey,
        tx: &Transaction,
        input_asset: &Asset,
    ) -> Result<Witness> {
        let keypair = self
            .key_ring
            .tweaked_keypair_for_script_key(script_key)
            .ok_or_else(|| Error::WalletUnavailable("unknown script key".to_string()))?;
        Ok(vm::sign_key_spend(&secp(), &keypair, tx, input_asset)?)
    }
}

/// In-memory proof archive.
pub struct MockProofArchive {
    files: Mutex<BTreeMap<(AssetId, XOnlyPublicKey), Vec<u8>>>,
    import_tx: mpsc::UnboundedSender<usize>,
    import_rx: AsyncMutex<mpsc::UnboundedReceiver<usize>>,
}

impl MockProofArchive {
    pub fn new() -> Self {
        let (import_tx, import_rx) = mpsc::unbounded_channel();
        MockProofArchive {
            files: Mutex::new(BTreeMap::new()),
            import_tx,
            import_rx: AsyncMutex::new(import_rx),
        }
    }

    /// Awaits the next import and returns how many proofs it carried.
    pub async fn next_import(&self) -> usize {
        self.import_rx
            .lock()
            .await
            .recv()
            .await
            .expect("import channel closed")
    }

    /// Synchronous lookup for test assertions.
    pub fn proof_blob(&self, locator: &ProofLocator) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("poisoned")
            .get(&(locator.asset_id, locator.script_key))
            .cloned()
    }

    pub fn num_files(&self) -> usize {
        self.files.lock().expect("poisoned").len()
    }
}

impl Default for MockProofArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProofArchive for MockProofArchive {
    async fn import_proofs(&self, proofs: Vec<AnnotatedProof>) -> Result<()> {
        let count = proofs.len();
        let mut files = self.files.lock().expect("poisoned");
        for proof in proofs {
            files.insert(
                (proof.locator.asset_id, proof.locator.script_key),
                proof.blob,
            );
        }
        drop(files);
        let _ = self.import_tx.send(count);
        Ok(())
    }

    async fn fetch_proof(&self, locator: &ProofLocator) -> Result<Vec<u8>> {
        self.files
            .lock()
            .expect("poisoned")
            .get(&(locator.asset_id, locator.script_key))
            .cloned()
            .ok_or_else(|| Error::StoreFailure("proof not found".to_string()))
    }
}

/// In-memory minting store.
pub struct MockMintingStore {
    batches: Mutex<HashMap<[u8; 33], MintingBatch>>,
}

impl MockMintingStore {
    pub fn new() -> Self {
        MockMintingStore {
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn with_batch<T>(
        &self,
        batch_key: &bitcoin::secp256k1::PublicKey,
        update: impl FnOnce(&mut MintingBatch) -> T,
    ) -> Result<T> {
        let mut batches = self.batches.lock().expect("poisoned");
        let batch = batches
            .get_mut(&batch_key.serialize())
            .ok_or_else(|| Error::StoreFailure("unknown batch".to_string()))?;
        Ok(update(batch))
    }
}

impl Default for MockMintingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MintingStore for MockMintingStore {
    async fn commit_minting_batch(&self, batch: MintingBatch) -> Result<()> {
        self.batches
            .lock()
            .expect("poisoned")
            .insert(batch.key_bytes(), batch);
        Ok(())
    }

    async fn fetch_non_final_batches(&self) -> Result<Vec<MintingBatch>> {
        Ok(self
            .batches
            .lock()
            .expect("poisoned")
            .values()
            .filter(|batch| !batch.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn fetch_all_batches(&self) -> Result<Vec<MintingBatch>> {
        Ok(self
            .batches
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn update_batch_state(
        &self,
        batch_key: &bitcoin::secp256k1::PublicKey,
        new_state: BatchState,
    ) -> Result<()> {
        self.with_batch(batch_key, |batch| batch.state = new_state)
    }

    async fn commit_batch_sprout(
        &self,
        batch_key: &bitcoin::secp256k1::PublicKey,
        genesis_packet: FundedPsbt,
        assets: Vec<Asset>,
        root_commitment: taproot_assets_core::commitment::TapCommitment,
    ) -> Result<()> {
        self.with_batch(batch_key, |batch| {
            batch.genesis_packet = Some(genesis_packet);
            batch.sprouted_assets = assets;
            batch.root_commitment = Some(root_commitment);
        })
    }

    async fn commit_signed_genesis_psbt(
        &self,
        batch_key: &bitcoin::secp256k1::PublicKey,
        signed_psbt: Psbt,
        final_tx: Transaction,
        height_hint: u32,
    ) -> Result<()> {
        self.with_batch(batch_key, |batch| {
            if let Some(packet) = batch.genesis_packet.as_mut() {
                packet.psbt = signed_psbt;
            }
            batch.final_tx = Some(final_tx);
            batch.height_hint = height_hint;
        })
    }

    async fn mark_batch_confirmed(
        &self,
        batch_key: &bitcoin::secp256k1::PublicKey,
        _block_hash: BlockHash,
        _block_height: u32,
    ) -> Result<()> {
        // State advancement is recorded separately; confirmation here only
        // has to be idempotent.
        self.with_batch(batch_key, |_| ())
    }
}

/// In-memory asset store doubling as the coin lister.
pub struct MockCoinLister {
    commitments: Mutex<Vec<AnchoredCommitment>>,
}

impl MockCoinLister {
    pub fn new() -> Self {
        MockCoinLister {
            commitments: Mutex::new(Vec::new()),
        }
    }

    pub fn add_commitment(&self, commitment: AnchoredCommitment) {
        self.commitments.lock().expect("poisoned").push(commitment);
    }

    pub fn remove_anchor_point(&self, anchor_point: &OutPoint) {
        self.commitments
            .lock()
            .expect("poisoned")
            .retain(|commitment| commitment.anchor_point != *anchor_point);
    }

    pub fn all_commitments(&self) -> Vec<AnchoredCommitment> {
        self.commitments.lock().expect("poisoned").clone()
    }
}

impl Default for MockCoinLister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoinLister for MockCoinLister {
    async fn list_eligible_coins(
        &self,
        constraints: &CommitmentConstraints,
    ) -> Result<Vec<AnchoredCommitment>> {
        Ok(self
            .commitments
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|commitment| {
                if let Some(asset_id) = constraints.asset_id {
                    return commitment.asset.asset_id() == asset_id;
                }
                if let Some(group_key) = constraints.group_key {
                    return commitment
                        .asset
                        .group_key
                        .map(|group| group.group_pubkey == group_key)
                        .unwrap_or(false);
                }
                false
            })
            .cloned()
            .collect())
    }
}

/// In-memory export log. Confirmation moves asset ownership in the
/// attached coin store: spent anchor points disappear, new local outputs
/// and re-anchored passives appear.
pub struct MockExportLog {
    parcels: Mutex<Vec<(OutboundParcel, bool)>>,
    coin_store: Arc<MockCoinLister>,
    confirm_tx: mpsc::UnboundedSender<Txid>,
    confirm_rx: AsyncMutex<mpsc::UnboundedReceiver<Txid>>,
}

impl MockExportLog {
    pub fn new(coin_store: Arc<MockCoinLister>) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        MockExportLog {
            parcels: Mutex::new(Vec::new()),
            coin_store,
            confirm_tx,
            confirm_rx: AsyncMutex::new(confirm_rx),
        }
    }

    pub async fn next_confirmed(&self) -> Txid {
        self.confirm_rx
            .lock()
            .await
            .recv()
            .await
            .expect("confirm channel closed")
    }

    pub fn num_pending(&self) -> usize {
        self.parcels
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|(_, confirmed)| !confirmed)
            .count()
    }
}

#[async_trait]
impl ExportLog for MockExportLog {
    async fn log_pending_parcel(&self, parcel: &OutboundParcel) -> Result<()> {
        self.parcels
            .lock()
            .expect("poisoned")
            .push((parcel.clone(), false));
        Ok(())
    }

    async fn pending_parcels(&self) -> Result<Vec<OutboundParcel>> {
        Ok(self
            .parcels
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|(_, confirmed)| !confirmed)
            .map(|(parcel, _)| parcel.clone())
            .collect())
    }

    async fn confirm_parcel_delivery(&self, event: &AssetConfirmEvent) -> Result<()> {
        let mut parcels = self.parcels.lock().expect("poisoned");
        let entry = parcels
            .iter_mut()
            .find(|(parcel, _)| parcel.anchor_txid() == event.anchor_txid)
            .ok_or_else(|| Error::StoreFailure("unknown parcel".to_string()))?;
        if entry.1 {
            // Confirmations are keyed by (txid, block hash); redelivery is
            // a no-op.
            return Ok(());
        }
        entry.1 = true;
        let parcel = entry.0.clone();
        drop(parcels);

        // Ownership moves: spent inputs leave the store, local outputs and
        // passives re-appear under their new anchors.
        for input in &parcel.inputs {
            self.coin_store.remove_anchor_point(&input.prev_id.out_point);
        }

        let mut assets_per_output: BTreeMap<u32, Vec<Asset>> = BTreeMap::new();
        for output in &parcel.outputs {
            if let Some(asset) = &output.asset {
                assets_per_output
                    .entry(output.anchor.outpoint.vout)
                    .or_default()
                    .push(asset.clone());
            }
        }
        for passive in &parcel.passive_assets {
            assets_per_output
                .entry(passive.new_anchor_output_index)
                .or_default()
                .push(passive.asset.clone());
        }

        for output in &parcel.outputs {
            if !output.script_key_local {
                continue;
            }
            let asset = match &output.asset {
                Some(asset) => asset.clone(),
                None => continue,
            };
            if let Some(assets) = assets_per_output.get(&output.anchor.outpoint.vout) {
                if let Ok(commitment) =
                    taproot_assets_core::commitment::TapCommitment::from_assets(assets.clone())
                {
                    self.coin_store.add_commitment(AnchoredCommitment {
                        anchor_point: output.anchor.outpoint,
                        anchor_output_value: output.anchor.value,
                        internal_key: output.anchor.internal_key,
                        tapscript_sibling: output.anchor.tapscript_sibling.clone(),
                        commitment,
                        asset,
                    });
                }
            }
        }

        for passive in &parcel.passive_assets {
            let outpoint = OutPoint {
                txid: parcel.anchor_txid(),
                vout: passive.new_anchor_output_index,
            };
            let anchor = parcel
                .outputs
                .iter()
                .find(|output| output.anchor.outpoint.vout == passive.new_anchor_output_index);
            if let (Some(anchor_output), Some(assets)) = (
                anchor,
                assets_per_output.get(&passive.new_anchor_output_index),
            ) {
                if let Ok(commitment) =
                    taproot_assets_core::commitment::TapCommitment::from_assets(assets.clone())
                {
                    self.coin_store.add_commitment(AnchoredCommitment {
                        anchor_point: outpoint,
                        anchor_output_value: anchor_output.anchor.value,
                        internal_key: anchor_output.anchor.internal_key,
                        tapscript_sibling: None,
                        commitment,
                        asset: passive.asset.clone(),
                    });
                }
            }
        }

        let _ = self.confirm_tx.send(event.anchor_txid);
        Ok(())
    }
}

/// Builds an anchor transaction template-independent dummy outpoint, handy
/// for seeding test commitments.
pub fn test_outpoint(tag: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([tag; 32]),
        vout: 0,
    }
}

/// A trivial transaction spending `outpoint`, for seeding chain state in
/// tests.
pub fn test_spending_tx(outpoint: OutPoint) -> Transaction {
    Transaction {
        version: bitcoin::transaction::Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: Vec::new(),
    }
}
