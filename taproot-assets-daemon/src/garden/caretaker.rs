//! The per-batch caretaker.
//!
//! A caretaker owns exactly one frozen batch and walks it through
//! fund -> sprout -> commit -> sign -> broadcast -> confirm -> finalize.
//! Every side effect is idempotent so a restarted caretaker can resume
//! from the last durable state. Cancellation is honored up to broadcast.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::key::TweakedPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Parity, PublicKey, XOnlyPublicKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use taproot_assets_core::commitment::TapCommitment;
use taproot_assets_core::proof::{
    create_genesis_proof, verify_proof, BaseProofParams, ExclusionProofSpec,
};
use taproot_assets_psbt::KeyDescriptor;
use taproot_assets_types::asset::{Asset, AssetType, Genesis, GroupKey};
use taproot_assets_types::proof::File;

use crate::chain::{ChainBridge, TxConfirmation};
use crate::garden::{BatchState, GardenKit, MintingBatch, MintingStore, Seedling};
use crate::wallet::{
    bip86_script_key, AnnotatedProof, GenSigner, KeyRing, ProofArchive, ProofLocator,
    WalletAnchor, TAPROOT_ASSETS_KEY_FAMILY,
};
use crate::{retry_backoff, Error, Result};

/// Amount in satoshis carried by the genesis anchor output, comfortably
/// above dust.
pub const GENESIS_AMT_SATS: u64 = 1_000;

/// Fee estimation confirmation target for genesis transactions.
const GENESIS_CONF_TARGET: u32 = 6;

/// Progress reports a caretaker sends back to its planter.
#[derive(Debug)]
pub(super) enum CaretakerReport {
    /// The batch moved to a new durable state.
    StateChange {
        batch_key: [u8; 33],
        state: BatchState,
    },
    /// The caretaker failed fatally; the batch was moved to `Failed`.
    Fatal {
        batch_key: [u8; 33],
        error: Error,
    },
}

pub(super) struct BatchCaretaker {
    batch: MintingBatch,
    kit: GardenKit,
    cancel_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    report_tx: mpsc::UnboundedSender<CaretakerReport>,
    confirmation: Option<TxConfirmation>,
}

impl BatchCaretaker {
    /// Spawns a caretaker for the batch. Returns the cancellation handle
    /// and the join handle of the task.
    pub(super) fn spawn(
        batch: MintingBatch,
        kit: GardenKit,
        shutdown_rx: watch::Receiver<bool>,
        report_tx: mpsc::UnboundedSender<CaretakerReport>,
    ) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let caretaker = BatchCaretaker {
            batch,
            kit,
            cancel_rx,
            shutdown_rx,
            report_tx,
            confirmation: None,
        };
        let handle = tokio::spawn(caretaker.run());
        (cancel_tx, handle)
    }

    async fn run(mut self) {
        let batch_key = self.batch.key_bytes();
        if let Err(err) = self.advance().await {
            log::error!(
                "caretaker: batch {} failed: {}",
                hex_key(&batch_key),
                err
            );
            // Keep durable records, just flag the batch as failed.
            let _ = self
                .kit
                .log
                .update_batch_state(&self.batch.batch_key.pub_key, BatchState::Failed)
                .await;
            let _ = self.report_tx.send(CaretakerReport::Fatal { batch_key, error: err });
        }
    }

    async fn advance(&mut self) -> Result<()> {
        loop {
            if self.cancel_requested() && self.batch.state < BatchState::Broadcast {
                log::info!(
                    "caretaker: batch {} cancelled at state {}",
                    hex_key(&self.batch.key_bytes()),
                    self.batch.state
                );
                self.set_state(BatchState::SproutCancelled).await?;
                return Ok(());
            }
            if *self.shutdown_rx.borrow() {
                return Ok(());
            }

            match self.batch.state {
                BatchState::Pending | BatchState::Frozen => self.fund_and_sprout().await?,
                BatchState::Committed => self.sign_genesis().await?,
                BatchState::Broadcast => {
                    if !self.broadcast_and_confirm().await? {
                        // Shut down while waiting; resume after restart.
                        return Ok(());
                    }
                }
                BatchState::Confirmed => self.emit_proofs().await?,
                _ => return Ok(()),
            }
        }
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn set_state(&mut self, state: BatchState) -> Result<()> {
        let batch_key = self.batch.batch_key.pub_key;
        retry_backoff("update batch state", || {
            let log = self.kit.log.clone();
            async move { log.update_batch_state(&batch_key, state).await }
        })
        .await?;

        self.batch.state = state;
        let _ = self.report_tx.send(CaretakerReport::StateChange {
            batch_key: self.batch.key_bytes(),
            state,
        });
        Ok(())
    }

    /// Funds the genesis transaction, derives all asset keys, sprouts the
    /// seedlings into assets and commits them to the genesis output.
    async fn fund_and_sprout(&mut self) -> Result<()> {
        let fee_rate = retry_backoff("estimate fee", || {
            let chain = self.kit.chain_bridge.clone();
            async move { chain.estimate_fee_rate(GENESIS_CONF_TARGET).await }
        })
        .await?;

        // One dust-above output paying to a placeholder; the real output
        // key is patched in once the commitment is known.
        let template_tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(GENESIS_AMT_SATS),
                script_pubkey: genesis_dummy_script(),
            }],
        };
        let template = Psbt::from_unsigned_tx(template_tx)
            .map_err(|e| Error::Internal(format!("genesis template rejected: {}", e)))?;

        let mut funded = retry_backoff("fund genesis psbt", || {
            let wallet = self.kit.wallet.clone();
            let template = template.clone();
            async move { wallet.fund_psbt(template, fee_rate).await }
        })
        .await?;

        // The first input of the funded packet is the shared genesis point
        // of every asset in the batch.
        let genesis_point = funded
            .genesis_point()
            .ok_or_else(|| Error::Internal("funded genesis psbt has no inputs".to_string()))?;

        let assets = self.sprout_assets(genesis_point).await?;
        let commitment = TapCommitment::from_assets(assets.clone())?;
        let (output_key, _) = commitment.output_key(&self.batch.batch_key.pub_key, None)?;

        funded.psbt.unsigned_tx.output[0].script_pubkey =
            p2tr_script(output_key);

        retry_backoff("import output key", || {
            let wallet = self.kit.wallet.clone();
            async move { wallet.import_taproot_output_key(output_key).await }
        })
        .await?;

        let batch_key = self.batch.batch_key.pub_key;
        retry_backoff("commit batch sprout", || {
            let log = self.kit.log.clone();
            let funded = funded.clone();
            let assets = assets.clone();
            let commitment = commitment.clone();
            async move {
                log.commit_batch_sprout(&batch_key, funded, assets, commitment)
                    .await
            }
        })
        .await?;

        self.batch.genesis_packet = Some(funded);
        self.batch.sprouted_assets = assets;
        self.batch.root_commitment = Some(commitment);
        self.set_state(BatchState::Committed).await
    }

    /// Turns every seedling into an asset sharing the batch genesis point.
    /// Group anchors derive a fresh group key; tranche members join their
    /// anchor's group with a membership signature over their own asset ID.
    async fn sprout_assets(&mut self, genesis_point: bitcoin::OutPoint) -> Result<Vec<Asset>> {
        struct SproutContext {
            seedling: Seedling,
            genesis: Genesis,
            script_key: XOnlyPublicKey,
        }

        let mut contexts: Vec<SproutContext> = Vec::with_capacity(self.batch.seedlings.len());
        for seedling in self.batch.seedlings.values() {
            let script_key_desc = self.derive_key().await?;
            let genesis = Genesis {
                genesis_point,
                tag: seedling.name.clone(),
                meta_hash: seedling.meta.meta_hash(),
                output_index: 0,
                asset_type: seedling.asset_type,
            };
            contexts.push(SproutContext {
                seedling: seedling.clone(),
                genesis,
                script_key: bip86_script_key(&script_key_desc.pub_key),
            });
        }

        // Group anchors first so tranche members can look their group up.
        let mut groups: BTreeMap<String, (KeyDescriptor, taproot_assets_types::asset::AssetId)> =
            BTreeMap::new();
        for context in &contexts {
            let is_anchor =
                context.seedling.enable_emission && context.seedling.group_anchor.is_none();
            if !is_anchor {
                continue;
            }
            let group_key_desc = self.derive_key().await?;
            groups.insert(
                context.seedling.name.clone(),
                (group_key_desc, context.genesis.asset_id()),
            );
        }

        let mut assets = Vec::with_capacity(contexts.len());
        for context in contexts {
            let group_name = match (&context.seedling.group_anchor, context.seedling.enable_emission)
            {
                (Some(anchor_name), _) => Some(anchor_name.clone()),
                (None, true) => Some(context.seedling.name.clone()),
                (None, false) => None,
            };

            let group_key = match group_name {
                Some(name) => {
                    let (raw_key, anchor_id) = groups
                        .get(&name)
                        .ok_or_else(|| Error::GroupAnchorMissing(name.clone()))?;
                    let asset_id = context.genesis.asset_id();
                    let group_pubkey = self
                        .kit
                        .gen_signer
                        .derive_group_key(raw_key, *anchor_id)
                        .await?;
                    let sig = self
                        .kit
                        .gen_signer
                        .sign_group_membership(raw_key, *anchor_id, asset_id)
                        .await?;
                    Some(GroupKey { group_pubkey, sig })
                }
                None => None,
            };

            let amount = match context.seedling.asset_type {
                AssetType::Collectible => 1,
                AssetType::Normal => context.seedling.amount,
            };

            assets.push(Asset::new_genesis(
                context.genesis,
                amount,
                context.script_key,
                group_key,
            ));
        }

        Ok(assets)
    }

    async fn derive_key(&self) -> Result<KeyDescriptor> {
        retry_backoff("derive key", || {
            let key_ring = self.kit.key_ring.clone();
            async move { key_ring.derive_next_key(TAPROOT_ASSETS_KEY_FAMILY).await }
        })
        .await
    }

    /// Signs the funded genesis PSBT and records the pre-broadcast height
    /// hint.
    async fn sign_genesis(&mut self) -> Result<()> {
        let packet = self
            .batch
            .genesis_packet
            .clone()
            .ok_or_else(|| Error::Internal("committed batch has no genesis packet".to_string()))?;

        let signed = retry_backoff("sign genesis psbt", || {
            let wallet = self.kit.wallet.clone();
            let psbt = packet.psbt.clone();
            async move { wallet.sign_and_finalize_psbt(psbt).await }
        })
        .await?;
        let final_tx = signed.unsigned_tx.clone();

        let height_hint = retry_backoff("best height", || {
            let chain = self.kit.chain_bridge.clone();
            async move { chain.best_height().await }
        })
        .await?;

        let batch_key = self.batch.batch_key.pub_key;
        retry_backoff("commit signed genesis psbt", || {
            let log = self.kit.log.clone();
            let signed = signed.clone();
            let final_tx = final_tx.clone();
            async move {
                log.commit_signed_genesis_psbt(&batch_key, signed, final_tx, height_hint)
                    .await
            }
        })
        .await?;

        self.batch.final_tx = Some(final_tx);
        self.batch.height_hint = height_hint;
        self.set_state(BatchState::Broadcast).await
    }

    /// (Re-)broadcasts the genesis transaction and waits for its
    /// confirmation. Returns false if the wait was interrupted by
    /// shutdown.
    async fn broadcast_and_confirm(&mut self) -> Result<bool> {
        let final_tx = self
            .batch
            .final_tx
            .clone()
            .ok_or_else(|| Error::Internal("broadcast batch has no final tx".to_string()))?;
        let txid = final_tx.compute_txid();
        let height_hint = self.batch.height_hint;

        // Re-submission after a restart is a best-effort no-op.
        retry_backoff("publish genesis tx", || {
            let chain = self.kit.chain_bridge.clone();
            let tx = final_tx.clone();
            async move { chain.publish_transaction(&tx).await }
        })
        .await?;

        let conf_rx = retry_backoff("register confirmation", || {
            let chain = self.kit.chain_bridge.clone();
            async move { chain.register_confirmation_ntfn(txid, height_hint).await }
        })
        .await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        let confirmation = tokio::select! {
            conf = conf_rx => match conf {
                Ok(confirmation) => confirmation,
                Err(_) => {
                    return Err(Error::ChainBackendUnavailable(
                        "confirmation channel closed".to_string(),
                    ))
                }
            },
            _ = shutdown_rx.changed() => return Ok(false),
        };

        let batch_key = self.batch.batch_key.pub_key;
        let block_hash = confirmation.block_hash();
        let block_height = confirmation.block_height;
        retry_backoff("mark batch confirmed", || {
            let log = self.kit.log.clone();
            async move {
                log.mark_batch_confirmed(&batch_key, block_hash, block_height)
                    .await
            }
        })
        .await?;

        self.confirmation = Some(confirmation);
        self.set_state(BatchState::Confirmed).await?;
        Ok(true)
    }

    /// Builds one genesis proof file per sprouted asset and hands them to
    /// the proof archive. Proof failures are fatal and do not advance the
    /// batch.
    async fn emit_proofs(&mut self) -> Result<()> {
        let confirmation = match self.confirmation.clone() {
            Some(confirmation) => confirmation,
            // Restarted into Confirmed: the confirmation is redelivered,
            // keyed by (txid, block hash).
            None => {
                let final_tx = self.batch.final_tx.clone().ok_or_else(|| {
                    Error::Internal("confirmed batch has no final tx".to_string())
                })?;
                let txid = final_tx.compute_txid();
                let height_hint = self.batch.height_hint;
                let conf_rx = retry_backoff("register confirmation", || {
                    let chain = self.kit.chain_bridge.clone();
                    async move { chain.register_confirmation_ntfn(txid, height_hint).await }
                })
                .await?;
                conf_rx.await.map_err(|_| {
                    Error::ChainBackendUnavailable("confirmation channel closed".to_string())
                })?
            }
        };

        let final_tx = self
            .batch
            .final_tx
            .clone()
            .ok_or_else(|| Error::Internal("confirmed batch has no final tx".to_string()))?;
        let commitment = self
            .batch
            .root_commitment
            .clone()
            .ok_or_else(|| Error::Internal("confirmed batch has no commitment".to_string()))?;
        let genesis_packet = self
            .batch
            .genesis_packet
            .clone()
            .ok_or_else(|| Error::Internal("confirmed batch has no genesis packet".to_string()))?;

        // Taproot outputs the wallet added while funding (its change)
        // need a BIP-86 exclusion proof; the wallet advertises their
        // internal keys in the PSBT output metadata.
        let mut exclusions = Vec::new();
        for (index, txout) in final_tx.output.iter().enumerate() {
            if index == 0 || !txout.script_pubkey.is_p2tr() {
                continue;
            }
            let internal_key = genesis_packet
                .psbt
                .outputs
                .get(index)
                .and_then(|output| output.tap_internal_key)
                .ok_or_else(|| {
                    Error::Internal("wallet taproot output without internal key".to_string())
                })?;
            exclusions.push(ExclusionProofSpec::Bip86 {
                output_index: index as u32,
                internal_key: PublicKey::from_x_only_public_key(internal_key, Parity::Even),
            });
        }

        let params = BaseProofParams {
            block_header: confirmation.block_header,
            block_height: confirmation.block_height,
            block_txids: &confirmation.block_txids,
            tx_index: confirmation.tx_index,
            anchor_tx: final_tx,
            output_index: 0,
            internal_key: self.batch.batch_key.pub_key,
            commitment: &commitment,
            tapscript_sibling: None,
            exclusions,
        };

        let mut annotated = Vec::with_capacity(self.batch.sprouted_assets.len());
        for asset in &self.batch.sprouted_assets {
            let meta_reveal = self
                .batch
                .seedlings
                .get(&asset.genesis.tag)
                .map(|seedling| seedling.meta.clone());

            let proof = create_genesis_proof(&params, asset, meta_reveal)?;
            verify_proof(&proof, None)?;

            let mut file = File::new();
            file.append(proof.to_bytes()?);
            annotated.push(AnnotatedProof {
                locator: ProofLocator {
                    asset_id: asset.asset_id(),
                    script_key: asset.script_key,
                },
                blob: file.to_bytes(),
            });
        }

        retry_backoff("import genesis proofs", || {
            let archive = self.kit.proof_archive.clone();
            let annotated = annotated.clone();
            async move { archive.import_proofs(annotated).await }
        })
        .await?;

        self.set_state(BatchState::Finalized).await
    }
}

/// A placeholder P2TR-shaped script used until the real genesis output key
/// is known.
pub(super) fn genesis_dummy_script() -> ScriptBuf {
    let mut script = Vec::with_capacity(34);
    script.push(0x51);
    script.push(0x20);
    script.extend_from_slice(&[0u8; 32]);
    ScriptBuf::from_bytes(script)
}

/// The output script paying to a tweaked taproot output key.
pub(super) fn p2tr_script(output_key: XOnlyPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key))
}

fn hex_key(key: &[u8; 33]) -> String {
    key.iter().map(|byte| format!("{:02x}", byte)).collect()
}
