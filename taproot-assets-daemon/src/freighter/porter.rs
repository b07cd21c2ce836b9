//! The chain porter.
//!
//! A single-threaded event loop advancing one outbound parcel at a time
//! through coin selection, virtual transaction construction and signing,
//! anchor funding and signing, broadcast, confirmation and proof
//! delivery. Parcels are persisted before broadcast and re-broadcast on
//! startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Parity, PublicKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use taproot_assets_core::commitment::TapCommitment;
use taproot_assets_core::proof::{
    append_transition, create_transition_proof, BaseProofParams, ExclusionProofSpec,
    SplitRootParams,
};
use taproot_assets_core::split::{SplitCommitment, SplitLocator};
use taproot_assets_core::vm;
use taproot_assets_psbt::{
    Anchor as VInputAnchor, KeyDescriptor, VInput, VOutput, VOutputType, VPacket,
};
use taproot_assets_types::address::{ChainParams, TapAddress};
use taproot_assets_types::asset::{Asset, PrevId, PrevWitness, SerializedKey};
use taproot_assets_types::proof::File;

use crate::chain::{ChainBridge, TxConfirmation};
use crate::freighter::{
    select_for_amount, Anchor, AnchoredCommitment, AssetConfirmEvent, CoinLister,
    CommitmentConstraints, ExportLog, MultiCommitmentSelectStrategy, OutboundParcel,
    PassiveAssetReAnchor, SendState, TransferInput, TransferOutput, WalletOutput,
};
use crate::wallet::{
    bip86_script_key, AnnotatedProof, KeyRing, ProofArchive, ProofLocator, Signer, WalletAnchor,
    TAPROOT_ASSETS_KEY_FAMILY,
};
use crate::{retry_backoff, Error, Result};

/// Amount in satoshis carried by each asset anchor output.
pub const ANCHOR_AMT_SATS: u64 = 1_000;

/// Fee estimation confirmation target for anchor transactions.
const ANCHOR_CONF_TARGET: u32 = 6;

/// A request to ship assets to an address.
#[derive(Debug, Clone)]
pub struct Parcel {
    /// The decoded destination address.
    pub address: TapAddress,
    /// Whether the receiver is aware of the transfer. Interactive
    /// full-value sends skip the tombstone output.
    pub interactive: bool,
}

/// Configuration of a chain porter.
pub struct PorterConfig {
    /// Enumerates spendable commitments.
    pub coin_lister: Arc<dyn CoinLister>,
    /// Signs virtual transaction inputs.
    pub signer: Arc<dyn Signer>,
    /// The chain backend for broadcast and confirmations.
    pub chain_bridge: Arc<dyn ChainBridge>,
    /// The wallet funding and signing anchor transactions.
    pub wallet: Arc<dyn WalletAnchor>,
    /// The durable parcel log.
    pub export_log: Arc<dyn ExportLog>,
    /// The provenance archive.
    pub proof_archive: Arc<dyn ProofArchive>,
    /// Derives change script keys and anchor internal keys.
    pub key_ring: Arc<dyn KeyRing>,
    /// Chain parameters of the network shipped on.
    pub chain_params: &'static ChainParams,
}

#[derive(Clone)]
struct FreightKit {
    coin_lister: Arc<dyn CoinLister>,
    signer: Arc<dyn Signer>,
    chain_bridge: Arc<dyn ChainBridge>,
    wallet: Arc<dyn WalletAnchor>,
    export_log: Arc<dyn ExportLog>,
    proof_archive: Arc<dyn ProofArchive>,
    key_ring: Arc<dyn KeyRing>,
    chain_params: &'static ChainParams,
}

enum PorterCommand {
    RequestShipment {
        parcel: Parcel,
        cancel: watch::Receiver<bool>,
        reply: oneshot::Sender<Result<OutboundParcel>>,
    },
}

/// Public handle to the porter actor.
pub struct ChainPorter {
    cmd_tx: mpsc::Sender<PorterCommand>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChainPorter {
    /// Starts the porter and re-broadcasts any pending parcels found in
    /// the export log.
    pub async fn start(config: PorterConfig) -> Result<ChainPorter> {
        let kit = FreightKit {
            coin_lister: config.coin_lister,
            signer: config.signer,
            chain_bridge: config.chain_bridge,
            wallet: config.wallet,
            export_log: config.export_log,
            proof_archive: config.proof_archive,
            key_ring: config.key_ring,
            chain_params: config.chain_params,
        };
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<PorterCommand>(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Replay: every pending parcel is re-broadcast and driven to
        // completion.
        let pending = retry_backoff("fetch pending parcels", || {
            let log = kit.export_log.clone();
            async move { log.pending_parcels().await }
        })
        .await?;
        for parcel in pending {
            log::info!(
                "porter: resuming pending parcel {}",
                parcel.anchor_txid()
            );
            let kit = kit.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(err) = resume_parcel(&kit, parcel, shutdown_rx).await {
                    log::error!("porter: parcel resume failed: {}", err);
                }
            });
        }

        let mut loop_shutdown = shutdown_rx.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(PorterCommand::RequestShipment { parcel, cancel, reply }) => {
                            let result =
                                ship_parcel(&kit, parcel, cancel, shutdown_rx.clone()).await;
                            let _ = reply.send(result);
                        }
                        None => return,
                    },
                    _ = loop_shutdown.changed() => return,
                }
            }
        });

        Ok(ChainPorter {
            cmd_tx,
            shutdown_tx,
            task,
        })
    }

    /// Requests that a new send be funneled through the porter. Resolves
    /// once the parcel's proofs are delivered. The cancellation token is
    /// honored until broadcast; afterwards the attempt is logged and the
    /// parcel continues.
    pub async fn request_shipment(
        &self,
        parcel: Parcel,
        cancel: watch::Receiver<bool>,
    ) -> Result<OutboundParcel> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(PorterCommand::RequestShipment {
                parcel,
                cancel,
                reply,
            })
            .await
            .map_err(|_| Error::Internal("porter stopped".to_string()))?;
        response
            .await
            .map_err(|_| Error::Internal("porter stopped".to_string()))?
    }

    /// Signals a graceful shutdown. Pending parcels resume on next start.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the porter and waits for the actor to wind down.
    pub async fn stop_and_wait(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Everything assembled while preparing a transfer, before broadcast.
struct ActiveTransfer {
    parcel: OutboundParcel,
}

async fn ship_parcel(
    kit: &FreightKit,
    parcel: Parcel,
    cancel: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<OutboundParcel> {
    let mut state = SendState::Requested;
    log::debug!("porter: new shipment, state {}", state);

    // Coin selection.
    check_cancel(&cancel, state)?;
    let selected = select_coins(kit, &parcel.address).await?;
    state = SendState::InputsSelected;
    log::debug!("porter: state {}", state);

    // Virtual transaction construction and VM signing.
    check_cancel(&cancel, state)?;
    let transfer = build_and_sign_transfer(kit, &parcel, &selected).await?;
    state = SendState::VirtualSigned;
    log::debug!("porter: state {}", state);

    // Anchor into a Bitcoin transaction.
    check_cancel(&cancel, state)?;
    let active = anchor_transfer(kit, &selected, transfer).await?;
    state = SendState::AnchorSigned;
    log::debug!("porter: state {}", state);

    // Persist, then broadcast.
    check_cancel(&cancel, state)?;
    let outbound = active.parcel;
    retry_backoff("log pending parcel", || {
        let log = kit.export_log.clone();
        let outbound = outbound.clone();
        async move { log.log_pending_parcel(&outbound).await }
    })
    .await?;

    broadcast_parcel(kit, &outbound).await?;
    state = SendState::Broadcast;
    log::debug!("porter: state {}", state);
    if *cancel.borrow() {
        // Too late: the anchor transaction is out.
        log::warn!("porter: cancellation after broadcast ignored");
    }

    let confirmation = match await_confirmation(kit, &outbound, shutdown_rx).await? {
        Some(confirmation) => confirmation,
        None => {
            return Err(Error::Internal(
                "porter shut down while awaiting confirmation".to_string(),
            ))
        }
    };
    log::debug!("porter: state {}", SendState::Confirmed);

    let outbound = finalize_confirmed(kit, outbound, &confirmation).await?;
    log::debug!("porter: state {}", SendState::ProofsDelivered);
    Ok(outbound)
}

/// Resumes a pending parcel after a restart: re-broadcast, await
/// confirmation, deliver proofs.
async fn resume_parcel(
    kit: &FreightKit,
    parcel: OutboundParcel,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    broadcast_parcel(kit, &parcel).await?;
    if let Some(confirmation) = await_confirmation(kit, &parcel, shutdown_rx).await? {
        finalize_confirmed(kit, parcel, &confirmation).await?;
    }
    Ok(())
}

fn check_cancel(cancel: &watch::Receiver<bool>, state: SendState) -> Result<()> {
    if *cancel.borrow() {
        log::info!("porter: shipment cancelled at state {}", state);
        return Err(Error::Internal("shipment cancelled".to_string()));
    }
    Ok(())
}

async fn select_coins(
    kit: &FreightKit,
    address: &TapAddress,
) -> Result<Vec<AnchoredCommitment>> {
    let constraints = CommitmentConstraints {
        asset_id: match address.group_key {
            Some(_) => None,
            None => Some(address.asset_id),
        },
        group_key: address.group_key,
        min_amt: address.amount,
    };

    let eligible = retry_backoff("list eligible coins", || {
        let lister = kit.coin_lister.clone();
        let constraints = constraints.clone();
        async move { lister.list_eligible_coins(&constraints).await }
    })
    .await?;

    select_for_amount(
        address.amount,
        eligible,
        MultiCommitmentSelectStrategy::PreferMaxAmount,
    )
}

/// The draft of the active transfer: the virtual packet, the new assets
/// per anchor output and the passive re-anchors.
struct SignedTransfer {
    packet: VPacket,
    passive_assets: Vec<PassiveAssetReAnchor>,
    change_internal_key: KeyDescriptor,
    /// Anchor output index of the recipient output.
    recipient_output_index: u32,
}

async fn build_and_sign_transfer(
    kit: &FreightKit,
    parcel: &Parcel,
    selected: &[AnchoredCommitment],
) -> Result<SignedTransfer> {
    let address = &parcel.address;
    let inputs: Vec<(PrevId, Asset)> = selected
        .iter()
        .map(|commitment| (commitment.prev_id(), commitment.asset.clone()))
        .collect();
    let input_total: u64 = inputs.iter().map(|(_, asset)| asset.amount).sum();
    let full_value = input_total == address.amount;

    let recipient_internal = PublicKey::from_x_only_public_key(
        address.internal_key,
        Parity::Even,
    );

    let mut prev_assets: BTreeMap<PrevId, Asset> = BTreeMap::new();
    for (prev_id, asset) in &inputs {
        prev_assets.insert(*prev_id, asset.clone());
    }

    // Interactive full-value sends move the whole balance in a single
    // simple output; everything else splits with a (possibly zero-amount
    // tombstone) split root.
    let interactive_full_value = full_value && parcel.interactive;
    let (recipient_output_index, change_output_index) = if interactive_full_value {
        (0u32, 1u32)
    } else {
        (1u32, 0u32)
    };

    let change_internal_key = derive_key(kit).await?;

    let mut outputs: Vec<VOutput> = Vec::new();
    if interactive_full_value {
        let mut moved = inputs[0].1.clone();
        moved.amount = input_total;
        moved.script_key = address.script_key;
        moved.split_commitment_root = None;
        moved.prev_witnesses = inputs
            .iter()
            .map(|(prev_id, _)| PrevWitness {
                prev_id: Some(*prev_id),
                tx_witness: Witness::new(),
                split_commitment: None,
            })
            .collect();

        sign_transfer_witnesses(kit, &mut moved, &prev_assets).await?;
        let secp = bitcoin::secp256k1::Secp256k1::verification_only();
        vm::verify(&secp, &moved, recipient_output_index, &prev_assets)?;

        outputs.push(VOutput {
            amount: input_total,
            output_type: VOutputType::Simple,
            interactive: true,
            anchor_output_index: recipient_output_index,
            anchor_internal_key: Some(recipient_internal),
            anchor_derivation: None,
            anchor_tapscript_sibling: address.tapscript_sibling.clone(),
            asset: Some(moved),
            split_asset: None,
            script_key: address.script_key,
            script_key_derivation: None,
        });
    } else {
        let change_script_key_desc = derive_key(kit).await?;
        let change_script_key = bip86_script_key(&change_script_key_desc.pub_key);
        let asset_id = inputs[0].1.asset_id();

        let root_locator = SplitLocator {
            output_index: change_output_index,
            asset_id,
            script_key: change_script_key,
            amount: input_total - address.amount,
        };
        let recipient_locator = SplitLocator {
            output_index: recipient_output_index,
            asset_id,
            script_key: address.script_key,
            amount: address.amount,
        };

        let mut split =
            SplitCommitment::new(&inputs, &root_locator, &[recipient_locator])?;
        sign_transfer_witnesses(kit, &mut split.root_asset, &prev_assets).await?;

        let recipient_asset = split.split_asset(&recipient_locator)?;
        let secp = bitcoin::secp256k1::Secp256k1::verification_only();
        vm::verify(&secp, &recipient_asset, recipient_output_index, &prev_assets)?;

        outputs.push(VOutput {
            amount: root_locator.amount,
            output_type: VOutputType::SplitRoot,
            interactive: false,
            anchor_output_index: change_output_index,
            anchor_internal_key: Some(change_internal_key.pub_key),
            anchor_derivation: Some(change_internal_key),
            anchor_tapscript_sibling: None,
            asset: Some(split.root_asset.clone()),
            split_asset: None,
            script_key: change_script_key,
            script_key_derivation: Some(change_script_key_desc),
        });
        outputs.push(VOutput {
            amount: address.amount,
            output_type: VOutputType::Simple,
            interactive: parcel.interactive,
            anchor_output_index: recipient_output_index,
            anchor_internal_key: Some(recipient_internal),
            anchor_derivation: None,
            anchor_tapscript_sibling: address.tapscript_sibling.clone(),
            asset: Some(recipient_asset),
            split_asset: None,
            script_key: address.script_key,
            script_key_derivation: None,
        });
    }

    // Passive assets: everything co-located in a spent commitment that is
    // not itself being transferred rides along to the change output with
    // an unchanged witness set.
    let mut passive_assets = Vec::new();
    for commitment in selected {
        let spent_key = commitment.asset.asset_commitment_key();
        for asset in commitment.commitment.committed_assets() {
            if asset.asset_commitment_key() == spent_key
                && asset.tap_commitment_key() == commitment.asset.tap_commitment_key()
            {
                continue;
            }

            let passive = asset.clone();
            let packet = passive_packet(
                kit.chain_params,
                &passive,
                commitment.anchor_point,
                change_output_index,
            );
            passive_assets.push(PassiveAssetReAnchor {
                packet,
                genesis_id: passive.asset_id(),
                prev_anchor_point: commitment.anchor_point,
                script_key: passive.script_key,
                new_anchor_output_index: change_output_index,
                asset: passive,
            });
        }
    }

    let packet = VPacket {
        inputs: selected
            .iter()
            .map(|commitment| VInput {
                prev_id: commitment.prev_id(),
                anchor: VInputAnchor {
                    value: commitment.anchor_output_value,
                    pk_script: ScriptBuf::new(),
                    sighash_type: 0,
                    internal_key: Some(commitment.internal_key.pub_key),
                    merkle_root: Vec::new(),
                    tapscript_sibling: commitment.tapscript_sibling.clone(),
                    derivation: Some(commitment.internal_key),
                },
                asset: Some(commitment.asset.clone()),
                proof: Vec::new(),
                script_key_derivation: None,
            })
            .collect(),
        outputs,
        chain_params_hrp: kit.chain_params.address_hrp.to_string(),
        version: 0,
    };
    // One asset ID per virtual packet; mixing is a programming error.
    packet.asset_id()?;

    Ok(SignedTransfer {
        packet,
        passive_assets,
        change_internal_key,
        recipient_output_index,
    })
}

/// Builds the lightweight re-anchoring packet of one passive asset. The
/// asset itself is untouched; only its anchor changes.
fn passive_packet(
    chain_params: &ChainParams,
    passive: &Asset,
    prev_anchor_point: OutPoint,
    anchor_output_index: u32,
) -> VPacket {
    VPacket {
        inputs: vec![VInput {
            prev_id: PrevId {
                out_point: prev_anchor_point,
                asset_id: passive.asset_id(),
                script_key: SerializedKey::from_xonly(&passive.script_key),
            },
            anchor: VInputAnchor::empty(),
            asset: Some(passive.clone()),
            proof: Vec::new(),
            script_key_derivation: None,
        }],
        outputs: vec![VOutput {
            amount: passive.amount,
            output_type: VOutputType::PassiveAssetsOnly,
            interactive: true,
            anchor_output_index,
            anchor_internal_key: None,
            anchor_derivation: None,
            anchor_tapscript_sibling: None,
            asset: Some(passive.clone()),
            split_asset: None,
            script_key: passive.script_key,
            script_key_derivation: None,
        }],
        chain_params_hrp: chain_params.address_hrp.to_string(),
        version: 0,
    }
}

async fn sign_transfer_witnesses(
    kit: &FreightKit,
    asset: &mut Asset,
    prev_assets: &BTreeMap<PrevId, Asset>,
) -> Result<()> {
    let tx = vm::virtual_tx(asset, prev_assets)?;
    for witness in &mut asset.prev_witnesses {
        let prev_id = witness
            .prev_id
            .ok_or_else(|| Error::Internal("transfer witness without prev id".to_string()))?;
        let input_asset = prev_assets
            .get(&prev_id)
            .ok_or_else(|| Error::Internal("transfer input not found".to_string()))?;
        let signature = kit
            .signer
            .sign_virtual_tx(&input_asset.script_key, &tx, input_asset)
            .await?;
        witness.tx_witness = signature;
    }
    Ok(())
}

async fn derive_key(kit: &FreightKit) -> Result<KeyDescriptor> {
    retry_backoff("derive key", || {
        let key_ring = kit.key_ring.clone();
        async move { key_ring.derive_next_key(TAPROOT_ASSETS_KEY_FAMILY).await }
    })
    .await
}

/// Maps the signed virtual outputs onto Bitcoin outputs, merges outputs
/// sharing an anchor index into one TapCommitment, funds and signs the
/// anchor transaction and assembles the durable parcel.
async fn anchor_transfer(
    kit: &FreightKit,
    selected: &[AnchoredCommitment],
    transfer: SignedTransfer,
) -> Result<ActiveTransfer> {
    // Merge all assets per anchor output index.
    let mut assets_per_output: BTreeMap<u32, Vec<Asset>> = BTreeMap::new();
    for output in &transfer.packet.outputs {
        if let Some(asset) = &output.asset {
            assets_per_output
                .entry(output.anchor_output_index)
                .or_default()
                .push(asset.clone());
        }
    }
    for passive in &transfer.passive_assets {
        assets_per_output
            .entry(passive.new_anchor_output_index)
            .or_default()
            .push(passive.asset.clone());
    }

    let mut commitments: BTreeMap<u32, TapCommitment> = BTreeMap::new();
    for (index, assets) in &assets_per_output {
        commitments.insert(*index, TapCommitment::from_assets(assets.clone())?);
    }

    // Internal key and sibling per anchor output.
    let recipient_internal = transfer
        .packet
        .outputs
        .iter()
        .find(|output| output.anchor_output_index == transfer.recipient_output_index)
        .and_then(|output| output.anchor_internal_key)
        .ok_or_else(|| Error::Internal("recipient output missing internal key".to_string()))?;
    let recipient_sibling = transfer
        .packet
        .outputs
        .iter()
        .find(|output| output.anchor_output_index == transfer.recipient_output_index)
        .and_then(|output| output.anchor_tapscript_sibling.clone());

    let internal_key_for = |index: u32| -> (PublicKey, KeyDescriptor) {
        if index == transfer.recipient_output_index {
            (
                recipient_internal,
                KeyDescriptor {
                    pub_key: recipient_internal,
                    family: 0,
                    index: 0,
                },
            )
        } else {
            (
                transfer.change_internal_key.pub_key,
                transfer.change_internal_key,
            )
        }
    };

    // Anchor transaction template: spend every input anchor outpoint and
    // create one taproot output per anchor index.
    let max_index = assets_per_output.keys().copied().max().unwrap_or(0);
    let mut tx_outputs = Vec::with_capacity(max_index as usize + 1);
    for index in 0..=max_index {
        let script_pubkey = match commitments.get(&index) {
            Some(commitment) => {
                let (internal, _) = internal_key_for(index);
                let sibling = if index == transfer.recipient_output_index {
                    recipient_sibling.as_ref()
                } else {
                    None
                };
                let (output_key, _) = commitment.output_key(&internal, sibling)?;
                ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(
                    output_key,
                ))
            }
            None => ScriptBuf::new(),
        };
        tx_outputs.push(TxOut {
            value: Amount::from_sat(ANCHOR_AMT_SATS),
            script_pubkey,
        });
    }

    let template_tx = Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: selected
            .iter()
            .map(|commitment| TxIn {
                previous_output: commitment.anchor_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: tx_outputs,
    };
    let template = Psbt::from_unsigned_tx(template_tx)
        .map_err(|e| Error::Internal(format!("anchor template rejected: {}", e)))?;

    let fee_rate = retry_backoff("estimate fee", || {
        let chain = kit.chain_bridge.clone();
        async move { chain.estimate_fee_rate(ANCHOR_CONF_TARGET).await }
    })
    .await?;
    let funded = retry_backoff("fund anchor psbt", || {
        let wallet = kit.wallet.clone();
        let template = template.clone();
        async move { wallet.fund_psbt(template, fee_rate).await }
    })
    .await?;
    log::debug!("porter: state {}", SendState::AnchorFunded);

    let signed = retry_backoff("sign anchor psbt", || {
        let wallet = kit.wallet.clone();
        let psbt = funded.psbt.clone();
        async move { wallet.sign_and_finalize_psbt(psbt).await }
    })
    .await?;
    let final_tx = signed.unsigned_tx.clone();
    let anchor_txid = final_tx.compute_txid();

    // Any taproot output the wallet added during funding (its change)
    // needs a BIP-86 exclusion proof later; the wallet advertises the
    // internal key in the PSBT output metadata.
    let mut wallet_outputs = Vec::new();
    for (index, txout) in final_tx.output.iter().enumerate() {
        let index = index as u32;
        if commitments.contains_key(&index) || !txout.script_pubkey.is_p2tr() {
            continue;
        }
        let internal_key = signed
            .outputs
            .get(index as usize)
            .and_then(|output| output.tap_internal_key)
            .ok_or_else(|| {
                Error::Internal("wallet taproot output without internal key".to_string())
            })?;
        wallet_outputs.push(WalletOutput {
            output_index: index,
            internal_key: PublicKey::from_x_only_public_key(internal_key, Parity::Even),
        });
    }

    let height_hint = retry_backoff("best height", || {
        let chain = kit.chain_bridge.clone();
        async move { chain.best_height().await }
    })
    .await?;

    // Assemble the durable parcel.
    let inputs = selected
        .iter()
        .map(|commitment| TransferInput {
            prev_id: commitment.prev_id(),
            amount: commitment.asset.amount,
        })
        .collect();

    let mut outputs = Vec::new();
    for output in &transfer.packet.outputs {
        let index = output.anchor_output_index;
        let commitment = commitments
            .get(&index)
            .ok_or_else(|| Error::Internal("missing output commitment".to_string()))?;
        let (_, internal_desc) = internal_key_for(index);
        let sibling = if index == transfer.recipient_output_index {
            recipient_sibling.clone()
        } else {
            None
        };
        let num_passive = transfer
            .passive_assets
            .iter()
            .filter(|passive| passive.new_anchor_output_index == index)
            .count() as u32;

        outputs.push(TransferOutput {
            anchor: Anchor {
                outpoint: OutPoint {
                    txid: anchor_txid,
                    vout: index,
                },
                value: Amount::from_sat(ANCHOR_AMT_SATS),
                internal_key: internal_desc,
                taproot_asset_root: commitment.root().hash.to_byte_array(),
                merkle_root: commitment
                    .tapscript_root(sibling.as_ref())?
                    .to_byte_array()
                    .to_vec(),
                tapscript_sibling: sibling,
                num_passive_assets: num_passive,
            },
            output_type: output.output_type,
            script_key: output.script_key,
            script_key_local: output.script_key_derivation.is_some(),
            amount: output.amount,
            asset: output.asset.clone(),
            proof_suffix: Vec::new(),
        });
    }

    // Anchor outputs that only carry passive assets still need a durable
    // record so confirmation handling can find their internal keys.
    for index in assets_per_output.keys() {
        if outputs
            .iter()
            .any(|output: &TransferOutput| output.anchor.outpoint.vout == *index)
        {
            continue;
        }
        let commitment = commitments
            .get(index)
            .ok_or_else(|| Error::Internal("missing passive commitment".to_string()))?;
        let (_, internal_desc) = internal_key_for(*index);
        let passives: Vec<_> = transfer
            .passive_assets
            .iter()
            .filter(|passive| passive.new_anchor_output_index == *index)
            .collect();
        let first_passive = passives
            .first()
            .ok_or_else(|| Error::Internal("empty passive output".to_string()))?;

        outputs.push(TransferOutput {
            anchor: Anchor {
                outpoint: OutPoint {
                    txid: anchor_txid,
                    vout: *index,
                },
                value: Amount::from_sat(ANCHOR_AMT_SATS),
                internal_key: internal_desc,
                taproot_asset_root: commitment.root().hash.to_byte_array(),
                merkle_root: commitment.tapscript_root(None)?.to_byte_array().to_vec(),
                tapscript_sibling: None,
                num_passive_assets: passives.len() as u32,
            },
            output_type: VOutputType::PassiveAssetsOnly,
            script_key: first_passive.script_key,
            script_key_local: true,
            amount: 0,
            asset: None,
            proof_suffix: Vec::new(),
        });
    }

    let parcel = OutboundParcel {
        anchor_tx: final_tx,
        anchor_tx_height_hint: height_hint,
        chain_fees: funded.chain_fees,
        inputs,
        outputs,
        wallet_outputs,
        passive_assets: transfer.passive_assets,
    };

    Ok(ActiveTransfer { parcel })
}

async fn broadcast_parcel(kit: &FreightKit, parcel: &OutboundParcel) -> Result<()> {
    retry_backoff("publish anchor tx", || {
        let chain = kit.chain_bridge.clone();
        let tx = parcel.anchor_tx.clone();
        async move { chain.publish_transaction(&tx).await }
    })
    .await
}

async fn await_confirmation(
    kit: &FreightKit,
    parcel: &OutboundParcel,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<Option<TxConfirmation>> {
    let txid = parcel.anchor_txid();
    let height_hint = parcel.anchor_tx_height_hint;
    let conf_rx = retry_backoff("register confirmation", || {
        let chain = kit.chain_bridge.clone();
        async move { chain.register_confirmation_ntfn(txid, height_hint).await }
    })
    .await?;

    tokio::select! {
        conf = conf_rx => match conf {
            Ok(confirmation) => Ok(Some(confirmation)),
            Err(_) => Err(Error::ChainBackendUnavailable(
                "confirmation channel closed".to_string(),
            )),
        },
        _ = shutdown_rx.changed() => Ok(None),
    }
}

/// Handles a confirmed parcel: writes the final proof for every new
/// output, updates each passive asset's proof and moves the parcel to its
/// durable confirmed state.
async fn finalize_confirmed(
    kit: &FreightKit,
    mut parcel: OutboundParcel,
    confirmation: &TxConfirmation,
) -> Result<OutboundParcel> {
    // Rebuild the commitment of each anchor output from the durable
    // parcel; replay lands here with exactly the same data.
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
    let mut commitments: BTreeMap<u32, TapCommitment> = BTreeMap::new();
    for (index, assets) in &assets_per_output {
        commitments.insert(*index, TapCommitment::from_assets(assets.clone())?);
    }

    let internal_key_of = |index: u32| -> Result<PublicKey> {
        parcel
            .outputs
            .iter()
            .find(|output| output.anchor.outpoint.vout == index)
            .map(|output| output.internal_key().pub_key)
            .ok_or_else(|| Error::Internal("missing anchor internal key".to_string()))
    };
    let sibling_of = |index: u32| {
        parcel
            .outputs
            .iter()
            .find(|output| output.anchor.outpoint.vout == index)
            .and_then(|output| output.anchor.tapscript_sibling.clone())
    };

    let exclusions_for = |own_index: u32| -> Vec<ExclusionProofSpec<'_>> {
        let mut specs: Vec<ExclusionProofSpec<'_>> = commitments
            .iter()
            .filter(|(index, _)| **index != own_index)
            .filter_map(|(index, commitment)| {
                let internal_key = internal_key_of(*index).ok()?;
                Some(ExclusionProofSpec::Commitment {
                    output_index: *index,
                    internal_key,
                    commitment,
                    tapscript_sibling: sibling_of(*index),
                })
            })
            .collect();
        for wallet_output in &parcel.wallet_outputs {
            specs.push(ExclusionProofSpec::Bip86 {
                output_index: wallet_output.output_index,
                internal_key: wallet_output.internal_key,
            });
        }
        specs
    };

    let prev_out = parcel
        .inputs
        .first()
        .map(|input| input.prev_id.out_point)
        .ok_or_else(|| Error::Internal("parcel without inputs".to_string()))?;

    // Fetch the provenance of every consumed input up front. The first
    // input anchors the chained proof; the rest ride along as nested
    // files inside the new transition.
    let mut input_files: Vec<File> = Vec::with_capacity(parcel.inputs.len());
    for input in &parcel.inputs {
        let locator = ProofLocator {
            asset_id: input.prev_id.asset_id,
            script_key: input.prev_id.script_key.parse()?,
        };
        let blob = retry_backoff("fetch input proof", || {
            let archive = kit.proof_archive.clone();
            let locator = locator.clone();
            async move { archive.fetch_proof(&locator).await }
        })
        .await?;
        input_files.push(File::from_bytes(&blob)?);
    }
    let primary_file = input_files
        .first()
        .cloned()
        .ok_or_else(|| Error::Internal("parcel without inputs".to_string()))?;
    let additional_inputs: Vec<File> = input_files.iter().skip(1).cloned().collect();

    // Final proofs for the new outputs.
    let mut final_proofs = Vec::new();
    let mut proof_suffixes: Vec<(usize, Vec<u8>)> = Vec::new();
    for (position, output) in parcel.outputs.iter().enumerate() {
        let asset = match &output.asset {
            Some(asset) => asset,
            None => continue,
        };
        let index = output.anchor.outpoint.vout;
        let commitment = commitments
            .get(&index)
            .ok_or_else(|| Error::Internal("missing output commitment".to_string()))?;

        let params = BaseProofParams {
            block_header: confirmation.block_header,
            block_height: confirmation.block_height,
            block_txids: &confirmation.block_txids,
            tx_index: confirmation.tx_index,
            anchor_tx: parcel.anchor_tx.clone(),
            output_index: index,
            internal_key: internal_key_of(index)?,
            commitment,
            tapscript_sibling: sibling_of(index),
            exclusions: exclusions_for(index),
        };

        // Split outputs additionally prove their root asset's inclusion
        // at the split root's anchor output.
        let split_root_params;
        let split_root = if asset.has_split_commitment_witness() {
            let root_index = parcel
                .outputs
                .iter()
                .find(|candidate| candidate.output_type.is_split_root())
                .map(|candidate| candidate.anchor.outpoint.vout)
                .ok_or_else(|| Error::Internal("split without split root output".to_string()))?;
            split_root_params = SplitRootParams {
                output_index: root_index,
                internal_key: internal_key_of(root_index)?,
                commitment: commitments
                    .get(&root_index)
                    .ok_or_else(|| Error::Internal("missing split root commitment".to_string()))?,
                tapscript_sibling: sibling_of(root_index),
            };
            Some(&split_root_params)
        } else {
            None
        };

        let proof =
            create_transition_proof(&params, asset, prev_out, split_root, additional_inputs.clone())?;

        // Extend the first input's provenance chain with the new
        // transition; the other inputs are nested inside the proof.
        let mut file = primary_file.clone();
        append_transition(&mut file, &proof)?;

        proof_suffixes.push((position, proof.to_bytes()?));
        final_proofs.push(AnnotatedProof {
            locator: ProofLocator {
                asset_id: asset.asset_id(),
                script_key: output.script_key,
            },
            blob: file.to_bytes(),
        });
    }

    // Updated proof files for the passive assets: asset ID, amount and
    // witness set are untouched, only the anchor moved.
    let mut passive_proofs = Vec::new();
    for passive in &parcel.passive_assets {
        let index = passive.new_anchor_output_index;
        let commitment = commitments
            .get(&index)
            .ok_or_else(|| Error::Internal("missing passive commitment".to_string()))?;

        let params = BaseProofParams {
            block_header: confirmation.block_header,
            block_height: confirmation.block_height,
            block_txids: &confirmation.block_txids,
            tx_index: confirmation.tx_index,
            anchor_tx: parcel.anchor_tx.clone(),
            output_index: index,
            internal_key: internal_key_of(index)?,
            commitment,
            tapscript_sibling: sibling_of(index),
            exclusions: exclusions_for(index),
        };

        let proof = create_transition_proof(
            &params,
            &passive.asset,
            passive.prev_anchor_point,
            None,
            Vec::new(),
        )?;

        let passive_locator = ProofLocator {
            asset_id: passive.genesis_id,
            script_key: passive.script_key,
        };
        let blob = retry_backoff("fetch passive proof", || {
            let archive = kit.proof_archive.clone();
            let locator = passive_locator.clone();
            async move { archive.fetch_proof(&locator).await }
        })
        .await?;
        let mut file = File::from_bytes(&blob)?;
        append_transition(&mut file, &proof)?;

        passive_proofs.push(AnnotatedProof {
            locator: passive_locator,
            blob: file.to_bytes(),
        });
    }

    for (position, suffix) in proof_suffixes {
        parcel.outputs[position].proof_suffix = suffix;
    }

    retry_backoff("import transfer proofs", || {
        let archive = kit.proof_archive.clone();
        let proofs: Vec<AnnotatedProof> = final_proofs
            .iter()
            .chain(passive_proofs.iter())
            .cloned()
            .collect();
        async move { archive.import_proofs(proofs).await }
    })
    .await?;

    let event = AssetConfirmEvent {
        anchor_txid: parcel.anchor_txid(),
        block_hash: confirmation.block_hash(),
        block_height: confirmation.block_height,
        tx_index: confirmation.tx_index as u32,
        final_proofs,
        passive_asset_proof_files: passive_proofs,
    };
    retry_backoff("confirm parcel delivery", || {
        let log = kit.export_log.clone();
        let event = event.clone();
        async move { log.confirm_parcel_delivery(&event).await }
    })
    .await?;

    Ok(parcel)
}

impl TransferOutput {
    fn internal_key(&self) -> &KeyDescriptor {
        &self.anchor.internal_key
    }
}
