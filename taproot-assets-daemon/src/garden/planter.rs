//! The chain planter.
//!
//! A single-threaded coordinator owning the at-most-one pending batch.
//! Seedlings are queued into the pending batch; a ticker (or an explicit
//! finalize request) freezes it and hands it to a dedicated caretaker.
//! The planter never blocks on a caretaker; everything travels as
//! messages.

use std::collections::HashMap;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::garden::caretaker::{BatchCaretaker, CaretakerReport};
use crate::garden::{BatchState, GardenKit, MintingBatch, MintingStore, Seedling};
use crate::wallet::{KeyRing, TAPROOT_ASSETS_KEY_FAMILY};
use crate::{retry_backoff, Error, Result};

/// Configuration of a chain planter.
pub struct PlanterConfig {
    /// The collaborators shared with every caretaker.
    pub garden: GardenKit,
    /// How often the pending batch is frozen automatically.
    pub batch_tick_interval: Duration,
}

/// Result of a batch cancellation attempt. After broadcast the batch key
/// of the broadcast batch is still returned, but the state is unchanged
/// and the error says so.
#[derive(Debug)]
pub struct CancelBatchResult {
    /// The key of the batch the cancellation was aimed at, if any.
    pub batch_key: Option<PublicKey>,
    /// Whether the cancellation took effect.
    pub result: Result<()>,
}

enum PlanterCommand {
    QueueSeedling {
        seedling: Seedling,
        reply: oneshot::Sender<Result<BatchState>>,
    },
    PendingBatch {
        reply: oneshot::Sender<Option<MintingBatch>>,
    },
    NumActiveBatches {
        reply: oneshot::Sender<usize>,
    },
    ListBatches {
        batch_key: Option<PublicKey>,
        reply: oneshot::Sender<Result<Vec<MintingBatch>>>,
    },
    FinalizeBatch {
        reply: oneshot::Sender<Result<PublicKey>>,
    },
    CancelBatch {
        reply: oneshot::Sender<CancelBatchResult>,
    },
}

/// Public handle to the planter actor.
pub struct ChainPlanter {
    cmd_tx: mpsc::Sender<PlanterCommand>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChainPlanter {
    /// Starts the planter: replays the minting log, resumes caretakers for
    /// every non-final batch and begins dispatching commands.
    pub async fn start(config: PlanterConfig) -> Result<ChainPlanter> {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let mut actor = PlanterActor {
            kit: config.garden,
            pending: None,
            caretakers: HashMap::new(),
            current_caretaker: None,
            cmd_rx,
            report_tx,
            report_rx,
            shutdown_rx,
        };
        actor.replay().await?;

        let task = tokio::spawn(async move {
            actor.run(config.batch_tick_interval).await;
        });

        Ok(ChainPlanter {
            cmd_tx,
            shutdown_tx,
            task,
        })
    }

    /// Queues a new seedling into the pending batch, creating the batch if
    /// necessary. Returns the batch state the seedling landed in.
    pub async fn queue_new_seedling(&self, seedling: Seedling) -> Result<BatchState> {
        let (reply, response) = oneshot::channel();
        self.send(PlanterCommand::QueueSeedling { seedling, reply })
            .await?;
        response
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))?
    }

    /// Returns the current pending batch, if any.
    pub async fn pending_batch(&self) -> Result<Option<MintingBatch>> {
        let (reply, response) = oneshot::channel();
        self.send(PlanterCommand::PendingBatch { reply }).await?;
        response
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))
    }

    /// Number of caretakers still working a batch.
    pub async fn num_active_batches(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send(PlanterCommand::NumActiveBatches { reply }).await?;
        response
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))
    }

    /// Lists batches from the minting log, optionally filtered by batch
    /// key.
    pub async fn list_batches(
        &self,
        batch_key: Option<PublicKey>,
    ) -> Result<Vec<MintingBatch>> {
        let (reply, response) = oneshot::channel();
        self.send(PlanterCommand::ListBatches { batch_key, reply })
            .await?;
        response
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))?
    }

    /// Freezes the pending batch now and spawns its caretaker.
    pub async fn finalize_batch(&self) -> Result<PublicKey> {
        let (reply, response) = oneshot::channel();
        self.send(PlanterCommand::FinalizeBatch { reply }).await?;
        response
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))?
    }

    /// Attempts to cancel the current batch.
    pub async fn cancel_batch(&self) -> Result<CancelBatchResult> {
        let (reply, response) = oneshot::channel();
        self.send(PlanterCommand::CancelBatch { reply }).await?;
        response
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))
    }

    /// Signals a graceful shutdown. In-flight batches resume from their
    /// durable state on the next start.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the planter and waits for the actor to wind down.
    pub async fn stop_and_wait(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    async fn send(&self, cmd: PlanterCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Internal("planter stopped".to_string()))
    }
}

struct CaretakerHandle {
    pub_key: PublicKey,
    state: BatchState,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct PlanterActor {
    kit: GardenKit,
    pending: Option<MintingBatch>,
    caretakers: HashMap<[u8; 33], CaretakerHandle>,
    current_caretaker: Option<[u8; 33]>,
    cmd_rx: mpsc::Receiver<PlanterCommand>,
    report_tx: mpsc::UnboundedSender<CaretakerReport>,
    report_rx: mpsc::UnboundedReceiver<CaretakerReport>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PlanterActor {
    /// Replays the minting log: the pending batch is adopted as-is, every
    /// other non-final batch resumes under a fresh caretaker at its last
    /// durable state.
    async fn replay(&mut self) -> Result<()> {
        let batches = retry_backoff("fetch non-final batches", || {
            let log = self.kit.log.clone();
            async move { log.fetch_non_final_batches().await }
        })
        .await?;

        for batch in batches {
            match batch.state {
                BatchState::Pending => {
                    if self.pending.is_none() {
                        self.pending = Some(batch);
                    }
                }
                state if !state.is_terminal() => {
                    log::info!(
                        "planter: resuming batch at state {} after restart",
                        state
                    );
                    self.spawn_caretaker(batch);
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn run(mut self, tick_interval: Duration) {
        let mut ticker = tokio::time::interval(tick_interval);
        // The first tick fires immediately; swallow it so a fresh planter
        // does not freeze an empty batch.
        ticker.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.pending.as_ref().map_or(false, |batch| !batch.seedlings.is_empty()) {
                        if let Err(err) = self.freeze_pending().await {
                            log::error!("planter: batch tick failed: {}", err);
                        }
                    }
                }
                report = self.report_rx.recv() => {
                    if let Some(report) = report {
                        self.handle_report(report);
                    }
                }
                _ = self.shutdown_rx.changed() => break,
            }
        }

        // Drain the caretakers so a restarted planter never overlaps a
        // predecessor still writing to the store.
        for (_, handle) in self.caretakers.drain() {
            let _ = handle.task.await;
        }
    }

    async fn handle_command(&mut self, cmd: PlanterCommand) {
        match cmd {
            PlanterCommand::QueueSeedling { seedling, reply } => {
                let _ = reply.send(self.queue_seedling(seedling).await);
            }
            PlanterCommand::PendingBatch { reply } => {
                let _ = reply.send(self.pending.clone());
            }
            PlanterCommand::NumActiveBatches { reply } => {
                let active = self
                    .caretakers
                    .values()
                    .filter(|handle| !handle.state.is_terminal())
                    .count();
                let _ = reply.send(active);
            }
            PlanterCommand::ListBatches { batch_key, reply } => {
                let _ = reply.send(self.list_batches(batch_key).await);
            }
            PlanterCommand::FinalizeBatch { reply } => {
                let _ = reply.send(self.freeze_pending().await);
            }
            PlanterCommand::CancelBatch { reply } => {
                let _ = reply.send(self.cancel_batch().await);
            }
        }
    }

    fn handle_report(&mut self, report: CaretakerReport) {
        match report {
            CaretakerReport::StateChange { batch_key, state } => {
                if let Some(handle) = self.caretakers.get_mut(&batch_key) {
                    handle.state = state;
                }
            }
            CaretakerReport::Fatal { batch_key, error } => {
                log::error!("planter: caretaker failed: {}", error);
                if let Some(handle) = self.caretakers.get_mut(&batch_key) {
                    handle.state = BatchState::Failed;
                }
            }
        }
    }

    async fn queue_seedling(&mut self, seedling: Seedling) -> Result<BatchState> {
        if self.pending.is_none() {
            let batch_key = retry_backoff("derive batch key", || {
                let key_ring = self.kit.key_ring.clone();
                async move { key_ring.derive_next_key(TAPROOT_ASSETS_KEY_FAMILY).await }
            })
            .await?;
            self.pending = Some(MintingBatch::new(batch_key));
        }

        let batch = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::Internal("pending batch vanished".to_string()))?;
        batch.validate_seedling(&seedling)?;
        batch
            .seedlings
            .insert(seedling.name.clone(), seedling);

        let snapshot = batch.clone();
        retry_backoff("commit minting batch", || {
            let log = self.kit.log.clone();
            let snapshot = snapshot.clone();
            async move { log.commit_minting_batch(snapshot).await }
        })
        .await?;

        Ok(BatchState::Pending)
    }

    async fn list_batches(&self, batch_key: Option<PublicKey>) -> Result<Vec<MintingBatch>> {
        let batches = retry_backoff("fetch batches", || {
            let log = self.kit.log.clone();
            async move { log.fetch_all_batches().await }
        })
        .await?;

        Ok(batches
            .into_iter()
            .filter(|batch| {
                batch_key.map_or(true, |key| batch.batch_key.pub_key == key)
            })
            .collect())
    }

    /// Freezes the pending batch and hands it to a caretaker.
    async fn freeze_pending(&mut self) -> Result<PublicKey> {
        let mut batch = self.pending.take().ok_or(Error::NoPendingBatch)?;
        let batch_key = batch.batch_key.pub_key;

        batch.state = BatchState::Frozen;
        retry_backoff("freeze batch", || {
            let log = self.kit.log.clone();
            async move {
                log.update_batch_state(&batch_key, BatchState::Frozen).await
            }
        })
        .await?;

        self.spawn_caretaker(batch);
        Ok(batch_key)
    }

    fn spawn_caretaker(&mut self, batch: MintingBatch) {
        let key_bytes = batch.key_bytes();
        let pub_key = batch.batch_key.pub_key;
        let state = batch.state;
        let (cancel_tx, task) = BatchCaretaker::spawn(
            batch,
            self.kit.clone(),
            self.shutdown_rx.clone(),
            self.report_tx.clone(),
        );
        self.caretakers.insert(
            key_bytes,
            CaretakerHandle {
                pub_key,
                state,
                cancel_tx,
                task,
            },
        );
        self.current_caretaker = Some(key_bytes);
    }

    /// Cancels the pending batch, or asks the current caretaker to stop.
    /// After broadcast the attempt is logged and refused; the batch key of
    /// the broadcast batch is still reported back.
    async fn cancel_batch(&mut self) -> CancelBatchResult {
        if let Some(batch) = self.pending.take() {
            let batch_key = batch.batch_key.pub_key;
            let result = retry_backoff("cancel pending batch", || {
                let log = self.kit.log.clone();
                async move {
                    log.update_batch_state(&batch_key, BatchState::SeedlingCancelled)
                        .await
                }
            })
            .await;
            return CancelBatchResult {
                batch_key: Some(batch_key),
                result,
            };
        }

        let current = self
            .current_caretaker
            .and_then(|key| self.caretakers.get(&key));
        match current {
            Some(handle) if handle.state.is_terminal() => CancelBatchResult {
                batch_key: None,
                result: Err(Error::NoPendingBatch),
            },
            Some(handle) if handle.state < BatchState::Broadcast => {
                let _ = handle.cancel_tx.send(true);
                CancelBatchResult {
                    batch_key: Some(handle.pub_key),
                    result: Ok(()),
                }
            }
            Some(handle) => {
                log::warn!(
                    "planter: refusing to cancel batch in state {}",
                    handle.state
                );
                CancelBatchResult {
                    batch_key: Some(handle.pub_key),
                    result: Err(Error::BatchNotCancellable),
                }
            }
            None => CancelBatchResult {
                batch_key: None,
                result: Err(Error::NoPendingBatch),
            },
        }
    }
}
