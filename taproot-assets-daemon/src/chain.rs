//! Chain backend capability trait.

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{BlockHash, Transaction, Txid};
use tokio::sync::oneshot;

use crate::Result;

/// A confirmation event for a previously registered transaction.
#[derive(Debug, Clone)]
pub struct TxConfirmation {
    /// Header of the confirming block.
    pub block_header: Header,
    /// Height of the confirming block.
    pub block_height: u32,
    /// Position of the transaction within the block.
    pub tx_index: usize,
    /// All txids of the confirming block, in block order.
    pub block_txids: Vec<Txid>,
}

impl TxConfirmation {
    /// Hash of the confirming block. Together with the anchor txid this
    /// keys confirmation handling, making redelivery idempotent.
    pub fn block_hash(&self) -> BlockHash {
        self.block_header.block_hash()
    }
}

/// The subset of a chain backend the daemon relies on: block height and
/// fee queries, transaction broadcast and confirmation notifications.
/// Notifications are multiplexed; the backend is shared read-only.
#[async_trait]
pub trait ChainBridge: Send + Sync {
    /// Returns the current best block height.
    async fn best_height(&self) -> Result<u32>;

    /// Estimates a fee rate in sat/vB for the given confirmation target.
    async fn estimate_fee_rate(&self, conf_target: u32) -> Result<u64>;

    /// Broadcasts a transaction. Rebroadcasting a known transaction is not
    /// an error.
    async fn publish_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Registers for a one-shot confirmation notification of `txid`,
    /// scanning from `height_hint`.
    async fn register_confirmation_ntfn(
        &self,
        txid: Txid,
        height_hint: u32,
    ) -> Result<oneshot::Receiver<TxConfirmation>>;
}
