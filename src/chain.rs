//! Interfaces to the chain the filter engine follows.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::ChainError,
    types::{HeadChange, Tipset, TxReceipt},
};

/// Source of ordered head changes.
#[async_trait]
pub trait HeadNotifier: Send + Sync {
    /// Subscribes to head changes. Batches are delivered in order on a channel holding at most
    /// `capacity` batches. The first batch holds a single `Apply` of the current head.
    ///
    /// The notifier closes the channel instead of dropping a batch, so a closed channel means
    /// the stream has a gap.
    async fn subscribe_head_changes(
        &self,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<HeadChange>>, ChainError>;

    /// Returns the current head tipset.
    async fn head(&self) -> Result<Tipset, ChainError>;

    /// Returns the canonical tipset at `height`, `None` if it is above the head or was a null
    /// round.
    async fn tipset_by_height(&self, height: u64) -> Result<Option<Tipset>, ChainError>;
}

/// Loads the execution receipts of a tipset.
#[async_trait]
pub trait ReceiptLoader: Send + Sync {
    /// Returns the receipts of every message executed in `tipset`, in execution order.
    async fn load_receipts(&self, tipset: &Tipset) -> Result<Vec<TxReceipt>, ChainError>;
}

/// A chain offering both head changes and receipts.
pub trait ChainSource: HeadNotifier + ReceiptLoader + 'static {}

impl<T: HeadNotifier + ReceiptLoader + 'static> ChainSource for T {}
