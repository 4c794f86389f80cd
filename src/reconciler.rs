//! Follows the chain head and turns head changes into indexed and delivered log records.
//!
//! The reconciler is the only consumer of the head change stream. Everything one batch
//! triggers (receipt loading, extraction, indexing and delivery) completes before the next
//! batch is looked at.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::ChainSource,
    config::reconciler::ReconcilerConfig,
    dispatcher::LiveDispatcher,
    error::{ChainError, FilterError},
    extractor::EventExtractor,
    index::EventIndex,
    types::{HeadChange, LogRecord, Tipset, TipsetRef, TxReceipt},
};

/// Resync attempts made when the chain keeps moving underneath one.
const MAX_RESYNC_ATTEMPTS: usize = 3;

type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Waiting for the first head change batch.
    Uninitialized,
    Synced,
    /// Lost track of the chain. Every filter and subscription has been failed.
    Fatal,
    Stopped,
}

/// A tipset applied by this reconciler, kept to answer reverts without a database round trip.
#[derive(Debug, Clone)]
struct AppliedTipset {
    tipset: Tipset,
    seq: u64,
    records: Vec<LogRecord>,
}

fn resync_required(err: ChainError) -> FilterError {
    FilterError::ResyncRequired(err.to_string())
}

pub struct HeadReconciler<C> {
    chain: Arc<C>,
    extractor: EventExtractor,
    index: Arc<EventIndex>,
    dispatcher: Arc<LiveDispatcher>,
    config: ReconcilerConfig,
    head: Option<TipsetRef>,
    /// Most recently applied tipsets, oldest first.
    recent: VecDeque<AppliedTipset>,
    state: watch::Sender<ReconcilerState>,
    head_watch: watch::Sender<Option<TipsetRef>>,
}

impl<C: ChainSource> HeadReconciler<C> {
    pub fn new(
        chain: Arc<C>,
        index: Arc<EventIndex>,
        dispatcher: Arc<LiveDispatcher>,
        config: ReconcilerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Uninitialized);
        let (head_watch, _) = watch::channel(None);
        Self {
            chain,
            extractor: EventExtractor::new(),
            index,
            dispatcher,
            recent: VecDeque::with_capacity(config.max_reorg_depth.min(1024) as usize),
            config,
            head: None,
            state,
            head_watch,
        }
    }

    /// Starts the reconciler loop on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> ReconcilerHandle {
        let state = self.state.subscribe();
        let head = self.head_watch.subscribe();
        let task = tokio::spawn(self.run(cancel.clone()));

        ReconcilerHandle {
            state,
            head,
            cancel,
            task,
        }
    }

    /// Runs until `cancel` fires or the reconciler loses track of the chain. Closes every
    /// subscription and the index before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        match self.follow(&cancel).await {
            Ok(()) => {
                tracing::info!("head reconciler stopped");
                self.state.send_replace(ReconcilerState::Stopped);
            }
            Err(err) => {
                tracing::error!("head reconciler failed: {}", err);
                let err = match err {
                    FilterError::Fatal(_) => err,
                    other => FilterError::Fatal(other.to_string()),
                };
                self.dispatcher.fail_all(err);
                self.state.send_replace(ReconcilerState::Fatal);
            }
        }

        self.dispatcher.close_all();
        self.index.close().await;
    }

    async fn follow(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut receiver = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            receiver = self.start() => receiver?,
        };

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                batch = receiver.recv() => batch,
            };

            match batch {
                Some(batch) => {
                    if let Err(err) = self.process_batch(batch).await {
                        tracing::warn!("{}, resyncing", err);
                        self.resync().await?;
                    }
                }
                None => {
                    tracing::warn!("head change stream closed, resyncing");
                    self.resync().await?;
                    receiver = self.subscribe().await?;
                }
            }
        }
    }

    /// Subscribes, learns the head from the first batch and backfills the index up to it.
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<HeadChange>>> {
        let mut receiver = self.subscribe().await?;
        let first = receiver
            .recv()
            .await
            .ok_or_else(|| FilterError::Fatal(String::from("head change stream closed")))?;
        let head = first
            .iter()
            .rev()
            .find_map(|change| match change {
                HeadChange::Apply(tipset) => Some(tipset.tipset_ref()),
                HeadChange::Revert(_) => None,
            })
            .ok_or_else(|| FilterError::Fatal(String::from("first head change has no head")))?;

        match self.index.latest_canonical().await {
            // Resyncing from the indexed head also reverts indexed tipsets the chain abandoned.
            Ok(Some(indexed)) if indexed.key != head.key => {
                tracing::info!(
                    from = indexed.height,
                    to = head.height,
                    "reconciling event index with the chain"
                );
                self.set_head(indexed);
                self.resync().await?;
            }
            Ok(_) => self.set_head(head),
            Err(err) => {
                tracing::warn!("could not read the event index, skipping backfill: {}", err);
                self.set_head(head);
            }
        }

        tracing::info!(height = head.height, "head reconciler synced at {:#x}", head.key);
        self.state.send_replace(ReconcilerState::Synced);
        Ok(receiver)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<HeadChange>>> {
        self.chain
            .subscribe_head_changes(self.config.notify_queue_capacity.max(1))
            .await
            .map_err(|err| FilterError::Fatal(format!("failed subscribing to head changes: {err}")))
    }

    async fn process_batch(&mut self, batch: Vec<HeadChange>) -> Result<()> {
        tracing::debug!(changes = batch.len(), "processing head change batch");
        for change in batch {
            match change {
                HeadChange::Apply(tipset) => {
                    if self.head.map(|head| head.key) == Some(tipset.key) {
                        continue;
                    }
                    self.apply(tipset).await?;
                }
                HeadChange::Revert(tipset) => {
                    if self.head.map(|head| head.key) != Some(tipset.key) {
                        return Err(FilterError::ResyncRequired(format!(
                            "revert of {:#x} which is not the head",
                            tipset.key
                        )));
                    }
                    self.revert(&tipset).await;
                }
            }
        }

        Ok(())
    }

    /// Applies `tipset`, which must be a child of the head.
    async fn apply(&mut self, tipset: Tipset) -> Result<()> {
        if let Some(head) = self.head {
            if tipset.parent != head.key {
                return Err(FilterError::ResyncRequired(format!(
                    "tipset {:#x} at {} does not extend the head {:#x}",
                    tipset.key, tipset.height, head.key
                )));
            }
        }

        let receipts = self.load_receipts(&tipset).await?;
        let records = self.extractor.extract(&tipset, &receipts);

        if let Err(err) = self.index.append(&tipset, &records).await {
            tracing::warn!(height = tipset.height, "failed indexing tipset: {}", err);
        }

        let seq = self.dispatcher.deliver_apply(&tipset, &records);
        tracing::debug!(
            height = tipset.height,
            records = records.len(),
            "applied tipset {:#x}",
            tipset.key
        );

        self.set_head(tipset.tipset_ref());
        self.remember(AppliedTipset {
            tipset,
            seq,
            records,
        });
        Ok(())
    }

    /// Reverts the head tipset.
    async fn revert(&mut self, tipset: &Tipset) {
        let applied = match self.recent.back() {
            Some(applied) if applied.tipset.key == tipset.key => self.recent.pop_back(),
            _ => None,
        };

        let indexed = match self.index.mark_reverted(tipset.key).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(height = tipset.height, "failed reverting indexed tipset: {}", err);
                vec![]
            }
        };

        match applied {
            Some(applied) => {
                let retracted: Vec<_> = applied.records.iter().map(LogRecord::retracted).collect();
                self.dispatcher
                    .deliver_revert(applied.seq, tipset, &retracted);
            }
            // Applied before this process started, so no live consumer saw it.
            None => self.dispatcher.deliver_revert(0, tipset, &indexed),
        }

        let parent = match self.recent.back() {
            Some(applied) if applied.tipset.key == tipset.parent => applied.tipset.tipset_ref(),
            _ => self.parent_of(tipset).await,
        };
        tracing::debug!(height = tipset.height, "reverted tipset {:#x}", tipset.key);
        self.set_head(parent);
    }

    /// Locates the parent of `tipset`, which sits below any null rounds preceding it.
    async fn parent_of(&self, tipset: &Tipset) -> TipsetRef {
        match self.index.tipset(tipset.parent).await {
            Ok(Some(parent)) => return parent,
            Ok(None) => {}
            Err(err) => tracing::warn!("failed looking up indexed parent: {}", err),
        }

        let floor = tipset.height.saturating_sub(self.config.max_reorg_depth.max(1));
        for height in (floor..tipset.height).rev() {
            match self.chain.tipset_by_height(height).await {
                Ok(None) => continue,
                Ok(Some(candidate)) if candidate.key == tipset.parent => {
                    return candidate.tipset_ref()
                }
                Ok(Some(_)) => break,
                Err(err) => {
                    tracing::warn!(height, "failed looking up parent on the chain: {}", err);
                    break;
                }
            }
        }

        TipsetRef {
            height: tipset.height.saturating_sub(1),
            key: tipset.parent,
        }
    }

    async fn load_receipts(&self, tipset: &Tipset) -> Result<Vec<TxReceipt>> {
        let backoff = ExponentialBuilder::default()
            .with_max_times(self.config.receipt_retries)
            .with_min_delay(self.config.receipt_retry_min_delay());

        timeout(
            self.config.receipt_timeout(),
            (|| async { self.chain.load_receipts(tipset).await })
                .retry(backoff)
                .notify(|err: &ChainError, dur: Duration| {
                    tracing::warn!(
                        height = tipset.height,
                        "loading receipts failed, retrying after {:?}: {}",
                        dur,
                        err
                    );
                })
                .sleep(tokio::time::sleep),
        )
        .await
        .map_err(|_| {
            FilterError::ResyncRequired(format!(
                "timed out loading receipts of {:#x}",
                tipset.key
            ))
        })?
        .map_err(resync_required)
    }

    /// Brings the head back onto the canonical chain and up to the chain head.
    async fn resync(&mut self) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=MAX_RESYNC_ATTEMPTS {
            match self.try_resync().await {
                Ok(()) => return Ok(()),
                Err(FilterError::ResyncRequired(reason)) => {
                    tracing::warn!(attempt, "resync attempt failed: {}", reason);
                    last_err = Some(reason);
                }
                Err(err) => return Err(err),
            }
        }

        Err(FilterError::Fatal(format!(
            "resync failed: {}",
            last_err.unwrap_or_default()
        )))
    }

    async fn try_resync(&mut self) -> Result<()> {
        let target = self.chain.head().await.map_err(resync_required)?;
        let Some(head) = self.head else {
            self.set_head(target.tipset_ref());
            return Ok(());
        };
        tracing::info!(
            from = head.height,
            to = target.height,
            "resyncing with the chain"
        );

        // Walk back to the common ancestor.
        let mut depth = 0;
        while let Some(head) = self.head {
            let canonical = self
                .chain
                .tipset_by_height(head.height)
                .await
                .map_err(resync_required)?;
            if canonical.map(|tipset| tipset.key) == Some(head.key) {
                break;
            }

            if depth >= self.config.max_reorg_depth {
                return Err(FilterError::Fatal(format!(
                    "reorg deeper than {} tipsets",
                    self.config.max_reorg_depth
                )));
            }
            let tipset = self.head_tipset(head).await?;
            self.revert(&tipset).await;
            depth += 1;
        }

        let from = self.head.map_or(0, |head| head.height + 1);
        for height in from..=target.height {
            let Some(tipset) = self
                .chain
                .tipset_by_height(height)
                .await
                .map_err(resync_required)?
            else {
                continue;
            };
            self.apply(tipset).await?;
        }

        Ok(())
    }

    /// The full tipset of `head`, from memory or from the index.
    async fn head_tipset(&self, head: TipsetRef) -> Result<Tipset> {
        if let Some(applied) = self.recent.back() {
            if applied.tipset.key == head.key {
                return Ok(applied.tipset.clone());
            }
        }

        self.index
            .canonical_tipsets_between(head.height, head.height)
            .await?
            .into_iter()
            .find(|tipset| tipset.key == head.key)
            .ok_or_else(|| {
                FilterError::Fatal(format!(
                    "cannot revert unknown tipset {:#x} at {}",
                    head.key, head.height
                ))
            })
    }

    fn remember(&mut self, applied: AppliedTipset) {
        let capacity = self.config.max_reorg_depth as usize;
        if capacity == 0 {
            return;
        }
        if self.recent.len() >= capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(applied);
    }

    fn set_head(&mut self, head: TipsetRef) {
        self.head = Some(head);
        self.head_watch.send_replace(Some(head));
    }
}

/// Controls a spawned [HeadReconciler].
#[derive(Debug)]
pub struct ReconcilerHandle {
    state: watch::Receiver<ReconcilerState>,
    head: watch::Receiver<Option<TipsetRef>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    /// A receiver of the head as last reconciled.
    pub fn head_watch(&self) -> watch::Receiver<Option<TipsetRef>> {
        self.head.clone()
    }

    /// Waits until the reconciled head satisfies `predicate`. Fails once the reconciler exits.
    pub async fn wait_for_head(
        &self,
        mut predicate: impl FnMut(&TipsetRef) -> bool,
    ) -> Result<TipsetRef> {
        let mut head = self.head.clone();
        loop {
            if let Some(current) = *head.borrow_and_update() {
                if predicate(&current) {
                    return Ok(current);
                }
            }
            if head.changed().await.is_err() {
                return Err(FilterError::Fatal(String::from("head reconciler exited")));
            }
        }
    }

    /// Waits until the reconciler reaches `expected`. Fails once the reconciler exits in
    /// another state.
    pub async fn wait_for_state(&self, expected: ReconcilerState) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == expected {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return match *state.borrow() == expected {
                    true => Ok(()),
                    false => Err(FilterError::Fatal(String::from("head reconciler exited"))),
                };
            }
        }
    }

    /// Stops the reconciler and waits for it to release its resources.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::error!("head reconciler task failed: {}", err);
        }
    }
}
