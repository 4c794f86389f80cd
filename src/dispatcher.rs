//! Delivery of reconciled chain updates to poll filters and push subscriptions.

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    error::FilterError,
    filters::{FilterRegistry, FilterSpec},
    types::{LogRecord, Tipset, U256},
};

/// Opaque subscription identifier, unique for the lifetime of the process.
pub type SubscriptionId = U256;

/// The item type of a subscription stream. An `Err` is always the last item.
pub type SubscriptionItem = Result<LogRecord, FilterError>;

/// Kinds of push subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Logs,
}

impl FromStr for SubscriptionKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logs" => Ok(SubscriptionKind::Logs),
            other => Err(FilterError::InvalidSpec(format!(
                "unsupported subscription kind '{other}'"
            ))),
        }
    }
}

/// The consumer end of a log subscription.
#[derive(Debug)]
pub struct LogSubscription {
    pub id: SubscriptionId,
    receiver: mpsc::Receiver<SubscriptionItem>,
}

impl LogSubscription {
    /// Waits for the next record. `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        self.receiver.recv().await
    }

    /// Returns the next record if one is queued.
    pub fn try_recv(&mut self) -> Option<SubscriptionItem> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<SubscriptionItem> {
        ReceiverStream::new(self.receiver)
    }
}

#[derive(Debug)]
struct Subscription {
    spec: FilterSpec,
    installed_seq: u64,
    sender: mpsc::Sender<SubscriptionItem>,
}

enum Delivery {
    Delivered,
    Overflowed,
    Closed,
}

impl Subscription {
    /// Queues `record`, keeping the last slot for a terminal error.
    fn send(&self, record: LogRecord) -> Delivery {
        if self.sender.is_closed() {
            return Delivery::Closed;
        }
        if self.sender.capacity() <= 1 {
            let _ = self.sender.try_send(Err(FilterError::Overflow));
            return Delivery::Overflowed;
        }
        match self.sender.try_send(Ok(record)) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflowed,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Fans reconciled tipsets out to the poll filter registry and to log subscriptions.
///
/// Delivery never waits on a consumer: a subscription whose queue is full is terminated with
/// [FilterError::Overflow].
#[derive(Debug)]
pub struct LiveDispatcher {
    filters: Arc<FilterRegistry>,
    subscriptions: RwLock<IndexMap<SubscriptionId, Subscription>>,
    id_counter: AtomicU64,
    buffer: usize,
}

impl LiveDispatcher {
    /// Creates a dispatcher whose subscriptions queue up to `buffer` records.
    pub fn new(filters: Arc<FilterRegistry>, buffer: usize) -> Self {
        Self {
            filters,
            subscriptions: Default::default(),
            id_counter: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    /// Opens a log subscription receiving every record matching `spec` delivered from now on.
    pub fn subscribe(&self, spec: FilterSpec) -> Result<LogSubscription, FilterError> {
        spec.validate()?;

        let (sender, receiver) = mpsc::channel(self.buffer + 1);
        let id = SubscriptionId::from(self.id_counter.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = self.filters.halted() {
            return Err(err.clone());
        }
        subscriptions.insert(
            id,
            Subscription {
                spec,
                installed_seq: self.filters.current_seq(),
                sender,
            },
        );

        tracing::info!("created logs subscription '{id:#x}'");
        Ok(LogSubscription { id, receiver })
    }

    /// Closes a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(&id)
            .is_some();
        if removed {
            tracing::info!("removed subscription '{id:#x}'");
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers an applied tipset and its records. Returns the sequence number of the apply.
    pub fn deliver_apply(&self, tipset: &Tipset, records: &[LogRecord]) -> u64 {
        let seq = self.filters.advance_seq();
        self.filters.notify_new_block(seq, tipset.key);
        self.filters
            .notify_new_transactions(seq, tipset.key, &tipset.messages);
        self.filters.notify_new_logs(seq, records, tipset.height);

        self.fan_out(seq, records, tipset.height);
        seq
    }

    /// Delivers the retraction of the tipset applied as `applied_seq`. `retracted` are its
    /// records marked `removed`.
    pub fn deliver_revert(&self, applied_seq: u64, tipset: &Tipset, retracted: &[LogRecord]) {
        self.filters
            .notify_reverted(applied_seq, tipset.key, retracted, tipset.height);
        self.fan_out(applied_seq, retracted, tipset.height);
    }

    /// Terminates every filter and subscription with `err`. Later installs and subscriptions
    /// fail with it too.
    pub fn fail_all(&self, err: FilterError) {
        self.filters.halt(err.clone());

        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (id, subscription) in subscriptions {
            let _ = subscription.sender.try_send(Err(err.clone()));
            tracing::warn!("closed subscription '{id:#x}': {}", err);
        }
    }

    /// Closes every subscription output and stops accepting new filters and subscriptions.
    pub fn close_all(&self) {
        self.filters.halt(FilterError::Stopped);
        let closed = std::mem::take(
            &mut *self
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "closed subscriptions");
        }
    }

    /// Sends `records` to every subscription installed before the apply numbered `seq`.
    fn fan_out(&self, seq: u64, records: &[LogRecord], head: u64) {
        let mut dropped = vec![];
        {
            let subscriptions = self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, subscription) in subscriptions.iter() {
                if subscription.installed_seq >= seq {
                    continue;
                }
                for record in records {
                    if !subscription.spec.matches(record, head) {
                        continue;
                    }
                    match subscription.send(record.clone()) {
                        Delivery::Delivered => {}
                        Delivery::Overflowed => {
                            tracing::warn!("subscription '{id:#x}' overflowed, closing it");
                            dropped.push(*id);
                            break;
                        }
                        Delivery::Closed => {
                            tracing::debug!("subscription '{id:#x}' consumer went away");
                            dropped.push(*id);
                            break;
                        }
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscriptions = self
                .subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in dropped {
                subscriptions.shift_remove(&id);
            }
        }
    }
}
