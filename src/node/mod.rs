//! Event filter node, serving filters, subscriptions and historic queries over a followed chain.

mod eth;

use std::{str::FromStr, sync::Arc};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::ChainSource,
    config::{filters::FiltersConfig, NodeConfig},
    dispatcher::{LiveDispatcher, LogSubscription, SubscriptionId, SubscriptionKind},
    error::FilterError,
    filters::{FilterChanges, FilterId, FilterKind, FilterRegistry, FilterSpec},
    index::EventIndex,
    reconciler::{HeadReconciler, ReconcilerHandle},
    types::{LogRecord, TipsetRef},
};

type Result<T> = std::result::Result<T, FilterError>;

/// A handle to the filter engine. Cheap to clone; every clone shares the same filters,
/// subscriptions and index.
#[derive(Debug, Clone)]
pub struct EventFilterNode {
    dispatcher: Arc<LiveDispatcher>,
    index: Arc<EventIndex>,
    head: watch::Receiver<Option<TipsetRef>>,
    config: FiltersConfig,
}

impl EventFilterNode {
    pub fn new(
        dispatcher: Arc<LiveDispatcher>,
        index: Arc<EventIndex>,
        head: watch::Receiver<Option<TipsetRef>>,
        config: FiltersConfig,
    ) -> Self {
        Self {
            dispatcher,
            index,
            head,
            config,
        }
    }

    /// Wires the filter engine to `chain` and starts following it. Cancelling `cancel` stops
    /// the reconciler and the idle filter sweeper.
    pub fn start<C: ChainSource>(
        chain: Arc<C>,
        index: EventIndex,
        config: &NodeConfig,
        cancel: CancellationToken,
    ) -> (Self, ReconcilerHandle) {
        let filters = Arc::new(FilterRegistry::new(config.filters.limits()));
        filters.spawn_sweeper(config.filters.sweep_interval(), cancel.clone());

        let dispatcher = Arc::new(LiveDispatcher::new(
            filters,
            config.filters.subscription_buffer,
        ));
        let index = Arc::new(index);
        let handle = HeadReconciler::new(
            chain,
            index.clone(),
            dispatcher.clone(),
            config.reconciler.clone(),
        )
        .spawn(cancel);

        let node = Self::new(
            dispatcher,
            index,
            handle.head_watch(),
            config.filters.clone(),
        );
        (node, handle)
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        self.dispatcher.filters()
    }

    /// Height `latest` resolves to.
    pub fn head_height(&self) -> u64 {
        self.head.borrow().map_or(0, |head| head.height)
    }

    fn ensure_realtime(&self) -> Result<()> {
        match self.config.disable_realtime_filter_api {
            true => Err(FilterError::NotSupported("the real-time filter API")),
            false => Ok(()),
        }
    }

    fn ensure_historic(&self) -> Result<()> {
        match self.config.disable_historic_filter_api {
            true => Err(FilterError::NotSupported("the historic filter API")),
            false => Ok(()),
        }
    }

    pub fn install_filter(&self, kind: FilterKind) -> Result<FilterId> {
        self.ensure_realtime()?;
        if let FilterKind::Log(spec) = &kind {
            spec.validate()?;
        }
        self.filters().install(kind)
    }

    pub fn uninstall_filter(&self, id: FilterId) -> Result<bool> {
        self.ensure_realtime()?;
        Ok(self.filters().uninstall(id))
    }

    /// Returns and clears everything the filter accumulated since the last poll.
    pub fn poll_filter(&self, id: FilterId) -> Result<FilterChanges> {
        self.ensure_realtime()?;
        self.filters().drain(id)
    }

    /// Runs a historic query with the spec of an installed log filter.
    pub async fn filter_logs(&self, id: FilterId) -> Result<Vec<LogRecord>> {
        self.ensure_historic()?;
        let info = self.filters().lookup(id)?;
        let spec = info.kind.spec().ok_or_else(|| {
            FilterError::InvalidSpec(format!(
                "{} filter '{id:#x}' does not track logs",
                info.kind.name()
            ))
        })?;

        self.index.query(&spec, self.head_height()).await
    }

    pub async fn query_logs(&self, spec: &FilterSpec) -> Result<Vec<LogRecord>> {
        self.ensure_historic()?;
        spec.validate()?;
        self.index.query(spec, self.head_height()).await
    }

    /// Opens a push subscription. `logs` is the only supported kind; a missing spec matches
    /// every record.
    pub fn subscribe(&self, kind: &str, spec: Option<FilterSpec>) -> Result<LogSubscription> {
        self.ensure_realtime()?;
        match SubscriptionKind::from_str(kind)? {
            SubscriptionKind::Logs => self.dispatcher.subscribe(spec.unwrap_or_default()),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }
}
