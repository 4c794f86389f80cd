use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard,
        RwLockWriteGuard,
    },
    time::{Duration, Instant},
};

use ethereum_types::{H256, U256};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::FilterSpec;
use crate::{error::FilterError, types::LogRecord};

/// Opaque filter identifier, unique for the lifetime of the process.
pub type FilterId = U256;

type Result<T> = std::result::Result<T, FilterError>;

/// Specifies a filter type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// A filter for the hashes of messages included in new tipsets.
    PendingTransaction,
    /// A filter for new tipset hashes.
    Block,
    /// A filter for log records matching a spec.
    /// This is [Box] to ensure the enum invariants are similar size.
    Log(Box<FilterSpec>),
    /// A filter for every log record.
    CatchAll,
}

impl FilterKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::PendingTransaction => "pending transaction",
            FilterKind::Block => "block",
            FilterKind::Log(_) => "log",
            FilterKind::CatchAll => "catch-all",
        }
    }

    /// Returns the spec historic queries for this filter should use, if it tracks logs.
    pub fn spec(&self) -> Option<FilterSpec> {
        match self {
            FilterKind::Log(spec) => Some(spec.as_ref().clone()),
            FilterKind::CatchAll => Some(FilterSpec::default()),
            _ => None,
        }
    }

    fn tracks_logs(&self) -> bool {
        matches!(self, FilterKind::Log(_) | FilterKind::CatchAll)
    }

    fn matches(&self, record: &LogRecord, head: u64) -> bool {
        match self {
            FilterKind::Log(spec) => spec.matches(record, head),
            FilterKind::CatchAll => true,
            _ => false,
        }
    }
}

/// Accumulated updates of a filter, typed after the filter's kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterChanges {
    Transactions(Vec<H256>),
    Blocks(Vec<H256>),
    Logs(Vec<LogRecord>),
}

impl FilterChanges {
    pub fn len(&self) -> usize {
        match self {
            FilterChanges::Transactions(hashes) | FilterChanges::Blocks(hashes) => hashes.len(),
            FilterChanges::Logs(logs) => logs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounds applied to every installed filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterLimits {
    /// A filter not polled for longer than this is evicted.
    pub ttl: Duration,
    /// Maximum number of installed filters, `0` for no limit.
    pub max_filters: usize,
    /// Maximum number of buffered items per filter, `0` for no limit.
    pub max_results: usize,
}

impl Default for FilterLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            max_filters: 100,
            max_results: 10_000,
        }
    }
}

/// A point-in-time view of an installed filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInfo {
    pub id: FilterId,
    pub kind: FilterKind,
    pub created_at: Instant,
    pub last_polled: Instant,
    /// Number of buffered, undrained items.
    pub pending: usize,
    pub stale: bool,
}

#[derive(Debug)]
enum FilterBuffer {
    /// Hashes tagged with the key of the tipset that produced them.
    Hashes(VecDeque<(H256, H256)>),
    Logs(VecDeque<LogRecord>),
}

#[derive(Debug)]
struct Filter {
    kind: FilterKind,
    installed_seq: u64,
    created_at: Instant,
    last_polled: Instant,
    buffer: FilterBuffer,
    stale: Option<FilterError>,
    evicted: bool,
}

impl Filter {
    fn new(kind: FilterKind, installed_seq: u64) -> Self {
        let now = Instant::now();
        let buffer = if kind.tracks_logs() {
            FilterBuffer::Logs(VecDeque::new())
        } else {
            FilterBuffer::Hashes(VecDeque::new())
        };

        Self {
            kind,
            installed_seq,
            created_at: now,
            last_polled: now,
            buffer,
            stale: None,
            evicted: false,
        }
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_polled) > ttl
    }

    /// Whether the filter was live when the apply numbered `seq` was delivered.
    fn receives(&self, seq: u64) -> bool {
        !self.evicted && self.stale.is_none() && self.installed_seq < seq
    }

    fn pending(&self) -> usize {
        match &self.buffer {
            FilterBuffer::Hashes(hashes) => hashes.len(),
            FilterBuffer::Logs(logs) => logs.len(),
        }
    }

    fn push_hash(&mut self, tipset_key: H256, hash: H256, max_results: usize) {
        if let FilterBuffer::Hashes(hashes) = &mut self.buffer {
            if max_results > 0 && hashes.len() >= max_results {
                hashes.pop_front();
                tracing::warn!("filter buffer full, dropping oldest hash");
            }
            hashes.push_back((tipset_key, hash));
        }
    }

    fn push_log(&mut self, record: LogRecord, max_results: usize) {
        if let FilterBuffer::Logs(logs) = &mut self.buffer {
            if max_results > 0 && logs.len() >= max_results {
                logs.pop_front();
                tracing::warn!("filter buffer full, dropping oldest log");
            }
            logs.push_back(record);
        }
    }

    fn take_changes(&mut self) -> FilterChanges {
        match (&self.kind, &mut self.buffer) {
            (FilterKind::Block, FilterBuffer::Hashes(hashes)) => {
                FilterChanges::Blocks(hashes.drain(..).map(|(_, hash)| hash).collect())
            }
            (_, FilterBuffer::Hashes(hashes)) => {
                FilterChanges::Transactions(hashes.drain(..).map(|(_, hash)| hash).collect())
            }
            (_, FilterBuffer::Logs(logs)) => FilterChanges::Logs(logs.drain(..).collect()),
        }
    }

    fn info(&self, id: FilterId) -> FilterInfo {
        FilterInfo {
            id,
            kind: self.kind.clone(),
            created_at: self.created_at,
            last_polled: self.last_polled,
            pending: self.pending(),
            stale: self.stale.is_some(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps track of installed poll filters and their respective updates.
///
/// The filter table and each filter's buffer are locked independently: delivery to one
/// filter never blocks polling another. The table lock is always taken before a filter lock.
#[derive(Debug)]
pub struct FilterRegistry {
    limits: FilterLimits,
    id_counter: AtomicU64,
    /// Sequence number of the last delivered apply.
    seq: AtomicU64,
    filters: RwLock<FxHashMap<FilterId, Arc<Mutex<Filter>>>>,
    /// Set once the registry stops receiving updates; every later call fails with it.
    halted: OnceLock<FilterError>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new(FilterLimits::default())
    }
}

impl FilterRegistry {
    pub fn new(limits: FilterLimits) -> Self {
        Self {
            limits,
            id_counter: AtomicU64::new(1),
            seq: AtomicU64::new(0),
            filters: Default::default(),
            halted: OnceLock::new(),
        }
    }

    pub fn limits(&self) -> FilterLimits {
        self.limits
    }

    /// Installs a filter. Returns the filter id.
    pub fn install(&self, kind: FilterKind) -> Result<FilterId> {
        if let FilterKind::Log(spec) = &kind {
            spec.validate()?;
        }

        let mut filters = write(&self.filters);
        self.ensure_running()?;
        if self.limits.max_filters > 0 && filters.len() >= self.limits.max_filters {
            Self::retain_active(&mut filters, Instant::now(), self.limits.ttl);
            if filters.len() >= self.limits.max_filters {
                return Err(FilterError::TooManyFilters(self.limits.max_filters));
            }
        }

        let id = FilterId::from(self.id_counter.fetch_add(1, Ordering::Relaxed));
        let name = kind.name();
        let filter = Filter::new(kind, self.seq.load(Ordering::SeqCst));
        filters.insert(id, Arc::new(Mutex::new(filter)));

        tracing::info!("created {} filter '{:#x}'", name, id);
        Ok(id)
    }

    /// Removes the filter with the given id. Returns true if the filter existed, false otherwise.
    pub fn uninstall(&self, id: FilterId) -> bool {
        let removed = write(&self.filters).remove(&id);
        match removed {
            Some(filter) => {
                lock(&filter).evicted = true;
                tracing::info!("removed filter '{id:#x}'");
                true
            }
            None => false,
        }
    }

    /// Returns a snapshot of the filter with the given id.
    pub fn lookup(&self, id: FilterId) -> Result<FilterInfo> {
        self.with_live_filter(id, |filter| filter.info(id))
    }

    /// Retrieves the filter updates with the given id. The updates are reset after this call.
    pub fn drain(&self, id: FilterId) -> Result<FilterChanges> {
        self.ensure_running()?;
        self.with_live_filter(id, |filter| {
            filter.last_polled = Instant::now();
            match &filter.stale {
                Some(err) => Err(err.clone()),
                None => Ok(filter.take_changes()),
            }
        })?
    }

    /// Appends updates to a single filter. The updates must fit the filter's kind.
    pub fn append(&self, id: FilterId, changes: FilterChanges) -> Result<()> {
        let max_results = self.limits.max_results;
        self.with_live_filter(id, |filter| {
            match (filter.kind.clone(), changes) {
                (FilterKind::Block, FilterChanges::Blocks(hashes)) => hashes
                    .into_iter()
                    .for_each(|hash| filter.push_hash(hash, hash, max_results)),
                (FilterKind::PendingTransaction, FilterChanges::Transactions(hashes)) => hashes
                    .into_iter()
                    .for_each(|hash| filter.push_hash(H256::zero(), hash, max_results)),
                (kind, FilterChanges::Logs(logs)) if kind.tracks_logs() => logs
                    .into_iter()
                    .for_each(|log| filter.push_log(log, max_results)),
                (kind, _) => {
                    return Err(FilterError::InvalidSpec(format!(
                        "updates do not fit {} filter '{id:#x}'",
                        kind.name()
                    )))
                }
            }
            Ok(())
        })?
    }

    /// Lists every installed, unexpired filter ordered by id.
    pub fn list_live(&self) -> Vec<FilterInfo> {
        let now = Instant::now();
        let mut live: Vec<FilterInfo> = read(&self.filters)
            .iter()
            .filter_map(|(id, filter)| {
                let filter = lock(filter);
                (!filter.evicted && !filter.is_idle(now, self.limits.ttl)).then(|| filter.info(*id))
            })
            .collect();
        live.sort_by_key(|info| info.id);
        live
    }

    pub fn len(&self) -> usize {
        read(&self.filters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts every filter idle at `now`. Returns the number of evicted filters.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut filters = write(&self.filters);
        let before = filters.len();
        Self::retain_active(&mut filters, now, self.limits.ttl);
        before - filters.len()
    }

    /// Stops the registry. Installed filters turn stale, and every later install or poll
    /// fails with `err`. Only the first call has an effect.
    pub fn halt(&self, err: FilterError) {
        if self.halted.set(err.clone()).is_err() {
            return;
        }
        for filter in read(&self.filters).values() {
            lock(filter).stale = Some(err.clone());
        }
    }

    /// The error the registry was halted with, if any.
    pub fn halted(&self) -> Option<&FilterError> {
        self.halted.get()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.halted.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Sequence number of the last delivered apply.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Allocates the sequence number of a new apply.
    pub(crate) fn advance_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Notify block filters of a newly applied tipset
    pub fn notify_new_block(&self, seq: u64, tipset_key: H256) {
        let max_results = self.limits.max_results;
        self.for_each_receiving(seq, |filter| {
            if let FilterKind::Block = filter.kind {
                filter.push_hash(tipset_key, tipset_key, max_results)
            }
        })
    }

    /// Notify pending transaction filters of the messages included in a newly applied tipset
    pub fn notify_new_transactions(&self, seq: u64, tipset_key: H256, hashes: &[H256]) {
        let max_results = self.limits.max_results;
        self.for_each_receiving(seq, |filter| {
            if let FilterKind::PendingTransaction = filter.kind {
                for hash in hashes {
                    filter.push_hash(tipset_key, *hash, max_results)
                }
            }
        })
    }

    /// Notify log filters of the records of a newly applied tipset
    pub fn notify_new_logs(&self, seq: u64, records: &[LogRecord], head: u64) {
        let max_results = self.limits.max_results;
        self.for_each_receiving(seq, |filter| {
            for record in records {
                if filter.kind.matches(record, head) {
                    filter.push_log(record.clone(), max_results);
                }
            }
        })
    }

    /// Notify filters that the tipset applied as `applied_seq` was reverted.
    ///
    /// Log filters live at the time of the apply receive the retracted records. Hashes of
    /// the tipset that were not polled yet are dropped from hash filters.
    pub fn notify_reverted(
        &self,
        applied_seq: u64,
        tipset_key: H256,
        retracted: &[LogRecord],
        head: u64,
    ) {
        let max_results = self.limits.max_results;
        for filter in read(&self.filters).values() {
            let mut filter = lock(filter);
            if filter.evicted {
                continue;
            }

            if let FilterBuffer::Hashes(hashes) = &mut filter.buffer {
                hashes.retain(|(key, _)| *key != tipset_key);
                continue;
            }

            if filter.receives(applied_seq) {
                for record in retracted {
                    if filter.kind.matches(record, head) {
                        filter.push_log(record.clone(), max_results);
                    }
                }
            }
        }
    }

    /// Spawns a task evicting idle filters every `interval` until `cancel` fires or the
    /// registry is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        let evicted = registry.evict_idle(Instant::now());
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted idle filters");
                        }
                    }
                }
            }
        })
    }

    fn with_live_filter<R>(&self, id: FilterId, f: impl FnOnce(&mut Filter) -> R) -> Result<R> {
        let filter = read(&self.filters)
            .get(&id)
            .cloned()
            .ok_or(FilterError::NotFound)?;

        let mut guard = lock(&filter);
        if guard.evicted {
            return Err(FilterError::NotFound);
        }
        if guard.is_idle(Instant::now(), self.limits.ttl) {
            guard.evicted = true;
            drop(guard);
            write(&self.filters).remove(&id);
            tracing::info!("filter '{id:#x}' expired");
            return Err(FilterError::NotFound);
        }

        Ok(f(&mut guard))
    }

    fn for_each_receiving(&self, seq: u64, mut f: impl FnMut(&mut Filter)) {
        for filter in read(&self.filters).values() {
            let mut filter = lock(filter);
            if filter.receives(seq) {
                f(&mut filter);
            }
        }
    }

    fn retain_active(
        filters: &mut FxHashMap<FilterId, Arc<Mutex<Filter>>>,
        now: Instant,
        ttl: Duration,
    ) {
        filters.retain(|id, filter| {
            let mut filter = lock(filter);
            if filter.is_idle(now, ttl) {
                filter.evicted = true;
                tracing::info!("filter '{id:#x}' expired");
                false
            } else {
                true
            }
        });
    }
}
