//! Chain-side data model: tipsets, head changes, receipts and the log records derived from them.

pub use ethereum_types::{Address, H256, U256, U64};

/// Multicodec code of raw bytes, the only codec accepted for event entry values.
pub const IPLD_RAW: u64 = 0x55;

/// Identifies a tipset by height and key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TipsetRef {
    pub height: u64,
    pub key: H256,
}

/// A block (tipset) as seen by the filter engine. The key doubles as the Ethereum block hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tipset {
    pub height: u64,
    pub key: H256,
    pub parent: H256,
    /// Hashes of the messages included in this tipset, in execution order.
    pub messages: Vec<H256>,
}

impl Tipset {
    pub fn tipset_ref(&self) -> TipsetRef {
        TipsetRef {
            height: self.height,
            key: self.key,
        }
    }
}

/// A single head change; batches of these are delivered in order by the head notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadChange {
    Apply(Tipset),
    Revert(Tipset),
}

impl HeadChange {
    pub fn tipset(&self) -> &Tipset {
        match self {
            HeadChange::Apply(tipset) | HeadChange::Revert(tipset) => tipset,
        }
    }
}

/// One key/value pair of an actor event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub flags: u8,
    pub key: String,
    pub codec: u64,
    pub value: Vec<u8>,
}

impl EventEntry {
    /// An indexed, raw-encoded entry, the shape EVM logs are emitted in.
    pub fn raw(key: &str, value: Vec<u8>) -> Self {
        Self {
            flags: 0x03,
            key: key.to_string(),
            codec: IPLD_RAW,
            value,
        }
    }
}

/// An event as emitted by the execution layer, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub emitter: Address,
    pub entries: Vec<EventEntry>,
}

/// The receipt of one executed message along with the events it emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub tx_index: u64,
    pub events: Vec<RawEvent>,
}

/// Canonical log record. Immutable apart from `removed`, which flips when the owning tipset
/// is reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_height: u64,
    pub block_hash: H256,
    pub tx_hash: H256,
    pub tx_index: u64,
    pub log_index: u64,
    pub removed: bool,
}

impl LogRecord {
    /// Returns a copy of the record marked as removed by a revert.
    pub fn retracted(&self) -> Self {
        Self {
            removed: true,
            ..self.clone()
        }
    }
}
