//! This file hold testing helpers for other unit tests.
//!
//! There is MockServer that can help simulate an upstream Ethereum node, and MockChain that
//! plays the head notifier and receipt loader in-process.
//!

#![cfg(test)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use ethabi::{ParamType, Token};
use httptest::{
    matchers::{eq, json_decoded, request},
    responders::json_encoded,
    Expectation, Server,
};
use tokio::sync::mpsc;

use crate::{
    chain::{HeadNotifier, ReceiptLoader},
    error::ChainError,
    types::{Address, EventEntry, HeadChange, LogRecord, RawEvent, Tipset, TxReceipt, H256, U256},
};

/// A HTTP server that can be used to mock an upstream node.
pub struct MockServer {
    /// The implementation for [httptest::Server].
    pub inner: Server,
}

impl MockServer {
    /// Start the mock server.
    pub fn run() -> Self {
        MockServer {
            inner: Server::run(),
        }
    }

    /// Retrieve the mock server's url.
    pub fn url(&self) -> String {
        self.inner.url("").to_string()
    }

    /// Assert an exactly single call expectation with a given request and the provided response.
    pub fn expect(&self, request: serde_json::Value, response: serde_json::Value) {
        self.inner.expect(
            Expectation::matching(request::body(json_decoded(eq(request))))
                .respond_with(json_encoded(response)),
        );
    }

    /// Answers any number of requests accepted by `matcher` with the provided response.
    pub fn expect_any<F>(&self, matcher: F, response: serde_json::Value)
    where
        F: Fn(&serde_json::Value) -> bool + Send + 'static,
    {
        self.inner.expect(
            Expectation::matching(request::body(json_decoded(matcher)))
                .times(..)
                .respond_with(json_encoded(response)),
        );
    }
}

/// A mock response builder for a block
#[derive(Default, Debug, Clone)]
pub struct BlockResponseBuilder {
    hash: H256,
    parent_hash: H256,
    number: u64,
    transactions: Vec<H256>,
}

impl BlockResponseBuilder {
    /// Create a new instance of [BlockResponseBuilder]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the number, hash, parent and messages of a tipset
    pub fn set_tipset(&mut self, tipset: &Tipset) -> &mut Self {
        self.hash = tipset.key;
        self.parent_hash = tipset.parent;
        self.number = tipset.height;
        self.transactions = tipset.messages.clone();
        self
    }

    /// Sets the block hash
    pub fn set_hash(&mut self, hash: H256) -> &mut Self {
        self.hash = hash;
        self
    }

    /// Sets the block number
    pub fn set_number(&mut self, number: u64) -> &mut Self {
        self.number = number;
        self
    }

    /// Builds the json response
    pub fn build(&mut self) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "result": {
                "hash": format!("{:#x}", self.hash),
                "parentHash": format!("{:#x}", self.parent_hash),
                "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
                "miner": "0x0000000000000000000000000000000000000000",
                "stateRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "number": format!("{:#x}", self.number),
                "gasUsed": "0x0",
                "gasLimit": "0xffffffff",
                "baseFeePerGas": "0x1dcd6500",
                "extraData": "0x",
                "timestamp": "0x63ecc41a",
                "transactions": self.transactions.iter().map(|hash| format!("{hash:#x}")).collect::<Vec<_>>(),
                "uncles": [],
            },
        })
    }
}

/// A mock response builder for the receipts of a block
#[derive(Default, Debug, Clone)]
pub struct ReceiptsResponseBuilder {
    block_hash: H256,
    block_number: u64,
    receipts: Vec<serde_json::Value>,
}

impl ReceiptsResponseBuilder {
    /// Create a new instance of [ReceiptsResponseBuilder]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block the receipts belong to
    pub fn set_block(&mut self, number: u64, hash: H256) -> &mut Self {
        self.block_number = number;
        self.block_hash = hash;
        self
    }

    /// Appends a receipt emitting `logs`, each given as (address, topics, data)
    pub fn add(&mut self, tx_hash: H256, logs: Vec<(Address, Vec<H256>, Vec<u8>)>) -> &mut Self {
        let tx_index = self.receipts.len();
        self.receipts.push(serde_json::json!({
            "transactionHash": format!("{tx_hash:#x}"),
            "transactionIndex": format!("{tx_index:#x}"),
            "blockHash": format!("{:#x}", self.block_hash),
            "blockNumber": format!("{:#x}", self.block_number),
            "status": "0x1",
            "logs": logs.into_iter().map(|(address, topics, data)| serde_json::json!({
                "address": format!("{address:#x}"),
                "topics": topics.iter().map(|topic| format!("{topic:#x}")).collect::<Vec<_>>(),
                "data": format!("0x{}", hex::encode(data)),
                "removed": false,
            })).collect::<Vec<_>>(),
        }));
        self
    }

    /// Builds the json response
    pub fn build(&mut self) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "result": self.receipts,
        })
    }
}

/// Key of the tipset at `height` on chain branch `fork`.
pub fn tipset_key(fork: u8, height: u64) -> H256 {
    let mut key = H256::from_low_u64_be(height);
    key.0[0] = 0xee;
    key.0[1] = fork;
    key
}

/// A builder for [Tipset]s, keyed on the main branch by default
#[derive(Debug, Clone)]
pub struct TipsetBuilder {
    tipset: Tipset,
}

impl TipsetBuilder {
    /// Create a new instance of [TipsetBuilder] at the given height
    pub fn new(height: u64) -> Self {
        Self {
            tipset: Tipset {
                height,
                key: tipset_key(0, height),
                parent: height
                    .checked_sub(1)
                    .map_or_else(H256::zero, |parent| tipset_key(0, parent)),
                messages: vec![],
            },
        }
    }

    /// Places the tipset on chain branch `fork`
    pub fn fork(&mut self, fork: u8) -> &mut Self {
        self.tipset.key = tipset_key(fork, self.tipset.height);
        self
    }

    /// Makes the tipset a child of `parent`
    pub fn parent(&mut self, parent: &Tipset) -> &mut Self {
        self.tipset.parent = parent.key;
        self
    }

    /// Sets the included message hashes
    pub fn messages(&mut self, messages: Vec<H256>) -> &mut Self {
        self.tipset.messages = messages;
        self
    }

    /// Builds the tipset
    pub fn build(&mut self) -> Tipset {
        self.tipset.clone()
    }
}

/// A builder for [LogRecord]s
#[derive(Debug, Clone)]
pub struct LogBuilder {
    record: LogRecord,
}

impl Default for LogBuilder {
    fn default() -> Self {
        Self {
            record: LogRecord {
                address: Address::zero(),
                topics: vec![H256::zero()],
                data: vec![],
                block_height: 0,
                block_hash: tipset_key(0, 0),
                tx_hash: H256::zero(),
                tx_index: 0,
                log_index: 0,
                removed: false,
            },
        }
    }
}

impl LogBuilder {
    /// Create a new instance of [LogBuilder]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block height, and the matching main branch block hash
    pub fn set_block(&mut self, height: u64) -> &mut Self {
        self.record.block_height = height;
        self.record.block_hash = tipset_key(0, height);
        self
    }

    /// Sets the block hash
    pub fn set_block_hash(&mut self, hash: H256) -> &mut Self {
        self.record.block_hash = hash;
        self
    }

    /// Sets the block height and hash from a tipset
    pub fn set_tipset(&mut self, tipset: &Tipset) -> &mut Self {
        self.record.block_height = tipset.height;
        self.record.block_hash = tipset.key;
        self
    }

    /// Sets the emitting address
    pub fn set_address(&mut self, address: Address) -> &mut Self {
        self.record.address = address;
        self
    }

    /// Sets the topics
    pub fn set_topics(&mut self, topics: Vec<H256>) -> &mut Self {
        self.record.topics = topics;
        self
    }

    /// Sets the data payload
    pub fn set_data(&mut self, data: Vec<u8>) -> &mut Self {
        self.record.data = data;
        self
    }

    /// Sets the transaction hash and index
    pub fn set_tx(&mut self, hash: H256, index: u64) -> &mut Self {
        self.record.tx_hash = hash;
        self.record.tx_index = index;
        self
    }

    /// Sets the log index
    pub fn set_log_index(&mut self, index: u64) -> &mut Self {
        self.record.log_index = index;
        self
    }

    /// Builds the record
    pub fn build(&mut self) -> LogRecord {
        self.record.clone()
    }
}

/// An event shaped the way EVM logs are emitted: topics as `t1`.. and data as `d`.
pub fn evm_event(emitter: Address, topics: Vec<H256>, data: Vec<u8>) -> RawEvent {
    let mut entries: Vec<_> = topics
        .iter()
        .enumerate()
        .map(|(i, topic)| EventEntry::raw(&format!("t{}", i + 1), topic.as_bytes().to_vec()))
        .collect();
    entries.push(EventEntry::raw("d", data));
    RawEvent { emitter, entries }
}

pub fn receipt(tx_hash: H256, tx_index: u64, events: Vec<RawEvent>) -> TxReceipt {
    TxReceipt {
        tx_hash,
        tx_index,
        events,
    }
}

/// Signature topic of `EventOneData(uint256)`.
pub fn event_one_data_topic() -> H256 {
    H256::from_slice(ethabi::long_signature("EventOneData", &[ParamType::Uint(256)]).as_bytes())
}

/// An `EventOneData(uint256)` emission carrying `value`.
pub fn event_one_data(emitter: Address, value: u64) -> RawEvent {
    evm_event(
        emitter,
        vec![event_one_data_topic()],
        ethabi::encode(&[Token::Uint(ethabi::Uint::from(value))]),
    )
}

/// Decodes the `uint256` payload of an `EventOneData` record.
pub fn event_one_data_value(data: &[u8]) -> U256 {
    ethabi::decode(&[ParamType::Uint(256)], data)
        .ok()
        .and_then(|tokens| tokens.into_iter().next())
        .and_then(Token::into_uint)
        .map(|value| U256::from_big_endian(&{
            let mut bytes = [0u8; 32];
            value.to_big_endian(&mut bytes);
            bytes
        }))
        .expect("not an EventOneData payload")
}

#[derive(Debug)]
struct MockChainInner {
    /// Canonical tipsets, indexed by height. `None` marks a null round.
    canonical: Vec<Option<Tipset>>,
    receipts: HashMap<H256, Vec<TxReceipt>>,
    sender: Option<mpsc::Sender<Vec<HeadChange>>>,
    forks: u8,
}

/// An in-process chain, mined on demand.
#[derive(Debug)]
pub struct MockChain {
    inner: Mutex<MockChainInner>,
    failing_receipt_loads: AtomicUsize,
}

impl MockChain {
    /// Starts a chain holding only the genesis tipset.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockChainInner {
                canonical: vec![Some(TipsetBuilder::new(0).build())],
                receipts: Default::default(),
                sender: None,
                forks: 0,
            }),
            failing_receipt_loads: AtomicUsize::new(0),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MockChainInner> {
        self.inner.lock().expect("mock chain poisoned")
    }

    /// Mines a tipset holding `receipts` on top of the head and announces it.
    pub fn mine(&self, receipts: Vec<TxReceipt>) -> Tipset {
        let mut inner = self.inner();
        let fork = inner.forks;
        let tipset = inner.extend(fork, receipts);
        inner.send(vec![HeadChange::Apply(tipset.clone())]);
        tipset
    }

    /// Skips a height without producing a tipset.
    pub fn null_round(&self) {
        self.inner().canonical.push(None);
    }

    /// Mines `count` empty tipsets.
    pub fn mine_empty(&self, count: usize) -> Vec<Tipset> {
        (0..count).map(|_| self.mine(vec![])).collect()
    }

    /// Replaces the top `depth` tipsets with a new branch holding one tipset per entry of
    /// `receipts`, announcing the switch as a single batch.
    pub fn reorg(&self, depth: usize, receipts: Vec<Vec<TxReceipt>>) -> Vec<Tipset> {
        let mut inner = self.inner();
        let keep = inner.canonical.len() - depth;
        let reverted: Vec<_> = inner.canonical.drain(keep..).rev().flatten().collect();

        inner.forks += 1;
        let fork = inner.forks;
        let applied: Vec<_> = receipts
            .into_iter()
            .map(|receipts| inner.extend(fork, receipts))
            .collect();

        inner.send(
            reverted
                .into_iter()
                .map(HeadChange::Revert)
                .chain(applied.iter().cloned().map(HeadChange::Apply))
                .collect(),
        );
        applied
    }

    /// Closes the head change stream. Tipsets mined afterwards are not announced until the
    /// next subscription.
    pub fn disconnect(&self) {
        self.inner().sender = None;
    }

    /// Makes the next `count` receipt loads fail.
    pub fn fail_next_receipt_loads(&self, count: usize) {
        self.failing_receipt_loads.store(count, Ordering::SeqCst);
    }

    pub fn tipset_at(&self, height: u64) -> Tipset {
        self.inner().canonical[height as usize]
            .clone()
            .expect("null round")
    }
}

impl MockChainInner {
    fn head(&self) -> Option<Tipset> {
        self.canonical.iter().rev().flatten().next().cloned()
    }

    fn extend(&mut self, fork: u8, receipts: Vec<TxReceipt>) -> Tipset {
        let parent = self.head().unwrap_or_else(|| TipsetBuilder::new(0).build());
        let tipset = TipsetBuilder::new(self.canonical.len() as u64)
            .fork(fork)
            .parent(&parent)
            .messages(receipts.iter().map(|r| r.tx_hash).collect())
            .build();
        self.receipts.insert(tipset.key, receipts);
        self.canonical.push(Some(tipset.clone()));
        tipset
    }

    fn send(&mut self, batch: Vec<HeadChange>) {
        if let Some(sender) = &self.sender {
            if sender.try_send(batch).is_err() {
                self.sender = None;
            }
        }
    }
}

#[async_trait]
impl HeadNotifier for MockChain {
    async fn subscribe_head_changes(
        &self,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<HeadChange>>, ChainError> {
        let mut inner = self.inner();
        let (sender, receiver) = mpsc::channel(capacity);
        let head = inner.head().ok_or(ChainError::Closed)?;
        sender
            .try_send(vec![HeadChange::Apply(head)])
            .map_err(|_| ChainError::Closed)?;
        inner.sender = Some(sender);
        Ok(receiver)
    }

    async fn head(&self) -> Result<Tipset, ChainError> {
        self.inner().head().ok_or(ChainError::Closed)
    }

    async fn tipset_by_height(&self, height: u64) -> Result<Option<Tipset>, ChainError> {
        Ok(self.inner().canonical.get(height as usize).cloned().flatten())
    }
}

#[async_trait]
impl ReceiptLoader for MockChain {
    async fn load_receipts(&self, tipset: &Tipset) -> Result<Vec<TxReceipt>, ChainError> {
        let failing = self
            .failing_receipt_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ChainError::Rpc(String::from("injected receipt failure")));
        }

        Ok(self
            .inner()
            .receipts
            .get(&tipset.key)
            .cloned()
            .unwrap_or_default())
    }
}

mod test {
    use super::*;

    #[test]
    fn test_block_response_builder_set_hash() {
        let builder = BlockResponseBuilder::new()
            .set_hash(H256::repeat_byte(0x01))
            .build();

        let actual_value = builder
            .as_object()
            .and_then(|o| o.get("result").unwrap().as_object())
            .and_then(|o| o.get("hash").unwrap().as_str())
            .expect("failed retrieving value");

        assert_eq!(
            "0x0101010101010101010101010101010101010101010101010101010101010101",
            actual_value
        );
    }

    #[test]
    fn test_block_response_builder_set_number() {
        let builder = BlockResponseBuilder::new().set_number(255).build();

        let actual_value = builder
            .as_object()
            .and_then(|o| o.get("result").unwrap().as_object())
            .and_then(|o| o.get("number").unwrap().as_str())
            .expect("failed retrieving value");

        assert_eq!("0xff", actual_value);
    }

    #[test]
    fn test_event_one_data_round_trips_value() {
        let event = event_one_data(Address::repeat_byte(0x1), 44);
        let data = &event.entries.last().expect("no data entry").value;

        assert_eq!(U256::from(44), event_one_data_value(data));
    }

    #[tokio::test]
    async fn test_mock_chain_announces_reorg_as_one_batch() {
        let chain = MockChain::new();
        let mut receiver = chain
            .subscribe_head_changes(8)
            .await
            .expect("failed subscribing");
        receiver.recv().await.expect("no initial batch");

        let mined = chain.mine_empty(2);
        let applied = chain.reorg(1, vec![vec![], vec![]]);

        receiver.recv().await.expect("no batch");
        receiver.recv().await.expect("no batch");
        let batch = receiver.recv().await.expect("no batch");
        assert_eq!(
            vec![
                HeadChange::Revert(mined[1].clone()),
                HeadChange::Apply(applied[0].clone()),
                HeadChange::Apply(applied[1].clone()),
            ],
            batch
        );
        assert_eq!(mined[0].key, applied[0].parent);
        assert_eq!(applied[1], chain.head().await.expect("no head"));
    }
}
