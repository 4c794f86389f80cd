use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::Bytes,
    chain::{HeadNotifier, ReceiptLoader},
    config::upstream::UpstreamConfig,
    error::ChainError,
    types::{Address, EventEntry, HeadChange, RawEvent, Tipset, TxReceipt, H256, U64},
};

const TOPIC_KEYS: [&str; 4] = ["t1", "t2", "t3", "t4"];

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    hash: H256,
    parent_hash: H256,
    number: U64,
    #[serde(default)]
    transactions: Vec<H256>,
}

impl From<RpcBlock> for Tipset {
    fn from(block: RpcBlock) -> Self {
        Tipset {
            height: block.number.as_u64(),
            key: block.hash,
            parent: block.parent_hash,
            messages: block.transactions,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: H256,
    transaction_index: U64,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: Address,
    topics: Vec<H256>,
    data: Bytes,
}

impl From<RpcLog> for RawEvent {
    /// Re-encodes a log the way the execution layer emits it: one raw entry per topic plus
    /// the data payload.
    fn from(log: RpcLog) -> Self {
        let mut entries: Vec<_> = log
            .topics
            .iter()
            .zip(TOPIC_KEYS)
            .map(|(topic, key)| EventEntry::raw(key, topic.as_bytes().to_vec()))
            .collect();
        entries.push(EventEntry::raw("d", log.data.0));

        RawEvent {
            emitter: log.address,
            entries,
        }
    }
}

impl From<RpcReceipt> for TxReceipt {
    fn from(receipt: RpcReceipt) -> Self {
        TxReceipt {
            tx_hash: receipt.transaction_hash,
            tx_index: receipt.transaction_index.as_u64(),
            events: receipt.logs.into_iter().map(RawEvent::from).collect(),
        }
    }
}

/// Chain source that follows an Ethereum JSON-RPC node over HTTP.
///
/// Head changes are discovered by polling `eth_getBlockByNumber("latest")` and walking parent
/// hashes back to a known block.
#[derive(Debug, Clone)]
pub struct HttpChainSource {
    /// URL of the followed node.
    pub url: String,
    client: reqwest::Client,
    request_id: Arc<AtomicU64>,
    poll_interval: Duration,
    /// Deepest reorg the poller follows before closing the stream.
    max_reorg_depth: u64,
    cancel: CancellationToken,
}

impl HttpChainSource {
    pub fn new(config: &UpstreamConfig, max_reorg_depth: u64, cancel: CancellationToken) -> Self {
        Self {
            url: config.url.clone(),
            client: reqwest::Client::new(),
            request_id: Default::default(),
            poll_interval: config.poll_interval(),
            max_reorg_depth: max_reorg_depth.max(1),
            cancel,
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ChainError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ChainError::Rpc(format!(
                "{method} failed with {}: {}",
                error.code, error.message
            )));
        }

        serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|err| ChainError::Decode(format!("{method}: {err}")))
    }

    async fn block_by_number(&self, number: &str) -> Result<Option<Tipset>, ChainError> {
        let block: Option<RpcBlock> = self
            .request("eth_getBlockByNumber", serde_json::json!([number, false]))
            .await?;
        Ok(block.map(Tipset::from))
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Tipset>, ChainError> {
        let block: Option<RpcBlock> = self
            .request(
                "eth_getBlockByHash",
                serde_json::json!([format!("{hash:#x}"), false]),
            )
            .await?;
        Ok(block.map(Tipset::from))
    }
}

#[async_trait]
impl HeadNotifier for HttpChainSource {
    async fn subscribe_head_changes(
        &self,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<HeadChange>>, ChainError> {
        let head = self.head().await?;
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        sender
            .try_send(vec![HeadChange::Apply(head.clone())])
            .map_err(|_| ChainError::Closed)?;

        tracing::debug!(height = head.height, "polling {} for head changes", self.url);
        let poller = HeadPoller {
            source: self.clone(),
            known: VecDeque::from([head]),
            sender,
        };
        tokio::spawn(poller.run());

        Ok(receiver)
    }

    async fn head(&self) -> Result<Tipset, ChainError> {
        self.block_by_number("latest")
            .await?
            .ok_or_else(|| ChainError::Decode(String::from("node returned no latest block")))
    }

    async fn tipset_by_height(&self, height: u64) -> Result<Option<Tipset>, ChainError> {
        self.block_by_number(&format!("{height:#x}")).await
    }
}

#[async_trait]
impl ReceiptLoader for HttpChainSource {
    async fn load_receipts(&self, tipset: &Tipset) -> Result<Vec<TxReceipt>, ChainError> {
        let receipts: Option<Vec<RpcReceipt>> = self
            .request(
                "eth_getBlockReceipts",
                serde_json::json!([format!("{:#x}", tipset.key)]),
            )
            .await?;

        let receipts = receipts.ok_or_else(|| {
            ChainError::Rpc(format!("node has no receipts for block {:#x}", tipset.key))
        })?;
        Ok(receipts.into_iter().map(TxReceipt::from).collect())
    }
}

/// Turns successive `latest` blocks into head change batches.
struct HeadPoller {
    source: HttpChainSource,
    /// Recently announced canonical blocks, oldest first.
    known: VecDeque<Tipset>,
    sender: mpsc::Sender<Vec<HeadChange>>,
}

impl HeadPoller {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.source.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.source.cancel.cancelled() => return,
                _ = self.sender.closed() => return,
                _ = interval.tick() => {}
            }

            match self.poll().await {
                Ok(None) => {}
                Ok(Some(batch)) => match self.sender.try_send(batch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("head change queue is full, closing the stream");
                        return;
                    }
                    Err(TrySendError::Closed(_)) => return,
                },
                Err(ChainError::Closed) => {
                    tracing::warn!("lost track of the upstream chain, closing the stream");
                    return;
                }
                Err(err) => tracing::warn!("polling the upstream head failed: {}", err),
            }
        }
    }

    /// Returns the changes leading from the last announced block to the current head.
    async fn poll(&mut self) -> Result<Option<Vec<HeadChange>>, ChainError> {
        let latest = self.source.head().await?;
        let Some(known_head) = self.known.back() else {
            return Err(ChainError::Closed);
        };
        if latest.key == known_head.key {
            return Ok(None);
        }

        // The head moved back onto a block already announced.
        if let Some(position) = self.known.iter().rposition(|t| t.key == latest.key) {
            let reverts: Vec<_> = self
                .known
                .drain(position + 1..)
                .rev()
                .map(HeadChange::Revert)
                .collect();
            return Ok(Some(reverts));
        }

        let lowest_known = self.known.front().map_or(0, |tipset| tipset.height);
        let mut applies = vec![latest];
        let ancestor = loop {
            let Some(oldest) = applies.last() else {
                return Err(ChainError::Closed);
            };
            if let Some(position) = self.known.iter().rposition(|t| t.key == oldest.parent) {
                break position;
            }
            if applies.len() as u64 > self.source.max_reorg_depth || oldest.height <= lowest_known
            {
                return Err(ChainError::Closed);
            }

            let parent = self
                .source
                .block_by_hash(oldest.parent)
                .await?
                .ok_or_else(|| {
                    ChainError::Decode(format!("parent block {:#x} not found", oldest.parent))
                })?;
            applies.push(parent);
        };

        let mut batch: Vec<_> = self
            .known
            .drain(ancestor + 1..)
            .rev()
            .map(HeadChange::Revert)
            .collect();
        for tipset in applies.into_iter().rev() {
            self.known.push_back(tipset.clone());
            batch.push(HeadChange::Apply(tipset));
        }
        while self.known.len() as u64 > self.source.max_reorg_depth {
            self.known.pop_front();
        }

        Ok(Some(batch))
    }
}
