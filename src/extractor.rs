//! Decoding of raw actor events into Ethereum-style log records.

use ethereum_types::H256;

use crate::{
    filters::MAX_TOPICS,
    types::{LogRecord, RawEvent, Tipset, TxReceipt, IPLD_RAW},
    utils::h256_from_bytes,
};

/// Reasons an event cannot be represented as an Ethereum log.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("entry '{key}' uses codec {codec:#x}, expected raw")]
    UnsupportedCodec { key: String, codec: u64 },
    #[error("topic '{key}' is {len} bytes long")]
    MisSizedTopic { key: String, len: usize },
    #[error("duplicate entry '{0}'")]
    DuplicateEntry(String),
    #[error("topics are not contiguous")]
    TopicGap,
    #[error("event has no topics")]
    NoTopics,
}

/// Turns the receipts of a tipset into [LogRecord]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventExtractor;

impl EventExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extracts the log records of `tipset`, in receipt order. Log indexes run across the
    /// whole tipset. Malformed events are skipped.
    pub fn extract(&self, tipset: &Tipset, receipts: &[TxReceipt]) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for receipt in receipts {
            for event in &receipt.events {
                match decode_event(event) {
                    Ok((topics, data)) => records.push(LogRecord {
                        address: event.emitter,
                        topics,
                        data,
                        block_height: tipset.height,
                        block_hash: tipset.key,
                        tx_hash: receipt.tx_hash,
                        tx_index: receipt.tx_index,
                        log_index: records.len() as u64,
                        removed: false,
                    }),
                    Err(err) => tracing::warn!(
                        height = tipset.height,
                        tx = %format!("{:#x}", receipt.tx_hash),
                        emitter = %format!("{:#x}", event.emitter),
                        "skipping event: {}",
                        err
                    ),
                }
            }
        }

        records
    }
}

/// Decodes the topics and data of a single event.
///
/// Entries keyed `t1` to `t4` are topics and `d` is the data payload; every value must be
/// raw-encoded. Unknown keys are ignored.
pub fn decode_event(event: &RawEvent) -> Result<(Vec<H256>, Vec<u8>), EventDecodeError> {
    let mut topics = [None; MAX_TOPICS];
    let mut data = None;

    for entry in &event.entries {
        let position = match entry.key.as_str() {
            "t1" => Some(0),
            "t2" => Some(1),
            "t3" => Some(2),
            "t4" => Some(3),
            "d" => None,
            other => {
                tracing::warn!("unexpected event entry '{}'", other);
                continue;
            }
        };

        if entry.codec != IPLD_RAW {
            return Err(EventDecodeError::UnsupportedCodec {
                key: entry.key.clone(),
                codec: entry.codec,
            });
        }

        match position {
            Some(position) => {
                if topics[position].is_some() {
                    return Err(EventDecodeError::DuplicateEntry(entry.key.clone()));
                }
                let topic =
                    h256_from_bytes(&entry.value).ok_or_else(|| EventDecodeError::MisSizedTopic {
                        key: entry.key.clone(),
                        len: entry.value.len(),
                    })?;
                topics[position] = Some(topic);
            }
            None => {
                if data.is_some() {
                    return Err(EventDecodeError::DuplicateEntry(entry.key.clone()));
                }
                data = Some(entry.value.clone());
            }
        }
    }

    let count = topics.iter().take_while(|topic| topic.is_some()).count();
    if topics[count..].iter().any(Option::is_some) {
        return Err(EventDecodeError::TopicGap);
    }
    if count == 0 {
        return Err(EventDecodeError::NoTopics);
    }

    Ok((
        topics.into_iter().flatten().collect(),
        data.unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{evm_event, receipt, TipsetBuilder},
        types::{Address, EventEntry},
    };

    #[test]
    fn test_extract_assigns_positions_across_receipts() {
        let tipset = TipsetBuilder::new(3).build();
        let emitter = Address::repeat_byte(0x1);
        let receipts = vec![
            receipt(
                H256::repeat_byte(0xa),
                0,
                vec![
                    evm_event(emitter, vec![H256::repeat_byte(0x1)], vec![1]),
                    evm_event(emitter, vec![H256::repeat_byte(0x2)], vec![2]),
                ],
            ),
            receipt(
                H256::repeat_byte(0xb),
                1,
                vec![evm_event(emitter, vec![H256::repeat_byte(0x3)], vec![3])],
            ),
        ];

        let records = EventExtractor::new().extract(&tipset, &receipts);

        assert_eq!(3, records.len());
        assert_eq!(
            vec![(0, 0), (0, 1), (1, 2)],
            records
                .iter()
                .map(|r| (r.tx_index, r.log_index))
                .collect::<Vec<_>>()
        );
        assert!(records.iter().all(|r| r.block_height == 3
            && r.block_hash == tipset.key
            && r.address == emitter
            && !r.removed));
        assert_eq!(H256::repeat_byte(0xb), records[2].tx_hash);
        assert_eq!(vec![3], records[2].data);
    }

    #[test]
    fn test_extract_skips_malformed_events_without_consuming_log_index() {
        let tipset = TipsetBuilder::new(1).build();
        let emitter = Address::repeat_byte(0x1);
        let malformed = RawEvent {
            emitter,
            entries: vec![EventEntry::raw("t1", vec![0u8; 31])],
        };
        let receipts = vec![receipt(
            H256::repeat_byte(0xa),
            0,
            vec![
                malformed,
                evm_event(emitter, vec![H256::repeat_byte(0x1)], vec![]),
            ],
        )];

        let records = EventExtractor::new().extract(&tipset, &receipts);

        assert_eq!(1, records.len());
        assert_eq!(0, records[0].log_index);
    }

    #[test]
    fn test_decode_event_orders_topics_by_key() {
        let event = RawEvent {
            emitter: Address::zero(),
            entries: vec![
                EventEntry::raw("t2", H256::repeat_byte(0x2).as_bytes().to_vec()),
                EventEntry::raw("d", vec![0xde, 0xad]),
                EventEntry::raw("t1", H256::repeat_byte(0x1).as_bytes().to_vec()),
            ],
        };

        let (topics, data) = decode_event(&event).expect("failed decoding");

        assert_eq!(vec![H256::repeat_byte(0x1), H256::repeat_byte(0x2)], topics);
        assert_eq!(vec![0xde, 0xad], data);
    }

    #[test]
    fn test_decode_event_ignores_unknown_keys() {
        let event = RawEvent {
            emitter: Address::zero(),
            entries: vec![
                EventEntry::raw("t1", H256::repeat_byte(0x1).as_bytes().to_vec()),
                EventEntry::raw("x", vec![1, 2, 3]),
            ],
        };

        let (topics, data) = decode_event(&event).expect("failed decoding");

        assert_eq!(vec![H256::repeat_byte(0x1)], topics);
        assert!(data.is_empty());
    }

    #[test]
    fn test_decode_event_rejects_malformed_events() {
        let topic = || H256::repeat_byte(0x1).as_bytes().to_vec();
        let cases = vec![
            (
                vec![EventEntry::raw("t1", vec![1u8; 20])],
                EventDecodeError::MisSizedTopic {
                    key: String::from("t1"),
                    len: 20,
                },
            ),
            (
                vec![EventEntry::raw("t1", topic()), EventEntry::raw("t1", topic())],
                EventDecodeError::DuplicateEntry(String::from("t1")),
            ),
            (
                vec![
                    EventEntry::raw("t1", topic()),
                    EventEntry::raw("d", vec![]),
                    EventEntry::raw("d", vec![]),
                ],
                EventDecodeError::DuplicateEntry(String::from("d")),
            ),
            (
                vec![EventEntry::raw("t1", topic()), EventEntry::raw("t3", topic())],
                EventDecodeError::TopicGap,
            ),
            (
                vec![EventEntry::raw("d", vec![1])],
                EventDecodeError::NoTopics,
            ),
            (
                vec![EventEntry {
                    flags: 0x03,
                    key: String::from("t1"),
                    codec: 0x71,
                    value: topic(),
                }],
                EventDecodeError::UnsupportedCodec {
                    key: String::from("t1"),
                    codec: 0x71,
                },
            ),
        ];

        for (entries, expected) in cases {
            let event = RawEvent {
                emitter: Address::zero(),
                entries,
            };
            assert_eq!(Err(expected), decode_event(&event));
        }
    }
}
