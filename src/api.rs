//! Ethereum JSON-RPC wire types of the filter API.

use std::collections::HashSet;

use ethereum_types::{Address, H256, U64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    error::FilterError,
    filters::{BlockParam, FilterChanges, FilterSpec, MAX_TOPICS},
    types::LogRecord,
};

/// Byte payload encoded as `0x`-prefixed hex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let digits = value.strip_prefix("0x").unwrap_or(&value);
        hex::decode(digits)
            .map(Bytes)
            .map_err(serde::de::Error::custom)
    }
}

/// A single value or a list of values, as accepted for `address` and topic positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueOrArray<T> {
    Value(T),
    Array(Vec<T>),
}

impl<T> ValueOrArray<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            ValueOrArray::Value(value) => vec![value],
            ValueOrArray::Array(values) => values,
        }
    }
}

/// The filter object of `eth_newFilter` and `eth_getLogs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthFilterSpec {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "block_param"
    )]
    pub from_block: Option<BlockParam>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "block_param"
    )]
    pub to_block: Option<BlockParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ValueOrArray<Address>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<Option<ValueOrArray<H256>>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<H256>,
}

mod block_param {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::filters::BlockParam;

    pub fn serialize<S: Serializer>(
        value: &Option<BlockParam>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(block) => serializer.serialize_str(&block.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BlockParam>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|value| value.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl TryFrom<EthFilterSpec> for FilterSpec {
    type Error = FilterError;

    fn try_from(value: EthFilterSpec) -> Result<Self, Self::Error> {
        let topics = value.topics.unwrap_or_default();
        if topics.len() > MAX_TOPICS {
            return Err(FilterError::InvalidSpec(format!(
                "{} topic positions given, at most {MAX_TOPICS} supported",
                topics.len()
            )));
        }

        let mut spec = FilterSpec {
            from_block: value.from_block,
            to_block: value.to_block,
            block_hash: value.block_hash,
            addresses: value
                .address
                .map(ValueOrArray::into_vec)
                .unwrap_or_default()
                .into_iter()
                .collect(),
            topics: Default::default(),
        };
        for (position, accepted) in topics.into_iter().enumerate() {
            spec.topics[position] = accepted
                .map(ValueOrArray::into_vec)
                .unwrap_or_default()
                .into_iter()
                .collect::<HashSet<_>>();
        }

        spec.validate()?;
        Ok(spec)
    }
}

/// A log object as returned by `eth_getLogs` and `eth_getFilterChanges`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: U64,
    pub block_hash: H256,
    pub transaction_hash: H256,
    pub transaction_index: U64,
    pub log_index: U64,
    pub removed: bool,
}

impl From<LogRecord> for Log {
    fn from(value: LogRecord) -> Self {
        Self {
            address: value.address,
            topics: value.topics,
            data: Bytes(value.data),
            block_number: U64::from(value.block_height),
            block_hash: value.block_hash,
            transaction_hash: value.tx_hash,
            transaction_index: U64::from(value.tx_index),
            log_index: U64::from(value.log_index),
            removed: value.removed,
        }
    }
}

/// The result of `eth_getFilterChanges`, a plain JSON list either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EthFilterChanges {
    Hashes(Vec<H256>),
    Logs(Vec<Log>),
}

impl From<FilterChanges> for EthFilterChanges {
    fn from(value: FilterChanges) -> Self {
        match value {
            FilterChanges::Transactions(hashes) | FilterChanges::Blocks(hashes) => {
                EthFilterChanges::Hashes(hashes)
            }
            FilterChanges::Logs(logs) => {
                EthFilterChanges::Logs(logs.into_iter().map(Log::from).collect())
            }
        }
    }
}
