use std::{collections::HashSet, fmt, str::FromStr};

use ethereum_types::{Address, H256};

use crate::{
    error::FilterError,
    types::LogRecord,
    utils::{parse_hex_quantity, to_real_block_number},
};

/// Maximum number of topic positions a log can carry.
pub const MAX_TOPICS: usize = 4;

/// One OR-set per topic position. An empty set is a wildcard.
pub type TopicSpec = [HashSet<H256>; MAX_TOPICS];

/// A block height or one of the `earliest` / `latest` / `pending` sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockParam {
    Number(u64),
    Earliest,
    Latest,
    Pending,
}

impl FromStr for BlockParam {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earliest" => Ok(BlockParam::Earliest),
            "latest" => Ok(BlockParam::Latest),
            "pending" => Ok(BlockParam::Pending),
            other => parse_hex_quantity(other)
                .map(BlockParam::Number)
                .ok_or_else(|| FilterError::InvalidSpec(format!("invalid block parameter '{other}'"))),
        }
    }
}

impl fmt::Display for BlockParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockParam::Number(n) => write!(f, "{n:#x}"),
            BlockParam::Earliest => f.write_str("earliest"),
            BlockParam::Latest => f.write_str("latest"),
            BlockParam::Pending => f.write_str("pending"),
        }
    }
}

/// The blocks a spec covers once its sentinels are resolved against a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockScope {
    /// Exactly the tipset with this key.
    Tipset(H256),
    /// Heights `from..=to`. Empty when `to < from`.
    Range { from: u64, to: u64 },
}

/// Criteria selecting log records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub from_block: Option<BlockParam>,
    pub to_block: Option<BlockParam>,
    pub block_hash: Option<H256>,
    /// Emitting contracts, empty matches any address.
    pub addresses: HashSet<Address>,
    pub topics: TopicSpec,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_block(mut self, block: BlockParam) -> Self {
        self.from_block = Some(block);
        self
    }

    pub fn to_block(mut self, block: BlockParam) -> Self {
        self.to_block = Some(block);
        self
    }

    pub fn block_hash(mut self, hash: H256) -> Self {
        self.block_hash = Some(hash);
        self
    }

    pub fn addresses(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    /// Sets the OR-set of accepted values at topic `position` (0-based).
    ///
    /// # Panics
    ///
    /// If `position` is not below [MAX_TOPICS].
    pub fn topic(mut self, position: usize, values: impl IntoIterator<Item = H256>) -> Self {
        self.topics[position] = values.into_iter().collect();
        self
    }

    /// True when the spec places no constraint at all.
    pub fn is_catch_all(&self) -> bool {
        self.from_block.is_none()
            && self.to_block.is_none()
            && self.block_hash.is_none()
            && self.addresses.is_empty()
            && self.topics.iter().all(HashSet::is_empty)
    }

    /// Rejects specs that can never be well-formed, regardless of the head.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.block_hash.is_some() && (self.from_block.is_some() || self.to_block.is_some()) {
            return Err(FilterError::InvalidSpec(String::from(
                "must not specify block hash and from/to block",
            )));
        }

        // `earliest` is always genesis, so it bounds the range like a number does.
        let fixed = |block: Option<BlockParam>| match block {
            Some(BlockParam::Number(number)) => Some(number),
            Some(BlockParam::Earliest) => Some(0),
            _ => None,
        };
        if let (Some(from), Some(to)) = (fixed(self.from_block), fixed(self.to_block)) {
            if to < from {
                return Err(FilterError::InvalidSpec(format!(
                    "toBlock {to:#x} is lower than fromBlock {from:#x}"
                )));
            }
        }

        Ok(())
    }

    /// Resolves the block constraints against the current head. Unset `from` is genesis, unset
    /// `to` is the head.
    pub fn scope(&self, head: u64) -> BlockScope {
        if let Some(hash) = self.block_hash {
            return BlockScope::Tipset(hash);
        }

        BlockScope::Range {
            from: self
                .from_block
                .map_or(0, |block| to_real_block_number(block, head)),
            to: self
                .to_block
                .map_or(head, |block| to_real_block_number(block, head)),
        }
    }

    /// Decides whether `record` satisfies the spec, with `latest` resolved to `head`.
    pub fn matches(&self, record: &LogRecord, head: u64) -> bool {
        match self.scope(head) {
            BlockScope::Tipset(hash) => {
                if record.block_hash != hash {
                    return false;
                }
            }
            BlockScope::Range { from, to } => {
                if record.block_height < from || record.block_height > to {
                    return false;
                }
            }
        }

        if !self.addresses.is_empty() && !self.addresses.contains(&record.address) {
            return false;
        }

        self.topics
            .iter()
            .enumerate()
            .filter(|(_, accepted)| !accepted.is_empty())
            .all(|(position, accepted)| {
                record
                    .topics
                    .get(position)
                    .map_or(false, |topic| accepted.contains(topic))
            })
    }
}

#[cfg(test)]
mod tests {
    use maplit::hashset;

    use super::*;
    use crate::testing::LogBuilder;

    #[test]
    fn test_block_param_parses_sentinels_and_quantities() {
        assert_eq!(BlockParam::Earliest, "earliest".parse().unwrap());
        assert_eq!(BlockParam::Latest, "latest".parse().unwrap());
        assert_eq!(BlockParam::Pending, "pending".parse().unwrap());
        assert_eq!(BlockParam::Number(16), "0x10".parse().unwrap());
        assert!(matches!(
            "finalized".parse::<BlockParam>(),
            Err(FilterError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_validate_rejects_block_hash_with_range() {
        let spec = FilterSpec::new()
            .block_hash(H256::repeat_byte(0x1))
            .from_block(BlockParam::Number(1));

        assert!(matches!(spec.validate(), Err(FilterError::InvalidSpec(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let spec = FilterSpec::new()
            .from_block(BlockParam::Number(10))
            .to_block(BlockParam::Number(5));

        assert!(matches!(spec.validate(), Err(FilterError::InvalidSpec(_))));
    }

    #[test]
    fn test_validate_rejects_range_ending_at_earliest() {
        let spec = FilterSpec::new()
            .from_block(BlockParam::Number(5))
            .to_block(BlockParam::Earliest);

        assert!(matches!(spec.validate(), Err(FilterError::InvalidSpec(_))));
    }

    #[test]
    fn test_validate_accepts_range_with_sentinels() {
        let spec = FilterSpec::new()
            .from_block(BlockParam::Number(10))
            .to_block(BlockParam::Latest);
        assert!(spec.validate().is_ok());

        let spec = FilterSpec::new()
            .from_block(BlockParam::Earliest)
            .to_block(BlockParam::Number(0));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_scope_defaults_to_genesis_through_head() {
        assert_eq!(
            BlockScope::Range { from: 0, to: 42 },
            FilterSpec::new().scope(42)
        );
    }

    #[test]
    fn test_empty_spec_matches_everything() {
        let spec = FilterSpec::new();

        assert!(spec.is_catch_all());
        assert!(spec.matches(&LogBuilder::new().set_block(7).build(), 7));
    }

    #[test]
    fn test_range_is_inclusive_on_both_ends() {
        let spec = FilterSpec::new()
            .from_block(BlockParam::Number(5))
            .to_block(BlockParam::Number(10));

        assert!(!spec.matches(&LogBuilder::new().set_block(4).build(), 20));
        assert!(spec.matches(&LogBuilder::new().set_block(5).build(), 20));
        assert!(spec.matches(&LogBuilder::new().set_block(10).build(), 20));
        assert!(!spec.matches(&LogBuilder::new().set_block(11).build(), 20));
    }

    #[test]
    fn test_from_latest_rejects_blocks_below_head() {
        let spec = FilterSpec::new().from_block(BlockParam::Latest);

        assert!(!spec.matches(&LogBuilder::new().set_block(9).build(), 10));
        assert!(spec.matches(&LogBuilder::new().set_block(10).build(), 10));
    }

    #[test]
    fn test_block_hash_pins_the_tipset() {
        let hash = H256::repeat_byte(0xab);
        let spec = FilterSpec::new().block_hash(hash);

        assert!(spec.matches(&LogBuilder::new().set_block_hash(hash).build(), 100));
        assert!(!spec.matches(
            &LogBuilder::new()
                .set_block_hash(H256::repeat_byte(0xcd))
                .build(),
            100
        ));
    }

    #[test]
    fn test_address_set_is_an_or() {
        let spec = FilterSpec::new().addresses(hashset! {
            Address::repeat_byte(0x1),
            Address::repeat_byte(0x2),
        });

        assert!(spec.matches(
            &LogBuilder::new()
                .set_address(Address::repeat_byte(0x1))
                .build(),
            0
        ));
        assert!(spec.matches(
            &LogBuilder::new()
                .set_address(Address::repeat_byte(0x2))
                .build(),
            0
        ));
        assert!(!spec.matches(
            &LogBuilder::new()
                .set_address(Address::repeat_byte(0x3))
                .build(),
            0
        ));
    }

    #[test]
    fn test_topics_are_and_across_positions_and_or_within() {
        let a = H256::repeat_byte(0xa);
        let b = H256::repeat_byte(0xb);
        let c = H256::repeat_byte(0xc);
        let spec = FilterSpec::new().topic(0, hashset! {a}).topic(1, hashset! {b, c});

        assert!(spec.matches(&LogBuilder::new().set_topics(vec![a, b]).build(), 0));
        assert!(spec.matches(&LogBuilder::new().set_topics(vec![a, c, b]).build(), 0));
        assert!(!spec.matches(&LogBuilder::new().set_topics(vec![b, b]).build(), 0));
        assert!(!spec.matches(&LogBuilder::new().set_topics(vec![a, a]).build(), 0));
    }

    #[test]
    fn test_wildcard_position_accepts_any_topic() {
        let b = H256::repeat_byte(0xb);
        let spec = FilterSpec::new().topic(1, hashset! {b});

        assert!(spec.matches(
            &LogBuilder::new()
                .set_topics(vec![H256::repeat_byte(0x1), b])
                .build(),
            0
        ));
        assert!(spec.matches(
            &LogBuilder::new()
                .set_topics(vec![H256::repeat_byte(0x2), b])
                .build(),
            0
        ));
    }

    #[test]
    fn test_constrained_position_beyond_record_topics_rejects() {
        let spec = FilterSpec::new().topic(2, hashset! {H256::repeat_byte(0x1)});

        assert!(!spec.matches(
            &LogBuilder::new()
                .set_topics(vec![H256::repeat_byte(0x1), H256::repeat_byte(0x1)])
                .build(),
            0
        ));
    }

    #[test]
    fn test_matching_is_deterministic() {
        let spec = FilterSpec::new()
            .from_block(BlockParam::Number(1))
            .topic(0, hashset! {H256::repeat_byte(0x1)});
        let log = LogBuilder::new()
            .set_block(3)
            .set_topics(vec![H256::repeat_byte(0x1)])
            .build();

        let first = spec.matches(&log, 3);
        for _ in 0..10 {
            assert_eq!(first, spec.matches(&log, 3));
        }
    }
}
