//! Durable index of every log record seen, answering historic queries.
//!
//! Records live in a sqlite database. Every applied tipset is written in a single transaction,
//! so a query (a single statement) never sees part of a tipset. Reverts only flag rows: a
//! reverted tipset that is applied again is simply unflagged.

use std::{path::Path, str::FromStr};

use ethereum_types::H256;
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
    QueryBuilder, Row, Sqlite,
};

use crate::{
    error::FilterError,
    filters::{BlockScope, FilterSpec},
    types::{LogRecord, Tipset, TipsetRef},
    utils::{address_from_bytes, h256_from_bytes},
};

type Result<T> = std::result::Result<T, FilterError>;

const LOG_COLUMNS: &str = "tipset_key, height, address, topic_1, topic_2, topic_3, topic_4, \
                           data, tx_hash, tx_index, log_index, reverted";

/// Bounds applied to historic queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Maximum number of heights a range query may span, `0` for no limit.
    pub max_height_range: u64,
    /// Maximum number of records a query may return, `0` for no limit.
    pub max_results: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_height_range: 2880,
            max_results: 10_000,
        }
    }
}

/// The historic log index.
#[derive(Debug, Clone)]
pub struct EventIndex {
    pool: SqlitePool,
    limits: QueryLimits,
}

impl EventIndex {
    /// Opens (creating if missing) the index stored at `path`, or a private in-memory index
    /// when no path is given.
    pub async fn open(path: Option<&Path>, limits: QueryLimits) -> Result<Self> {
        let pool = match path {
            Some(path) => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal);
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await?
            }
            None => {
                // Every connection to `:memory:` is a separate database, so the pool holds
                // exactly one connection for its whole lifetime.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await?
            }
        };

        Self::create_if_not_exists(&pool).await?;
        tracing::info!(
            "opened event index at {}",
            path.map_or_else(|| String::from("memory"), |p| p.display().to_string())
        );

        Ok(Self { pool, limits })
    }

    /// Opens a private in-memory index.
    pub async fn in_memory() -> Result<Self> {
        Self::open(None, QueryLimits::default()).await
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    async fn create_if_not_exists(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS tipsets (
                id INTEGER PRIMARY KEY,
                tipset_key BLOB NOT NULL,
                height INTEGER NOT NULL,
                parent_key BLOB NOT NULL,
                reverted INTEGER DEFAULT 0 NOT NULL,
                UNIQUE (
                    tipset_key
                )
            );
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY,
                tipset_key BLOB NOT NULL,
                height INTEGER NOT NULL,
                address BLOB NOT NULL,
                topic_1 BLOB,
                topic_2 BLOB,
                topic_3 BLOB,
                topic_4 BLOB,
                data BLOB NOT NULL,
                tx_hash BLOB NOT NULL,
                tx_index INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                reverted INTEGER DEFAULT 0 NOT NULL,
                UNIQUE (
                    tipset_key,
                    tx_index,
                    log_index
                )
            );
            CREATE INDEX IF NOT EXISTS tipset_height_idx ON tipsets (
                height,
                reverted
            );
            CREATE INDEX IF NOT EXISTS height_idx ON logs (
                height,
                address
            );
            CREATE INDEX IF NOT EXISTS address_idx ON logs (
                address,
                height
            );
            CREATE INDEX IF NOT EXISTS topic_1_idx ON logs (
                topic_1,
                height
            );
            CREATE INDEX IF NOT EXISTS topic_2_idx ON logs (
                topic_2,
                height
            );
            CREATE INDEX IF NOT EXISTS topic_3_idx ON logs (
                topic_3,
                height
            );
            CREATE INDEX IF NOT EXISTS topic_4_idx ON logs (
                topic_4,
                height
            );
            CREATE INDEX IF NOT EXISTS tipset_key_idx ON logs (
                tipset_key
            );
            COMMIT;",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Records an applied tipset and its log records. Either everything becomes visible or
    /// nothing does.
    pub async fn append(&self, tipset: &Tipset, records: &[LogRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO tipsets (tipset_key, height, parent_key, reverted) VALUES (?, ?, ?, 0)
            ON CONFLICT (tipset_key) DO UPDATE SET reverted = 0",
        )
        .bind(tipset.key.as_bytes())
        .bind(tipset.height as i64)
        .bind(tipset.parent.as_bytes())
        .execute(&mut *tx)
        .await?;

        for record in records {
            let topic = |position: usize| record.topics.get(position).map(|t| t.as_bytes());
            sqlx::query(
                "INSERT INTO logs (tipset_key, height, address, topic_1, topic_2, topic_3, topic_4,
                    data, tx_hash, tx_index, log_index, reverted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
                ON CONFLICT (tipset_key, tx_index, log_index) DO UPDATE SET reverted = 0",
            )
            .bind(record.block_hash.as_bytes())
            .bind(record.block_height as i64)
            .bind(record.address.as_bytes())
            .bind(topic(0))
            .bind(topic(1))
            .bind(topic(2))
            .bind(topic(3))
            .bind(record.data.as_slice())
            .bind(record.tx_hash.as_bytes())
            .bind(record.tx_index as i64)
            .bind(record.log_index as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::trace!(
            height = tipset.height,
            records = records.len(),
            "indexed tipset {:#x}",
            tipset.key
        );
        Ok(())
    }

    /// Flags the tipset with `key` and its records as reverted. Returns the affected records,
    /// marked `removed`, in their original order.
    pub async fn mark_reverted(&self, key: H256) -> Result<Vec<LogRecord>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM logs WHERE tipset_key = ? AND reverted = 0
            ORDER BY tx_index ASC, log_index ASC"
        ))
        .bind(key.as_bytes())
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("UPDATE tipsets SET reverted = 1 WHERE tipset_key = ?")
            .bind(key.as_bytes())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE logs SET reverted = 1 WHERE tipset_key = ?")
            .bind(key.as_bytes())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        rows.iter()
            .map(|row| record_from_row(row).map(|record| record.retracted()))
            .collect()
    }

    /// Returns every non-reverted record matching `spec`, ordered by height, transaction
    /// index and log index. `latest` resolves to `head`.
    pub async fn query(&self, spec: &FilterSpec, head: u64) -> Result<Vec<LogRecord>> {
        self.query_records(spec, head, false).await
    }

    /// Like [EventIndex::query] but including reverted records, which come back `removed`.
    pub async fn query_including_reverted(
        &self,
        spec: &FilterSpec,
        head: u64,
    ) -> Result<Vec<LogRecord>> {
        self.query_records(spec, head, true).await
    }

    async fn query_records(
        &self,
        spec: &FilterSpec,
        head: u64,
        include_reverted: bool,
    ) -> Result<Vec<LogRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {LOG_COLUMNS} FROM logs WHERE "));

        match spec.scope(head) {
            BlockScope::Tipset(key) => {
                builder.push("tipset_key = ");
                builder.push_bind(key.as_bytes().to_vec());
            }
            BlockScope::Range { from, to } => {
                if to < from {
                    return Ok(vec![]);
                }
                if self.limits.max_height_range > 0 && to - from > self.limits.max_height_range {
                    return Err(FilterError::InvalidSpec(format!(
                        "block range {from:#x}..{to:#x} exceeds the maximum of {} heights",
                        self.limits.max_height_range
                    )));
                }
                builder.push("height BETWEEN ");
                let mut height = builder.separated(" AND ");
                height.push_bind(from as i64);
                height.push_bind(to as i64);
            }
        }

        if !include_reverted {
            builder.push(" AND reverted = 0");
        }

        if !spec.addresses.is_empty() {
            builder.push(" AND address IN (");
            let mut addresses = builder.separated(", ");
            for address in &spec.addresses {
                addresses.push_bind(address.as_bytes().to_vec());
            }
            builder.push(")");
        }

        for (position, accepted) in spec.topics.iter().enumerate() {
            if accepted.is_empty() {
                continue;
            }
            builder.push(format!(" AND topic_{} IN (", position + 1));
            let mut topics = builder.separated(", ");
            for topic in accepted {
                topics.push_bind(topic.as_bytes().to_vec());
            }
            builder.push(")");
        }

        builder.push(" ORDER BY height ASC, tx_index ASC, log_index ASC");
        let max_results = self.limits.max_results;
        if max_results > 0 {
            builder.push(" LIMIT ");
            builder.push_bind(max_results as i64 + 1);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        if max_results > 0 && rows.len() > max_results {
            return Err(FilterError::TooManyResults(max_results));
        }

        rows.iter().map(record_from_row).collect()
    }

    /// The tipset indexed under `key`, reverted or not.
    pub async fn tipset(&self, key: H256) -> Result<Option<TipsetRef>> {
        let row = sqlx::query("SELECT tipset_key, height FROM tipsets WHERE tipset_key = ?")
            .bind(key.as_bytes())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(tipset_ref_from_row).transpose()
    }

    /// The highest non-reverted tipset, if any.
    pub async fn latest_canonical(&self) -> Result<Option<TipsetRef>> {
        let row = sqlx::query(
            "SELECT tipset_key, height FROM tipsets WHERE reverted = 0
            ORDER BY height DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tipset_ref_from_row).transpose()
    }

    /// Non-reverted tipsets with heights in `from..=to`, highest first.
    pub async fn canonical_tipsets_between(&self, from: u64, to: u64) -> Result<Vec<Tipset>> {
        let rows = sqlx::query(
            "SELECT tipset_key, height, parent_key FROM tipsets
            WHERE height BETWEEN ? AND ? AND reverted = 0 ORDER BY height DESC",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let tipset = tipset_ref_from_row(row)?;
                Ok(Tipset {
                    height: tipset.height,
                    key: tipset.key,
                    parent: h256_column(row, "parent_key")?,
                    messages: vec![],
                })
            })
            .collect()
    }

    /// Closes every connection. Queries issued afterwards fail with `IndexUnavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("closed event index");
    }
}

fn h256_column(row: &SqliteRow, column: &str) -> Result<H256> {
    let bytes: Vec<u8> = row.try_get(column)?;
    h256_from_bytes(&bytes)
        .ok_or_else(|| FilterError::IndexUnavailable(format!("corrupt {column} column")))
}

fn tipset_ref_from_row(row: &SqliteRow) -> Result<TipsetRef> {
    Ok(TipsetRef {
        height: row.try_get::<i64, _>("height")? as u64,
        key: h256_column(row, "tipset_key")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<LogRecord> {
    let address: Vec<u8> = row.try_get("address")?;
    let mut topics = Vec::new();
    for column in ["topic_1", "topic_2", "topic_3", "topic_4"] {
        let topic: Option<Vec<u8>> = row.try_get(column)?;
        match topic {
            Some(bytes) => topics.push(h256_from_bytes(&bytes).ok_or_else(|| {
                FilterError::IndexUnavailable(format!("corrupt {column} column"))
            })?),
            None => break,
        }
    }

    Ok(LogRecord {
        address: address_from_bytes(&address)
            .ok_or_else(|| FilterError::IndexUnavailable(String::from("corrupt address column")))?,
        topics,
        data: row.try_get("data")?,
        block_height: row.try_get::<i64, _>("height")? as u64,
        block_hash: h256_column(row, "tipset_key")?,
        tx_hash: h256_column(row, "tx_hash")?,
        tx_index: row.try_get::<i64, _>("tx_index")? as u64,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        removed: row.try_get::<i64, _>("reverted")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use maplit::hashset;
    use tempdir::TempDir;

    use super::*;
    use crate::{
        filters::BlockParam,
        testing::{LogBuilder, TipsetBuilder},
        types::Address,
    };

    /// Indexes one tipset per height `1..=heights`, each with `per_tipset` records.
    async fn populate(index: &EventIndex, heights: u64, per_tipset: u64) -> Vec<Tipset> {
        let mut tipsets = vec![];
        let mut parent = TipsetBuilder::new(0).build();
        for height in 1..=heights {
            let tipset = TipsetBuilder::new(height).parent(&parent).build();
            let records: Vec<_> = (0..per_tipset)
                .map(|i| {
                    LogBuilder::new()
                        .set_tipset(&tipset)
                        .set_address(Address::from_low_u64_be(i + 1))
                        .set_topics(vec![H256::from_low_u64_be(height)])
                        .set_tx(H256::from_low_u64_be(height * 100 + i), i)
                        .set_log_index(i)
                        .build()
                })
                .collect();
            index
                .append(&tipset, &records)
                .await
                .expect("failed appending");
            parent = tipset.clone();
            tipsets.push(tipset);
        }
        tipsets
    }

    #[tokio::test]
    async fn test_query_returns_records_in_chain_order() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        populate(&index, 3, 2).await;

        let records = index
            .query(&FilterSpec::new(), 3)
            .await
            .expect("failed querying");

        assert_eq!(
            vec![(1, 0), (1, 1), (2, 0), (2, 1), (3, 0), (3, 1)],
            records
                .iter()
                .map(|r| (r.block_height, r.log_index))
                .collect::<Vec<_>>()
        );
        assert!(records.iter().all(|r| !r.removed));
    }

    #[tokio::test]
    async fn test_query_round_trips_record_fields() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        let tipset = TipsetBuilder::new(7).build();
        let record = LogBuilder::new()
            .set_tipset(&tipset)
            .set_address(Address::repeat_byte(0x42))
            .set_topics(vec![H256::repeat_byte(0x1), H256::repeat_byte(0x2)])
            .set_data(vec![0xca, 0xfe])
            .set_tx(H256::repeat_byte(0x9), 3)
            .set_log_index(5)
            .build();
        index
            .append(&tipset, &[record.clone()])
            .await
            .expect("failed appending");

        let records = index
            .query(&FilterSpec::new(), 7)
            .await
            .expect("failed querying");

        assert_eq!(vec![record], records);
    }

    #[tokio::test]
    async fn test_query_filters_by_range_address_and_topics() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        populate(&index, 5, 3).await;

        let by_range = index
            .query(
                &FilterSpec::new()
                    .from_block(BlockParam::Number(2))
                    .to_block(BlockParam::Number(3)),
                5,
            )
            .await
            .expect("failed querying");
        assert_eq!(6, by_range.len());
        assert!(by_range
            .iter()
            .all(|r| (2..=3).contains(&r.block_height)));

        let by_address = index
            .query(
                &FilterSpec::new().addresses(hashset! {Address::from_low_u64_be(2)}),
                5,
            )
            .await
            .expect("failed querying");
        assert_eq!(5, by_address.len());
        assert!(by_address
            .iter()
            .all(|r| r.address == Address::from_low_u64_be(2)));

        let by_topic = index
            .query(
                &FilterSpec::new().topic(
                    0,
                    hashset! {H256::from_low_u64_be(1), H256::from_low_u64_be(4)},
                ),
                5,
            )
            .await
            .expect("failed querying");
        assert_eq!(
            vec![1, 1, 1, 4, 4, 4],
            by_topic.iter().map(|r| r.block_height).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_query_constrained_topic_excludes_records_without_that_position() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        populate(&index, 2, 1).await;

        let records = index
            .query(&FilterSpec::new().topic(1, hashset! {H256::zero()}), 2)
            .await
            .expect("failed querying");

        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_query_by_block_hash() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        let tipsets = populate(&index, 3, 2).await;

        let records = index
            .query(&FilterSpec::new().block_hash(tipsets[1].key), 3)
            .await
            .expect("failed querying");

        assert_eq!(2, records.len());
        assert!(records.iter().all(|r| r.block_hash == tipsets[1].key));
    }

    #[tokio::test]
    async fn test_query_partitions_are_consistent_with_the_full_range() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        populate(&index, 9, 2).await;

        let full = index
            .query(&FilterSpec::new().from_block(BlockParam::Earliest), 9)
            .await
            .expect("failed querying");
        let mut partitioned = vec![];
        for (from, to) in [(0, 3), (4, 6), (7, 9)] {
            partitioned.extend(
                index
                    .query(
                        &FilterSpec::new()
                            .from_block(BlockParam::Number(from))
                            .to_block(BlockParam::Number(to)),
                        9,
                    )
                    .await
                    .expect("failed querying"),
            );
        }

        assert_eq!(full, partitioned);
    }

    #[tokio::test]
    async fn test_query_range_after_the_head_is_empty() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        populate(&index, 3, 1).await;

        let records = index
            .query(
                &FilterSpec::new()
                    .from_block(BlockParam::Number(10))
                    .to_block(BlockParam::Latest),
                3,
            )
            .await
            .expect("failed querying");

        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_mark_reverted_hides_records_from_queries() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        let tipsets = populate(&index, 3, 2).await;

        let retracted = index
            .mark_reverted(tipsets[2].key)
            .await
            .expect("failed reverting");

        assert_eq!(2, retracted.len());
        assert!(retracted
            .iter()
            .all(|r| r.removed && r.block_hash == tipsets[2].key));

        let visible = index
            .query(&FilterSpec::new(), 3)
            .await
            .expect("failed querying");
        assert_eq!(4, visible.len());
        assert!(visible.iter().all(|r| r.block_height < 3));

        let audited = index
            .query_including_reverted(&FilterSpec::new(), 3)
            .await
            .expect("failed querying");
        assert_eq!(6, audited.len());
        assert_eq!(2, audited.iter().filter(|r| r.removed).count());

        assert_eq!(
            Some(tipsets[1].tipset_ref()),
            index.latest_canonical().await.expect("failed reading")
        );
        assert_eq!(
            Some(tipsets[2].tipset_ref()),
            index.tipset(tipsets[2].key).await.expect("failed reading")
        );
        assert_eq!(
            None,
            index
                .tipset(H256::repeat_byte(0xab))
                .await
                .expect("failed reading")
        );
    }

    #[tokio::test]
    async fn test_reapplying_a_reverted_tipset_restores_its_records() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        let tipset = TipsetBuilder::new(1).build();
        let record = LogBuilder::new().set_tipset(&tipset).build();
        index
            .append(&tipset, &[record.clone()])
            .await
            .expect("failed appending");
        index
            .mark_reverted(tipset.key)
            .await
            .expect("failed reverting");

        index
            .append(&tipset, &[record.clone()])
            .await
            .expect("failed appending");

        assert_eq!(
            vec![record],
            index
                .query(&FilterSpec::new(), 1)
                .await
                .expect("failed querying")
        );
    }

    #[tokio::test]
    async fn test_query_rejects_ranges_wider_than_the_limit() {
        let index = EventIndex::open(
            None,
            QueryLimits {
                max_height_range: 10,
                max_results: 0,
            },
        )
        .await
        .expect("failed opening index");

        let result = index
            .query(&FilterSpec::new().from_block(BlockParam::Earliest), 100)
            .await;

        assert!(matches!(result, Err(FilterError::InvalidSpec(_))));
    }

    #[tokio::test]
    async fn test_query_rejects_more_results_than_the_limit() {
        let index = EventIndex::open(
            None,
            QueryLimits {
                max_height_range: 0,
                max_results: 3,
            },
        )
        .await
        .expect("failed opening index");
        populate(&index, 2, 2).await;

        let result = index.query(&FilterSpec::new(), 2).await;

        assert_eq!(Err(FilterError::TooManyResults(3)), result);
    }

    #[tokio::test]
    async fn test_canonical_tipsets_between_is_highest_first() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        let tipsets = populate(&index, 4, 0).await;

        let between = index
            .canonical_tipsets_between(2, 3)
            .await
            .expect("failed reading");

        assert_eq!(
            vec![tipsets[2].key, tipsets[1].key],
            between.iter().map(|t| t.key).collect::<Vec<_>>()
        );
        assert_eq!(tipsets[1].parent, between[1].parent);
    }

    #[tokio::test]
    async fn test_index_persists_across_reopen() {
        let dir = TempDir::new("event_index").expect("failed creating temp dir");
        let path = dir.path().join("events.db");

        let index = EventIndex::open(Some(&path), QueryLimits::default())
            .await
            .expect("failed opening index");
        populate(&index, 2, 1).await;
        index.close().await;

        let index = EventIndex::open(Some(&path), QueryLimits::default())
            .await
            .expect("failed opening index");
        let records = index
            .query(&FilterSpec::new(), 2)
            .await
            .expect("failed querying");

        assert_eq!(2, records.len());
        assert_eq!(
            Some(2),
            index
                .latest_canonical()
                .await
                .expect("failed reading")
                .map(|t| t.height)
        );
    }

    #[tokio::test]
    async fn test_closed_index_reports_unavailable() {
        let index = EventIndex::in_memory().await.expect("failed opening index");
        index.close().await;

        let result = index.query(&FilterSpec::new(), 0).await;

        assert!(matches!(result, Err(FilterError::IndexUnavailable(_))));
    }
}
