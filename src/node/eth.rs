use crate::{
    api::{EthFilterChanges, EthFilterSpec, Log},
    filters::{FilterKind, FilterSpec},
    namespaces::{EthFilterNamespaceT, RpcResult},
    node::EventFilterNode,
    types::U256,
    utils::IntoBoxedFuture,
};

impl EthFilterNamespaceT for EventFilterNode {
    /// Creates a filter object, based on filter options, to notify when the state changes (logs).
    ///
    /// # Arguments
    ///
    /// * `filter`: The filter options -
    ///     fromBlock   - Integer block number, or the string "latest", "earliest" or "pending".
    ///     toBlock     - Integer block number, or the string "latest", "earliest" or "pending".
    ///     address     - Contract address or a list of addresses from which the logs should originate.
    ///     topics      - [H256] topics. Topics are order-dependent. Each topic can also be an array with "or" options.
    ///     blockHash   - Restricts the filter to a single block. Excludes fromBlock and toBlock.
    ///
    /// An empty filter object installs a catch-all filter.
    fn new_filter(&self, filter: EthFilterSpec) -> RpcResult<U256> {
        let kind = match FilterSpec::try_from(filter) {
            Ok(spec) if spec.is_catch_all() => FilterKind::CatchAll,
            Ok(spec) => FilterKind::Log(Box::new(spec)),
            Err(err) => return Err(err.into()).into_boxed_future(),
        };

        self.install_filter(kind)
            .map_err(Into::into)
            .into_boxed_future()
    }

    fn new_block_filter(&self) -> RpcResult<U256> {
        self.install_filter(FilterKind::Block)
            .map_err(Into::into)
            .into_boxed_future()
    }

    fn new_pending_transaction_filter(&self) -> RpcResult<U256> {
        self.install_filter(FilterKind::PendingTransaction)
            .map_err(Into::into)
            .into_boxed_future()
    }

    fn uninstall_filter(&self, id: U256) -> RpcResult<bool> {
        EventFilterNode::uninstall_filter(self, id)
            .map_err(Into::into)
            .into_boxed_future()
    }

    /// Polling method for a filter, which returns an array of logs, block hashes or
    /// transaction hashes which occurred since last poll.
    fn get_filter_changes(&self, id: U256) -> RpcResult<EthFilterChanges> {
        self.poll_filter(id)
            .map(EthFilterChanges::from)
            .map_err(Into::into)
            .into_boxed_future()
    }

    /// Returns an array of all logs matching the filter with the given id.
    fn get_filter_logs(&self, id: U256) -> RpcResult<Vec<Log>> {
        let node = self.clone();
        Box::pin(async move {
            let records = node.filter_logs(id).await?;
            Ok(records.into_iter().map(Log::from).collect())
        })
    }

    /// Returns an array of all logs matching a given filter.
    fn get_logs(&self, filter: EthFilterSpec) -> RpcResult<Vec<Log>> {
        let node = self.clone();
        Box::pin(async move {
            let spec = FilterSpec::try_from(filter)?;
            let records = node.query_logs(&spec).await?;
            Ok(records.into_iter().map(Log::from).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use jsonrpc_core::ErrorCode;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        api::ValueOrArray,
        config::NodeConfig,
        error::FilterError,
        filters::BlockParam,
        node::tests::{start_node, wait_for_height, WAIT},
        testing::{event_one_data, event_one_data_topic, event_one_data_value, evm_event, receipt},
        types::{Address, H256},
    };

    fn topic_filter(from_block: u64, to_block: Option<u64>, topic: H256) -> EthFilterSpec {
        EthFilterSpec {
            from_block: Some(BlockParam::Number(from_block)),
            to_block: to_block.map(BlockParam::Number),
            topics: Some(vec![Some(ValueOrArray::Value(topic))]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_filter_returns_distinct_ids() {
        let (_chain, node, _handle) = start_node(NodeConfig::default()).await;

        let first = node
            .new_filter(topic_filter(0, None, H256::repeat_byte(0x1)))
            .await
            .expect("failed creating filter");
        let second = node
            .new_filter(topic_filter(0, None, H256::repeat_byte(0x1)))
            .await
            .expect("failed creating filter");
        let block = node
            .new_block_filter()
            .await
            .expect("failed creating filter");

        assert_ne!(first, second);
        assert_ne!(second, block);
    }

    #[tokio::test]
    async fn test_new_filter_with_empty_spec_installs_catch_all() {
        let (_chain, node, _handle) = start_node(NodeConfig::default()).await;

        let id = node
            .new_filter(EthFilterSpec::default())
            .await
            .expect("failed creating filter");

        let info = node.filters().lookup(id).expect("filter not installed");
        assert_eq!(FilterKind::CatchAll, info.kind);
    }

    #[tokio::test]
    async fn test_new_filter_rejects_block_hash_with_range() {
        let (_chain, node, _handle) = start_node(NodeConfig::default()).await;

        let err = node
            .new_filter(EthFilterSpec {
                from_block: Some(BlockParam::Earliest),
                block_hash: Some(H256::repeat_byte(0x1)),
                ..Default::default()
            })
            .await
            .expect_err("filter should be rejected");

        assert_eq!(ErrorCode::InvalidParams, err.code);
    }

    #[tokio::test]
    async fn test_uninstall_filter_returns_true_only_once() {
        let (_chain, node, _handle) = start_node(NodeConfig::default()).await;
        let id = node
            .new_block_filter()
            .await
            .expect("failed creating filter");

        assert!(EthFilterNamespaceT::uninstall_filter(&node, id)
            .await
            .expect("failed uninstalling filter"));
        assert!(!EthFilterNamespaceT::uninstall_filter(&node, id)
            .await
            .expect("failed uninstalling filter"));
    }

    #[tokio::test]
    async fn test_get_filter_changes_returns_error_for_unknown_id() {
        let (_chain, node, _handle) = start_node(NodeConfig::default()).await;

        let err = node
            .get_filter_changes(U256::from(42))
            .await
            .expect_err("unknown filter should fail");

        assert_eq!(ErrorCode::InvalidParams, err.code);
        assert_eq!(FilterError::NotFound.to_string(), err.message);
    }

    #[tokio::test]
    async fn test_get_filter_changes_returns_block_hash_updates_only_once() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        let id = node
            .new_block_filter()
            .await
            .expect("failed creating filter");

        let mined = chain.mine_empty(2);
        wait_for_height(&handle, 2).await;

        assert_eq!(
            EthFilterChanges::Hashes(mined.iter().map(|tipset| tipset.key).collect()),
            node.get_filter_changes(id).await.expect("failed polling")
        );
        assert_eq!(
            EthFilterChanges::Hashes(vec![]),
            node.get_filter_changes(id).await.expect("failed polling")
        );
    }

    #[tokio::test]
    async fn test_event_one_data_from_two_contracts() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        let id = node
            .new_filter(topic_filter(0, None, event_one_data_topic()))
            .await
            .expect("failed creating filter");

        let first = Address::repeat_byte(0xa1);
        let second = Address::repeat_byte(0xa2);
        chain.mine(vec![receipt(
            H256::repeat_byte(0x1),
            0,
            vec![event_one_data(first, 23)],
        )]);
        chain.mine_empty(1);
        chain.mine(vec![receipt(
            H256::repeat_byte(0x2),
            0,
            vec![event_one_data(second, 44)],
        )]);
        wait_for_height(&handle, 3).await;

        let EthFilterChanges::Logs(logs) = node.get_filter_changes(id).await.expect("failed polling")
        else {
            panic!("expected logs");
        };
        assert_eq!(2, logs.len());
        assert!(logs[0].block_number < logs[1].block_number);
        assert_eq!(first, logs[0].address);
        assert_eq!(U256::from(23), event_one_data_value(&logs[0].data.0));
        assert_eq!(second, logs[1].address);
        assert_eq!(U256::from(44), event_one_data_value(&logs[1].data.0));
    }

    #[tokio::test]
    async fn test_pending_transaction_filter_receives_every_mined_transaction() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        let id = node
            .new_pending_transaction_filter()
            .await
            .expect("failed creating filter");

        let submitted: Vec<_> = (1..=100u64).map(H256::from_low_u64_be).collect();
        for batch in submitted.chunks(30) {
            chain.mine(
                batch
                    .iter()
                    .enumerate()
                    .map(|(index, hash)| receipt(*hash, index as u64, vec![]))
                    .collect(),
            );
        }
        wait_for_height(&handle, 4).await;

        let EthFilterChanges::Hashes(hashes) =
            node.get_filter_changes(id).await.expect("failed polling")
        else {
            panic!("expected hashes");
        };
        assert_eq!(100, hashes.len());
        assert_eq!(
            submitted.into_iter().collect::<HashSet<_>>(),
            hashes.into_iter().collect::<HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn test_catch_all_filter_returns_every_event() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        let id = node
            .new_filter(EthFilterSpec::default())
            .await
            .expect("failed creating filter");

        let emitter = Address::repeat_byte(0xc0);
        let events: Vec<_> = (1..=3u8)
            .map(|n| (vec![H256::repeat_byte(n), H256::repeat_byte(n + 0x10)], vec![n; 4]))
            .collect();
        chain.mine(vec![
            receipt(
                H256::repeat_byte(0x1),
                0,
                vec![
                    evm_event(emitter, events[0].0.clone(), events[0].1.clone()),
                    evm_event(emitter, events[1].0.clone(), events[1].1.clone()),
                ],
            ),
            receipt(
                H256::repeat_byte(0x2),
                1,
                vec![evm_event(emitter, events[2].0.clone(), events[2].1.clone())],
            ),
        ]);
        wait_for_height(&handle, 1).await;

        let EthFilterChanges::Logs(logs) = node.get_filter_changes(id).await.expect("failed polling")
        else {
            panic!("expected logs");
        };
        assert_eq!(3, logs.len());
        for (log, (topics, data)) in logs.iter().zip(events) {
            assert_eq!(emitter, log.address);
            assert_eq!(topics, log.topics);
            assert_eq!(data, log.data.0);
            assert!(!log.removed);
        }
    }

    #[tokio::test]
    async fn test_get_logs_is_consistent_across_partitions() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        let wanted = H256::repeat_byte(0xaa);
        let other = H256::repeat_byte(0xbb);
        let emitter = Address::repeat_byte(0x1);

        for height in 1..=9u8 {
            chain.mine(vec![receipt(
                H256::repeat_byte(height),
                0,
                vec![
                    evm_event(emitter, vec![wanted], vec![height]),
                    evm_event(emitter, vec![other], vec![height]),
                ],
            )]);
        }
        wait_for_height(&handle, 9).await;

        let heights = |logs: Vec<Log>| {
            logs.into_iter()
                .map(|log| log.block_number.as_u64())
                .collect::<Vec<_>>()
        };
        let all = node
            .get_logs(topic_filter(1, Some(9), wanted))
            .await
            .expect("failed querying");
        assert_eq!((1..=9).collect::<Vec<_>>(), heights(all));

        let middle = node
            .get_logs(topic_filter(4, Some(6), wanted))
            .await
            .expect("failed querying");
        assert_eq!(vec![4, 5, 6], heights(middle));

        let after = node
            .get_logs(topic_filter(10, Some(12), wanted))
            .await
            .expect("failed querying");
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_reverted_logs_are_retracted_once() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        let id = node
            .new_filter(EthFilterSpec::default())
            .await
            .expect("failed creating filter");

        chain.mine(vec![receipt(
            H256::repeat_byte(0x1),
            0,
            vec![event_one_data(Address::repeat_byte(0x1), 5)],
        )]);
        wait_for_height(&handle, 1).await;
        let replacement = chain.reorg(1, vec![vec![]]);
        timeout(WAIT, handle.wait_for_head(|head| head.key == replacement[0].key))
            .await
            .expect("timed out")
            .expect("reconciler exited");

        let EthFilterChanges::Logs(logs) = node.get_filter_changes(id).await.expect("failed polling")
        else {
            panic!("expected logs");
        };
        assert_eq!(vec![false, true], logs.iter().map(|log| log.removed).collect::<Vec<_>>());
        assert_eq!(logs[0].transaction_hash, logs[1].transaction_hash);
        assert_eq!(
            EthFilterChanges::Logs(vec![]),
            node.get_filter_changes(id).await.expect("failed polling")
        );

        let logs = node
            .get_logs(EthFilterSpec::default())
            .await
            .expect("failed querying");
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_get_filter_logs_replays_history() {
        let (chain, node, handle) = start_node(NodeConfig::default()).await;
        chain.mine(vec![receipt(
            H256::repeat_byte(0x1),
            0,
            vec![event_one_data(Address::repeat_byte(0x1), 1)],
        )]);
        wait_for_height(&handle, 1).await;

        let id = node
            .new_filter(topic_filter(0, None, event_one_data_topic()))
            .await
            .expect("failed creating filter");

        let logs = node.get_filter_logs(id).await.expect("failed querying");
        assert_eq!(1, logs.len());
        assert_eq!(
            EthFilterChanges::Logs(vec![]),
            node.get_filter_changes(id).await.expect("failed polling")
        );
    }

    #[tokio::test]
    async fn test_subscription_overflow_closes_the_stream() {
        let mut config = NodeConfig::default();
        config.filters.subscription_buffer = 2;
        let (chain, node, handle) = start_node(config).await;
        let mut subscription = node.subscribe("logs", None).expect("failed subscribing");

        chain.mine(vec![receipt(
            H256::repeat_byte(0x1),
            0,
            (1..=3)
                .map(|n| event_one_data(Address::repeat_byte(0x1), n))
                .collect(),
        )]);
        wait_for_height(&handle, 1).await;

        assert!(matches!(subscription.recv().await, Some(Ok(_))));
        assert!(matches!(subscription.recv().await, Some(Ok(_))));
        assert_eq!(Some(Err(FilterError::Overflow)), subscription.recv().await);
        assert_eq!(None, subscription.recv().await);
    }
}
