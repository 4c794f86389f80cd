use jsonrpc_derive::rpc;

use crate::{
    api::{EthFilterChanges, EthFilterSpec, Log},
    namespaces::RpcResult,
    types::U256,
};

/// The `eth_` filter methods.
#[rpc(server)]
pub trait EthFilterNamespaceT {
    /// Installs a log filter; an empty filter object installs a catch-all filter.
    #[rpc(name = "eth_newFilter")]
    fn new_filter(&self, filter: EthFilterSpec) -> RpcResult<U256>;

    #[rpc(name = "eth_newBlockFilter")]
    fn new_block_filter(&self) -> RpcResult<U256>;

    #[rpc(name = "eth_newPendingTransactionFilter")]
    fn new_pending_transaction_filter(&self) -> RpcResult<U256>;

    #[rpc(name = "eth_uninstallFilter")]
    fn uninstall_filter(&self, id: U256) -> RpcResult<bool>;

    #[rpc(name = "eth_getFilterChanges")]
    fn get_filter_changes(&self, id: U256) -> RpcResult<EthFilterChanges>;

    #[rpc(name = "eth_getFilterLogs")]
    fn get_filter_logs(&self, id: U256) -> RpcResult<Vec<Log>>;

    #[rpc(name = "eth_getLogs")]
    fn get_logs(&self, filter: EthFilterSpec) -> RpcResult<Vec<Log>>;
}
