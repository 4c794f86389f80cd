use std::net::IpAddr;

use clap::{Parser, Subcommand};

use crate::observability::LogLevel;

#[derive(Debug, Parser, Clone)]
#[command(
    author = "Matter Labs",
    version,
    about = "Ethereum event filters and subscriptions over a followed chain.",
    long_about = "Eth Events Node\n\nServes eth_newFilter, eth_getFilterChanges and eth_getLogs for the chain of an upstream node."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file (default: $HOME/.eth_events_node/config.toml).
    #[arg(long, value_name = "PATH", help_heading = "General Options")]
    pub config: Option<String>,

    #[arg(long, help_heading = "Network Options")]
    /// Port to listen on (default: 8011).
    pub port: Option<u16>,

    /// The host the server will listen on (default: 127.0.0.1).
    #[arg(
        long,
        value_name = "IP_ADDR",
        env = "ETH_EVENTS_NODE_IP_ADDR",
        help_heading = "Network Options"
    )]
    pub host: Option<IpAddr>,

    // Logging Configuration
    #[arg(long, help_heading = "Logging Configuration")]
    /// Log level (default: info).
    pub log: Option<LogLevel>,

    #[arg(long, help_heading = "Logging Configuration")]
    /// Log file path (default: eth_events_node.log).
    pub log_file_path: Option<String>,

    // Filter Options
    #[arg(long, value_name = "SECONDS", help_heading = "Filter Options")]
    /// Evict filters not polled for this long (default: 86400).
    pub filter_ttl_secs: Option<u64>,

    #[arg(long, value_name = "NUM", help_heading = "Filter Options")]
    /// Maximum number of installed filters (default: 100).
    pub max_filters: Option<usize>,

    #[arg(long, value_name = "NUM", help_heading = "Filter Options")]
    /// Maximum number of results per filter or query (default: 10000).
    pub max_filter_results: Option<usize>,

    #[arg(long, value_name = "NUM", help_heading = "Filter Options")]
    /// Maximum number of heights a historic query may span (default: 2880).
    pub max_filter_height_range: Option<u64>,

    #[arg(long, help_heading = "Filter Options")]
    /// Disables eth_newFilter, eth_newBlockFilter, eth_newPendingTransactionFilter and eth_getFilterChanges.
    pub disable_realtime_filter_api: bool,

    #[arg(long, help_heading = "Filter Options")]
    /// Disables eth_getLogs and eth_getFilterLogs.
    pub disable_historic_filter_api: bool,

    // Index Options
    #[arg(long, value_name = "PATH", help_heading = "Index Options")]
    /// Sqlite file of the historic index (default: in memory).
    pub index_path: Option<String>,

    // Upstream Options
    #[arg(long, value_name = "URL", env = "ETH_EVENTS_NODE_UPSTREAM", help_heading = "Upstream Options")]
    /// JSON-RPC endpoint of the followed node (default: http://127.0.0.1:8545).
    pub upstream_url: Option<String>,

    #[arg(long, value_name = "MILLIS", help_heading = "Upstream Options")]
    /// Interval between head polls of the upstream node (default: 1000).
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Follows the upstream chain and serves the filter API.
    #[command(name = "run")]
    Run,
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use clap::Parser;

    use crate::config::cli::{Cli, Command};

    #[test]
    fn can_parse_run_without_options() {
        let args = Cli::parse_from(["eth_events_node", "run"]);

        assert!(matches!(args.command, Some(Command::Run)));
        assert_eq!(None, args.port);
        assert!(!args.disable_historic_filter_api);
    }

    #[test]
    fn can_parse_host() {
        let args = Cli::parse_from(["eth_events_node", "--host", "0.0.0.0"]);

        assert_eq!(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), args.host);
    }

    #[test]
    fn rejects_unknown_log_level() {
        let result = Cli::try_parse_from(["eth_events_node", "--log", "verbose"]);

        assert!(result.is_err());
    }
}
