use std::{env, fs::read_to_string, path::PathBuf};

use cli::Cli;
use filters::FiltersConfig;
use index::IndexConfig;
use log::LogConfig;
use node::NodeServerConfig;
use reconciler::ReconcilerConfig;
use serde::Deserialize;
use upstream::UpstreamConfig;

pub mod cli;

pub const CONFIG_DIR: &str = ".eth_events_node";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Defines the configuration parameters of the event filter node.
#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeServerConfig,
    // Logging configuration.
    pub log: LogConfig,
    // Filter and subscription limits.
    pub filters: FiltersConfig,
    // Head change processing.
    pub reconciler: ReconcilerConfig,
    // Historic index storage.
    pub index: IndexConfig,
    // The node whose chain is followed.
    pub upstream: UpstreamConfig,
}

impl NodeConfig {
    /// Try to load a configuration file from either a provided path or the `$HOME` directory.
    pub fn try_load(file_path: &Option<String>) -> eyre::Result<NodeConfig> {
        let path = if let Some(path) = file_path {
            PathBuf::from(path)
        } else {
            // NOTE: `env::home_dir` is not compatible with Windows.
            #[allow(deprecated)]
            let mut path =
                env::home_dir().ok_or_else(|| eyre::eyre!("failed to get home directory"))?;

            path.push(CONFIG_DIR);
            path.push(CONFIG_FILE_NAME);
            path
        };

        let toml = read_to_string(path)?;
        let config = toml::from_str(&toml)?;

        Ok(config)
    }

    /// Override the config with values provided by [`Cli`].
    pub fn override_with_opts(&mut self, opt: &Cli) {
        // [`NodeServerConfig`].
        if let Some(port) = &opt.port {
            self.node.port = *port;
        }
        if let Some(host) = &opt.host {
            self.node.host = *host;
        }

        // [`LogConfig`].
        if let Some(log_level) = &opt.log {
            self.log.level = log_level.clone();
        }
        if let Some(file_path) = &opt.log_file_path {
            self.log.file_path = file_path.to_string();
        }

        // [`FiltersConfig`].
        if let Some(ttl) = &opt.filter_ttl_secs {
            self.filters.filter_ttl_secs = *ttl;
        }
        if let Some(max_filters) = &opt.max_filters {
            self.filters.max_filters = *max_filters;
        }
        if let Some(max_results) = &opt.max_filter_results {
            self.filters.max_filter_results = *max_results;
        }
        if let Some(max_range) = &opt.max_filter_height_range {
            self.filters.max_filter_height_range = *max_range;
        }
        if opt.disable_realtime_filter_api {
            self.filters.disable_realtime_filter_api = true;
        }
        if opt.disable_historic_filter_api {
            self.filters.disable_historic_filter_api = true;
        }

        // [`IndexConfig`].
        if let Some(path) = &opt.index_path {
            self.index.path = Some(path.clone());
        }

        // [`UpstreamConfig`].
        if let Some(url) = &opt.upstream_url {
            self.upstream.url = url.clone();
        }
        if let Some(poll_interval_ms) = &opt.poll_interval_ms {
            self.upstream.poll_interval_ms = *poll_interval_ms;
        }
    }
}

pub mod node {
    use std::net::{IpAddr, Ipv4Addr};

    use serde::Deserialize;

    pub const DEFAULT_PORT: u16 = 8011;

    #[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
    #[serde(default)]
    pub struct NodeServerConfig {
        pub port: u16,
        pub host: IpAddr,
    }

    impl Default for NodeServerConfig {
        fn default() -> Self {
            Self {
                port: DEFAULT_PORT,
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            }
        }
    }
}

pub mod log {
    use serde::Deserialize;

    use crate::observability::LogLevel;

    pub const DEFAULT_LOG_FILE_PATH: &str = "eth_events_node.log";

    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    #[serde(default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file_path: String,
    }

    impl Default for LogConfig {
        fn default() -> Self {
            Self {
                level: LogLevel::Info,
                file_path: String::from(DEFAULT_LOG_FILE_PATH),
            }
        }
    }
}

pub mod filters {
    use std::time::Duration;

    use serde::Deserialize;

    use crate::{filters::FilterLimits, index::QueryLimits};

    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    #[serde(default)]
    pub struct FiltersConfig {
        /// Seconds a filter may go unpolled before it is evicted.
        pub filter_ttl_secs: u64,
        pub filter_sweep_interval_secs: u64,
        pub max_filters: usize,
        /// Bounds both a filter's buffer and a historic query's result set.
        pub max_filter_results: usize,
        pub max_filter_height_range: u64,
        /// Records a subscription may queue before it is closed.
        pub subscription_buffer: usize,
        pub disable_realtime_filter_api: bool,
        pub disable_historic_filter_api: bool,
    }

    impl Default for FiltersConfig {
        fn default() -> Self {
            Self {
                filter_ttl_secs: 24 * 60 * 60,
                filter_sweep_interval_secs: 60,
                max_filters: 100,
                max_filter_results: 10_000,
                max_filter_height_range: 2880,
                subscription_buffer: 256,
                disable_realtime_filter_api: false,
                disable_historic_filter_api: false,
            }
        }
    }

    impl FiltersConfig {
        pub fn limits(&self) -> FilterLimits {
            FilterLimits {
                ttl: Duration::from_secs(self.filter_ttl_secs),
                max_filters: self.max_filters,
                max_results: self.max_filter_results,
            }
        }

        pub fn query_limits(&self) -> QueryLimits {
            QueryLimits {
                max_height_range: self.max_filter_height_range,
                max_results: self.max_filter_results,
            }
        }

        pub fn sweep_interval(&self) -> Duration {
            Duration::from_secs(self.filter_sweep_interval_secs.max(1))
        }
    }
}

pub mod reconciler {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    #[serde(default)]
    pub struct ReconcilerConfig {
        /// Head change batches the notifier may queue.
        pub notify_queue_capacity: usize,
        pub receipt_retries: usize,
        pub receipt_retry_min_delay_ms: u64,
        /// Upper bound on loading the receipts of one tipset, retries included.
        pub receipt_timeout_secs: u64,
        /// Deepest reorg that is reconciled; anything deeper is fatal.
        pub max_reorg_depth: u64,
    }

    impl Default for ReconcilerConfig {
        fn default() -> Self {
            Self {
                notify_queue_capacity: 16,
                receipt_retries: 5,
                receipt_retry_min_delay_ms: 100,
                receipt_timeout_secs: 30,
                max_reorg_depth: 900,
            }
        }
    }

    impl ReconcilerConfig {
        pub fn receipt_retry_min_delay(&self) -> Duration {
            Duration::from_millis(self.receipt_retry_min_delay_ms)
        }

        pub fn receipt_timeout(&self) -> Duration {
            Duration::from_secs(self.receipt_timeout_secs)
        }
    }
}

pub mod index {
    use serde::Deserialize;

    /// Historic index storage. The index is kept in memory when no path is set.
    #[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
    #[serde(default)]
    pub struct IndexConfig {
        pub path: Option<String>,
    }
}

pub mod upstream {
    use std::time::Duration;

    use serde::Deserialize;

    pub const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8545";

    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    #[serde(default)]
    pub struct UpstreamConfig {
        pub url: String,
        pub poll_interval_ms: u64,
    }

    impl Default for UpstreamConfig {
        fn default() -> Self {
            Self {
                url: String::from(DEFAULT_UPSTREAM_URL),
                poll_interval_ms: 1000,
            }
        }
    }

    impl UpstreamConfig {
        pub fn poll_interval(&self) -> Duration {
            Duration::from_millis(self.poll_interval_ms.max(1))
        }
    }
}
