use core::fmt;
use std::{fs::File, sync::Mutex};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log filter level for the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LogLevel::Trace => f.pad("TRACE"),
            LogLevel::Debug => f.pad("DEBUG"),
            LogLevel::Info => f.pad("INFO"),
            LogLevel::Warn => f.pad("WARN"),
            LogLevel::Error => f.pad("ERROR"),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Marks the process-wide tracing subscriber as installed.
#[derive(Debug, Clone)]
pub struct Observability;

impl Observability {
    /// Initialize the tracing subscriber, logging to stdout and to `log_file`.
    ///
    /// Only events of `binary_name` pass the level filter; `RUST_LOG` directives are added on
    /// top, which is how sqlx or reqwest logs can be enabled.
    pub fn init(
        binary_name: String,
        log_level_filter: LevelFilter,
        log_file: File,
    ) -> Result<Self, anyhow::Error> {
        let filter = Self::level_filter(&binary_name, log_level_filter)?;

        let timer_format = time::format_description::parse("[hour]:[minute]:[second]")?;
        let time_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
        let timer = tracing_subscriber::fmt::time::OffsetTime::new(time_offset, timer_format);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer().event_format(
                    tracing_subscriber::fmt::format()
                        .compact()
                        .with_timer(timer.clone())
                        .with_target(false),
                ),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(
                        tracing_subscriber::fmt::format()
                            .compact()
                            .with_timer(timer)
                            .with_target(true),
                    )
                    .with_writer(Mutex::new(log_file))
                    .with_ansi(false),
            )
            .try_init()?;

        Ok(Self)
    }

    fn level_filter(binary_name: &str, level: LevelFilter) -> Result<EnvFilter, anyhow::Error> {
        Self::parse_filter(&format!(
            "{}={}",
            binary_name,
            format!("{level}").to_lowercase()
        ))
    }

    /// Parses a directive and builds an [EnvFilter] from it.
    /// Example:
    ///     * "my_crate=debug"
    ///     * "my_crate::module=trace"
    ///     * "my_crate=debug,other_crate=warn"
    fn parse_filter(directive: &str) -> Result<EnvFilter, anyhow::Error> {
        let mut filter = EnvFilter::from_default_env();
        for directive in directive.split(',') {
            filter = filter.add_directive(directive.parse()?);
        }

        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_deserializes_lowercase() {
        let level: LogLevel = serde_json::from_str("\"warn\"").expect("failed deserializing");

        assert_eq!(LogLevel::Warn, level);
        assert_eq!(LevelFilter::WARN, LevelFilter::from(level));
    }

    #[test]
    fn test_parse_filter_accepts_multiple_directives() {
        assert!(Observability::parse_filter("eth_events_node=debug,sqlx=warn").is_ok());
        assert!(Observability::parse_filter("eth_events_node=loud").is_err());
    }

    #[test]
    fn test_level_filter_scopes_the_binary() {
        assert!(Observability::level_filter("eth_events_node", LevelFilter::TRACE).is_ok());
        assert!(Observability::level_filter("eth_events_node", LevelFilter::OFF).is_ok());
    }
}
