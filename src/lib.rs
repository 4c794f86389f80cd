//! Ethereum event filters, subscriptions and historic log queries over a followed chain.

pub mod api;
pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod filters;
pub mod http_chain_source;
pub mod index;
pub mod logging_middleware;
pub mod namespaces;
pub mod node;
pub mod observability;
pub mod reconciler;
mod testing;
pub mod types;
pub mod utils;
