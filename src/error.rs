use jsonrpc_core::ErrorCode;

/// Errors surfaced by the filter engine to its callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    InvalidSpec(String),
    #[error("filter not found")]
    NotFound,
    #[error("subscription queue overflowed, subscription closed")]
    Overflow,
    #[error("event index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("chain resync required: {0}")]
    ResyncRequired(String),
    #[error("event filtering halted: {0}")]
    Fatal(String),
    #[error("maximum number of filters ({0}) reached")]
    TooManyFilters(usize),
    #[error("query matched more than {0} results")]
    TooManyResults(usize),
    #[error("event filtering stopped")]
    Stopped,
    #[error("{0} is disabled on this node")]
    NotSupported(&'static str),
}

impl From<sqlx::Error> for FilterError {
    fn from(value: sqlx::Error) -> Self {
        FilterError::IndexUnavailable(value.to_string())
    }
}

impl From<FilterError> for jsonrpc_core::Error {
    fn from(value: FilterError) -> Self {
        match value {
            err @ FilterError::InvalidSpec(_)
            | err @ FilterError::NotFound
            | err @ FilterError::TooManyFilters(_)
            | err @ FilterError::TooManyResults(_) => {
                jsonrpc_core::Error::invalid_params(err.to_string())
            }
            err @ FilterError::NotSupported(_) => jsonrpc_core::Error {
                code: ErrorCode::MethodNotFound,
                message: err.to_string(),
                data: None,
            },
            err => {
                tracing::error!("filter request failed: {}", err);
                jsonrpc_core::Error {
                    code: ErrorCode::InternalError,
                    message: err.to_string(),
                    data: None,
                }
            }
        }
    }
}

/// Errors raised by the chain collaborators (head notifier, receipt loader).
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("chain request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chain node returned an error: {0}")]
    Rpc(String),
    #[error("malformed chain response: {0}")]
    Decode(String),
    #[error("head change stream closed")]
    Closed,
}
