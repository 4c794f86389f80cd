use colored::Colorize;
use futures::Future;
use futures::{future::Either, FutureExt};
use itertools::Itertools;
use jsonrpc_core::{
    middleware, Call, FutureResponse, Metadata, Middleware, Params, Request, Response,
};
use tracing_subscriber::filter::LevelFilter;

/// Longest rendering of a single parameter outside of TRACE.
const MAX_PARAM_LEN: usize = 70;

#[derive(Clone, Debug, Default)]
pub struct Meta();
impl Metadata for Meta {}

pub struct LoggingMiddleware {
    log_level_filter: LevelFilter,
}

impl LoggingMiddleware {
    pub fn new(log_level_filter: LevelFilter) -> Self {
        Self { log_level_filter }
    }

    fn log_call(&self, call: &Call) {
        let Call::MethodCall(method_call) = call else {
            return;
        };

        if self.log_level_filter == LevelFilter::TRACE {
            tracing::trace!(
                "{} was called {}",
                method_call.method.cyan(),
                format_params(&method_call.params, None)
            );
        } else {
            tracing::debug!(
                "{} was called {}",
                method_call.method.cyan(),
                format_params(&method_call.params, Some(MAX_PARAM_LEN))
            );
        }
    }
}

/// Renders positional params as `with [a, b]`, cutting each one to `max_len` characters.
fn format_params(params: &Params, max_len: Option<usize>) -> String {
    let values = match params {
        Params::Array(values) if !values.is_empty() => values,
        _ => return String::default(),
    };

    let rendered = values
        .iter()
        .map(|value| {
            let value = value.to_string();
            match max_len {
                Some(max_len) if value.len() > max_len => {
                    format!("{:.*}...", max_len - 3, value)
                }
                _ => value,
            }
        })
        .join(", ");
    format!("with [{rendered}]")
}

/// Logging Middleware for all in-bound requests
/// Logs out incoming filter calls and their parameters
impl Middleware<Meta> for LoggingMiddleware {
    type Future = FutureResponse;
    type CallFuture = middleware::NoopCallFuture;

    fn on_request<F, X>(&self, request: Request, meta: Meta, next: F) -> Either<Self::Future, X>
    where
        F: FnOnce(Request, Meta) -> X + Send,
        X: Future<Output = Option<Response>> + Send + 'static,
    {
        match &request {
            Request::Single(call) => self.log_call(call),
            Request::Batch(calls) => calls.iter().for_each(|call| self.log_call(call)),
        }

        Either::Left(Box::pin(next(request, meta).map(move |res| {
            tracing::trace!("API response => {:?}", res);
            res
        })))
    }
}
