use std::{fs::File, net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use clap::Parser;
use eth_events_node::{
    config::{
        cli::{Cli, Command},
        NodeConfig,
    },
    http_chain_source::HttpChainSource,
    index::EventIndex,
    logging_middleware::LoggingMiddleware,
    namespaces::EthFilterNamespaceT,
    node::EventFilterNode,
    observability::Observability,
};
use futures::{channel::oneshot, FutureExt};
use jsonrpc_core::MetaIoHandler;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

const BINARY_NAME: &str = "eth_events_node";

async fn build_json_http(
    addr: SocketAddr,
    log_level_filter: LevelFilter,
    node: EventFilterNode,
) -> tokio::task::JoinHandle<()> {
    let (sender, recv) = oneshot::channel::<()>();

    let io_handler = {
        let mut io = MetaIoHandler::with_middleware(LoggingMiddleware::new(log_level_filter));
        io.extend_with(EthFilterNamespaceT::to_delegate(node));
        io
    };

    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(1)
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!("failed building the JSON-RPC runtime: {}", err);
                return;
            }
        };

        let server = match jsonrpc_http_server::ServerBuilder::new(io_handler)
            .threads(1)
            .event_loop_executor(runtime.handle().clone())
            .start_http(&addr)
        {
            Ok(server) => server,
            Err(err) => {
                tracing::error!("failed starting the JSON-RPC server on {}: {}", addr, err);
                return;
            }
        };

        server.wait();
        let _ = sender;
    });

    tokio::spawn(recv.map(drop))
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let index = EventIndex::open(
        config.index.path.as_deref().map(Path::new),
        config.filters.query_limits(),
    )
    .await
    .context("failed opening the event index")?;
    let chain = Arc::new(HttpChainSource::new(
        &config.upstream,
        config.reconciler.max_reorg_depth,
        cancel.clone(),
    ));
    let (node, reconciler) = EventFilterNode::start(chain, index, &config, cancel.clone());

    let addr = SocketAddr::new(config.node.host, config.node.port);
    let server = build_json_http(addr, LevelFilter::from(config.log.level), node).await;

    tracing::info!("========================================");
    tracing::info!("  Node is ready at {}", addr);
    tracing::info!("  Following {}", config.upstream.url);
    tracing::info!("========================================");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl-C, shutting down"),
        _ = server => tracing::error!("JSON-RPC server stopped"),
    }

    cancel.cancel();
    reconciler.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Cli::parse();

    let loaded = NodeConfig::try_load(&opt.config);
    let mut config = match &loaded {
        Ok(config) => config.clone(),
        Err(err) if opt.config.is_some() => {
            anyhow::bail!("failed loading config file: {err}")
        }
        Err(_) => NodeConfig::default(),
    };
    config.override_with_opts(&opt);

    let log_file = File::create(&config.log.file_path)
        .with_context(|| format!("failed creating log file '{}'", config.log.file_path))?;
    let _observability = Observability::init(
        String::from(BINARY_NAME),
        LevelFilter::from(config.log.level),
        log_file,
    )?;
    if let Err(err) = loaded {
        tracing::debug!("no config file loaded, using defaults: {}", err);
    }

    match opt.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
    }
}
