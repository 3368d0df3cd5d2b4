// ingestd/src/main.rs
// Ingest-and-detect server entry point: wires the bus, columnar store
// and registry to the gateway, rules engine and sink, then serves the
// agent-facing endpoint until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Level};

mod tls;

use ingest_core::bus::Bus;
use ingest_core::nats::NatsBus;
use ingest_core::registry::{PostgresRegistry, Registry};
use ingest_core::store::{ClickHouseStore, EventStore};
use ingest_core::{default_rules, ColumnarSink, Config, Gateway, IngestMetrics, RulesEngine};

/// How long open streams get to drain after the shutdown signal.
const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let matches = Command::new("ingestd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Telemetry ingest gateway, rules engine and columnar sink")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("ingestd.toml"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Override the listen port")
                .value_parser(clap::value_parser!(u16)),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("ingestd.toml");
    let mut config = Config::load(config_path);
    if let Some(port) = matches.get_one::<u16>("port") {
        config.grpc_port = *port;
    }

    info!("🚀 ingestd starting");
    run_server(config).await
}

async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // external collaborators; any failure here is fatal at startup
    let nats = Arc::new(
        NatsBus::connect(&config.bus_url)
            .await
            .context("connect to bus")?,
    );
    nats.ensure_streams().await.context("ensure bus streams")?;
    let bus: Arc<dyn Bus> = nats;

    let clickhouse = Arc::new(
        ClickHouseStore::connect(&config.columnar_addr)
            .await
            .context("connect to columnar store")?,
    );
    clickhouse
        .ensure_tables()
        .await
        .context("ensure columnar tables")?;
    let store: Arc<dyn EventStore> = clickhouse;

    let registry: Option<Arc<dyn Registry>> = match &config.database_url {
        Some(url) => Some(Arc::new(
            PostgresRegistry::connect(url)
                .await
                .context("connect to registry")?,
        )),
        None => {
            warn!("no DATABASE_URL configured, running without agent registry");
            None
        }
    };

    let metrics = Arc::new(IngestMetrics::new());

    // rules engine and columnar sink, consuming from the bus
    let rules = default_rules().context("compile default rules")?;
    let engine = Arc::new(RulesEngine::new(
        Arc::clone(&bus),
        rules,
        Arc::clone(&metrics),
        shutdown.child_token(),
    ));
    let sink = ColumnarSink::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        Arc::clone(&metrics),
        shutdown.child_token(),
    );

    let workers = TaskTracker::new();
    workers.spawn({
        let engine = Arc::clone(&engine);
        async move {
            if let Err(e) = engine.run().await {
                error!("rules engine stopped: {e}");
            }
        }
    });
    workers.spawn(async move {
        if let Err(e) = sink.run().await {
            error!("columnar sink stopped: {e}");
        }
    });

    // agent-facing endpoint
    let gateway = Arc::new(Gateway::new(
        bus,
        store,
        registry,
        Arc::clone(&metrics),
        shutdown.child_token(),
        config.heartbeat_interval_secs,
    ));

    let acceptor = if config.tls.enabled {
        let acceptor = tls::load_acceptor(&config.tls.cert_file, &config.tls.key_file)
            .context("load TLS certificates")?;
        info!("ingest endpoint listening on :{} with TLS", config.grpc_port);
        Some(acceptor)
    } else {
        info!("ingest endpoint listening on :{} (insecure)", config.grpc_port);
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", config.grpc_port))
        .await
        .with_context(|| format!("bind :{}", config.grpc_port))?;

    let connections = TaskTracker::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };

        let gateway = Arc::clone(&gateway);
        let acceptor = acceptor.clone();
        connections.spawn(async move {
            let peer_addr = peer.to_string();
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => gateway.serve_connection(tls_stream, peer_addr.clone()).await,
                    Err(e) => {
                        warn!("TLS handshake with {peer_addr} failed: {e}");
                        return;
                    }
                },
                None => gateway.serve_connection(stream, peer_addr.clone()).await,
            };
            if let Err(e) = result {
                warn!("connection {peer_addr} ended with error: {e}");
            }
        });
    }

    info!("shutdown…");
    gateway.sessions.cancel_all();
    connections.close();
    workers.close();
    if tokio::time::timeout(DRAIN_DEADLINE, async {
        connections.wait().await;
        workers.wait().await;
    })
    .await
    .is_err()
    {
        warn!("drain deadline hit, exiting with streams still open");
    }

    let summary = metrics.summary();
    info!(
        "final counters: {} events received, {} published, {} alerts, {} commands forwarded",
        summary.events_received,
        summary.events_published,
        summary.alerts_emitted,
        summary.commands_forwarded
    );
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!("failed to install SIGTERM handler: {e}");
                        let _ = ctrl_c.await;
                        shutdown.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("ctrl-c received");
        }
        shutdown.cancel();
    });
}
