//! tickstream: market-data streaming gateway and capture service.
//!
//! Maintains one session to the broker gateway, fans live ticks out over
//! SSE and WebSocket, and records every tick to the time-partitioned
//! append store.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickstream_backend::config::Config;
use tickstream_backend::storage::MultiStorage;
use tickstream_backend::stream::{
    self, spawn_notice_listener, spawn_sweeper, tracker, RegistryLimits, StreamRegistry,
};
use tickstream_backend::upstream::{SessionState, UpstreamSession};
use tickstream_backend::{api, AppState};

#[derive(Parser, Debug)]
#[command(name = "tickstream", about = "Market-data streaming gateway and capture service")]
struct Args {
    /// Server bind address (overrides IB_STREAM_BIND_HOST)
    #[arg(long)]
    host: Option<String>,
    /// HTTP port (overrides IB_STREAM_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    load_env();
    init_tracing();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = Args::parse();
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(host) = args.host {
        config.server.bind_host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    info!(
        host = %config.connection.host,
        ports = ?config.connection.ports,
        client_id = config.connection.client_id,
        "starting tickstream"
    );

    // Upstream session: startup fails hard when no gateway port accepts.
    let (session, ticks) = UpstreamSession::spawn(config.connection.clone());
    session
        .open()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("upstream gateway unreachable at startup")?;

    // Append store.
    let storage = Arc::new(MultiStorage::from_config(&config.storage));
    storage.start().await.context("starting append store")?;

    // Registry, pipeline, sweepers.
    let registry = StreamRegistry::new(
        session.clone(),
        RegistryLimits {
            max_streams: config.server.max_streams,
            max_streams_per_connection: config.server.max_streams_per_connection,
            buffer_size: config.server.buffer_size,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    stream::spawn_pipeline(ticks, registry.clone(), storage.clone());
    spawn_sweeper(registry.clone(), shutdown_rx.clone());
    spawn_notice_listener(registry.clone(), session.clone(), shutdown_rx.clone());

    // Background tracker.
    let tracked_active =
        config.storage.enable_background_streaming && !config.storage.tracked_contracts.is_empty();
    if tracked_active {
        info!(
            contracts = config.storage.tracked_contracts.len(),
            "background streaming enabled"
        );
        tracker::spawn(
            registry.clone(),
            session.clone(),
            config.storage.tracked_contracts.clone(),
            config.storage.background_reconnect_delay,
            shutdown_rx.clone(),
        );
    }

    let state = AppState::new(
        config.clone(),
        session.clone(),
        registry.clone(),
        storage.clone(),
    );
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.bind_host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "http server listening");

    let exit_code = Arc::new(AtomicI32::new(0));
    let shutdown = shutdown_future(session.clone(), tracked_active, exit_code.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    // A second signal during the drain forces an immediate exit.
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        std::process::exit(130);
    });

    info!("draining: completing subscriptions and flushing storage");
    let _ = shutdown_tx.send(true);
    registry.shutdown_all();
    session.close().await;
    storage.stop().await;

    let code = exit_code.load(Ordering::Relaxed);
    info!(code, "shutdown complete");
    Ok(code)
}

/// Resolves on SIGINT/SIGTERM (exit 0) or on terminal upstream loss with no
/// tracked contracts configured (exit 1).
async fn shutdown_future(
    session: Arc<UpstreamSession>,
    has_tracked_contracts: bool,
    exit_code: Arc<AtomicI32>,
) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let upstream_failed = async {
        if has_tracked_contracts {
            // Tracked contracts keep the process alive for recovery.
            std::future::pending::<()>().await;
        }
        let mut state = session.watch_state();
        loop {
            if *state.borrow() == SessionState::Failed {
                return;
            }
            if state.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
        _ = upstream_failed => {
            warn!("upstream lost with no tracked contracts; shutting down");
            exit_code.store(1, Ordering::Relaxed);
        }
    }
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the manifest directory
    // for runs launched from elsewhere.
    let _ = dotenv::dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn init_tracing() {
    let default_filter = std::env::var("IB_STREAM_LOG_LEVEL")
        .map(|level| format!("tickstream_backend={},tower_http=info", level.to_lowercase()))
        .unwrap_or_else(|_| "tickstream_backend=info,tower_http=info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
