mod cli;
mod handler;
mod redis_pool;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use thr_core::config::ConfigFile;
use thr_core::rules::RuleSet;
use tracing::info;

use cli::FrontendArgs;
use redis_pool::RedisPool;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = FrontendArgs::parse();

    let rules = match &args.config {
        Some(path) => ConfigFile::load(path)?.build_rules()?,
        None => RuleSet::new(),
    };

    let app_state = AppState {
        rules: Arc::new(rules),
        redis: Arc::new(RedisPool::new()),
        default_redis_host: args.redis_host.clone(),
        default_redis_port: args.redis_port,
        default_redis_uds: args.redis_uds.clone(),
        default_redis_queue: args.redis_queue.clone(),
        timeout: Duration::from_secs(args.timeout),
    };

    let app = Router::new()
        .route("/health", get(handler::health))
        .fallback(handler::fallback)
        .with_state(app_state);

    if args.port == 0 {
        anyhow::bail!("--port 0 (TCP disabled) requires --unix_socket; UDS listener not wired up in this build");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "thr-frontend listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(args.timeout))
    .await?;

    info!("thr-frontend shut down gracefully");
    Ok(())
}

async fn shutdown_signal(timeout_secs: u64) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    info!(timeout_secs, "draining in-flight requests before exit");
}
