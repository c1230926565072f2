//! Demo service instrumented with the timing middleware
//!
//! Reads storage settings from `--config` or the environment (`.env` is
//! honoured), prepares the timing table and serves a couple of routes.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{Router, routing::get};
use clap::Parser;
use request_timings::{
    config::{Config, read_config_file},
    middleware::{TimingMiddleware, TimingOptions},
    storage,
};
use tower_http::trace::TraceLayer;
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(name = "timing-demo")]
#[command(about = "Serve a demo API that records request timings", long_about = None)]
struct Args {
    /// Config file (defaults to the environment)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("request_timings", LevelFilter::DEBUG),
        ("timing_demo", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = match &args.config {
        Some(path) => read_config_file(path)?,
        None => Config::from_env()?,
    };

    let gateway = storage::connect(&config.storage).await?;
    // Refuse to serve traffic whose timings cannot be stored.
    gateway.setup().await?;

    let routes = Router::new()
        .route("/health", get(health))
        .route("/slow", get(slow))
        .layer(TraceLayer::new_for_http());
    let app = TimingMiddleware::new(gateway, TimingOptions::from(&config.timing)).instrument(routes);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(250)).await;
    "done"
}
