use anyhow::Context as _;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod dispatch;
mod format;
mod hooks;
mod latest;
mod reader;
mod record;
mod store;
mod tc;

use config::{CliArgs, Config};
use dispatch::SnifferContext;
use hooks::Sniffer;
use tc::TcInterceptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))
            .with_context(|| format!("failed to read config {config_path}"))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── Shared state ──────────────────────────────────────────────────
    let ctx = Arc::new(SnifferContext::new(config.log_capacity));
    tracing::info!("log store allocated ({} bytes)", config.log_capacity);

    // ── Interception ──────────────────────────────────────────────────
    let mut interceptor = TcInterceptor::load(&config.ebpf_object, &config.interface)?;
    let poller = interceptor.event_poller()?;
    tokio::spawn(poller.run());

    let sniffer = Sniffer::start(interceptor, ctx, &config.stages())?;
    for stage in record::Stage::ALL {
        tracing::info!("{} hook: {:?}", stage, sniffer.state(stage));
    }

    // ── HTTP read endpoints ───────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        ctx: sniffer.context().clone(),
        start_time: std::time::Instant::now(),
    });
    let app = api::router(app_state, &config.allowed_ips);

    let served = async {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
        tracing::info!("Server running on http://0.0.0.0:{}", config.port);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;
        anyhow::Ok(())
    }
    .await;

    // Hooks are removed whether the server stopped cleanly or not.
    let unregistered = sniffer.shutdown().map(drop);
    served.and(unregistered)
}
