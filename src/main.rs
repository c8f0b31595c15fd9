use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vplayer::{
    create_router, AppState, Config, EventBus, FfmpegAdapter, MetricsSampler, OutputPublisher,
    SessionManager,
};

#[derive(Debug, Parser)]
#[command(name = "vplayer", version, about = "Stream session manager")]
struct Args {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/vplayer")]
    config: String,

    /// Override service.http.bind
    #[arg(long)]
    bind: Option<String>,

    /// Override service.http.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vplayer=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        cfg.service.http.bind = bind;
    }
    if let Some(port) = args.port {
        cfg.service.http.port = port;
    }

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    let publisher_config = cfg.publisher()?;
    info!("Publishing output from {:?} at {}", publisher_config.root, publisher_config.public_path);
    tokio::fs::create_dir_all(&publisher_config.root)
        .await
        .with_context(|| format!("Failed to create output root {:?}", publisher_config.root))?;

    let ffmpeg = cfg.ffmpeg();
    info!("Transcoder: {:?}", ffmpeg.ffmpeg_path);

    let supervisor = cfg.supervisor();
    info!(
        "Max {} concurrent sessions, {} retries",
        supervisor.max_concurrent_sessions, supervisor.backoff.max_retries
    );

    let manager = SessionManager::new(
        supervisor,
        OutputPublisher::new(publisher_config),
        Arc::new(FfmpegAdapter::new(ffmpeg)),
        EventBus::new(),
    );
    manager.spawn_metrics(
        MetricsSampler::new(&cfg.metrics.thermal_zone, &cfg.metrics.disk_path),
        cfg.metrics_interval(),
    );
    manager.spawn_gc(cfg.gc_interval(), cfg.retention());

    let app = create_router(AppState::new(manager.clone()));

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("HTTP server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves once ctrl-c is received and every session has been stopped.
async fn shutdown_signal(manager: SessionManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
    manager.shutdown().await;
}
