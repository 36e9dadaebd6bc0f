use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use engine_core::{EngineRuntime, ExternalRuntime, ManagedRuntime, VoicevoxClient};
use pipeline_core::{FfmpegEncoder, JobScheduler, Library, PipelineSettings};
use server::{build_router, config::ServerConfig, state::AppState};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting audiobook streaming server...");

    let config = ServerConfig::from_env();
    let settings = PipelineSettings::from_env();

    let client = VoicevoxClient::new(&settings.engine_url, settings.engine_timeout())
        .context("invalid engine configuration")?;
    let runtime: Box<dyn EngineRuntime> = match &config.engine_executable {
        Some(executable) => {
            let mut managed =
                ManagedRuntime::new(executable, client.clone(), settings.engine_ready_timeout())?;
            if let Some(threads) = config.engine_cpu_threads {
                managed = managed.with_cpu_threads(threads);
            }
            Box::new(managed)
        }
        None => Box::new(ExternalRuntime::new(client.clone(), settings.engine_ready_timeout())),
    };
    // The server can still serve finished chapters without an engine.
    match runtime.ensure_ready().await {
        Ok(()) => info!("Synthesis engine ready at {}", runtime.address()),
        Err(e) => warn!("Synthesis engine not ready: {e}"),
    }

    let library = Library::open(&config.library_root)
        .with_context(|| format!("cannot open library {}", config.library_root.display()))?;
    let encoder = Arc::new(FfmpegEncoder::new(settings.ffmpeg_path.clone()));
    let scheduler = JobScheduler::new(settings, Arc::new(client), encoder);
    let state = AppState::new(library, scheduler, config.clone());
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, library={}",
        config.port,
        config.rate_limit_per_minute,
        config.library_root.display()
    );

    // Rate limiting, shared by all clients. One request is replenished
    // every 60s / limit.
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / u64::from(per_minute)).max(1))
            .burst_size(per_minute)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .context("invalid rate limit configuration")?,
    );
    info!("Rate limiting: {} requests per minute", per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .into_inner();
    let app = build_router(state).layer(middleware_stack);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = runtime.shutdown().await {
        warn!("Engine shutdown failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
