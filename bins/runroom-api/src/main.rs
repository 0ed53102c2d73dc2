mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use runroom_common::config::Settings;
use runroom_core::{
    FanoutRouter, Intake, JobQueue, LanguageConfigManager, QueueConfig, RedisBus, RedisJobStore,
    Runner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub intake: Intake,
    pub router: Arc<FanoutRouter>,
    pub shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Runroom API booting...");

    let settings = Settings::from_env()?;

    let languages = LanguageConfigManager::load_or_builtin(&settings.languages_config)?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    // Connect to Redis
    let client = redis::Client::open(settings.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let bus = RedisBus::connect(&client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", settings.redis_url);

    let router = FanoutRouter::start(
        settings.instance_id.clone(),
        Arc::new(bus),
        settings.outbound_buffer,
    )
    .await?;

    let store = RedisJobStore::connect(&client, settings.worker_count).await?;
    let runner = Runner::new(Arc::new(languages), settings.work_dir.clone());
    let queue = JobQueue::new(
        Arc::new(store),
        Arc::new(runner),
        router.clone(),
        QueueConfig::from(&settings),
    );

    let shutdown = CancellationToken::new();
    let workers = if settings.worker_count > 0 {
        if let Err(e) = queue.recover_abandoned(Duration::from_secs(60)).await {
            warn!(error = %e, "Abandoned job recovery failed");
        }
        info!(
            workers = settings.worker_count,
            work_dir = %settings.work_dir.display(),
            "Starting embedded workers"
        );
        queue.spawn_workers(shutdown.clone())
    } else {
        info!("Embedded workers disabled, jobs run on runroom-worker instances");
        Vec::new()
    };

    let state = AppState {
        intake: Intake::new(queue),
        router: router.clone(),
        shutdown: shutdown.clone(),
    };

    let app = routes::routes().with_state(state);

    // Start server
    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    info!(instance_id = %settings.instance_id, "HTTP server listening on {}", settings.bind_addr);
    info!("Ready to accept run requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task panicked");
        }
    }
    router.shutdown().await;

    info!("API shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    warn!("Received shutdown signal, closing connections...");
    shutdown.cancel();
}
