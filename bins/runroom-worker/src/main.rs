use anyhow::Context;
use runroom_common::config::Settings;
use runroom_core::{
    FanoutRouter, JobQueue, LanguageConfigManager, QueueConfig, RedisBus, RedisJobStore, Runner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Active jobs older than the execution limit plus this are treated as abandoned
const RECOVERY_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Runroom Worker booting...");

    let settings = Settings::from_env()?;
    if settings.worker_count == 0 {
        anyhow::bail!("WORKER_COUNT must be at least 1 for a worker process");
    }

    // Load language configurations
    let languages = LanguageConfigManager::load_or_builtin(&settings.languages_config)
        .map_err(|e| {
            error!("Failed to load language configurations: {}", e);
            error!("Check {} or run `runroom-cli init`", settings.languages_config.display());
            e
        })?;

    info!("Loaded language configurations for: {:?}", languages.list_languages());

    // Connect to Redis
    let client = redis::Client::open(settings.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let bus = RedisBus::connect(&client)
        .await
        .context("Failed to connect to Redis")?;
    let store = RedisJobStore::connect(&client, settings.worker_count).await?;

    info!("Connected to Redis: {}", settings.redis_url);

    // Output is published to the bus; no client connects to a worker directly
    let router = FanoutRouter::start(
        settings.instance_id.clone(),
        Arc::new(bus),
        settings.outbound_buffer,
    )
    .await?;

    let runner = Runner::new(Arc::new(languages), settings.work_dir.clone());
    let queue = JobQueue::new(
        Arc::new(store),
        Arc::new(runner),
        router.clone(),
        QueueConfig::from(&settings),
    );

    if let Err(e) = queue.recover_abandoned(RECOVERY_GRACE).await {
        warn!(error = %e, "Abandoned job recovery failed");
    }

    info!(
        instance_id = %settings.instance_id,
        workers = settings.worker_count,
        max_active_secs = settings.max_active.as_secs(),
        work_dir = %settings.work_dir.display(),
        "Worker pool starting"
    );

    let shutdown = CancellationToken::new();
    let workers = queue.spawn_workers(shutdown.clone());

    // Setup graceful shutdown
    signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, cancelling running jobs...");
    shutdown.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task panicked");
        }
    }
    router.shutdown().await;

    info!("Worker shutdown complete");
    Ok(())
}
