mod challenges;
mod config;
mod engine;
mod engine_tests;
mod error;
mod evaluator;
mod executor;
#[cfg(test)]
mod fake_runtime;
mod lifecycle;
mod metrics;
mod protocol;
mod runners;
mod scoring;
mod status;

use challenges::RedisChallengeStore;
use config::{TrackConfigManager, WorkerSettings};
use engine::DockerEngine;
use executor::ExecutionService;
use gradebox_common::config::Settings;
use gradebox_common::redis;
use runners::RunnerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

/// BLPOP timeout; also bounds how long shutdown waits for intake to stop
const POP_TIMEOUT_SECONDS: f64 = 5.0;
/// Re-check interval while the container runtime is unreachable
const RUNTIME_RETRY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Gradebox worker booting...");

    let config = Arc::new(TrackConfigManager::load_default().map_err(|e| {
        error!("Failed to load track configurations: {:#}", e);
        e
    })?);
    info!("Loaded track configurations for: {:?}", config.list_tracks());

    let settings = Settings::from_env();
    let worker = WorkerSettings::from_env();

    let engine = Arc::new(DockerEngine::connect(worker.pull_missing_images)?);
    match engine.ping().await {
        Ok(()) => match engine.reap_orphans().await {
            Ok(removed) => info!(removed, "Container runtime reachable"),
            Err(e) => warn!(error = %e, "Failed to reap orphaned containers"),
        },
        // Reported on /status; intake stays paused until the daemon answers
        Err(e) => error!(error = %e, "Container runtime unreachable at startup"),
    }

    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", settings.redis_url);

    let registry = RunnerRegistry::standard(engine.clone(), &config)?;
    let service = ExecutionService::new(
        Arc::new(RedisChallengeStore::new(conn.clone())),
        registry,
        engine.clone(),
        config,
    );

    let status_service = service.clone();
    let status_addr = worker.status_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = status::serve(&status_addr, status_service).await {
            error!(error = %e, "Status server stopped");
        }
    });

    let stopping = Arc::new(AtomicBool::new(false));
    let flag = stopping.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, finishing in-flight runs..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        flag.store(true, Ordering::SeqCst);
    });

    let permits = Arc::new(Semaphore::new(worker.max_concurrent_runs));
    worker_loop(conn, &settings, &engine, &service, &permits, &stopping).await;

    // Every permit back means every run has stored its result
    let _drained = permits
        .acquire_many(worker.max_concurrent_runs as u32)
        .await?;
    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[instrument(skip_all, fields(queue = %settings.queue_name))]
async fn worker_loop(
    mut conn: ::redis::aio::ConnectionManager,
    settings: &Settings,
    engine: &DockerEngine,
    service: &ExecutionService,
    permits: &Arc<Semaphore>,
    stopping: &AtomicBool,
) {
    let mut runtime_down = false;

    while !stopping.load(Ordering::SeqCst) {
        // Nothing is popped that could not be run
        if let Err(e) = engine.ping().await {
            if !runtime_down {
                error!(error = %e, "Container runtime unreachable, pausing intake");
                runtime_down = true;
            }
            tokio::time::sleep(RUNTIME_RETRY).await;
            continue;
        }
        if runtime_down {
            info!("Container runtime reachable again, resuming intake");
            runtime_down = false;
        }

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        match redis::pop_execution(&mut conn, &settings.queue_name, POP_TIMEOUT_SECONDS).await {
            Ok(Some(queued)) => {
                info!(
                    run_id = %queued.id,
                    challenge_id = %queued.request.challenge_id,
                    user_id = %queued.request.user_id,
                    code_size = queued.request.code.len(),
                    queued_at = %queued.submitted_at,
                    "Received execution"
                );

                let service = service.clone();
                let mut conn = conn.clone();
                let ttl = settings.result_ttl_seconds;
                tokio::spawn(async move {
                    let result = service.execute(queued.id, &queued.request).await;
                    match redis::store_result(&mut conn, &queued.id, &result, ttl).await {
                        Ok(()) => info!(run_id = %queued.id, "Result persisted to Redis"),
                        Err(e) => error!(run_id = %queued.id, error = %e, "Failed to persist result"),
                    }
                    drop(permit);
                });
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
