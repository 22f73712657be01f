use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use queue_core::{BackendConfig, Engine, EngineConfig, PoolConfig, RedisOptions, SqlOptions};
use tracing::{info, warn};

mod config;

use config::Config;

/// Periodic out-of-band sweep for stuck tasks. Supplements (does not
/// replace) the opportunistic check `Engine::dequeue` already runs on an
/// empty queue: a worker pool idling on a full queue would otherwise never
/// trigger reclamation, and a deployment can also run the janitor with zero
/// workers attached, as a pure cleanup process, grounded on
/// `cyclotron-janitor`'s standalone cleanup loop.
async fn cleanup_loop(engine: std::sync::Arc<Engine>, interval: Duration, health: queue_core::health::HealthHandle) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        health.report_healthy().await;
        match engine.reclaim_stuck_tasks().await {
            Ok(count) if count > 0 => info!(reclaimed = count, "janitor reclaimed stuck tasks"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "janitor sweep failed"),
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let backend = match config.backend.as_str() {
        "memory" => BackendConfig::Memory,
        "file" => BackendConfig::File {
            file_path: config.file_path.clone().into(),
        },
        "redis" => BackendConfig::Redis {
            url: config.redis_url.clone(),
            options: RedisOptions {
                storage_name: Some(config.redis_namespace.clone()),
            },
        },
        "sql" => BackendConfig::Sql {
            pool: PoolConfig {
                database_url: config.database_url.clone(),
                max_connections: config.max_pg_connections,
                ..PoolConfig::default()
            },
            options: SqlOptions {
                table_name: Some(config.table_name.clone()),
                use_migrate: false,
                ..SqlOptions::default()
            },
        },
        other => eyre::bail!("unknown QUEUE_BACKEND {:?}, expected memory/file/redis/sql", other),
    };

    let engine_config = EngineConfig {
        max_retries: config.max_retries,
        max_processing_time: Duration::from_secs(config.max_processing_time_seconds),
        max_reclaim_count: config.max_reclaim_count,
        ..EngineConfig::default()
    };

    let engine = Engine::from_backend(backend, engine_config).await?;

    let health_registry = queue_core::health::HealthRegistry::new("queue-janitor");
    let cleanup_health = health_registry
        .register("cleanup_loop".to_string(), time::Duration::seconds((config.cleanup_interval_seconds * 3) as i64))
        .await;

    let cleanup = tokio::spawn(cleanup_loop(
        engine.clone(),
        Duration::from_secs(config.cleanup_interval_seconds),
        cleanup_health,
    ));

    let router = Router::new()
        .route("/", get(|| async { "queue-janitor" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get({
                let health_registry = health_registry.clone();
                move || {
                    let health_registry = health_registry.clone();
                    async move { health_registry.get_status() }
                }
            }),
        )
        .merge(queue_core::metrics::setup_metrics_router());

    let bind = config.bind();
    info!(%bind, "queue-janitor listening");

    tokio::select! {
        result = queue_core::metrics::serve(router, &bind) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    cleanup.abort();
    Ok(())
}
