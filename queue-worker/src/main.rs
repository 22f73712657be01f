use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use queue_core::{BackendConfig, Engine, EngineConfig, PoolConfig, RedisOptions, SqlOptions};
use tracing::info;

mod config;
mod handlers;

use config::Config;

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
                use_migrate: true,
                ..SqlOptions::default()
            },
        },
        other => eyre::bail!("unknown QUEUE_BACKEND {:?}, expected memory/file/redis/sql", other),
    };

    let engine_config = EngineConfig {
        delay: Duration::from_millis(config.poll_interval_ms),
        max_retries: config.max_retries,
        max_processing_time: Duration::from_secs(config.max_processing_time_seconds),
        crash_on_worker_error: config.crash_on_worker_error,
        ..EngineConfig::default()
    };

    let engine = Engine::from_backend(backend, engine_config).await?;

    engine.registry.register(
        "log",
        Arc::new(handlers::LogHandler),
        queue_core::RegisterOptions::default(),
    );

    let health_registry = queue_core::health::HealthRegistry::new("queue-worker");
    let worker_health = health_registry
        .register("worker_pool".to_string(), time::Duration::seconds(30))
        .await;

    engine
        .start_worker_with_health(config.max_concurrent_jobs, Some(worker_health))
        .await;
    info!(concurrency = config.max_concurrent_jobs, "worker pool started");

    let router = Router::new()
        .route("/", get(|| async { "queue-worker" }))
        .route(
            "/_readiness",
            get(|| async { "ok" }),
        )
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
    info!(%bind, "queue-worker listening");

    tokio::select! {
        result = queue_core::metrics::serve(router, &bind) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    engine.stop_worker().await;
    Ok(())
}
