//! Purr Worker - Main entry point

use anyhow::Result;
use purr_common::logging::{init_logging, LogConfig};
use purr_common::Workflow;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use purr_worker::bus::postgres::{PgBusOptions, PgTaskBus};
use purr_worker::definition::HttpDefinitionService;
use purr_worker::notify::{Event, Notifier, PgNotifier};
use purr_worker::sink::PgUpsertSink;
use purr_worker::source::SqlxSourceStore;
use purr_worker::{Config, Coordinator, Dispatcher, TaskBus, UnsupportedCollaborator, WorkerContext};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("purr-worker")
        .filter_directives("purr_worker=debug,sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting purr worker");

    let config = Config::load()?;
    info!(
        hostname = %config.worker.hostname,
        suite = %config.worker.suite,
        work_workers = config.worker.work_max_workers,
        search_workers = config.worker.search_max_workers,
        "configuration loaded"
    );

    let bus = Arc::new(
        PgTaskBus::connect(PgBusOptions {
            connect: config.control_db.url.parse::<PgConnectOptions>()?,
            max_connections: config.control_db.max_connections,
            connect_timeout: config.control_db.connect_timeout(),
            channel: config.worker.task_channel.clone(),
        })
        .await?,
    );
    let control_pool = bus.pool().await;
    info!("Control database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&control_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    let analytics_pool = PgPoolOptions::new()
        .max_connections(config.analytics_db.max_connections)
        .acquire_timeout(config.analytics_db.connect_timeout())
        .connect(&config.analytics_db.url)
        .await?;

    info!("Analytics database connection pool established");

    let api_key = Some(config.definitions.api_key.clone()).filter(|k| !k.is_empty());
    let definitions = HttpDefinitionService::new(config.definitions.url.clone(), api_key)?;
    let notifier = Arc::new(PgNotifier::new(bus.shared_pool(), config.worker.hostname.clone()));

    bus.register_worker(&config.worker.hostname, &config.worker.suite)
        .await?;
    notifier
        .send(Event::note(
            format!("worker {} ready for {}", config.worker.hostname, config.worker.suite),
            None,
            Workflow::Any,
        ))
        .await;

    let ctx = Arc::new(WorkerContext {
        host: config.worker.hostname.clone(),
        suite: config.worker.suite.clone(),
        bus: bus.clone(),
        projects: bus,
        definitions: Arc::new(definitions),
        source: Arc::new(SqlxSourceStore::new()),
        sink: Arc::new(PgUpsertSink::new(analytics_pool)),
        notifier,
    });

    let coordinator = Arc::new(Coordinator::new(ctx.clone(), Arc::new(UnsupportedCollaborator)));
    let dispatcher = Dispatcher::new(
        ctx,
        coordinator,
        config.worker.work_max_workers,
        config.worker.search_max_workers,
        config.worker.shutdown_timeout(),
    );

    tokio::spawn(shutdown_signal(dispatcher.shutdown_token()));

    dispatcher.run().await?;

    info!("Worker shut down gracefully");

    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
        _ = token.cancelled() => return,
    }

    token.cancel();
}
