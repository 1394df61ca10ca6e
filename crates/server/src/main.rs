//! Orchestration server entry point.

use std::sync::Arc;

use command_bus::{CommandBus, Dependencies, DependencyKey, NatsTransport};
use futures_util::StreamExt;
use message_store::PostgresMessageRepository;
use saga::{OrchestrationEngine, OrchestrationRunner};
use server::config::{Config, LogFormat};
use server::{AppState, create_app};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Logs every status transition the database reports.
async fn log_status_changes(repository: PostgresMessageRepository) {
    let mut changes = match repository.status_changes().await {
        Ok(changes) => changes,
        Err(e) => {
            tracing::warn!(error = %e, "status change listener unavailable");
            return;
        }
    };

    while let Some(change) = changes.next().await {
        match change {
            Ok(change) => tracing::debug!(
                message_id = %change.message_id,
                orchestration_id = ?change.orchestration_id,
                status = %change.status,
                error = ?change.error,
                "message status changed"
            ),
            Err(e) => tracing::warn!(error = %e, "status change notification dropped"),
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Database and schema
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    let repository = PostgresMessageRepository::new(pool.clone());
    repository
        .run_migrations()
        .await
        .expect("failed to run migrations");

    // 4. Broker and bus
    let transport = NatsTransport::connect(
        &config.nats_url,
        &config.bus_namespace,
        config.stream_max_age(),
    )
    .await
    .expect("failed to connect to NATS");

    let mut dependencies = Dependencies::new();
    dependencies.add_singleton(DependencyKey::Db, pool.clone());

    let bus = Arc::new(CommandBus::new(
        config.bus_config(),
        repository.clone(),
        transport,
        dependencies,
    ));

    // 5. Orchestration engine and runner
    let engine = Arc::new(OrchestrationEngine::new(Arc::clone(&bus)));
    OrchestrationRunner::new(Arc::clone(&engine))
        .start()
        .await
        .expect("failed to start orchestration runner");

    let stale_before = chrono::Utc::now() - chrono::Duration::seconds(config.stale_after_secs as i64);
    match engine.recover_stale(stale_before).await {
        Ok(0) => {}
        Ok(resent) => tracing::warn!(resent, "re-sent stale commands"),
        Err(e) => tracing::error!(error = %e, "stale command recovery failed"),
    }

    tokio::spawn(log_status_changes(repository));

    // 6. Build the application and serve
    let app = create_app(Arc::new(AppState::new(Arc::clone(&bus))), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, namespace = %config.bus_namespace, module = %config.bus_module, "starting orchestration server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if let Err(e) = bus.unsubscribe().await {
        tracing::error!(error = %e, "failed to unsubscribe bus");
    }
    pool.close().await;

    tracing::info!("server shut down gracefully");
}
