//! Process wiring for the saga orchestration engine.
//!
//! The HTTP surface is limited to observability: a health check that
//! reports whether the bus is consuming, and Prometheus metrics.

pub mod config;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use command_bus::{CommandBus, Transport};
use message_store::MessageRepository;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

/// Shared state for the HTTP handlers.
pub struct AppState<R, T> {
    pub bus: Arc<CommandBus<R, T>>,
}

impl<R, T> AppState<R, T> {
    pub fn new(bus: Arc<CommandBus<R, T>>) -> Self {
        Self { bus }
    }
}

/// Creates the Axum application router.
pub fn create_app<R, T>(state: Arc<AppState<R, T>>, metrics_handle: PrometheusHandle) -> Router
where
    R: MessageRepository + Clone + 'static,
    T: Transport,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<R, T>))
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}
