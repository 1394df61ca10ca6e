//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use command_bus::Transport;
use message_store::MessageRepository;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub namespace: String,
    pub subscriptions: usize,
}

/// GET /health: `ok` while the bus has live subscriptions, `503` otherwise.
pub async fn check<R, T>(State(state): State<Arc<AppState<R, T>>>) -> (StatusCode, Json<HealthResponse>)
where
    R: MessageRepository + Clone + 'static,
    T: Transport,
{
    let subscriptions = state.bus.subscription_count().await;
    let (code, status) = if subscriptions > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not consuming")
    };

    (
        code,
        Json(HealthResponse {
            status,
            namespace: state.bus.config().namespace.clone(),
            subscriptions,
        }),
    )
}
