//! Health and diagnostics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::core::clock::current_timestamp;
use crate::core::RelayStatus;

use super::SharedRelay;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub ts: i64,
}

/// Liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "autsys-relay",
        ts: current_timestamp(),
    })
}

/// Queue lengths, last activity and debounce state.
pub async fn diag(State(relay): State<SharedRelay>) -> Json<RelayStatus> {
    match tokio::task::spawn_blocking(move || relay.status()).await {
        Ok(status) => Json(status),
        Err(e) => {
            tracing::error!("diag task failed: {}", e);
            Json(RelayStatus {
                ts: current_timestamp(),
                ..Default::default()
            })
        }
    }
}
