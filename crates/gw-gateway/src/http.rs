//! The operational HTTP surface alongside the WebSocket endpoint:
//! `/health`, `/metrics`, `/devices`, and an admin disconnect
//! endpoint. Grounded in the teacher's `sr-api::observability` handlers
//! for the metrics text-exposition shape and `sr-api::handlers::error`
//! for the JSON error body convention.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use gw_domain::session_state::CloseReason;
use gw_ports::ConnectionRegistry;
use serde::Serialize;
use serde_json::json;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

#[derive(Serialize)]
struct DevicesResponse {
    devices: Vec<DeviceSummaryView>,
    count: usize,
}

#[derive(Serialize)]
struct DeviceSummaryView {
    #[serde(rename = "clientId")]
    client_id: String,
    role: String,
    #[serde(rename = "connectedAt")]
    connected_at: String,
}

pub async fn devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    let snapshot = state.registry.snapshot().await;
    let devices = snapshot
        .into_iter()
        .map(|d| DeviceSummaryView {
            client_id: d.client_id,
            role: d.role,
            connected_at: d.connected_at.to_rfc3339(),
        })
        .collect::<Vec<_>>();
    let count = devices.len();
    Json(DevicesResponse { devices, count })
}

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: String,
}

/// `POST /devices/:client_id/disconnect`. Not part of the wire
/// protocol itself; a small operational surface so an operator can
/// force a misbehaving device off without restarting the gateway.
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    let evicted = state
        .supersede
        .evict(&client_id, CloseReason::AdminEvicted)
        .await;
    if evicted {
        StatusCode::ACCEPTED.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no connected session for {client_id}"),
            }),
        )
            .into_response()
    }
}
