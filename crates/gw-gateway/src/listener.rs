//! The WebSocket upgrade endpoint, per §4.J.
//!
//! Accepts an optional `Authorization: Bearer <token>` header before
//! the upgrade: when present it's validated immediately and a failure
//! is rejected with `401` rather than opening a socket just to close
//! it. When absent, the device authenticates in-band via an `AUTH`
//! frame once the socket is live (`session::authenticate`).

use crate::http::ErrorBody;
use crate::AppState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use gw_ports::TokenValidator;

pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let pre_auth = match headers.get(axum::http::header::AUTHORIZATION) {
        Some(value) => match bearer_token(value) {
            Some(token) => match state.token_validator.validate(token).await {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    return (
                        StatusCode::UNAUTHORIZED,
                        Json(ErrorBody {
                            error: format!("invalid bearer token: {e}"),
                        }),
                    )
                        .into_response()
                }
            },
            None => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorBody {
                        error: "malformed Authorization header: expected `Bearer <token>`"
                            .to_string(),
                    }),
                )
                    .into_response()
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| crate::session::run_session(socket, pre_auth, state))
}

fn bearer_token(value: &axum::http::HeaderValue) -> Option<&str> {
    value.to_str().ok()?.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_token_after_bearer_prefix() {
        let header = HeaderValue::from_static("Bearer abc.def.ghi");
        assert_eq!(bearer_token(&header), Some("abc.def.ghi"));
    }

    #[test]
    fn rejects_missing_bearer_prefix() {
        let header = HeaderValue::from_static("abc.def.ghi");
        assert_eq!(bearer_token(&header), None);
    }

    #[test]
    fn rejects_other_auth_schemes() {
        let header = HeaderValue::from_static("Basic dXNlcjpwYXNz");
        assert_eq!(bearer_token(&header), None);
    }
}
