use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::app::AdminState;

#[derive(Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Shared-token check: `?token=` or `Authorization: Bearer`. An empty
/// configured token disables the surface entirely rather than leaving it
/// open.
pub async fn require_token(
    State(state): State<AdminState>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.config.admin.token.as_str();
    if expected.is_empty() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "admin token not configured");
    }

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let presented = query.token.or(bearer);
    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => reject(StatusCode::UNAUTHORIZED, "invalid token"),
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
