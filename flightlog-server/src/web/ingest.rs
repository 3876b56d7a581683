//! Sighting ingest API: external sources POST sightings here.
//!
//! Each request is coalesced through the same store path as the poller.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use flightlog_core::types::Sighting;

use crate::web::routes::store_unavailable;
use crate::web::AppState;

// ---------------------------------------------------------------------------
// Auth helper
// ---------------------------------------------------------------------------

/// Validate bearer token if auth is configured. Returns Err response on failure.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let expected = match &state.auth_token {
        Some(t) => t,
        None => return Ok(()),
    };

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match auth_header.strip_prefix("Bearer ") {
        Some(token) if token == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or missing bearer token"})),
        )),
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// POST /api/v1/sightings: coalesce one sighting.
pub async fn api_ingest_sighting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(sighting): Json<Sighting>,
) -> Response {
    if let Err(rejection) = check_auth(&state, &headers) {
        return rejection.into_response();
    }

    match state.db.ingest(sighting).await {
        Ok(event_id) => {
            debug!(event_id, "ingested sighting");
            Json(json!({"event_id": event_id})).into_response()
        }
        Err(e) => store_unavailable(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
