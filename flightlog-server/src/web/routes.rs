//! REST API route handlers for the query layer.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use flightlog_core::source::{parse_mil, parse_mil_detail};
use flightlog_core::types::now_local;

use crate::db::{normalize_lookup, StoreError};
use crate::poller::fetch_json;
use crate::web::AppState;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 1000;

// ---------------------------------------------------------------------------
// Query param types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FlightsParams {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct MilDetailParams {
    hex: Option<String>,
}

#[derive(Deserialize)]
pub struct DetailParams {
    reg: Option<String>,
    hex: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn clamp_i64(val: i64, min: i64, max: i64) -> i64 {
    val.max(min).min(max)
}

/// Log a store failure and turn it into a 503.
pub(crate) fn store_unavailable(err: StoreError) -> Response {
    error!("store error: {err}");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "store_unavailable"})),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Flight endpoints
// ---------------------------------------------------------------------------

/// GET /api/flights: most recent events, newest first.
pub async fn api_flights(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FlightsParams>,
) -> Response {
    let limit = clamp_i64(params.limit.unwrap_or(DEFAULT_LIMIT), 1, MAX_LIMIT);

    match state.db.recent(limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_unavailable(e),
    }
}

/// GET /api/flight_detail: latest row plus lifetime aggregates.
pub async fn api_flight_detail(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DetailParams>,
) -> Response {
    let reg = params.reg.unwrap_or_default();
    let hex = params.hex.unwrap_or_default();

    match state.db.detail(&reg, &hex).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response(),
        Err(e) => store_unavailable(e),
    }
}

/// GET /api/stats: aggregate counters and top-10 lists.
pub async fn api_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.db.stats(now_local().date()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_unavailable(e),
    }
}

/// GET /api/mil: simplified military feed, highest first.
pub async fn api_mil(State(state): State<Arc<AppState>>) -> Response {
    let url = format!("{}/v2/mil", state.adsb_lol.trim_end_matches('/'));

    match fetch_json(&state.http, &url).await {
        Ok(body) => {
            let aircraft = parse_mil(&body);
            Json(json!({"count": aircraft.len(), "aircraft": aircraft})).into_response()
        }
        Err(e) => {
            warn!("military feed fetch failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "mil_fetch_failed", "details": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /api/mil_detail?hex=: adsbdb lookup for one military aircraft.
pub async fn api_mil_detail(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MilDetailParams>,
) -> Response {
    let hex = normalize_lookup(&params.hex.unwrap_or_default());
    if hex.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "no_hex"}))).into_response();
    }

    let url = format!("{}/v0/aircraft/{hex}", state.adsbdb.trim_end_matches('/'));
    match fetch_json(&state.http, &url).await {
        Ok(body) => Json(parse_mil_detail(&hex, &body)).into_response(),
        Err(e) => {
            warn!(hex = %hex, "military detail lookup failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"hex": hex, "found": false, "error": "lookup_failed"})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
