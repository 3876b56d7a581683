//! Web server: axum JSON API over the flight event log.
//!
//! Handlers share one injected [`FlightStore`]; each store call acquires and
//! releases its own connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use http::header::{HeaderValue, CACHE_CONTROL};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use flightlog_core::config::Config;

use crate::db::FlightStore;

pub mod ingest;
pub mod live;
pub mod routes;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub db: Arc<dyn FlightStore>,
    /// Bearer token required by the ingest endpoint, if set.
    pub auth_token: Option<String>,
    /// Client for the military pass-through.
    pub http: reqwest::Client,
    pub adsb_lol: String,
    pub adsbdb: String,
    /// How often the live stream checks for a changed latest row.
    pub live_interval: Duration,
}

impl AppState {
    pub fn new(db: Arc<dyn FlightStore>, config: &Config, http: reqwest::Client) -> Self {
        AppState {
            db,
            auth_token: config.ingest_token.clone(),
            http,
            adsb_lol: config.sources.adsb_lol.clone(),
            adsbdb: config.sources.adsbdb.clone(),
            live_interval: live::DEFAULT_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/flights", get(routes::api_flights))
        .route("/api/flight_detail", get(routes::api_flight_detail))
        .route("/api/stats", get(routes::api_stats))
        .route("/api/mil", get(routes::api_mil))
        .route("/api/mil_detail", get(routes::api_mil_detail))
        .route("/events", get(live::live_events))
        // Ingest API (external sighting sources)
        .route("/api/v1/sightings", post(ingest::api_ingest_sighting))
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(cors)
}

/// Start the web server and run until `shutdown` resolves.
pub async fn serve<F>(state: Arc<AppState>, host: &str, port: u16, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("flightlog server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
