//! Nearest-aircraft poller.
//!
//! One cycle: fetch the closest aircraft from adsb.lol, enrich it from adsbdb
//! when its identity changed, and ingest the resulting sighting. Upstream
//! and store failures are logged and the loop keeps going.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use flightlog_core::config::{Config, SourcesConfig, StationConfig};
use flightlog_core::enrich::{Enrichment, EnrichmentCache};
use flightlog_core::source::{build_sighting, parse_aircraft, parse_nearest, parse_route, AircraftInfo, NearestAircraft, RouteInfo};
use flightlog_core::types::{now_local, EventId};

use crate::db::FlightStore;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Build the shared HTTP client with the configured request timeout.
pub fn http_client(timeout_secs: u64) -> Result<reqwest::Client, PollError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("flightlog/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// GET a JSON document, treating non-2xx as an error.
pub async fn fetch_json(client: &reqwest::Client, url: &str) -> Result<Value, PollError> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(PollError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(resp.json().await?)
}

pub struct Poller {
    client: reqwest::Client,
    station: StationConfig,
    sources: SourcesConfig,
    interval: Duration,
    store: Arc<dyn FlightStore>,
    cache: EnrichmentCache,
}

impl Poller {
    pub fn new(config: &Config, client: reqwest::Client, store: Arc<dyn FlightStore>) -> Self {
        Poller {
            client,
            station: config.station.clone(),
            sources: config.sources.clone(),
            interval: Duration::from_secs(config.poll.interval_secs.max(1)),
            store,
            cache: EnrichmentCache::new(),
        }
    }

    fn adsb_lol(&self, path: &str) -> String {
        format!("{}{path}", self.sources.adsb_lol.trim_end_matches('/'))
    }

    fn adsbdb(&self, path: &str) -> String {
        format!("{}{path}", self.sources.adsbdb.trim_end_matches('/'))
    }

    /// Closest aircraft to the station, `None` when the sky is empty.
    pub async fn fetch_nearest(&self) -> Result<Option<NearestAircraft>, PollError> {
        let url = self.adsb_lol(&format!(
            "/v2/closest/{}/{}/{}",
            self.station.lat, self.station.lon, self.station.radius_nm
        ));
        let body = fetch_json(&self.client, &url).await?;
        Ok(parse_nearest(&body))
    }

    async fn fetch_aircraft(&self, reg: &str) -> Option<AircraftInfo> {
        let url = self.adsbdb(&format!("/v0/aircraft/{reg}"));
        match fetch_json(&self.client, &url).await {
            Ok(body) => parse_aircraft(&body),
            Err(e) => {
                warn!(reg, "aircraft lookup failed: {e}");
                None
            }
        }
    }

    async fn fetch_route(&self, callsign: &str) -> Option<RouteInfo> {
        let url = self.adsbdb(&format!("/v0/callsign/{callsign}"));
        match fetch_json(&self.client, &url).await {
            Ok(body) => parse_route(&body),
            Err(e) => {
                warn!(callsign, "route lookup failed: {e}");
                None
            }
        }
    }

    /// Lookups for `ac`, refetched only when its identity changed.
    async fn enrichment(&mut self, ac: &NearestAircraft) -> Enrichment {
        let key = ac.identity();
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let aircraft = match ac.reg.as_deref() {
            Some(reg) => self.fetch_aircraft(reg).await,
            None => None,
        };
        let route = match ac.callsign.as_deref() {
            Some(callsign) => self.fetch_route(callsign).await,
            None => None,
        };

        debug!(
            hits = self.cache.hits,
            misses = self.cache.misses,
            "enrichment refreshed"
        );
        self.cache.insert(key, Enrichment { aircraft, route }).clone()
    }

    /// Run one cycle.
    ///
    /// Errors only when the nearest-aircraft fetch fails. A store failure is
    /// logged and yields `Ok(None)`.
    pub async fn poll_once(&mut self) -> Result<Option<EventId>, PollError> {
        let ac = match self.fetch_nearest().await? {
            Some(ac) => ac,
            None => {
                debug!("no aircraft in range");
                return Ok(None);
            }
        };

        let enrichment = self.enrichment(&ac).await;
        let sighting = build_sighting(
            &ac,
            enrichment.aircraft.as_ref(),
            enrichment.route.as_ref(),
            now_local(),
        );

        match self.store.ingest(sighting).await {
            Ok(id) => {
                debug!(
                    event_id = id,
                    hex = ac.hex.as_deref().unwrap_or("-"),
                    callsign = ac.callsign.as_deref().unwrap_or("-"),
                    "sighting logged"
                );
                Ok(Some(id))
            }
            Err(e) => {
                error!("failed to log sighting: {e}");
                Ok(None)
            }
        }
    }

    /// Poll every interval until `shutdown` resolves.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            lat = self.station.lat,
            lon = self.station.lon,
            radius_nm = self.station.radius_nm,
            interval_secs = self.interval.as_secs(),
            "poller started"
        );

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("poll failed: {e}");
                    }
                }
            }
        }

        info!("poller stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::Path;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use crate::db::{SqliteDb, StoreError};
    use flightlog_core::event::Coalescer;
    use flightlog_core::types::Sighting;

    #[derive(Default)]
    struct Calls {
        aircraft: AtomicUsize,
        route: AtomicUsize,
    }

    /// Spawn a stand-in for both upstream APIs. Returns its base URL.
    async fn mock_upstream(closest: Value, calls: Arc<Calls>) -> String {
        let aircraft_calls = calls.clone();
        let route_calls = calls;
        let app = Router::new()
            .route(
                "/v2/closest/:lat/:lon/:radius",
                get(move || {
                    let body = closest.clone();
                    async move { Json(body) }
                }),
            )
            .route(
                "/v0/aircraft/:reg",
                get(move |Path(reg): Path<String>| {
                    aircraft_calls.aircraft.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Json(json!({"response": {"aircraft": {
                            "type": "737-824",
                            "manufacturer": "Boeing",
                            "registered_owner": format!("Owner of {reg}"),
                            "registered_owner_country_name": "United States",
                            "registered_owner_country_iso_name": "US"
                        }}}))
                    }
                }),
            )
            .route(
                "/v0/callsign/:callsign",
                get(move || {
                    route_calls.route.fetch_add(1, Ordering::SeqCst);
                    async { (axum::http::StatusCode::NOT_FOUND, Json(json!({"response": "unknown callsign"}))) }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn config_for(base: &str) -> Config {
        let mut config = Config::default();
        config.sources.adsb_lol = base.to_string();
        config.sources.adsbdb = base.to_string();
        config
    }

    fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteDb> {
        let path = dir.path().join("poll.db").to_str().unwrap().to_string();
        Arc::new(SqliteDb::new(path, Coalescer::default()).unwrap())
    }

    #[tokio::test]
    async fn test_poll_once_logs_and_caches() {
        let calls = Arc::new(Calls::default());
        let closest = json!({"ac": [{
            "hex": "a1b2c3", "r": "N123UA", "flight": "UAL123 ", "t": "B738",
            "alt_baro": 31000, "gs": 450.0, "dst": 3.1, "track": 270.0
        }]});
        let base = mock_upstream(closest, calls.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir);

        let config = config_for(&base);
        let mut poller = Poller::new(&config, http_client(5).unwrap(), store.clone());

        let id1 = poller.poll_once().await.unwrap().unwrap();
        let id2 = poller.poll_once().await.unwrap().unwrap();
        assert_eq!(id1, id2);

        // Identity unchanged: one lookup each
        assert_eq!(calls.aircraft.load(Ordering::SeqCst), 1);
        assert_eq!(calls.route.load(Ordering::SeqCst), 1);
        assert_eq!(poller.cache.hits, 1);

        let ev = store.latest().await.unwrap().unwrap().record;
        assert_eq!(ev.times_seen, 2);
        assert_eq!(ev.hex.as_deref(), Some("A1B2C3"));
        assert_eq!(ev.callsign.as_deref(), Some("UAL123"));
        assert_eq!(ev.descriptive.type_code.as_deref(), Some("B738"));
        assert_eq!(ev.descriptive.model.as_deref(), Some("737-824"));
        assert_eq!(ev.descriptive.owner.as_deref(), Some("Owner of N123UA"));
        // Route lookup 404 is "no data"
        assert!(ev.descriptive.airline_name.is_none());
        assert_eq!(ev.telemetry.altitude_ft, Some(31000.0));
    }

    #[tokio::test]
    async fn test_poll_once_empty_sky() {
        let base = mock_upstream(json!({"ac": []}), Arc::new(Calls::default())).await;
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir);

        let mut poller = Poller::new(&config_for(&base), http_client(5).unwrap(), store.clone());
        assert!(poller.poll_once().await.unwrap().is_none());
        assert!(store.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_once_upstream_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir);

        let config = config_for("http://127.0.0.1:9");
        let mut poller = Poller::new(&config, http_client(2).unwrap(), store);
        assert!(matches!(poller.poll_once().await, Err(PollError::Http(_))));
    }

    struct RejectingStore;

    #[async_trait::async_trait]
    impl FlightStore for RejectingStore {
        async fn ingest(&self, _: Sighting) -> Result<EventId, StoreError> {
            Err(StoreError::Corrupt("read-only".into()))
        }
        async fn recent(&self, _: i64) -> Result<Vec<flightlog_core::StoredEvent>, StoreError> {
            Ok(Vec::new())
        }
        async fn latest(&self) -> Result<Option<flightlog_core::StoredEvent>, StoreError> {
            Ok(None)
        }
        async fn detail(&self, _: &str, _: &str) -> Result<Option<crate::db::FlightDetail>, StoreError> {
            Ok(None)
        }
        async fn stats(&self, _: chrono::NaiveDate) -> Result<crate::db::DbStats, StoreError> {
            Err(StoreError::Corrupt("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_does_not_stop_cycle() {
        let closest = json!({"hex": "abc123", "lat": 42.0, "lon": -83.0});
        let base = mock_upstream(closest, Arc::new(Calls::default())).await;

        let mut poller = Poller::new(
            &config_for(&base),
            http_client(5).unwrap(),
            Arc::new(RejectingStore),
        );
        assert!(poller.poll_once().await.unwrap().is_none());
        assert!(poller.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_until_stops() {
        let base = mock_upstream(json!({"ac": []}), Arc::new(Calls::default())).await;
        let dir = tempfile::tempdir().unwrap();
        let poller = Poller::new(&config_for(&base), http_client(5).unwrap(), sqlite_store(&dir));

        tokio::time::timeout(
            Duration::from_secs(5),
            poller.run_until(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap();
    }
}
