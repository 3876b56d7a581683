//! Server-sent event stream of the newest flight row.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use tracing::warn;

use flightlog_core::event::StoredEvent;
use flightlog_core::types::EventId;

use crate::web::AppState;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// What identifies a visible change to the latest row.
type Marker = (EventId, i64);

/// New marker if `latest` differs from what was last pushed.
fn changed(last: Option<Marker>, latest: &StoredEvent) -> Option<Marker> {
    let marker = (latest.id, latest.record.times_seen);
    (last != Some(marker)).then_some(marker)
}

struct LiveCursor {
    state: Arc<AppState>,
    last: Option<Marker>,
    primed: bool,
}

/// GET /events: push the latest row whenever a new event opens or the
/// current one is seen again.
pub async fn live_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let cursor = LiveCursor {
        state,
        last: None,
        primed: false,
    };

    let stream = stream::unfold(cursor, |mut cursor| async move {
        loop {
            if cursor.primed {
                tokio::time::sleep(cursor.state.live_interval).await;
            }
            cursor.primed = true;

            let latest = match cursor.state.db.latest().await {
                Ok(Some(ev)) => ev,
                Ok(None) => continue,
                Err(e) => {
                    warn!("live stream store read failed: {e}");
                    continue;
                }
            };

            if let Some(marker) = changed(cursor.last, &latest) {
                cursor.last = Some(marker);
                let event = Event::default().json_data(&latest);
                return Some((event, cursor));
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::StreamExt;
    use tower::ServiceExt;

    use crate::db::FlightStore;
    use crate::web::build_router;
    use crate::web::testing::test_state;
    use flightlog_core::event::{event_key, EventRecord};
    use flightlog_core::types::{now_local, Sighting};

    fn stored(id: EventId, times_seen: i64) -> StoredEvent {
        let s = Sighting {
            hex: Some("A1B2C3".into()),
            ..Default::default()
        };
        let mut record = EventRecord::open(&s, event_key(&s), now_local());
        record.times_seen = times_seen;
        StoredEvent { id, record }
    }

    #[test]
    fn test_change_detection() {
        let first = changed(None, &stored(1, 1));
        assert_eq!(first, Some((1, 1)));
        assert_eq!(changed(first, &stored(1, 1)), None);
        assert_eq!(changed(first, &stored(1, 2)), Some((1, 2)));
        assert_eq!(changed(first, &stored(2, 1)), Some((2, 1)));
    }

    #[tokio::test]
    async fn test_stream_pushes_latest_then_updates() {
        let (state, db, _dir) = test_state(None);
        let s = Sighting {
            hex: Some("A1B2C3".into()),
            callsign: Some("UAL123".into()),
            ..Default::default()
        };
        db.ingest(s.clone()).await.unwrap();

        let response = build_router(state)
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&chunk).to_string();
        assert!(text.starts_with("data: "));
        assert!(!text.contains("event:"));
        assert!(text.contains("\"times_seen\":1"));

        db.ingest(s).await.unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk).to_string();
        assert!(text.contains("\"times_seen\":2"));
    }
}
