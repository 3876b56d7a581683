//! SQLite persistence: WAL mode, one `flights` table of coalesced events.
//!
//! Every ingest is a single `BEGIN IMMEDIATE` transaction: the freshest
//! in-window lookup and the insert/update happen under the write lock, so
//! concurrent writers on other connections cannot open a duplicate event.

use std::path::Path;
use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;

use flightlog_core::event::{event_key, timestamp_text, Coalescer, EventKey, EventRecord, StoredEvent, WritePlan};
use flightlog_core::types::{format_timestamp, parse_timestamp, Descriptive, EventId, Sighting, Telemetry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flights (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seen_at TEXT NOT NULL,
    hex TEXT,
    reg TEXT,
    callsign TEXT,
    type_code TEXT,
    model TEXT,
    manufacturer TEXT,
    country TEXT,
    country_iso TEXT,
    owner TEXT,
    airline_name TEXT,
    origin_iata TEXT,
    origin_name TEXT,
    dest_iata TEXT,
    dest_name TEXT,
    altitude_ft REAL,
    ground_speed_kt REAL,
    distance_nm REAL,
    heading_deg REAL,
    event_key TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    times_seen INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_flights_key_last_seen ON flights(event_key, last_seen);
CREATE INDEX IF NOT EXISTS idx_flights_seen_at ON flights(seen_at);
CREATE INDEX IF NOT EXISTS idx_flights_reg ON flights(reg);
CREATE INDEX IF NOT EXISTS idx_flights_hex ON flights(hex);
"#;

const EVENT_COLUMNS: &str = "id, seen_at, hex, reg, callsign, type_code, model, manufacturer,
    country, country_iso, owner, airline_name, origin_iata, origin_name, dest_iata, dest_name,
    altitude_ft, ground_speed_kt, distance_nm, heading_deg, event_key, first_seen, last_seen,
    times_seen";

/// How long a writer waits for another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Days covered by the per-day breakdown in [`DbStats`].
pub const STATS_DAYS: u64 = 30;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("{0:?} cannot back a per-call store; use a file path")]
    Unsupported(String),
}

#[derive(Debug, Error)]
#[error("unparseable timestamp {0:?}")]
struct BadTimestamp(String);

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persisted event store shared by the poller, the ingest API, and the query
/// layer.
#[async_trait::async_trait]
pub trait FlightStore: Send + Sync {
    /// Coalesce one sighting. Exactly one row is inserted or updated.
    async fn ingest(&self, sighting: Sighting) -> Result<EventId, StoreError>;

    /// Most recent events, newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<StoredEvent>, StoreError>;

    /// Newest event row.
    async fn latest(&self) -> Result<Option<StoredEvent>, StoreError>;

    /// Latest row plus aggregates across every event for an aircraft.
    async fn detail(&self, reg: &str, hex: &str) -> Result<Option<FlightDetail>, StoreError>;

    async fn stats(&self, today: NaiveDate) -> Result<DbStats, StoreError>;
}

/// Trim + uppercase a detail lookup value.
pub fn normalize_lookup(value: &str) -> String {
    value.trim().to_ascii_uppercase()
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite database of coalesced flight events.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database { conn })
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Coalesce a sighting into the event log. Returns the affected event id.
    ///
    /// On error the transaction rolls back and no row is changed.
    pub fn ingest(&mut self, coalescer: &Coalescer, sighting: &Sighting) -> Result<EventId, StoreError> {
        let observed_at = coalescer.observed_at(sighting);
        let key = event_key(sighting);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = if key.is_degenerate() {
            None
        } else {
            find_open_event(&tx, &key, coalescer, observed_at)?
        };

        let id = match coalescer.resolve(sighting, key, observed_at, candidate) {
            WritePlan::Update(event) => {
                if update_event(&tx, &event)? == 0 {
                    return Err(StoreError::Corrupt(format!("event {} vanished", event.id)));
                }
                event.id
            }
            WritePlan::Insert(record) => insert_event(&tx, &record)?,
        };

        tx.commit()?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM flights ORDER BY id DESC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn latest_event(&self) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.recent_events(1)?.into_iter().next())
    }

    // -----------------------------------------------------------------------
    // Detail
    // -----------------------------------------------------------------------

    /// Look up an aircraft by registration and/or hex.
    ///
    /// Both empty returns `None`. Aggregates span every coalesced event
    /// matching the filter, not just the latest one.
    pub fn flight_detail(&self, reg: &str, hex: &str) -> Result<Option<FlightDetail>, StoreError> {
        let reg = normalize_lookup(reg);
        let hex = normalize_lookup(hex);
        if reg.is_empty() && hex.is_empty() {
            return Ok(None);
        }

        let mut conditions = Vec::new();
        let mut bind_values: Vec<Box<dyn ToSql>> = Vec::new();
        if !reg.is_empty() {
            conditions.push(format!("UPPER(reg) = ?{}", bind_values.len() + 1));
            bind_values.push(Box::new(reg));
        }
        if !hex.is_empty() {
            conditions.push(format!("UPPER(hex) = ?{}", bind_values.len() + 1));
            bind_values.push(Box::new(hex));
        }
        let where_clause = conditions.join(" AND ");
        let refs: Vec<&dyn ToSql> = bind_values.iter().map(|b| b.as_ref()).collect();

        let latest_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM flights WHERE {where_clause} ORDER BY id DESC LIMIT 1"
        );
        let latest = match self
            .conn
            .query_row(&latest_sql, refs.as_slice(), row_to_event)
            .optional()?
        {
            Some(ev) => ev,
            None => return Ok(None),
        };

        let agg_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(times_seen), 0), MIN(first_seen), MAX(last_seen)
             FROM flights WHERE {where_clause}"
        );
        let (event_count, total_seen, first_seen, last_seen) =
            self.conn.query_row(&agg_sql, refs.as_slice(), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    ts_column(r, 2)?,
                    ts_column(r, 3)?,
                ))
            })?;

        Ok(Some(FlightDetail {
            latest,
            event_count,
            total_seen,
            first_seen,
            last_seen,
        }))
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self, today: NaiveDate) -> Result<DbStats, StoreError> {
        let today_str = today.format("%Y-%m-%d").to_string();
        let since = today
            .checked_sub_days(Days::new(STATS_DAYS - 1))
            .unwrap_or(today)
            .format("%Y-%m-%d")
            .to_string();

        let (total_events, total_sightings): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(times_seen), 0) FROM flights",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let events_today: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM flights WHERE date(seen_at) = ?1",
            params![today_str],
            |r| r.get(0),
        )?;

        let unique_today: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT COALESCE(NULLIF(reg, ''), hex)) FROM flights
             WHERE date(seen_at) = ?1",
            params![today_str],
            |r| r.get(0),
        )?;

        let top_today = self.count_rows(
            "SELECT airline_name, COUNT(*) AS cnt FROM flights
             WHERE date(seen_at) = ?1 AND airline_name IS NOT NULL AND airline_name != ''
             GROUP BY airline_name ORDER BY cnt DESC, airline_name LIMIT 1",
            params![today_str],
        )?;
        let (top_airline_today, top_airline_today_count) = match top_today.into_iter().next() {
            Some(row) => (Some(row.name), row.count),
            None => (None, 0),
        };

        let top_airlines = self.count_rows(
            "SELECT airline_name, COUNT(*) AS cnt FROM flights
             WHERE airline_name IS NOT NULL AND airline_name != ''
             GROUP BY airline_name ORDER BY cnt DESC, airline_name LIMIT 10",
            [],
        )?;

        let top_types = self.count_rows(
            "SELECT COALESCE(NULLIF(model, ''), type_code) AS aircraft_type, COUNT(*) AS cnt
             FROM flights
             WHERE COALESCE(NULLIF(model, ''), type_code) IS NOT NULL
               AND COALESCE(NULLIF(model, ''), type_code) != ''
             GROUP BY aircraft_type ORDER BY cnt DESC, aircraft_type LIMIT 10",
            [],
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(NULLIF(country, ''), country_iso) AS c, MAX(country_iso), COUNT(*) AS cnt
             FROM flights
             WHERE COALESCE(NULLIF(country, ''), country_iso) IS NOT NULL
               AND COALESCE(NULLIF(country, ''), country_iso) != ''
             GROUP BY c ORDER BY cnt DESC, c LIMIT 10",
        )?;
        let top_countries = stmt
            .query_map([], |r| {
                Ok(CountryCount {
                    country: r.get(0)?,
                    country_iso: r.get(1)?,
                    count: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(NULLIF(reg, ''), hex) AS key_id, MAX(reg), MAX(hex),
                    MAX(airline_name), MAX(country), MAX(country_iso),
                    COUNT(*) AS cnt, SUM(times_seen), MIN(first_seen), MAX(last_seen)
             FROM flights
             WHERE COALESCE(NULLIF(reg, ''), hex) IS NOT NULL
               AND COALESCE(NULLIF(reg, ''), hex) != ''
             GROUP BY key_id ORDER BY cnt DESC, key_id LIMIT 10",
        )?;
        let top_aircraft = stmt
            .query_map([], |r| {
                Ok(AircraftCount {
                    key_id: r.get(0)?,
                    reg: r.get(1)?,
                    hex: r.get(2)?,
                    airline_name: r.get(3)?,
                    country: r.get(4)?,
                    country_iso: r.get(5)?,
                    events: r.get(6)?,
                    total_seen: r.get(7)?,
                    first_seen: ts_column(r, 8)?,
                    last_seen: ts_column(r, 9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT date(seen_at) AS day, COUNT(*), SUM(times_seen) FROM flights
             WHERE date(seen_at) >= ?1 AND date(seen_at) <= ?2
             GROUP BY day ORDER BY day",
        )?;
        let by_day = stmt
            .query_map(params![since, today_str], |r| {
                Ok(DayCount {
                    day: r.get(0)?,
                    events: r.get(1)?,
                    sightings: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(DbStats {
            total_events,
            total_sightings,
            events_today,
            unique_today,
            top_airline_today,
            top_airline_today_count,
            top_airlines,
            top_types,
            top_countries,
            top_aircraft,
            by_day,
        })
    }

    fn count_rows<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<NameCount>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |r| {
                Ok(NameCount {
                    name: r.get(0)?,
                    count: r.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
impl Database {
    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    pub fn event(&self, id: EventId) -> Result<Option<StoredEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM flights WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], row_to_event)
            .optional()?)
    }

    pub fn count_events(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM flights", [], |r| r.get(0))?)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Freshest event for `key` whose `last_seen` is at or after `cutoff`.
fn find_open_event(
    conn: &Connection,
    key: &EventKey,
    coalescer: &Coalescer,
    observed_at: NaiveDateTime,
) -> Result<Option<StoredEvent>, StoreError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM flights
         WHERE event_key = ?1 AND last_seen >= ?2 AND last_seen <= ?3
         ORDER BY last_seen DESC, id DESC LIMIT 1"
    );
    let cutoff = format_timestamp(&coalescer.cutoff(observed_at));
    let horizon = format_timestamp(&coalescer.horizon(observed_at));
    Ok(conn
        .query_row(&sql, params![key.as_str(), cutoff, horizon], row_to_event)
        .optional()?)
}

fn insert_event(conn: &Connection, ev: &EventRecord) -> Result<EventId, StoreError> {
    let d = &ev.descriptive;
    let t = &ev.telemetry;
    conn.execute(
        "INSERT INTO flights (
             seen_at, hex, reg, callsign, type_code, model, manufacturer, country, country_iso,
             owner, airline_name, origin_iata, origin_name, dest_iata, dest_name,
             altitude_ft, ground_speed_kt, distance_nm, heading_deg,
             event_key, first_seen, last_seen, times_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            format_timestamp(&ev.seen_at),
            ev.hex,
            ev.reg,
            ev.callsign,
            d.type_code,
            d.model,
            d.manufacturer,
            d.country,
            d.country_iso,
            d.owner,
            d.airline_name,
            d.origin_iata,
            d.origin_name,
            d.dest_iata,
            d.dest_name,
            t.altitude_ft,
            t.ground_speed_kt,
            t.distance_nm,
            t.heading_deg,
            ev.event_key.as_str(),
            format_timestamp(&ev.first_seen),
            format_timestamp(&ev.last_seen),
            ev.times_seen,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write back the mutable columns. Identity and `first_seen` are untouched.
fn update_event(conn: &Connection, ev: &StoredEvent) -> Result<usize, StoreError> {
    let r = &ev.record;
    let d = &r.descriptive;
    let t = &r.telemetry;
    let changed = conn.execute(
        "UPDATE flights SET
             seen_at = ?1, last_seen = ?2, times_seen = ?3,
             altitude_ft = ?4, ground_speed_kt = ?5, distance_nm = ?6, heading_deg = ?7,
             type_code = ?8, model = ?9, manufacturer = ?10, country = ?11, country_iso = ?12,
             owner = ?13, airline_name = ?14, origin_iata = ?15, origin_name = ?16,
             dest_iata = ?17, dest_name = ?18
         WHERE id = ?19",
        params![
            format_timestamp(&r.seen_at),
            format_timestamp(&r.last_seen),
            r.times_seen,
            t.altitude_ft,
            t.ground_speed_kt,
            t.distance_nm,
            t.heading_deg,
            d.type_code,
            d.model,
            d.manufacturer,
            d.country,
            d.country_iso,
            d.owner,
            d.airline_name,
            d.origin_iata,
            d.origin_name,
            d.dest_iata,
            d.dest_name,
            ev.id,
        ],
    )?;
    Ok(changed)
}

fn ts_column(r: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let text: String = r.get(idx)?;
    parse_timestamp(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(BadTimestamp(text)))
    })
}

fn row_to_event(r: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        id: r.get(0)?,
        record: EventRecord {
            seen_at: ts_column(r, 1)?,
            hex: r.get(2)?,
            reg: r.get(3)?,
            callsign: r.get(4)?,
            descriptive: Descriptive {
                type_code: r.get(5)?,
                model: r.get(6)?,
                manufacturer: r.get(7)?,
                country: r.get(8)?,
                country_iso: r.get(9)?,
                owner: r.get(10)?,
                airline_name: r.get(11)?,
                origin_iata: r.get(12)?,
                origin_name: r.get(13)?,
                dest_iata: r.get(14)?,
                dest_name: r.get(15)?,
            },
            telemetry: Telemetry {
                altitude_ft: r.get(16)?,
                ground_speed_kt: r.get(17)?,
                distance_nm: r.get(18)?,
                heading_deg: r.get(19)?,
            },
            event_key: EventKey::from(r.get::<_, String>(20)?),
            first_seen: ts_column(r, 21)?,
            last_seen: ts_column(r, 22)?,
            times_seen: r.get(23)?,
        },
    })
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct FlightDetail {
    pub latest: StoredEvent,
    pub event_count: i64,
    pub total_seen: i64,
    #[serde(with = "timestamp_text")]
    pub first_seen: NaiveDateTime,
    #[serde(with = "timestamp_text")]
    pub last_seen: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct NameCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct CountryCount {
    pub country: String,
    pub country_iso: Option<String>,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct AircraftCount {
    pub key_id: String,
    pub reg: Option<String>,
    pub hex: Option<String>,
    pub airline_name: Option<String>,
    pub country: Option<String>,
    pub country_iso: Option<String>,
    pub events: i64,
    pub total_seen: i64,
    #[serde(with = "timestamp_text")]
    pub first_seen: NaiveDateTime,
    #[serde(with = "timestamp_text")]
    pub last_seen: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct DayCount {
    pub day: String,
    pub events: i64,
    pub sightings: i64,
}

#[derive(Debug, Serialize)]
pub struct DbStats {
    pub total_events: i64,
    pub total_sightings: i64,
    pub events_today: i64,
    pub unique_today: i64,
    pub top_airline_today: Option<String>,
    pub top_airline_today_count: i64,
    pub top_airlines: Vec<NameCount>,
    pub top_types: Vec<NameCount>,
    pub top_countries: Vec<CountryCount>,
    pub top_aircraft: Vec<AircraftCount>,
    pub by_day: Vec<DayCount>,
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// [`FlightStore`] over a SQLite file.
///
/// Each call opens its own connection on the blocking pool and drops it when
/// done, so no handle outlives an operation.
pub struct SqliteDb {
    path: String,
    coalescer: Coalescer,
}

impl SqliteDb {
    /// Open (creating if needed) the database once to validate the path.
    ///
    /// `:memory:` is rejected since every call would see a fresh database.
    pub fn new(path: impl Into<String>, coalescer: Coalescer) -> Result<Self, StoreError> {
        let path = path.into();
        if path == ":memory:" {
            return Err(StoreError::Unsupported(path));
        }
        Database::open(&path)?;
        Ok(SqliteDb { path, coalescer })
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = Database::open(&path)?;
            f(&mut db)
        })
        .await?
    }
}

#[async_trait::async_trait]
impl FlightStore for SqliteDb {
    async fn ingest(&self, sighting: Sighting) -> Result<EventId, StoreError> {
        let coalescer = self.coalescer;
        self.with_db(move |db| db.ingest(&coalescer, &sighting)).await
    }

    async fn recent(&self, limit: i64) -> Result<Vec<StoredEvent>, StoreError> {
        self.with_db(move |db| db.recent_events(limit)).await
    }

    async fn latest(&self) -> Result<Option<StoredEvent>, StoreError> {
        self.with_db(|db| db.latest_event()).await
    }

    async fn detail(&self, reg: &str, hex: &str) -> Result<Option<FlightDetail>, StoreError> {
        let (reg, hex) = (reg.to_string(), hex.to_string());
        self.with_db(move |db| db.flight_detail(&reg, &hex)).await
    }

    async fn stats(&self, today: NaiveDate) -> Result<DbStats, StoreError> {
        self.with_db(move |db| db.stats(today)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flightlog_core::event::DEGENERATE_KEY;
    use std::sync::Arc;

    fn test_db() -> Database {
        Database::open_memory().unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn sighting(hex: &str, callsign: &str, ts: NaiveDateTime) -> Sighting {
        Sighting {
            observed_at: Some(ts),
            hex: Some(hex.into()),
            callsign: Some(callsign.into()),
            ..Default::default()
        }
    }

    fn get(db: &Database, id: EventId) -> EventRecord {
        db.event(id).unwrap().unwrap().record
    }

    #[test]
    fn test_open_memory() {
        let db = test_db();
        assert_eq!(db.count_events().unwrap(), 0);
        assert!(db.latest_event().unwrap().is_none());
    }

    #[test]
    fn test_scenario_a_same_row_updated() {
        let mut db = test_db();
        let c = Coalescer::default();

        let mut s1 = sighting("A1B2", "UAL123", at(10, 0, 0));
        s1.telemetry.altitude_ft = Some(30000.0);
        let id1 = db.ingest(&c, &s1).unwrap();
        assert_eq!(get(&db, id1).times_seen, 1);

        let mut s2 = sighting("A1B2", "UAL123", at(10, 5, 0));
        s2.telemetry.altitude_ft = Some(31000.0);
        s2.descriptive.owner = Some("United".into());
        let id2 = db.ingest(&c, &s2).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(db.count_events().unwrap(), 1);
        let ev = get(&db, id1);
        assert_eq!(ev.telemetry.altitude_ft, Some(31000.0));
        assert_eq!(ev.descriptive.owner.as_deref(), Some("United"));
        assert_eq!(ev.times_seen, 2);
        assert_eq!(ev.first_seen, at(10, 0, 0));
        assert_eq!(ev.last_seen, at(10, 5, 0));
        assert_eq!(ev.seen_at, at(10, 5, 0));
    }

    #[test]
    fn test_scenario_b_gap_splits() {
        let mut db = test_db();
        let c = Coalescer::default();
        let id1 = db.ingest(&c, &sighting("C3D4", "", at(9, 0, 0))).unwrap();
        let id2 = db.ingest(&c, &sighting("C3D4", "", at(9, 25, 0))).unwrap();

        assert_ne!(id1, id2);
        assert_eq!(get(&db, id1).times_seen, 1);
        assert_eq!(get(&db, id2).times_seen, 1);
    }

    #[test]
    fn test_scenario_c_degenerate_key() {
        let mut db = test_db();
        let c = Coalescer::default();
        let blank = |ts| Sighting {
            observed_at: Some(ts),
            hex: Some(String::new()),
            reg: Some(String::new()),
            callsign: Some(String::new()),
            ..Default::default()
        };

        let id1 = db.ingest(&c, &blank(at(8, 0, 0))).unwrap();
        let id2 = db.ingest(&c, &blank(at(8, 0, 0))).unwrap();
        assert_ne!(id1, id2);
        for id in [id1, id2] {
            let ev = get(&db, id);
            assert_eq!(ev.event_key.as_str(), DEGENERATE_KEY);
            assert_eq!(ev.times_seen, 1);
        }
    }

    #[test]
    fn test_window_boundary() {
        let c = Coalescer::default();

        let mut db = test_db();
        let id = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 0, 0))).unwrap();
        let inside = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 19, 59))).unwrap();
        assert_eq!(id, inside);

        let mut db = test_db();
        let id = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 0, 0))).unwrap();
        let outside = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 20, 1))).unwrap();
        assert_ne!(id, outside);
        assert_eq!(db.count_events().unwrap(), 2);
    }

    #[test]
    fn test_window_measured_from_last_seen() {
        let mut db = test_db();
        let c = Coalescer::default();
        // 15-minute steps keep extending one event past 20 minutes total
        let id = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 0, 0))).unwrap();
        db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 15, 0))).unwrap();
        db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 30, 0))).unwrap();

        assert_eq!(db.count_events().unwrap(), 1);
        let ev = get(&db, id);
        assert_eq!(ev.times_seen, 3);
        assert_eq!(ev.first_seen, at(10, 0, 0));
        assert_eq!(ev.last_seen, at(10, 30, 0));
    }

    #[test]
    fn test_custom_window() {
        let mut db = test_db();
        let c = Coalescer::new(5);
        let id1 = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 0, 0))).unwrap();
        let id2 = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 6, 0))).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_sticky_fields() {
        let mut db = test_db();
        let c = Coalescer::default();

        let mut s = sighting("A1B2", "UAL123", at(10, 0, 0));
        s.descriptive.owner = Some(String::new());
        let id = db.ingest(&c, &s).unwrap();

        let mut s = sighting("A1B2", "UAL123", at(10, 1, 0));
        s.descriptive.owner = Some("Acme".into());
        db.ingest(&c, &s).unwrap();
        assert_eq!(get(&db, id).descriptive.owner.as_deref(), Some("Acme"));

        let mut s = sighting("A1B2", "UAL123", at(10, 2, 0));
        s.descriptive.owner = Some(String::new());
        db.ingest(&c, &s).unwrap();
        assert_eq!(get(&db, id).descriptive.owner.as_deref(), Some("Acme"));
    }

    #[test]
    fn test_telemetry_not_sticky() {
        let mut db = test_db();
        let c = Coalescer::default();

        let mut s = sighting("A1B2", "UAL123", at(10, 0, 0));
        s.telemetry.altitude_ft = Some(30000.0);
        s.telemetry.heading_deg = Some(90.0);
        let id = db.ingest(&c, &s).unwrap();

        let s = sighting("A1B2", "UAL123", at(10, 1, 0));
        db.ingest(&c, &s).unwrap();

        let ev = get(&db, id);
        assert_eq!(ev.telemetry.altitude_ft, None);
        assert_eq!(ev.telemetry.heading_deg, None);
    }

    #[test]
    fn test_count_monotonicity() {
        let mut db = test_db();
        let c = Coalescer::default();
        let times: Vec<_> = (0..10).map(|i| at(10, i * 2, 0)).collect();

        let ids: Vec<_> = times
            .iter()
            .map(|t| db.ingest(&c, &sighting("A1B2", "UAL123", *t)).unwrap())
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));

        let ev = get(&db, ids[0]);
        assert_eq!(ev.times_seen, 10);
        assert_eq!(ev.first_seen, times[0]);
        assert_eq!(ev.last_seen, times[9]);
    }

    #[test]
    fn test_missing_timestamp_uses_now() {
        let mut db = test_db();
        let c = Coalescer::default();
        let s = Sighting {
            hex: Some("A1B2".into()),
            ..Default::default()
        };
        let before = flightlog_core::types::now_local();
        let id = db.ingest(&c, &s).unwrap();
        let ev = get(&db, id);
        assert!(ev.first_seen >= before);
        assert_eq!(ev.first_seen, ev.last_seen);
    }

    #[test]
    fn test_old_sighting_does_not_join_current_event() {
        let mut db = test_db();
        let c = Coalescer::default();
        let current = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 0, 0))).unwrap();

        let old_at = NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let old = db.ingest(&c, &sighting("A1B2", "UAL123", old_at)).unwrap();

        assert_ne!(current, old);
        assert_eq!(db.count_events().unwrap(), 2);
        assert_eq!(get(&db, current).times_seen, 1);
        assert_eq!(get(&db, current).first_seen, at(10, 0, 0));
        assert_eq!(get(&db, old).first_seen, old_at);

        // Just past the far edge of the window is a separate event too
        let edge = db.ingest(&c, &sighting("A1B2", "UAL123", at(9, 39, 59))).unwrap();
        assert_ne!(edge, current);
        let inside = db.ingest(&c, &sighting("A1B2", "UAL123", at(9, 40, 0))).unwrap();
        assert_eq!(inside, current);
    }

    #[test]
    fn test_sqlite_store_rejects_memory_path() {
        let err = SqliteDb::new(":memory:", Coalescer::default()).err().unwrap();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_freshest_candidate_wins() {
        let mut db = test_db();
        let c = Coalescer::default();
        let old = db.ingest(&c, &sighting("A1B2", "UAL123", at(9, 0, 0))).unwrap();
        let fresh = db.ingest(&c, &sighting("A1B2", "UAL123", at(9, 30, 0))).unwrap();
        // Late arrival inside both windows joins the newer event
        let hit = db.ingest(&c, &sighting("A1B2", "UAL123", at(9, 19, 0))).unwrap();

        assert_eq!(hit, fresh);
        assert_eq!(get(&db, old).times_seen, 1);
        assert_eq!(get(&db, fresh).times_seen, 2);
    }

    #[test]
    fn test_recent_events_newest_first() {
        let mut db = test_db();
        let c = Coalescer::default();
        for (i, hex) in ["AAAA", "BBBB", "CCCC"].iter().enumerate() {
            db.ingest(&c, &sighting(hex, "", at(10, i as u32, 0))).unwrap();
        }

        let recent = db.recent_events(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record.hex.as_deref(), Some("CCCC"));
        assert_eq!(recent[1].record.hex.as_deref(), Some("BBBB"));
        assert_eq!(db.latest_event().unwrap().unwrap().record.hex.as_deref(), Some("CCCC"));
    }

    #[test]
    fn test_flight_detail_aggregates_all_events() {
        let mut db = test_db();
        let c = Coalescer::default();
        let tail = |callsign: &str, ts| Sighting {
            observed_at: Some(ts),
            hex: Some("A1B2C3".into()),
            reg: Some("N123UA".into()),
            callsign: Some(callsign.into()),
            ..Default::default()
        };

        db.ingest(&c, &tail("UAL123", at(8, 0, 0))).unwrap();
        db.ingest(&c, &tail("UAL123", at(8, 10, 0))).unwrap();
        db.ingest(&c, &tail("UAL456", at(14, 0, 0))).unwrap();
        db.ingest(&c, &sighting("FFFF", "DAL1", at(15, 0, 0))).unwrap();

        let detail = db.flight_detail(" n123ua ", "").unwrap().unwrap();
        assert_eq!(detail.event_count, 2);
        assert_eq!(detail.total_seen, 3);
        assert_eq!(detail.first_seen, at(8, 0, 0));
        assert_eq!(detail.last_seen, at(14, 0, 0));
        assert_eq!(detail.latest.record.callsign.as_deref(), Some("UAL456"));

        let by_both = db.flight_detail("N123UA", "a1b2c3").unwrap().unwrap();
        assert_eq!(by_both.event_count, 2);

        assert!(db.flight_detail("N123UA", "FFFF").unwrap().is_none());
        assert!(db.flight_detail("", "  ").unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let mut db = test_db();
        let c = Coalescer::default();
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2024, 4, 30).unwrap();

        let mk = |hex: &str, reg: &str, airline: &str, model: &str, ts: NaiveDateTime| Sighting {
            observed_at: Some(ts),
            hex: Some(hex.into()),
            reg: Some(reg.into()),
            callsign: None,
            descriptive: Descriptive {
                airline_name: Some(airline.into()),
                model: Some(model.into()),
                country: Some("United States".into()),
                country_iso: Some("US".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        db.ingest(
            &c,
            &mk("A1", "N1", "Delta Air Lines", "B738", yesterday.and_hms_opt(20, 0, 0).unwrap()),
        )
        .unwrap();
        db.ingest(&c, &mk("A1", "N1", "United Airlines", "B738", at(9, 0, 0))).unwrap();
        db.ingest(&c, &mk("A1", "N1", "United Airlines", "B738", at(9, 5, 0))).unwrap();
        db.ingest(&c, &mk("A2", "N2", "United Airlines", "A320", at(11, 0, 0))).unwrap();
        db.ingest(&c, &mk("A3", "", "Delta Air Lines", "A320", at(12, 0, 0))).unwrap();

        let stats = db.stats(today).unwrap();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.total_sightings, 5);
        assert_eq!(stats.events_today, 3);
        assert_eq!(stats.unique_today, 3);
        assert_eq!(stats.top_airline_today.as_deref(), Some("United Airlines"));
        assert_eq!(stats.top_airline_today_count, 2);
        assert_eq!(stats.top_airlines.len(), 2);
        assert_eq!(stats.top_types[0].count, 2);
        assert_eq!(stats.top_countries[0].country, "United States");
        assert_eq!(stats.top_countries[0].count, 4);

        assert_eq!(stats.top_aircraft[0].key_id, "N1");
        assert_eq!(stats.top_aircraft[0].events, 2);
        assert_eq!(stats.top_aircraft[0].total_seen, 3);
        assert!(stats.top_aircraft.iter().any(|a| a.key_id == "A3"));

        assert_eq!(stats.by_day.len(), 2);
        assert_eq!(stats.by_day[0].day, "2024-04-30");
        assert_eq!(stats.by_day[1].events, 3);
        assert_eq!(stats.by_day[1].sightings, 4);
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let mut db = test_db();
        let c = Coalescer::default();
        let id = db.ingest(&c, &sighting("A1B2", "UAL123", at(10, 0, 0))).unwrap();
        db.conn
            .execute("UPDATE flights SET first_seen = 'garbage' WHERE id = ?1", params![id])
            .unwrap();
        assert!(db.event(id).is_err());
    }

    #[test]
    fn test_concurrent_connections_share_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flights.db").to_str().unwrap().to_string();
        Database::open(&path).unwrap();

        let path = Arc::new(path);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || {
                    let mut db = Database::open(&path).unwrap();
                    let c = Coalescer::default();
                    for j in 0..5 {
                        let s = sighting("A1B2", "UAL123", at(10, 0, i * 5 + j));
                        db.ingest(&c, &s).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.count_events().unwrap(), 1);
        let ev = db.latest_event().unwrap().unwrap();
        assert_eq!(ev.record.times_seen, 40);
        assert_eq!(ev.record.last_seen, at(10, 0, 39));
    }

    #[tokio::test]
    async fn test_sqlite_store_trait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db").to_str().unwrap().to_string();
        let store = SqliteDb::new(path, Coalescer::default()).unwrap();

        let id = store.ingest(sighting("A1B2", "UAL123", at(10, 0, 0))).await.unwrap();
        let same = store.ingest(sighting("A1B2", "UAL123", at(10, 1, 0))).await.unwrap();
        assert_eq!(id, same);

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record.times_seen, 2);

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, id);

        let detail = store.detail("", "a1b2").await.unwrap().unwrap();
        assert_eq!(detail.total_seen, 2);

        let stats = store.stats(at(0, 0, 0).date()).await.unwrap();
        assert_eq!(stats.total_events, 1);
    }
}
