//! PostgreSQL backend for multi-writer deployments.
//!
//! Requires the `postgres` feature flag. Same `flights` table as SQLite, with
//! native `TIMESTAMP` columns and a connection pool. Concurrent ingests of one
//! key serialize on a transaction-scoped advisory lock, so the lookup and the
//! write for a key never interleave across processes.

#![cfg(feature = "postgres")]

use chrono::{Days, NaiveDate, NaiveDateTime};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use flightlog_core::event::{event_key, Coalescer, EventKey, EventRecord, StoredEvent, WritePlan};
use flightlog_core::types::{Descriptive, EventId, Sighting, Telemetry};

use crate::db::*;

const PG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flights (
    id BIGSERIAL PRIMARY KEY,
    seen_at TIMESTAMP NOT NULL,
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
    altitude_ft DOUBLE PRECISION,
    ground_speed_kt DOUBLE PRECISION,
    distance_nm DOUBLE PRECISION,
    heading_deg DOUBLE PRECISION,
    event_key TEXT NOT NULL,
    first_seen TIMESTAMP NOT NULL,
    last_seen TIMESTAMP NOT NULL,
    times_seen BIGINT NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_flights_key_last_seen ON flights(event_key, last_seen DESC);
CREATE INDEX IF NOT EXISTS idx_flights_seen_at ON flights(seen_at);
CREATE INDEX IF NOT EXISTS idx_flights_reg ON flights(reg);
CREATE INDEX IF NOT EXISTS idx_flights_hex ON flights(hex);
"#;

const EVENT_COLUMNS: &str = "id, seen_at, hex, reg, callsign, type_code, model, manufacturer,
    country, country_iso, owner, airline_name, origin_iata, origin_name, dest_iata, dest_name,
    altitude_ft, ground_speed_kt, distance_nm, heading_deg, event_key, first_seen, last_seen,
    times_seen";

/// PostgreSQL event store with connection pooling.
pub struct PgFlightStore {
    pool: PgPool,
    coalescer: Coalescer,
}

impl PgFlightStore {
    /// Connect and create the schema if missing.
    pub async fn connect(url: &str, coalescer: Coalescer) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;

        sqlx::raw_sql(PG_SCHEMA).execute(&pool).await?;

        Ok(PgFlightStore { pool, coalescer })
    }

    async fn find_open_event(
        tx: &mut Transaction<'_, Postgres>,
        key: &EventKey,
        coalescer: &Coalescer,
        observed_at: NaiveDateTime,
    ) -> Result<Option<StoredEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM flights
             WHERE event_key = $1 AND last_seen >= $2 AND last_seen <= $3
             ORDER BY last_seen DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .bind(coalescer.cutoff(observed_at))
            .bind(coalescer.horizon(observed_at))
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.as_ref().map(pg_row_to_event).transpose()?)
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        ev: &EventRecord,
    ) -> Result<EventId, StoreError> {
        let d = &ev.descriptive;
        let t = &ev.telemetry;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO flights (
                 seen_at, hex, reg, callsign, type_code, model, manufacturer, country, country_iso,
                 owner, airline_name, origin_iata, origin_name, dest_iata, dest_name,
                 altitude_ft, ground_speed_kt, distance_nm, heading_deg,
                 event_key, first_seen, last_seen, times_seen)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                     $16, $17, $18, $19, $20, $21, $22, $23)
             RETURNING id",
        )
        .bind(ev.seen_at)
        .bind(&ev.hex)
        .bind(&ev.reg)
        .bind(&ev.callsign)
        .bind(&d.type_code)
        .bind(&d.model)
        .bind(&d.manufacturer)
        .bind(&d.country)
        .bind(&d.country_iso)
        .bind(&d.owner)
        .bind(&d.airline_name)
        .bind(&d.origin_iata)
        .bind(&d.origin_name)
        .bind(&d.dest_iata)
        .bind(&d.dest_name)
        .bind(t.altitude_ft)
        .bind(t.ground_speed_kt)
        .bind(t.distance_nm)
        .bind(t.heading_deg)
        .bind(ev.event_key.as_str())
        .bind(ev.first_seen)
        .bind(ev.last_seen)
        .bind(ev.times_seen)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    async fn update_event(
        tx: &mut Transaction<'_, Postgres>,
        ev: &StoredEvent,
    ) -> Result<u64, StoreError> {
        let r = &ev.record;
        let d = &r.descriptive;
        let t = &r.telemetry;
        let result = sqlx::query(
            "UPDATE flights SET
                 seen_at = $1, last_seen = $2, times_seen = $3,
                 altitude_ft = $4, ground_speed_kt = $5, distance_nm = $6, heading_deg = $7,
                 type_code = $8, model = $9, manufacturer = $10, country = $11, country_iso = $12,
                 owner = $13, airline_name = $14, origin_iata = $15, origin_name = $16,
                 dest_iata = $17, dest_name = $18
             WHERE id = $19",
        )
        .bind(r.seen_at)
        .bind(r.last_seen)
        .bind(r.times_seen)
        .bind(t.altitude_ft)
        .bind(t.ground_speed_kt)
        .bind(t.distance_nm)
        .bind(t.heading_deg)
        .bind(&d.type_code)
        .bind(&d.model)
        .bind(&d.manufacturer)
        .bind(&d.country)
        .bind(&d.country_iso)
        .bind(&d.owner)
        .bind(&d.airline_name)
        .bind(&d.origin_iata)
        .bind(&d.origin_name)
        .bind(&d.dest_iata)
        .bind(&d.dest_name)
        .bind(ev.id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn name_counts(&self, sql: &str, day: Option<NaiveDate>) -> Result<Vec<NameCount>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(day) = day {
            query = query.bind(day);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let counts = rows
            .iter()
            .map(|r| {
                Ok(NameCount {
                    name: r.try_get(0)?,
                    count: r.try_get(1)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(counts)
    }
}

fn pg_row_to_event(r: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        id: r.try_get("id")?,
        record: EventRecord {
            seen_at: r.try_get("seen_at")?,
            hex: r.try_get("hex")?,
            reg: r.try_get("reg")?,
            callsign: r.try_get("callsign")?,
            descriptive: Descriptive {
                type_code: r.try_get("type_code")?,
                model: r.try_get("model")?,
                manufacturer: r.try_get("manufacturer")?,
                country: r.try_get("country")?,
                country_iso: r.try_get("country_iso")?,
                owner: r.try_get("owner")?,
                airline_name: r.try_get("airline_name")?,
                origin_iata: r.try_get("origin_iata")?,
                origin_name: r.try_get("origin_name")?,
                dest_iata: r.try_get("dest_iata")?,
                dest_name: r.try_get("dest_name")?,
            },
            telemetry: Telemetry {
                altitude_ft: r.try_get("altitude_ft")?,
                ground_speed_kt: r.try_get("ground_speed_kt")?,
                distance_nm: r.try_get("distance_nm")?,
                heading_deg: r.try_get("heading_deg")?,
            },
            event_key: EventKey::from(r.try_get::<String, _>("event_key")?),
            first_seen: r.try_get("first_seen")?,
            last_seen: r.try_get("last_seen")?,
            times_seen: r.try_get("times_seen")?,
        },
    })
}

#[async_trait::async_trait]
impl FlightStore for PgFlightStore {
    async fn ingest(&self, sighting: Sighting) -> Result<EventId, StoreError> {
        let observed_at = self.coalescer.observed_at(&sighting);
        let key = event_key(&sighting);

        let mut tx = self.pool.begin().await?;

        let candidate = if key.is_degenerate() {
            None
        } else {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
            Self::find_open_event(&mut tx, &key, &self.coalescer, observed_at).await?
        };

        let id = match self.coalescer.resolve(&sighting, key, observed_at, candidate) {
            WritePlan::Update(event) => {
                if Self::update_event(&mut tx, &event).await? == 0 {
                    return Err(StoreError::Corrupt(format!("event {} vanished", event.id)));
                }
                event.id
            }
            WritePlan::Insert(record) => Self::insert_event(&mut tx, &record).await?,
        };

        tx.commit().await?;
        Ok(id)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM flights ORDER BY id DESC LIMIT $1");
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(pg_row_to_event).collect::<Result<Vec<_>, _>>()?)
    }

    async fn latest(&self) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.recent(1).await?.into_iter().next())
    }

    async fn detail(&self, reg: &str, hex: &str) -> Result<Option<FlightDetail>, StoreError> {
        let reg = normalize_lookup(reg);
        let hex = normalize_lookup(hex);
        if reg.is_empty() && hex.is_empty() {
            return Ok(None);
        }

        let mut conditions = Vec::new();
        let mut binds: Vec<&str> = Vec::new();
        if !reg.is_empty() {
            binds.push(&reg);
            conditions.push(format!("UPPER(reg) = ${}", binds.len()));
        }
        if !hex.is_empty() {
            binds.push(&hex);
            conditions.push(format!("UPPER(hex) = ${}", binds.len()));
        }
        let where_clause = conditions.join(" AND ");

        let latest_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM flights WHERE {where_clause} ORDER BY id DESC LIMIT 1"
        );
        let mut query = sqlx::query(&latest_sql);
        for b in &binds {
            query = query.bind(*b);
        }
        let latest = match query.fetch_optional(&self.pool).await? {
            Some(row) => pg_row_to_event(&row)?,
            None => return Ok(None),
        };

        let agg_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(times_seen), 0)::BIGINT, MIN(first_seen), MAX(last_seen)
             FROM flights WHERE {where_clause}"
        );
        let mut query = sqlx::query(&agg_sql);
        for b in &binds {
            query = query.bind(*b);
        }
        let row = query.fetch_one(&self.pool).await?;

        Ok(Some(FlightDetail {
            latest,
            event_count: row.try_get(0)?,
            total_seen: row.try_get(1)?,
            first_seen: row.try_get(2)?,
            last_seen: row.try_get(3)?,
        }))
    }

    async fn stats(&self, today: NaiveDate) -> Result<DbStats, StoreError> {
        let since = today
            .checked_sub_days(Days::new(STATS_DAYS - 1))
            .unwrap_or(today);

        let row = sqlx::query("SELECT COUNT(*), COALESCE(SUM(times_seen), 0)::BIGINT FROM flights")
            .fetch_one(&self.pool)
            .await?;
        let total_events: i64 = row.try_get(0)?;
        let total_sightings: i64 = row.try_get(1)?;

        let row = sqlx::query(
            "SELECT COUNT(*), COUNT(DISTINCT COALESCE(NULLIF(reg, ''), hex))
             FROM flights WHERE seen_at::date = $1",
        )
        .bind(today)
        .fetch_one(&self.pool)
        .await?;
        let events_today: i64 = row.try_get(0)?;
        let unique_today: i64 = row.try_get(1)?;

        let top_today = self
            .name_counts(
                "SELECT airline_name, COUNT(*) AS cnt FROM flights
                 WHERE seen_at::date = $1 AND airline_name IS NOT NULL AND airline_name != ''
                 GROUP BY airline_name ORDER BY cnt DESC, airline_name LIMIT 1",
                Some(today),
            )
            .await?;
        let (top_airline_today, top_airline_today_count) = match top_today.into_iter().next() {
            Some(row) => (Some(row.name), row.count),
            None => (None, 0),
        };

        let top_airlines = self
            .name_counts(
                "SELECT airline_name, COUNT(*) AS cnt FROM flights
                 WHERE airline_name IS NOT NULL AND airline_name != ''
                 GROUP BY airline_name ORDER BY cnt DESC, airline_name LIMIT 10",
                None,
            )
            .await?;

        let top_types = self
            .name_counts(
                "SELECT COALESCE(NULLIF(model, ''), type_code) AS aircraft_type, COUNT(*) AS cnt
                 FROM flights
                 WHERE COALESCE(NULLIF(model, ''), type_code) IS NOT NULL
                   AND COALESCE(NULLIF(model, ''), type_code) != ''
                 GROUP BY aircraft_type ORDER BY cnt DESC, aircraft_type LIMIT 10",
                None,
            )
            .await?;

        let rows = sqlx::query(
            "SELECT COALESCE(NULLIF(country, ''), country_iso) AS c, MAX(country_iso), COUNT(*) AS cnt
             FROM flights
             WHERE COALESCE(NULLIF(country, ''), country_iso) IS NOT NULL
               AND COALESCE(NULLIF(country, ''), country_iso) != ''
             GROUP BY c ORDER BY cnt DESC, c LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?;
        let top_countries = rows
            .iter()
            .map(|r| {
                Ok(CountryCount {
                    country: r.try_get(0)?,
                    country_iso: r.try_get(1)?,
                    count: r.try_get(2)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let rows = sqlx::query(
            "SELECT COALESCE(NULLIF(reg, ''), hex) AS key_id, MAX(reg), MAX(hex),
                    MAX(airline_name), MAX(country), MAX(country_iso),
                    COUNT(*) AS cnt, SUM(times_seen)::BIGINT, MIN(first_seen), MAX(last_seen)
             FROM flights
             WHERE COALESCE(NULLIF(reg, ''), hex) IS NOT NULL
               AND COALESCE(NULLIF(reg, ''), hex) != ''
             GROUP BY key_id ORDER BY cnt DESC, key_id LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?;
        let top_aircraft = rows
            .iter()
            .map(|r| {
                Ok(AircraftCount {
                    key_id: r.try_get(0)?,
                    reg: r.try_get(1)?,
                    hex: r.try_get(2)?,
                    airline_name: r.try_get(3)?,
                    country: r.try_get(4)?,
                    country_iso: r.try_get(5)?,
                    events: r.try_get(6)?,
                    total_seen: r.try_get(7)?,
                    first_seen: r.try_get(8)?,
                    last_seen: r.try_get(9)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let rows = sqlx::query(
            "SELECT to_char(seen_at::date, 'YYYY-MM-DD') AS day, COUNT(*),
                    SUM(times_seen)::BIGINT
             FROM flights
             WHERE seen_at::date >= $1 AND seen_at::date <= $2
             GROUP BY day ORDER BY day",
        )
        .bind(since)
        .bind(today)
        .fetch_all(&self.pool)
        .await?;
        let by_day = rows
            .iter()
            .map(|r| {
                Ok(DayCount {
                    day: r.try_get(0)?,
                    events: r.try_get(1)?,
                    sightings: r.try_get(2)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

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
}
