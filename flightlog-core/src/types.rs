//! Shared types, error enum, and timestamp helpers for flightlog-core.

use chrono::{DateTime, Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// All errors produced by flightlog-core.
#[derive(Debug, Error)]
pub enum FlightError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlightError>;

/// Synthetic, monotonically increasing event identity.
pub type EventId = i64;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Persisted timestamp layout. Fixed width, so text order is time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Current local wall-clock time, whole seconds.
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a sighting timestamp.
///
/// Accepts `YYYY-MM-DDTHH:MM:SS` (optionally with fractional seconds or a
/// space instead of `T`) and RFC 3339 with an offset, which is converted to
/// local time. Sub-second precision is dropped.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Local).naive_local().trunc_subsecs(0));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.trunc_subsecs(0))
}

/// Serde adapter: any unparseable or non-string timestamp becomes `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(|v| v.as_str()).and_then(parse_timestamp))
}

/// Serde adapter: persisted layout on the way out.
fn serialize_timestamp<S>(ts: &Option<NaiveDateTime>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match ts {
        Some(ts) => serializer.serialize_some(&format_timestamp(ts)),
        None => serializer.serialize_none(),
    }
}

/// Serde adapter: numbers pass through, anything else (e.g. `"ground"`) is `None`.
fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(|v| v.as_f64()))
}

/// True for absent or blank strings.
pub fn is_empty(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Sighting
// ---------------------------------------------------------------------------

/// Descriptive attributes. Sticky once populated on an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptive {
    #[serde(default)]
    pub type_code: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub country_iso: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub airline_name: Option<String>,
    #[serde(default)]
    pub origin_iata: Option<String>,
    #[serde(default)]
    pub origin_name: Option<String>,
    #[serde(default)]
    pub dest_iata: Option<String>,
    #[serde(default)]
    pub dest_name: Option<String>,
}

impl Descriptive {
    /// First-non-empty-wins, field by field.
    pub fn merge_sticky(&mut self, incoming: &Descriptive) {
        fn fill(slot: &mut Option<String>, incoming: &Option<String>) {
            if is_empty(slot) {
                *slot = incoming.clone();
            }
        }

        fill(&mut self.type_code, &incoming.type_code);
        fill(&mut self.model, &incoming.model);
        fill(&mut self.manufacturer, &incoming.manufacturer);
        fill(&mut self.country, &incoming.country);
        fill(&mut self.country_iso, &incoming.country_iso);
        fill(&mut self.owner, &incoming.owner);
        fill(&mut self.airline_name, &incoming.airline_name);
        fill(&mut self.origin_iata, &incoming.origin_iata);
        fill(&mut self.origin_name, &incoming.origin_name);
        fill(&mut self.dest_iata, &incoming.dest_iata);
        fill(&mut self.dest_name, &incoming.dest_name);
    }
}

/// Numeric readings. Always replaced by the latest sighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default, deserialize_with = "lenient_number")]
    pub altitude_ft: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub ground_speed_kt: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub distance_nm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub heading_deg: Option<f64>,
}

/// One observation of an aircraft during a single poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    #[serde(
        default,
        rename = "seen_at",
        alias = "observed_at",
        deserialize_with = "lenient_timestamp",
        serialize_with = "serialize_timestamp"
    )]
    pub observed_at: Option<NaiveDateTime>,
    #[serde(default, alias = "aircraft_hex")]
    pub hex: Option<String>,
    #[serde(default, alias = "registration")]
    pub reg: Option<String>,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(flatten)]
    pub descriptive: Descriptive,
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
