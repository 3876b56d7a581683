//! Upstream JSON parsing: adsb.lol nearest/military feeds and adsbdb lookups.
//!
//! Everything here works on already-fetched `serde_json::Value`s, so the
//! HTTP side can stay thin.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;

use crate::types::{Descriptive, Sighting, Telemetry};

/// Nearest aircraft as reported by `/v2/closest/{lat}/{lon}/{radius}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NearestAircraft {
    pub hex: Option<String>,
    pub reg: Option<String>,
    pub callsign: Option<String>,
    pub type_code: Option<String>,
    pub telemetry: Telemetry,
}

/// Identity used to decide whether enrichment must be refetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub hex: Option<String>,
    pub reg: Option<String>,
    pub callsign: Option<String>,
}

impl NearestAircraft {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            hex: self.hex.clone(),
            reg: self.reg.clone(),
            callsign: self.callsign.clone(),
        }
    }
}

/// Registration lookup result (adsbdb `/v0/aircraft/{reg}`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AircraftInfo {
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub country: Option<String>,
    pub country_iso: Option<String>,
    pub owner: Option<String>,
}

/// Route lookup result (adsbdb `/v0/callsign/{callsign}`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteInfo {
    pub airline_name: Option<String>,
    pub origin_iata: Option<String>,
    pub origin_name: Option<String>,
    pub dest_iata: Option<String>,
    pub dest_name: Option<String>,
}

/// One entry of the simplified military feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MilAircraft {
    pub hex: Option<String>,
    pub flight: String,
    pub alt_baro: Value,
    pub squawk: Value,
    pub category: Value,
    pub seen: Value,
    pub rssi: Value,
    pub t: Value,
    pub r#type: Value,
    pub lat: Value,
    pub lon: Value,
}

/// Military aircraft detail from an adsbdb hex lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MilDetail {
    pub hex: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icao_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Trimmed, uppercased string field; blank becomes `None`.
fn upper_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
}

/// Trimmed string field; blank becomes `None`.
fn text_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn number_field(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

/// First non-null of `a`, `b` (JSON null if both are missing).
fn either(obj: &Value, a: &str, b: &str) -> Value {
    match obj.get(a) {
        Some(v) if !v.is_null() => v.clone(),
        _ => obj.get(b).cloned().unwrap_or(Value::Null),
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Extract the nearest aircraft from a closest-aircraft response.
///
/// The API returns either `{"ac": [...]}` or a bare aircraft object.
pub fn parse_nearest(body: &Value) -> Option<NearestAircraft> {
    let ac = match body.get("ac") {
        Some(Value::Array(list)) => list.first()?,
        _ if body.get("lat").map_or(false, |v| !v.is_null()) => body,
        _ => return None,
    };

    Some(NearestAircraft {
        hex: upper_field(ac, "hex"),
        reg: upper_field(ac, "r"),
        callsign: upper_field(ac, "flight"),
        type_code: upper_field(ac, "t"),
        telemetry: Telemetry {
            altitude_ft: number_field(ac, "alt_baro"),
            ground_speed_kt: number_field(ac, "gs"),
            distance_nm: number_field(ac, "dst"),
            heading_deg: number_field(ac, "track"),
        },
    })
}

/// Parse an adsbdb aircraft response. `None` for "unknown aircraft".
pub fn parse_aircraft(body: &Value) -> Option<AircraftInfo> {
    let a = body.get("response")?.get("aircraft")?;
    if !a.is_object() {
        return None;
    }

    Some(AircraftInfo {
        model: text_field(a, "type").or_else(|| text_field(a, "icao_type")),
        manufacturer: text_field(a, "manufacturer"),
        country: text_field(a, "registered_owner_country_name"),
        country_iso: text_field(a, "registered_owner_country_iso_name"),
        owner: text_field(a, "registered_owner"),
    })
}

/// Parse an adsbdb callsign response. `None` for "unknown callsign".
pub fn parse_route(body: &Value) -> Option<RouteInfo> {
    let fr = body.get("response")?.get("flightroute")?;
    if !fr.is_object() {
        return None;
    }

    let airport_name = |ap: Option<&Value>| {
        ap.and_then(|ap| text_field(ap, "name").or_else(|| text_field(ap, "municipality")))
    };
    let origin = fr.get("origin");
    let dest = fr.get("destination");

    Some(RouteInfo {
        airline_name: fr.get("airline").and_then(|a| text_field(a, "name")),
        origin_iata: origin.and_then(|o| text_field(o, "iata_code")),
        origin_name: airport_name(origin),
        dest_iata: dest.and_then(|d| text_field(d, "iata_code")),
        dest_name: airport_name(dest),
    })
}

/// Simplify the military feed, highest altitude first.
pub fn parse_mil(body: &Value) -> Vec<MilAircraft> {
    let list: &[Value] = match body.get("ac") {
        Some(Value::Array(list)) => list.as_slice(),
        _ => &[],
    };

    let mut out: Vec<MilAircraft> = list
        .iter()
        .map(|ac| MilAircraft {
            hex: ac.get("hex").and_then(Value::as_str).map(str::to_string),
            flight: ac
                .get("flight")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string(),
            alt_baro: ac.get("alt_baro").cloned().unwrap_or(Value::Null),
            squawk: ac.get("squawk").cloned().unwrap_or(Value::Null),
            category: ac.get("category").cloned().unwrap_or(Value::Null),
            seen: ac.get("seen").cloned().unwrap_or(Value::Null),
            rssi: ac.get("rssi").cloned().unwrap_or(Value::Null),
            t: ac.get("t").cloned().unwrap_or(Value::Null),
            r#type: ac.get("type").cloned().unwrap_or(Value::Null),
            lat: either(ac, "lat", "rr_lat"),
            lon: either(ac, "lon", "rr_lon"),
        })
        .collect();

    // "ground" and missing altitudes sort as zero
    out.sort_by(|a, b| {
        let alt = |m: &MilAircraft| m.alt_baro.as_f64().unwrap_or(0.0);
        alt(b).total_cmp(&alt(a))
    });
    out
}

/// Parse an adsbdb aircraft response looked up by hex.
///
/// An unknown aircraft yields `found: false` with only the hex set.
pub fn parse_mil_detail(hex: &str, body: &Value) -> MilDetail {
    let aircraft = body
        .get("response")
        .and_then(|r| r.get("aircraft"))
        .filter(|a| a.is_object());

    match aircraft {
        Some(a) => MilDetail {
            hex: hex.to_string(),
            found: true,
            r#type: text_field(a, "type"),
            icao_type: text_field(a, "icao_type"),
            manufacturer: text_field(a, "manufacturer"),
            mode_s: text_field(a, "mode_s"),
            country_iso: text_field(a, "registered_owner_country_iso_name"),
            country_name: text_field(a, "registered_owner_country_name"),
            owner: text_field(a, "registered_owner"),
        },
        None => MilDetail {
            hex: hex.to_string(),
            ..Default::default()
        },
    }
}

/// Assemble the sighting logged for one poll cycle.
pub fn build_sighting(
    ac: &NearestAircraft,
    aircraft: Option<&AircraftInfo>,
    route: Option<&RouteInfo>,
    observed_at: NaiveDateTime,
) -> Sighting {
    let aircraft = aircraft.cloned().unwrap_or_default();
    let route = route.cloned().unwrap_or_default();

    Sighting {
        observed_at: Some(observed_at),
        hex: ac.hex.clone(),
        reg: ac.reg.clone(),
        callsign: ac.callsign.clone(),
        descriptive: Descriptive {
            type_code: ac.type_code.clone(),
            model: aircraft.model,
            manufacturer: aircraft.manufacturer,
            country: aircraft.country,
            country_iso: aircraft.country_iso,
            owner: aircraft.owner,
            airline_name: route.airline_name,
            origin_iata: route.origin_iata,
            origin_name: route.origin_name,
            dest_iata: route.dest_iata,
            dest_name: route.dest_name,
        },
        telemetry: ac.telemetry,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
