//! Flight event coalescing.
//!
//! Pure logic, no I/O. A store looks up the freshest candidate event for a
//! sighting's key, hands it to [`Coalescer::resolve`], and persists the
//! returned [`WritePlan`] inside one transaction.
//!
//! Identity is the literal `hex|reg|callsign` triple. The same tail flying a
//! new callsign is a different key, and a sighting with no identity at all
//! always opens its own event.

use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::types::*;

/// Default coalescing window in minutes.
pub const DEFAULT_WINDOW_MINUTES: u32 = 20;

pub const KEY_SEPARATOR: char = '|';

/// Key of a sighting with no hex, registration, or callsign.
pub const DEGENERATE_KEY: &str = "||";

// ---------------------------------------------------------------------------
// Event key
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKey(String);

impl EventKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// No identity to coalesce on.
    pub fn is_degenerate(&self) -> bool {
        self.0.chars().all(|c| c == KEY_SEPARATOR)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventKey {
    fn from(s: String) -> Self {
        EventKey(s)
    }
}

/// Derive the coalescing key for a sighting.
pub fn event_key(sighting: &Sighting) -> EventKey {
    fn part(field: &Option<String>) -> &str {
        field.as_deref().map(str::trim).unwrap_or("")
    }

    EventKey(format!(
        "{}{sep}{}{sep}{}",
        part(&sighting.hex),
        part(&sighting.reg),
        part(&sighting.callsign),
        sep = KEY_SEPARATOR
    ))
}

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// Every persisted column of an event except its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(with = "timestamp_text")]
    pub seen_at: NaiveDateTime,
    pub hex: Option<String>,
    pub reg: Option<String>,
    pub callsign: Option<String>,
    #[serde(flatten)]
    pub descriptive: Descriptive,
    #[serde(flatten)]
    pub telemetry: Telemetry,
    pub event_key: EventKey,
    #[serde(with = "timestamp_text")]
    pub first_seen: NaiveDateTime,
    #[serde(with = "timestamp_text")]
    pub last_seen: NaiveDateTime,
    pub times_seen: i64,
}

impl EventRecord {
    /// A brand new event from its first sighting. Fields are taken verbatim.
    pub fn open(sighting: &Sighting, key: EventKey, observed_at: NaiveDateTime) -> Self {
        EventRecord {
            seen_at: observed_at,
            hex: sighting.hex.clone(),
            reg: sighting.reg.clone(),
            callsign: sighting.callsign.clone(),
            descriptive: sighting.descriptive.clone(),
            telemetry: sighting.telemetry,
            event_key: key,
            first_seen: observed_at,
            last_seen: observed_at,
            times_seen: 1,
        }
    }

    /// Fold another sighting of the same key into this event.
    ///
    /// `first_seen` never moves and `last_seen` never goes backwards. A late
    /// sighting (older than `last_seen`) still counts and may fill sticky
    /// fields, but does not replace the newer telemetry.
    pub fn absorb(&mut self, sighting: &Sighting, observed_at: NaiveDateTime) {
        self.times_seen += 1;
        if observed_at >= self.last_seen {
            self.last_seen = observed_at;
            self.telemetry = sighting.telemetry;
        }
        self.seen_at = self.last_seen;
        self.descriptive.merge_sticky(&sighting.descriptive);
    }
}

/// An event as read back from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    #[serde(flatten)]
    pub record: EventRecord,
}

// ---------------------------------------------------------------------------
// Coalescer
// ---------------------------------------------------------------------------

/// What the store must write for one ingested sighting.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePlan {
    /// Update the existing row in place.
    Update(StoredEvent),
    /// Insert a new row.
    Insert(EventRecord),
}

/// Decides whether a sighting extends an open event or opens a new one.
#[derive(Debug, Clone, Copy)]
pub struct Coalescer {
    window: Duration,
}

impl Default for Coalescer {
    fn default() -> Self {
        Coalescer::new(DEFAULT_WINDOW_MINUTES)
    }
}

impl Coalescer {
    pub fn new(window_minutes: u32) -> Self {
        Coalescer {
            window: Duration::minutes(window_minutes as i64),
        }
    }

    /// Oldest `last_seen` that still counts as open for `observed_at`.
    pub fn cutoff(&self, observed_at: NaiveDateTime) -> NaiveDateTime {
        observed_at - self.window
    }

    /// Newest `last_seen` a late sighting at `observed_at` may still join.
    pub fn horizon(&self, observed_at: NaiveDateTime) -> NaiveDateTime {
        observed_at + self.window
    }

    /// Inclusive window test, bounded on both sides.
    pub fn is_open(&self, last_seen: NaiveDateTime, observed_at: NaiveDateTime) -> bool {
        last_seen >= self.cutoff(observed_at) && last_seen <= self.horizon(observed_at)
    }

    /// Effective observation time: the sighting's own, or now.
    pub fn observed_at(&self, sighting: &Sighting) -> NaiveDateTime {
        sighting.observed_at.unwrap_or_else(now_local)
    }

    /// Turn a sighting plus the store's freshest candidate into a write.
    ///
    /// `candidate` should be the event with `key` and the greatest
    /// `last_seen` between [`Coalescer::cutoff`] and [`Coalescer::horizon`].
    /// It is re-checked here,
    /// and ignored entirely for a degenerate key.
    pub fn resolve(
        &self,
        sighting: &Sighting,
        key: EventKey,
        observed_at: NaiveDateTime,
        candidate: Option<StoredEvent>,
    ) -> WritePlan {
        let candidate = candidate.filter(|c| {
            !key.is_degenerate()
                && c.record.event_key == key
                && self.is_open(c.record.last_seen, observed_at)
        });

        match candidate {
            Some(mut event) => {
                event.record.absorb(sighting, observed_at);
                WritePlan::Update(event)
            }
            None => WritePlan::Insert(EventRecord::open(sighting, key, observed_at)),
        }
    }
}

/// Persisted timestamp layout for serde.
pub mod timestamp_text {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::{format_timestamp, parse_timestamp};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(d)?;
        parse_timestamp(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {text}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
