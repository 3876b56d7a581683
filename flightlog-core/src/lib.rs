//! flightlog-core: sighting parsing and flight event coalescing.
//!
//! No async, no I/O: just data types and decisions. The server crate does
//! the HTTP fetching and persistence around these.

pub mod config;
pub mod enrich;
pub mod event;
pub mod source;
pub mod types;

// Re-export commonly used types at crate root
pub use enrich::{Enrichment, EnrichmentCache};
pub use event::{event_key, Coalescer, EventKey, EventRecord, StoredEvent, WritePlan};
pub use source::{build_sighting, parse_nearest, IdentityKey, NearestAircraft};
pub use types::*;
