//! Enrichment cache keyed by aircraft identity.
//!
//! Registration and route lookups are only repeated when the nearest
//! aircraft's `(hex, reg, callsign)` changes. The cache holds the lookups for
//! the current identity only; there is no expiry while the same aircraft stays
//! nearest.

use crate::source::{AircraftInfo, IdentityKey, RouteInfo};

/// Lookups resolved for one identity. `None` means "looked up, nothing found"
/// or "not looked up" (no registration / no callsign).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub aircraft: Option<AircraftInfo>,
    pub route: Option<RouteInfo>,
}

#[derive(Debug, Default)]
pub struct EnrichmentCache {
    current: Option<(IdentityKey, Enrichment)>,
    pub hits: u64,
    pub misses: u64,
}

impl EnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached lookups for `key`, counting the hit or miss.
    pub fn get(&mut self, key: &IdentityKey) -> Option<&Enrichment> {
        match &self.current {
            Some((k, e)) if k == key => {
                self.hits += 1;
                Some(e)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Replace the cached identity.
    pub fn insert(&mut self, key: IdentityKey, enrichment: Enrichment) -> &Enrichment {
        let (_, e) = self.current.insert((key, enrichment));
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex: &str, callsign: &str) -> IdentityKey {
        IdentityKey {
            hex: Some(hex.into()),
            reg: None,
            callsign: Some(callsign.into()),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let mut cache = EnrichmentCache::new();
        assert!(cache.get(&key("A1B2", "UAL123")).is_none());

        let enrichment = Enrichment {
            route: Some(RouteInfo {
                airline_name: Some("United Airlines".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        cache.insert(key("A1B2", "UAL123"), enrichment.clone());

        assert_eq!(cache.get(&key("A1B2", "UAL123")), Some(&enrichment));
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.misses, 1);
    }

    #[test]
    fn test_identity_change_invalidates() {
        let mut cache = EnrichmentCache::new();
        cache.insert(key("A1B2", "UAL123"), Enrichment::default());
        assert!(cache.get(&key("A1B2", "UAL456")).is_none());
        assert!(cache.get(&key("C3D4", "UAL123")).is_none());

        cache.insert(key("C3D4", "UAL123"), Enrichment::default());
        assert!(cache.get(&key("A1B2", "UAL123")).is_none());
        assert!(cache.get(&key("C3D4", "UAL123")).is_some());
    }
}
