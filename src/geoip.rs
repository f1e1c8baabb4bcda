//! GeoIP lookup collaborator.
//!
//! Sessions display a coarse location string next to each login. Lookups are
//! best-effort: a miss (or no resolver database at all) falls back to
//! `"Unknown"` rather than failing the session.

use std::collections::HashMap;

pub const UNKNOWN_LOCATION: &str = "Unknown";

pub trait GeoIpResolver: Send + Sync {
    /// Resolve an IP address to a display string, `None` on a miss.
    fn lookup(&self, ip: &str) -> Option<String>;

    /// Resolve with the `"Unknown"` fallback applied.
    fn location_or_unknown(&self, ip: Option<&str>) -> String {
        ip.and_then(|ip| self.lookup(ip))
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
    }
}

/// Resolver for deployments without a GeoIP database; everything is a miss.
#[derive(Clone, Debug, Default)]
pub struct NoopGeoIp;

impl GeoIpResolver for NoopGeoIp {
    fn lookup(&self, _ip: &str) -> Option<String> {
        None
    }
}

/// Fixed-table resolver for tests and local dev.
#[derive(Clone, Debug, Default)]
pub struct StaticGeoIp {
    entries: HashMap<String, String>,
}

impl StaticGeoIp {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(mut self, ip: &str, location: &str) -> Self {
        self.entries.insert(ip.to_string(), location.to_string());
        self
    }
}

impl GeoIpResolver for StaticGeoIp {
    fn lookup(&self, ip: &str) -> Option<String> {
        self.entries.get(ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{GeoIpResolver, NoopGeoIp, StaticGeoIp, UNKNOWN_LOCATION};

    #[test]
    fn noop_always_falls_back() {
        let resolver = NoopGeoIp;
        assert_eq!(resolver.location_or_unknown(None), UNKNOWN_LOCATION);
        assert_eq!(resolver.location_or_unknown(Some("1.2.3.4")), UNKNOWN_LOCATION);
    }

    #[test]
    fn static_resolver_hits_and_misses() {
        let resolver = StaticGeoIp::new().with_entry("203.0.113.5", "Berlin, DE");
        assert_eq!(
            resolver.location_or_unknown(Some("203.0.113.5")),
            "Berlin, DE"
        );
        assert_eq!(resolver.location_or_unknown(Some("198.51.100.1")), UNKNOWN_LOCATION);
    }
}
