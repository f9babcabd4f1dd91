//! In-memory position cache: origin → latest fix.
//!
//! One writer (the radio dispatch path), many readers. Entries are replaced
//! wholesale on every position packet and never evicted; growth is bounded
//! by the size of the radio neighborhood.

use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PositionFix {
    pub lat: f64,
    pub lon: f64,
    pub received_at: Instant,
    pub seen_count: u64,
}

#[derive(Default)]
pub struct PositionCache {
    fixes: DashMap<String, PositionFix>,
}

impl PositionCache {
    pub fn new() -> Self {
        Self { fixes: DashMap::new() }
    }

    /// Replace the origin's fix, preserving the running packet count.
    pub fn update(&self, origin: &str, lat: f64, lon: f64) {
        let seen_count = self.fixes.get(origin).map(|f| f.seen_count).unwrap_or(0) + 1;
        self.fixes.insert(
            origin.to_string(),
            PositionFix { lat, lon, received_at: Instant::now(), seen_count },
        );
    }

    pub fn get(&self, origin: &str) -> Option<PositionFix> {
        self.fixes.get(origin).map(|f| f.clone())
    }

    /// Age of the origin's fix, zero if the fix is somehow in the future.
    pub fn age(&self, origin: &str) -> Option<Duration> {
        self.fixes
            .get(origin)
            .map(|f| Instant::now().saturating_duration_since(f.received_at))
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    /// Snapshot of all known origins for the `#osmnodes` reply.
    pub fn snapshot(&self) -> Vec<(String, PositionFix)> {
        let mut entries: Vec<(String, PositionFix)> = self
            .fixes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| b.1.received_at.cmp(&a.1.received_at));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_replaces_and_counts() {
        let cache = PositionCache::new();
        cache.update("!a1b2", 4.6097, -74.0817);
        cache.update("!a1b2", 4.6100, -74.0820);

        let fix = cache.get("!a1b2").expect("fix present");
        assert_eq!(fix.lat, 4.6100);
        assert_eq!(fix.lon, -74.0820);
        assert_eq!(fix.seen_count, 2);
    }

    #[test]
    fn test_unknown_origin() {
        let cache = PositionCache::new();
        assert!(cache.get("!nope").is_none());
        assert!(cache.age("!nope").is_none());
    }

    #[test]
    fn test_age_grows() {
        let cache = PositionCache::new();
        cache.update("!a1b2", 1.0, 2.0);
        std::thread::sleep(Duration::from_millis(15));
        assert!(cache.age("!a1b2").unwrap() >= Duration::from_millis(15));
    }

    #[test]
    fn test_snapshot_newest_first() {
        let cache = PositionCache::new();
        cache.update("!old", 1.0, 1.0);
        std::thread::sleep(Duration::from_millis(5));
        cache.update("!new", 2.0, 2.0);

        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, "!new");
        assert_eq!(snap[1].0, "!old");
    }
}
