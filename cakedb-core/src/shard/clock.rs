//! Creation timestamps for segment names

use crate::store::BlobStore;
use crate::SegmentName;
use chrono::Utc;
use parking_lot::Mutex;

/// Hands out strictly increasing creation millis
///
/// Wall-clock time normally, but never equal to or below a value already
/// handed out, so two segments of one shard can never share a name.
#[derive(Debug, Default)]
pub struct CreatedClock {
    last: Mutex<i64>,
}

impl CreatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock that continues after the newest segment already in `store`
    pub fn seeded(store: &BlobStore) -> Self {
        let clock = Self::new();
        let newest = store
            .keys("")
            .filter_map(|key| key.parse::<SegmentName>().ok())
            .map(|name| name.created_at)
            .max();
        if let Some(created) = newest {
            clock.observe(created);
        }
        clock
    }

    /// Make sure later values exceed `created`
    pub fn observe(&self, created: i64) {
        let mut last = self.last.lock();
        *last = (*last).max(created);
    }

    /// Next creation time in milliseconds
    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.lock();
        *last = now.max(*last + 1);
        *last
    }

    /// Last value handed out or observed
    pub fn last(&self) -> i64 {
        *self.last.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::segment_transform;
    use tempfile::TempDir;

    #[test]
    fn test_strictly_increasing() {
        let clock = CreatedClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_future_value() {
        let clock = CreatedClock::new();
        let future = Utc::now().timestamp_millis() + 60_000;
        clock.observe(future);
        assert_eq!(clock.next(), future + 1);
        assert_eq!(clock.last(), future + 1);
    }

    #[test]
    fn test_seeded_from_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::open(temp_dir.path().join("value"), temp_dir.path().join("tmp"), segment_transform())
            .unwrap();
        let future = Utc::now().timestamp_millis() + 3_600_000;
        store.write(&format!("604800000000000_1_{}", future), b"x").unwrap();
        store.write("604800000000000_1_5", b"x").unwrap();

        let clock = CreatedClock::seeded(&store);
        assert_eq!(clock.last(), future);
        assert!(clock.next() > future);
    }
}
