//! Bounded, TTL-stamped LRU front for payload and metadata reads.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

use ctxmesh_types::{ContextId, ContextMetadata};

#[derive(Debug, Clone)]
struct CachedContext {
    payload: Value,
    metadata: ContextMetadata,
    inserted: Instant,
}

/// LRU cache of fully committed `(payload, metadata)` snapshots.
///
/// Entries are considered stale once older than the configured TTL and are
/// dropped on access. Mutated only under the owning context's lock so the
/// cache never gets ahead of (or behind) the files on disk.
#[derive(Debug)]
pub(crate) struct ContextCache {
    entries: LruCache<ContextId, CachedContext>,
    ttl: Duration,
}

impl ContextCache {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub(crate) fn get(&mut self, id: &ContextId) -> Option<(Value, ContextMetadata)> {
        match self.entries.get(id) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                Some((entry.payload.clone(), entry.metadata.clone()))
            }
            Some(_) => {
                self.entries.pop(id);
                None
            }
            None => None,
        }
    }

    pub(crate) fn put(&mut self, id: ContextId, payload: Value, metadata: ContextMetadata) {
        self.entries.put(
            id,
            CachedContext {
                payload,
                metadata,
                inserted: Instant::now(),
            },
        );
    }

    pub(crate) fn remove(&mut self, id: &ContextId) {
        self.entries.pop(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn meta(version: u64) -> ContextMetadata {
        ContextMetadata {
            version,
            last_modified: Utc::now(),
            size: 2,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = ContextCache::new(2, Duration::from_secs(60));
        let (a, b, c) = (
            ContextId::new("a").unwrap(),
            ContextId::new("b").unwrap(),
            ContextId::new("c").unwrap(),
        );
        cache.put(a.clone(), json!(1), meta(1));
        cache.put(b.clone(), json!(2), meta(1));
        cache.put(c.clone(), json!(3), meta(1));

        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn expired_entries_are_dropped_on_access() {
        let mut cache = ContextCache::new(4, Duration::from_millis(0));
        let id = ContextId::new("ttl").unwrap();
        cache.put(id.clone(), json!({"x": 1}), meta(1));
        assert!(cache.get(&id).is_none());
    }
}
