//! LRU cache of execution plans, keyed by task-set identity.
//!
//! Repeated runs of a structurally-identical graph skip the partitioner by
//! replaying a cached plan. Entries expire after a TTL and are invalidated
//! wholesale whenever the compiled-function generation counter advances —
//! a plan built against recompiled functions is stale even if the task set
//! matches.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use crate::plan::ExecutionPlan;

struct CachedPlan {
    plan: Arc<ExecutionPlan>,
    generation: u64,
    cached_at: Instant,
}

/// Cache of execution plans keyed by [`TaskGraph::identity_key`]
/// (see `abacus_graph`). A capacity of zero disables caching entirely.
pub struct PlanCache {
    entries: Option<Mutex<LruCache<String, CachedPlan>>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl PlanCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    /// Current compiled-function generation stamp.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Advance the generation counter, invalidating every cached plan.
    /// Call whenever calculation functions are recompiled or a
    /// partition-affecting configuration changes.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(entries) = &self.entries {
            entries.lock().unwrap().clear();
        }
    }

    /// Look up the plan for a graph identity key.
    pub fn get(&self, key: &str) -> Option<Arc<ExecutionPlan>> {
        let entries = self.entries.as_ref()?;
        let mut entries = entries.lock().unwrap();

        let entry = entries.get(key)?;
        if entry.generation != self.generation() {
            // Should have been cleared by bump_generation; discard anyway.
            warn!(
                key,
                stamped = entry.generation,
                current = self.generation(),
                "cached plan has stale function generation, repartitioning"
            );
            entries.pop(key);
            return None;
        }
        if entry.cached_at.elapsed() > self.ttl {
            debug!(key, "cached plan expired");
            entries.pop(key);
            return None;
        }
        debug!(key, "plan cache hit");
        Some(Arc::clone(&entry.plan))
    }

    pub fn put(&self, key: String, plan: Arc<ExecutionPlan>) {
        let Some(entries) = &self.entries else {
            return;
        };
        entries.lock().unwrap().put(
            key,
            CachedPlan {
                plan,
                generation: self.generation(),
                cached_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        match &self.entries {
            Some(entries) => entries.lock().unwrap().len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanFragment;
    use abacus_jobs::CacheSelectHint;

    fn make_plan() -> Arc<ExecutionPlan> {
        Arc::new(ExecutionPlan::Single(PlanFragment {
            tasks: vec![],
            cache_hint: CacheSelectHint::private([]),
            inputs: vec![],
            outputs: vec![],
            tails: vec![],
        }))
    }

    #[test]
    fn hit_and_miss() {
        let cache = PlanCache::new(4, Duration::from_secs(60));
        assert!(cache.get("a").is_none());

        cache.put("a".into(), make_plan());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = PlanCache::new(0, Duration::from_secs(60));
        cache.put("a".into(), make_plan());
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn generation_bump_invalidates() {
        let cache = PlanCache::new(4, Duration::from_secs(60));
        cache.put("a".into(), make_plan());
        cache.bump_generation();
        assert!(cache.get("a").is_none());
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PlanCache::new(4, Duration::from_millis(10));
        cache.put("a".into(), make_plan());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = PlanCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), make_plan());
        cache.put("b".into(), make_plan());
        cache.put("c".into(), make_plan());

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
