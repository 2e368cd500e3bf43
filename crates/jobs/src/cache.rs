use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use abacus_core::{ComputedValue, ValueId};
use serde::{Deserialize, Serialize};

/// Cache-partition hint attached to a batch job.
///
/// Classifies which of the job's produced values are private (visible only
/// within the producing fragment's execution coloring) versus shared
/// (published to the cycle-wide cache). The hint always lists the minority
/// set — whichever of the two is smaller — to minimize its size; the worker
/// infers the complement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSelectHint {
    /// The listed values are private; everything else the job produces is
    /// shared.
    PrivateValues(BTreeSet<ValueId>),
    /// The listed values are shared; everything else is private.
    SharedValues(BTreeSet<ValueId>),
}

impl CacheSelectHint {
    pub fn private(values: impl IntoIterator<Item = ValueId>) -> Self {
        CacheSelectHint::PrivateValues(values.into_iter().collect())
    }

    pub fn shared(values: impl IntoIterator<Item = ValueId>) -> Self {
        CacheSelectHint::SharedValues(values.into_iter().collect())
    }

    /// Build the minority-set hint from the full classification.
    pub fn select(private: BTreeSet<ValueId>, shared: BTreeSet<ValueId>) -> Self {
        if private.len() < shared.len() {
            CacheSelectHint::PrivateValues(private)
        } else {
            CacheSelectHint::SharedValues(shared)
        }
    }

    /// Whether the given produced value is shared cycle-wide.
    pub fn is_shared(&self, id: &ValueId) -> bool {
        match self {
            CacheSelectHint::PrivateValues(private) => !private.contains(id),
            CacheSelectHint::SharedValues(shared) => shared.contains(id),
        }
    }

    /// Number of identifiers the hint carries on the wire.
    pub fn len(&self) -> usize {
        match self {
            CacheSelectHint::PrivateValues(v) | CacheSelectHint::SharedValues(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared value cache for one (cycle, configuration) pair.
///
/// All fragments of a configuration's graph read and write one cache within
/// a cycle, from multiple dispatch threads concurrently.
pub trait ValueCache: Send + Sync {
    fn put(&self, id: ValueId, value: ComputedValue);

    fn get(&self, id: &ValueId) -> Option<ComputedValue>;

    /// Snapshot of the full contents, for delta comparison and result
    /// population.
    fn contents(&self) -> HashMap<ValueId, ComputedValue>;
}

/// Default in-memory cache implementation.
#[derive(Debug, Default)]
pub struct InMemoryValueCache {
    values: RwLock<HashMap<ValueId, ComputedValue>>,
}

impl InMemoryValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().unwrap().is_empty()
    }
}

impl ValueCache for InMemoryValueCache {
    fn put(&self, id: ValueId, value: ComputedValue) {
        self.values.write().unwrap().insert(id, value);
    }

    fn get(&self, id: &ValueId) -> Option<ComputedValue> {
        self.values.read().unwrap().get(id).cloned()
    }

    fn contents(&self) -> HashMap<ValueId, ComputedValue> {
        self.values.read().unwrap().clone()
    }
}
