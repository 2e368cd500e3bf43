//! Serializable execution plans.
//!
//! A plan is the flattened form of a fragment DAG: a map from fragment id to
//! descriptor, with neighbor/tail relations stored as ids. Running a plan
//! reconstructs live fragments and dispatches them exactly as a fresh
//! partitioning would, skipping the seed/merge/color passes.

use std::collections::BTreeMap;

use abacus_graph::{TaskGraph, TaskId};
use abacus_jobs::{CacheSelectHint, JobError};
use serde::{Deserialize, Serialize};

/// Descriptor of one fragment: its tasks, its cache-partition hint, and
/// numeric references to its neighbors and tail chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragment {
    pub tasks: Vec<TaskId>,
    pub cache_hint: CacheSelectHint,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub tails: Vec<u32>,
}

/// A cacheable description of how to execute one task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionPlan {
    /// The whole graph as one fragment.
    Single(PlanFragment),
    /// A fragment DAG keyed by fragment id.
    Partitioned(BTreeMap<u32, PlanFragment>),
}

impl ExecutionPlan {
    /// Uniform view of the plan's fragments. A single-fragment plan appears
    /// as fragment 0.
    pub fn fragment_map(&self) -> BTreeMap<u32, &PlanFragment> {
        match self {
            ExecutionPlan::Single(fragment) => BTreeMap::from([(0, fragment)]),
            ExecutionPlan::Partitioned(fragments) => {
                fragments.iter().map(|(id, f)| (*id, f)).collect()
            }
        }
    }

    pub fn fragment_count(&self) -> usize {
        match self {
            ExecutionPlan::Single(_) => 1,
            ExecutionPlan::Partitioned(fragments) => fragments.len(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.fragment_map().values().map(|f| f.tasks.len()).sum()
    }

    /// Mean items per fragment.
    pub fn average_items(&self) -> f64 {
        if self.fragment_count() == 0 {
            return 0.0;
        }
        self.task_count() as f64 / self.fragment_count() as f64
    }

    /// Mean estimated cost per fragment, priced against the given graph.
    pub fn average_cost(&self, graph: &TaskGraph) -> f64 {
        if self.fragment_count() == 0 {
            return 0.0;
        }
        let total: f64 = self
            .fragment_map()
            .values()
            .flat_map(|f| f.tasks.iter())
            .filter_map(|t| graph.task(*t))
            .map(|t| t.cost.total())
            .sum();
        total / self.fragment_count() as f64
    }

    /// Serialize to MessagePack bytes for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, JobError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JobError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
