use abacus_core::{ComputeTarget, ValueId};
use abacus_graph::TaskId;
use serde::{Deserialize, Serialize};

use crate::cache::CacheSelectHint;
use crate::error::JobError;

/// Identifier of a batch job, unique within one execution context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "J{}", self.0)
    }
}

/// One unit of work within a batch job: a single function invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    /// The originating graph task, carried through to the result so the
    /// engine can mark execution/failure per task.
    pub task: TaskId,
    pub function: String,
    pub target: ComputeTarget,
    /// Values the worker must read before invoking the function.
    pub inputs: Vec<ValueId>,
    /// Values the worker must write after invoking the function.
    pub outputs: Vec<ValueId>,
}

/// Wire-level unit sent to a calculation worker, built from one fragment.
///
/// Serialized with MessagePack for compact transport. Tail jobs execute on
/// the worker immediately after this job, without another dispatch round
/// trip; each tail carries its own id and produces its own result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationJob {
    pub id: JobId,
    /// Name of the calculation configuration this job belongs to.
    pub configuration: String,
    pub items: Vec<JobItem>,
    /// Which produced values the worker's cache may keep private vs. must
    /// publish to the shared cache.
    pub cache_hint: CacheSelectHint,
    /// Jobs in the same chain that must complete before this one may run.
    /// Always empty on the head job of a chain; the worker enforces the
    /// ordering for tails.
    pub required: Vec<JobId>,
    /// Jobs chained to run on the same worker after this one.
    pub tail: Vec<CalculationJob>,
}

impl CalculationJob {
    /// Number of items in this job and all chained tails.
    pub fn item_count(&self) -> usize {
        self.items.len() + self.tail.iter().map(CalculationJob::item_count).sum::<usize>()
    }

    /// This job's id plus the ids of all chained tails.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids = vec![self.id];
        for tail in &self.tail {
            ids.extend(tail.job_ids());
        }
        ids
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, JobError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JobError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
