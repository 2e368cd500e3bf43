//! Result model: the snapshot assembled by a computation cycle and the
//! incremental per-batch-job results streamed to a listener.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use abacus_core::{ComputedValue, ValueId};
use abacus_jobs::JobId;
use uuid::Uuid;

/// The values a completed cycle published, queryable by calculation
/// configuration name and value identifier.
#[derive(Debug, Default)]
pub struct ResultSnapshot {
    values: RwLock<HashMap<String, HashMap<ValueId, ComputedValue>>>,
}

impl ResultSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, configuration: &str, id: ValueId, value: ComputedValue) {
        self.values
            .write()
            .unwrap()
            .entry(configuration.to_string())
            .or_default()
            .insert(id, value);
    }

    pub fn value(&self, configuration: &str, id: &ValueId) -> Option<ComputedValue> {
        self.values
            .read()
            .unwrap()
            .get(configuration)
            .and_then(|values| values.get(id).cloned())
    }

    /// All values recorded for one configuration.
    pub fn values(&self, configuration: &str) -> HashMap<ValueId, ComputedValue> {
        self.values
            .read()
            .unwrap()
            .get(configuration)
            .cloned()
            .unwrap_or_default()
    }

    pub fn configurations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().unwrap().is_empty()
    }
}

/// Incremental result for one completed batch job: the terminal outputs of
/// the tasks that just finished, for streaming partial results to a
/// listener before the cycle completes.
#[derive(Debug, Clone)]
pub struct FragmentResult {
    pub configuration: String,
    pub job: JobId,
    pub duration: Duration,
    pub values: Vec<(ValueId, ComputedValue)>,
}

/// Receiver of incremental and final computation results.
pub trait ComputationListener: Send + Sync {
    /// A batch job completed; `result` carries its terminal outputs.
    fn fragment_result(&self, result: FragmentResult);

    /// A cycle reached the executed state and populated its snapshot.
    fn cycle_completed(&self, _cycle: Uuid, _snapshot: &ResultSnapshot) {}
}
