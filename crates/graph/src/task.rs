use abacus_core::{ComputeTarget, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a task within its graph.
///
/// Ids are small integers assigned densely by the builder, so they double as
/// arena indices in the partitioner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Estimated cost of invoking one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskCost {
    /// Cost of the function invocation itself.
    pub invocation: f64,
    /// Cost of moving the task's inputs to a worker.
    pub data_input: f64,
    /// Cost of moving the task's outputs back.
    pub data_output: f64,
}

impl TaskCost {
    pub fn new(invocation: f64, data_input: f64, data_output: f64) -> Self {
        Self {
            invocation,
            data_input,
            data_output,
        }
    }

    /// Combined cost used by the partitioner's size checks.
    pub fn total(&self) -> f64 {
        self.invocation + self.data_input + self.data_output
    }
}

impl Default for TaskCost {
    fn default() -> Self {
        Self::new(1.0, 0.0, 0.0)
    }
}

/// Pluggable per-task cost model.
///
/// The partitioner consults this when accumulating fragment costs; swap in a
/// model fed by observed execution times to bias merging toward balance.
pub trait CostEstimator: Send + Sync {
    fn cost(&self, task: &Task) -> TaskCost;
}

/// Cost model that charges one unit per invocation and nothing for data.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitCost;

impl CostEstimator for UnitCost {
    fn cost(&self, _task: &Task) -> TaskCost {
        TaskCost::default()
    }
}

/// One node of a resolved task graph: a single function invocation over a
/// target entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name of the compiled calculation function to invoke.
    pub function: String,
    pub target: ComputeTarget,
    /// Tasks whose outputs this task consumes.
    pub inputs: Vec<TaskId>,
    /// Value identifiers this task reads (from input tasks or market data).
    pub input_values: BTreeSet<ValueId>,
    /// Value identifiers this task produces.
    pub outputs: BTreeSet<ValueId>,
    pub cost: TaskCost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use abacus_core::TargetKind;

    #[test]
    fn cost_total() {
        let cost = TaskCost::new(2.0, 0.5, 0.25);
        assert_eq!(cost.total(), 2.75);
        assert_eq!(TaskCost::default().total(), 1.0);
    }

    #[test]
    fn unit_cost_ignores_task() {
        let task = Task {
            id: TaskId(0),
            function: "discount_curve".into(),
            target: ComputeTarget::new("USD", TargetKind::Primitive),
            inputs: vec![],
            input_values: BTreeSet::new(),
            outputs: BTreeSet::new(),
            cost: TaskCost::new(100.0, 0.0, 0.0),
        };
        assert_eq!(UnitCost.cost(&task).total(), 1.0);
    }
}
