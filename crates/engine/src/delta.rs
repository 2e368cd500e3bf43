//! Delta computation: reusing a previous cycle's outputs for tasks whose
//! inputs are provably unchanged.
//!
//! This is purely an optimization. Skipping it (or a comparator that always
//! answers "changed") just costs a full recompute; correctness never
//! depends on it.

use std::collections::HashSet;

use abacus_graph::{Task, TaskId};
use abacus_jobs::ValueCache;
use tracing::debug;

use crate::cycle::{ComputationCycle, CycleState};
use crate::error::EngineError;

/// External calculator deciding whether a task's inputs changed between two
/// cycles' caches.
pub trait DeltaComparator: Send + Sync {
    fn is_unchanged(&self, task: &Task, previous: &dyn ValueCache, current: &dyn ValueCache)
        -> bool;
}

/// Default comparator: a task is unchanged when every one of its input
/// values is present in both caches with an equal entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputEquality;

impl DeltaComparator for InputEquality {
    fn is_unchanged(
        &self,
        task: &Task,
        previous: &dyn ValueCache,
        current: &dyn ValueCache,
    ) -> bool {
        task.input_values.iter().all(|input| {
            match (previous.get(input), current.get(input)) {
                (Some(prev), Some(cur)) => prev == cur,
                _ => false,
            }
        })
    }
}

/// Mark every provably-unchanged task of `current` as already executed,
/// copying its output values forward from the previous cycle's caches.
///
/// Walks each graph in insertion order (topological), so an unchanged
/// task's copied outputs are visible when its consumers are compared — and
/// a changed task's absent outputs make every transitive consumer compare
/// as changed.
pub(crate) fn compute_delta(
    previous: &ComputationCycle,
    current: &ComputationCycle,
    comparator: &dyn DeltaComparator,
) -> Result<(), EngineError> {
    if previous.state() != CycleState::Executed {
        return Err(EngineError::PreviousCycleNotExecuted);
    }

    for config in &current.view().configurations {
        let Some(previous_cache) = previous.cache(&config.name) else {
            continue;
        };
        let Some(current_cache) = current.cache(&config.name) else {
            continue;
        };
        let Some(graph) = current.graph(&config.name) else {
            continue;
        };

        let previously_executed = previous.executed_tasks(&config.name);
        let previously_failed = previous.failed_tasks(&config.name);
        let mut unchanged: HashSet<TaskId> = HashSet::new();

        for task in graph.tasks() {
            if !previously_executed.contains(&task.id) {
                continue;
            }
            if !task.inputs.iter().all(|input| unchanged.contains(input)) {
                continue;
            }
            if !comparator.is_unchanged(task, previous_cache.as_ref(), current_cache.as_ref()) {
                continue;
            }

            unchanged.insert(task.id);
            for output in &task.outputs {
                if let Some(value) = previous_cache.get(output) {
                    current_cache.put(output.clone(), value);
                }
            }
            current.mark_executed(&config.name, task.id);
            if previously_failed.contains(&task.id) {
                current.mark_failed(&config.name, task.id);
            }
        }

        debug!(
            cycle = %current.id(),
            configuration = %config.name,
            reused = unchanged.len(),
            of = graph.len(),
            "delta computation"
        );
    }
    Ok(())
}
