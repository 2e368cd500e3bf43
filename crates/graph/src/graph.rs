use std::collections::{BTreeSet, HashMap, HashSet};

use abacus_core::{ComputeTarget, ValueId};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::task::{Task, TaskCost, TaskId};

/// Errors raised while assembling a task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown input task: {0}")]
    UnknownInput(TaskId),

    #[error("task on {task} may not depend on task on {input}")]
    InvalidDependency {
        task: ComputeTarget,
        input: ComputeTarget,
    },

    #[error("task {task} produces {value} which {other} already produces")]
    DuplicateOutput {
        task: TaskId,
        other: TaskId,
        value: ValueId,
    },
}

/// An immutable, already-resolved DAG of calculation tasks.
///
/// Task ids are dense and stable; a node-set subgraph preserves the ids of
/// the tasks it keeps, so executed-task bookkeeping carries across the full
/// graph and its filtered subgraphs.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    name: String,
    tasks: IndexMap<TaskId, Task>,
    consumers: HashMap<TaskId, Vec<TaskId>>,
    terminal_outputs: BTreeSet<ValueId>,
}

impl TaskGraph {
    /// Start building a graph with the given name.
    pub fn builder(name: impl Into<String>) -> TaskGraphBuilder {
        TaskGraphBuilder {
            name: name.into(),
            tasks: IndexMap::new(),
            produced: HashMap::new(),
            terminal_outputs: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Iterate tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.keys().copied()
    }

    /// Tasks consuming the given task's output.
    pub fn consumers(&self, id: TaskId) -> &[TaskId] {
        self.consumers.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks with no input tasks — executable immediately.
    pub fn leaves(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.inputs.is_empty())
            .map(|t| t.id)
            .collect()
    }

    /// Tasks nothing consumes — the graph's final calculations.
    pub fn roots(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| self.consumers(t.id).is_empty())
            .map(|t| t.id)
            .collect()
    }

    /// The outputs visible outside the graph (defaults to the union of root
    /// outputs unless overridden at build time).
    pub fn terminal_outputs(&self) -> &BTreeSet<ValueId> {
        &self.terminal_outputs
    }

    /// Input values no task in the graph produces — the market-data
    /// requirements of a run.
    pub fn external_inputs(&self) -> BTreeSet<ValueId> {
        let produced: HashSet<&ValueId> =
            self.tasks.values().flat_map(|t| t.outputs.iter()).collect();
        self.tasks
            .values()
            .flat_map(|t| t.input_values.iter())
            .filter(|v| !produced.contains(v))
            .cloned()
            .collect()
    }

    /// Sum of all task costs.
    pub fn total_cost(&self) -> f64 {
        self.tasks.values().map(|t| t.cost.total()).sum()
    }

    /// The node-set subgraph containing only `include`, preserving task ids.
    ///
    /// Edges to excluded tasks are dropped, so a task whose inputs were all
    /// excluded becomes a leaf of the subgraph. Terminal outputs are
    /// filtered down to values the subgraph still produces.
    pub fn subgraph(&self, include: &HashSet<TaskId>) -> TaskGraph {
        let mut tasks = IndexMap::new();
        for (id, task) in &self.tasks {
            if !include.contains(id) {
                continue;
            }
            let mut task = task.clone();
            task.inputs.retain(|input| include.contains(input));
            tasks.insert(*id, task);
        }

        let consumers = build_consumers(&tasks);
        let produced: HashSet<&ValueId> =
            tasks.values().flat_map(|t| t.outputs.iter()).collect();
        let terminal_outputs = self
            .terminal_outputs
            .iter()
            .filter(|v| produced.contains(v))
            .cloned()
            .collect();

        TaskGraph {
            name: self.name.clone(),
            tasks,
            consumers,
            terminal_outputs,
        }
    }

    /// Stable identity of the graph's task set, used as the plan-cache key.
    ///
    /// Two graphs with the same tasks (ids, functions, targets, edges,
    /// outputs) produce the same key regardless of how they were built.
    pub fn identity_key(&self) -> String {
        let mut hasher = Sha256::new();
        for task in self.tasks.values() {
            hasher.update(task.id.0.to_le_bytes());
            hasher.update(task.function.as_bytes());
            hasher.update(task.target.id.as_bytes());
            hasher.update(task.target.kind.to_string().as_bytes());
            for input in &task.inputs {
                hasher.update(input.0.to_le_bytes());
            }
            for output in &task.outputs {
                hasher.update(output.to_string().as_bytes());
            }
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn build_consumers(tasks: &IndexMap<TaskId, Task>) -> HashMap<TaskId, Vec<TaskId>> {
    let mut consumers: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for task in tasks.values() {
        for input in &task.inputs {
            consumers.entry(*input).or_default().push(task.id);
        }
    }
    consumers
}

/// Incremental builder for [`TaskGraph`].
pub struct TaskGraphBuilder {
    name: String,
    tasks: IndexMap<TaskId, Task>,
    produced: HashMap<ValueId, TaskId>,
    terminal_outputs: Option<BTreeSet<ValueId>>,
}

impl TaskGraphBuilder {
    /// Add a task, validating its dependencies against tasks added so far.
    #[allow(clippy::too_many_arguments)]
    pub fn add_task(
        &mut self,
        function: impl Into<String>,
        target: ComputeTarget,
        inputs: Vec<TaskId>,
        input_values: BTreeSet<ValueId>,
        outputs: BTreeSet<ValueId>,
        cost: TaskCost,
    ) -> Result<TaskId, GraphError> {
        let id = TaskId(self.tasks.len() as u32);

        for input in &inputs {
            let input_task = self
                .tasks
                .get(input)
                .ok_or(GraphError::UnknownInput(*input))?;
            if !target.kind.may_depend_on(input_task.target.kind) {
                return Err(GraphError::InvalidDependency {
                    task: target,
                    input: input_task.target.clone(),
                });
            }
        }

        for output in &outputs {
            if let Some(other) = self.produced.get(output) {
                return Err(GraphError::DuplicateOutput {
                    task: id,
                    other: *other,
                    value: output.clone(),
                });
            }
        }
        for output in &outputs {
            self.produced.insert(output.clone(), id);
        }

        self.tasks.insert(
            id,
            Task {
                id,
                function: function.into(),
                target,
                inputs,
                input_values,
                outputs,
                cost,
            },
        );
        Ok(id)
    }

    /// Override the terminal-output set (defaults to root outputs).
    pub fn terminal_outputs(&mut self, outputs: BTreeSet<ValueId>) -> &mut Self {
        self.terminal_outputs = Some(outputs);
        self
    }

    pub fn build(self) -> TaskGraph {
        let consumers = build_consumers(&self.tasks);
        let terminal_outputs = self.terminal_outputs.unwrap_or_else(|| {
            self.tasks
                .values()
                .filter(|t| !consumers.contains_key(&t.id))
                .flat_map(|t| t.outputs.iter().cloned())
                .collect()
        });
        TaskGraph {
            name: self.name,
            tasks: self.tasks,
            consumers,
            terminal_outputs,
        }
    }
}
