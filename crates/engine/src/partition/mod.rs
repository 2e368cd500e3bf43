//! Graph partitioner: turns a task graph into a fragment DAG sized for
//! efficient batch dispatch.
//!
//! The pipeline is seed → shared-input merge → single-dependency merge →
//! tail coloring → cache-hint classification → flatten into an
//! [`ExecutionPlan`]. A graph at or below the minimum job size skips all of
//! it and runs as a single fragment.

mod color;
mod fragment;
mod merge;

pub use fragment::{Fragment, FragmentArena, FragmentId, FragmentKind};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use abacus_core::{EngineSettings, ValueId};
use abacus_graph::{CostEstimator, Task, TaskGraph};
use abacus_jobs::CacheSelectHint;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::IdSource;
use crate::plan::{ExecutionPlan, PlanFragment};

/// Partitioning limits, typically read from the environment via
/// [`EngineSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Graphs at or below this size run as one fragment; fragments under it
    /// are merge candidates.
    #[serde(default = "default_min_job_items")]
    pub min_job_items: usize,
    /// Hard cap on items per batch job.
    #[serde(default = "default_max_job_items")]
    pub max_job_items: usize,
    /// Fragments under this estimated cost are merge candidates.
    #[serde(default = "default_min_job_cost")]
    pub min_job_cost: f64,
    /// Hard cap on estimated cost per batch job.
    #[serde(default = "default_max_job_cost")]
    pub max_job_cost: f64,
    /// Ceiling on concurrently-executing fragments per execution coloring.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_min_job_items() -> usize { 1 }
fn default_max_job_items() -> usize { 1000 }
fn default_min_job_cost() -> f64 { 0.0 }
fn default_max_job_cost() -> f64 { f64::MAX }
fn default_max_concurrency() -> usize { 4 }

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            min_job_items: default_min_job_items(),
            max_job_items: default_max_job_items(),
            min_job_cost: default_min_job_cost(),
            max_job_cost: default_max_job_cost(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl From<&EngineSettings> for PartitionConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            min_job_items: settings.min_job_items,
            max_job_items: settings.max_job_items,
            min_job_cost: settings.min_job_cost,
            max_job_cost: settings.max_job_cost,
            max_concurrency: settings.max_concurrency,
        }
    }
}

/// Builds execution plans from task graphs.
pub struct GraphPartitioner {
    config: PartitionConfig,
    estimator: Option<Arc<dyn CostEstimator>>,
}

impl GraphPartitioner {
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            config,
            estimator: None,
        }
    }

    /// Override the cost model baked into the graph's tasks, e.g. with one
    /// fed by observed execution times.
    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    fn cost_of(&self, task: &Task) -> f64 {
        match &self.estimator {
            Some(estimator) => estimator.cost(task).total(),
            None => task.cost.total(),
        }
    }

    /// Partition a graph into an execution plan.
    pub fn partition(&self, graph: &TaskGraph, ids: &IdSource) -> ExecutionPlan {
        if graph.len() <= self.config.min_job_items {
            debug!(
                graph = %graph.name(),
                tasks = graph.len(),
                "graph at or below minimum job size, using trivial plan"
            );
            return self.trivial_plan(graph);
        }

        // Seed: one fragment per task plus the synthetic root sink, edges
        // mirroring task dependencies.
        let base = ids.reserve_fragment_ids(graph.len() as u32 + 1);
        let mut arena = FragmentArena::new(base);
        let mut fragment_of = HashMap::new();
        for task in graph.tasks() {
            let id = arena.insert(FragmentKind::Standard, vec![task.id], self.cost_of(task));
            fragment_of.insert(task.id, id);
        }
        for task in graph.tasks() {
            let consumer = fragment_of[&task.id];
            for input in &task.inputs {
                let producer = fragment_of[input];
                arena.get_mut(producer).outputs.insert(consumer);
                arena.get_mut(consumer).inputs.insert(producer);
            }
        }
        let root = arena.insert(FragmentKind::Root, vec![], 0.0);
        for id in arena.standard_ids() {
            if arena.get(id).outputs.is_empty() {
                arena.get_mut(id).outputs.insert(root);
                arena.get_mut(root).inputs.insert(id);
            }
        }

        merge::shared_input_merge(&mut arena, &self.config);
        merge::single_dependency_merge(&mut arena, &self.config);
        color::color_fragments(&mut arena, self.config.max_concurrency);

        let shared = classify_shared(graph, &arena);
        let fragments = flatten(graph, &arena, &shared);

        debug!(
            graph = %graph.name(),
            tasks = graph.len(),
            fragments = fragments.len(),
            "partitioned graph"
        );
        ExecutionPlan::Partitioned(fragments)
    }

    fn trivial_plan(&self, graph: &TaskGraph) -> ExecutionPlan {
        let produced: BTreeSet<ValueId> = graph
            .tasks()
            .flat_map(|t| t.outputs.iter().cloned())
            .collect();
        let shared: BTreeSet<ValueId> = produced
            .iter()
            .filter(|v| graph.terminal_outputs().contains(v))
            .cloned()
            .collect();
        let private: BTreeSet<ValueId> = produced
            .into_iter()
            .filter(|v| !shared.contains(v))
            .collect();

        ExecutionPlan::Single(PlanFragment {
            tasks: graph.task_ids().collect(),
            cache_hint: CacheSelectHint::select(private, shared),
            inputs: Vec::new(),
            outputs: Vec::new(),
            tails: Vec::new(),
        })
    }
}

/// Classify which produced values are shared cycle-wide.
///
/// A value is shared when it is a declared terminal output, or when some
/// task in a differently-colored fragment consumes it. Everything else is
/// visible only within its producer's coloring.
fn classify_shared(graph: &TaskGraph, arena: &FragmentArena) -> HashSet<ValueId> {
    let mut producer_color: HashMap<&ValueId, u32> = HashMap::new();
    for id in arena.standard_ids() {
        let fragment = arena.get(id);
        let color = fragment.execution_id.unwrap();
        for &task in &fragment.tasks {
            for value in &graph.task(task).unwrap().outputs {
                producer_color.insert(value, color);
            }
        }
    }

    let mut shared: HashSet<ValueId> = graph.terminal_outputs().iter().cloned().collect();
    for id in arena.standard_ids() {
        let fragment = arena.get(id);
        let color = fragment.execution_id.unwrap();
        for &task in &fragment.tasks {
            for value in &graph.task(task).unwrap().input_values {
                if let Some(&producer) = producer_color.get(value) {
                    if producer != color {
                        shared.insert(value.clone());
                    }
                }
            }
        }
    }
    shared
}

fn flatten(
    graph: &TaskGraph,
    arena: &FragmentArena,
    shared: &HashSet<ValueId>,
) -> BTreeMap<u32, PlanFragment> {
    let mut fragments = BTreeMap::new();
    for id in arena.standard_ids() {
        let fragment = arena.get(id);
        let produced: BTreeSet<ValueId> = fragment
            .tasks
            .iter()
            .flat_map(|t| graph.task(*t).unwrap().outputs.iter().cloned())
            .collect();
        let (shared_values, private_values): (BTreeSet<ValueId>, BTreeSet<ValueId>) =
            produced.into_iter().partition(|v| shared.contains(v));

        fragments.insert(
            id.0,
            PlanFragment {
                tasks: fragment.tasks.clone(),
                cache_hint: CacheSelectHint::select(private_values, shared_values),
                inputs: fragment.inputs.iter().map(|i| i.0).collect(),
                outputs: fragment
                    .outputs
                    .iter()
                    .filter(|o| arena.get(**o).kind != FragmentKind::Root)
                    .map(|o| o.0)
                    .collect(),
                tails: fragment.tail.iter().map(|t| t.0).collect(),
            },
        );
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use abacus_core::{ComputeTarget, TargetKind};
    use abacus_graph::{TaskCost, TaskId};

    fn value(target: &str, name: &str) -> ValueId {
        ValueId::new(target, name)
    }

    /// 2 primitives → 1 security → 1 position → 1 portfolio node.
    fn five_task_graph() -> TaskGraph {
        let mut builder = TaskGraph::builder("five");
        let p1 = builder
            .add_task(
                "curve",
                ComputeTarget::new("USD", TargetKind::Primitive),
                vec![],
                [value("USD", "Quote")].into(),
                [value("USD", "Curve")].into(),
                TaskCost::default(),
            )
            .unwrap();
        let p2 = builder
            .add_task(
                "curve",
                ComputeTarget::new("EUR", TargetKind::Primitive),
                vec![],
                [value("EUR", "Quote")].into(),
                [value("EUR", "Curve")].into(),
                TaskCost::default(),
            )
            .unwrap();
        let sec = builder
            .add_task(
                "fair_value",
                ComputeTarget::new("BOND", TargetKind::Security),
                vec![p1, p2],
                [value("USD", "Curve"), value("EUR", "Curve")].into(),
                [value("BOND", "FairValue")].into(),
                TaskCost::default(),
            )
            .unwrap();
        let pos = builder
            .add_task(
                "position_value",
                ComputeTarget::new("POS", TargetKind::Position),
                vec![sec],
                [value("BOND", "FairValue")].into(),
                [value("POS", "Value")].into(),
                TaskCost::default(),
            )
            .unwrap();
        builder
            .add_task(
                "aggregate",
                ComputeTarget::new("PORT", TargetKind::PortfolioNode),
                vec![pos],
                [value("POS", "Value")].into(),
                [value("PORT", "Value")].into(),
                TaskCost::default(),
            )
            .unwrap();
        builder.build()
    }

    fn partition_with(config: PartitionConfig, graph: &TaskGraph) -> ExecutionPlan {
        GraphPartitioner::new(config).partition(graph, &IdSource::new())
    }

    fn all_tasks(plan: &ExecutionPlan) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = plan
            .fragment_map()
            .values()
            .flat_map(|f| f.tasks.iter().copied())
            .collect();
        tasks.sort();
        tasks
    }

    #[test]
    fn small_graph_forces_single_fragment() {
        let graph = five_task_graph();
        let plan = partition_with(
            PartitionConfig {
                min_job_items: 10,
                ..PartitionConfig::default()
            },
            &graph,
        );

        match &plan {
            ExecutionPlan::Single(fragment) => {
                assert_eq!(fragment.tasks.len(), 5);
            }
            other => panic!("expected trivial plan, got {other:?}"),
        }
    }

    #[test]
    fn partition_covers_every_task_exactly_once() {
        let graph = five_task_graph();
        let plan = partition_with(
            PartitionConfig {
                min_job_items: 1,
                max_job_items: 2,
                ..PartitionConfig::default()
            },
            &graph,
        );

        assert_eq!(
            all_tasks(&plan),
            (0..5).map(TaskId).collect::<Vec<_>>(),
            "every task appears exactly once across fragments"
        );
    }

    #[test]
    fn no_fragment_exceeds_max_items() {
        let graph = five_task_graph();
        let plan = partition_with(
            PartitionConfig {
                min_job_items: 1,
                max_job_items: 2,
                ..PartitionConfig::default()
            },
            &graph,
        );
        for fragment in plan.fragment_map().values() {
            assert!(fragment.tasks.len() <= 2);
        }
    }

    #[test]
    fn concurrency_one_chains_everything_as_tails() {
        let graph = five_task_graph();
        // min=2/max=2 merges the two primitives (shared input set) and the
        // security+position pair, leaving a 3-fragment chain.
        let plan = partition_with(
            PartitionConfig {
                min_job_items: 2,
                max_job_items: 2,
                max_concurrency: 1,
                ..PartitionConfig::default()
            },
            &graph,
        );

        let map = plan.fragment_map();
        assert_eq!(map.len(), 3);

        // Exactly one fragment is nobody's tail: the chain head. Walking
        // tail links from it must reach every fragment — one dispatched
        // job, zero extra round trips.
        let tails: HashSet<u32> = map.values().flat_map(|f| f.tails.iter().copied()).collect();
        let heads: Vec<u32> = map.keys().copied().filter(|id| !tails.contains(id)).collect();
        assert_eq!(heads.len(), 1);

        let mut reached = HashSet::new();
        let mut queue = vec![heads[0]];
        while let Some(id) = queue.pop() {
            reached.insert(id);
            queue.extend(map[&id].tails.iter().copied());
        }
        assert_eq!(reached.len(), map.len());
    }

    #[test]
    fn hint_is_minority_set() {
        let graph = five_task_graph();
        let plan = partition_with(
            PartitionConfig {
                min_job_items: 10,
                ..PartitionConfig::default()
            },
            &graph,
        );
        match &plan {
            ExecutionPlan::Single(fragment) => {
                // 5 produced values, 1 terminal: the shared side is the
                // minority and must be the one listed.
                assert_eq!(
                    fragment.cache_hint,
                    CacheSelectHint::shared([value("PORT", "Value")])
                );
                assert!(fragment.cache_hint.len() * 2 <= 5);
            }
            other => panic!("expected trivial plan, got {other:?}"),
        }
    }

    #[test]
    fn merged_chain_values_stay_private_within_color() {
        let graph = five_task_graph();
        // Generous limits: everything merges into one fragment via the
        // single-dependency pass even though min_job_items is 1.
        let plan = partition_with(
            PartitionConfig {
                min_job_items: 1,
                max_job_items: 100,
                ..PartitionConfig::default()
            },
            &graph,
        );
        let map = plan.fragment_map();
        let total: usize = map.values().map(|f| f.tasks.len()).sum();
        assert_eq!(total, 5);

        for fragment in map.values() {
            // Intermediate curve/fair-value outputs consumed within the
            // same coloring never appear as shared.
            assert!(!fragment.cache_hint.is_shared(&value("USD", "Curve")));
        }
    }
}
