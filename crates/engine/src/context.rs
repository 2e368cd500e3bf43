//! Execution context: the per-run state that drives one graph's fragments
//! through dispatch and result delivery.
//!
//! The context reconstructs live fragment state from an [`ExecutionPlan`],
//! assembles calculation jobs (materializing tail chains into nested jobs so
//! they need no further dispatch), and tracks in-flight jobs. Result
//! delivery uses a work-queue discipline: [`ExecutionContext::result_received`]
//! returns the fragments that just became ready, and the caller dispatches
//! them — no recursive completion callbacks, so deep tail chains cannot
//! overflow the stack.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use abacus_core::ValueId;
use abacus_graph::{TaskGraph, TaskId};
use abacus_jobs::{
    CalculationJob, JobDispatcher, JobHandle, JobId, JobItem, JobResult, ResultMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::plan::{ExecutionPlan, PlanFragment};

/// Monotonic fragment/job id generator.
///
/// Injected into the partitioner and execution contexts rather than living
/// as a process-wide singleton; create one per engine instance.
#[derive(Debug, Default)]
pub struct IdSource {
    next_fragment: AtomicU32,
    next_job: AtomicU64,
}

impl IdSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` contiguous fragment ids, returning the first.
    pub fn reserve_fragment_ids(&self, count: u32) -> u32 {
        self.next_fragment.fetch_add(count, Ordering::Relaxed)
    }

    pub fn next_job_id(&self) -> JobId {
        JobId(self.next_job.fetch_add(1, Ordering::Relaxed))
    }
}

/// Live run-state of one plan fragment.
struct RunFragment {
    plan: PlanFragment,
    remaining_inputs: usize,
    /// Chained into another fragment's job; never dispatched on its own.
    is_tail: bool,
    dispatched: bool,
    completed: bool,
}

struct RunState {
    fragments: BTreeMap<u32, RunFragment>,
    /// In-flight batch job → owning fragment. An entry is removed exactly
    /// once, on first delivery of the job's result.
    in_flight: HashMap<JobId, u32>,
    handles: HashMap<JobId, Box<dyn JobHandle>>,
    executed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    /// Output identifiers visible cycle-wide, pre-seeded with the graph's
    /// terminal outputs and extended from the plan's hint classification.
    shared_values: HashSet<ValueId>,
    remaining_fragments: usize,
}

/// Drives the execution of one task graph for one configuration within a
/// computation cycle.
pub struct ExecutionContext {
    configuration: String,
    graph: Arc<TaskGraph>,
    ids: Arc<IdSource>,
    dispatcher: Arc<dyn JobDispatcher>,
    results_tx: mpsc::Sender<ResultMessage>,
    state: Mutex<RunState>,
    cancelled: AtomicBool,
}

impl ExecutionContext {
    pub fn new(
        configuration: impl Into<String>,
        graph: Arc<TaskGraph>,
        plan: &ExecutionPlan,
        ids: Arc<IdSource>,
        dispatcher: Arc<dyn JobDispatcher>,
        results_tx: mpsc::Sender<ResultMessage>,
    ) -> Self {
        let map = plan.fragment_map();
        let tail_ids: HashSet<u32> = map
            .values()
            .flat_map(|f| f.tails.iter().copied())
            .collect();

        let mut shared_values: HashSet<ValueId> =
            graph.terminal_outputs().iter().cloned().collect();
        let mut fragments = BTreeMap::new();
        for (id, fragment) in &map {
            for task in &fragment.tasks {
                for value in &graph.task(*task).unwrap().outputs {
                    if fragment.cache_hint.is_shared(value) {
                        shared_values.insert(value.clone());
                    }
                }
            }
            fragments.insert(
                *id,
                RunFragment {
                    plan: (*fragment).clone(),
                    remaining_inputs: fragment.inputs.len(),
                    is_tail: tail_ids.contains(id),
                    dispatched: false,
                    completed: false,
                },
            );
        }
        let remaining_fragments = fragments.len();

        Self {
            configuration: configuration.into(),
            graph,
            ids,
            dispatcher,
            results_tx,
            state: Mutex::new(RunState {
                fragments,
                in_flight: HashMap::new(),
                handles: HashMap::new(),
                executed: HashSet::new(),
                failed: HashSet::new(),
                shared_values,
                remaining_fragments,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    /// Fragments with no inputs — dispatched immediately at the start of a
    /// run. Everything else activates reactively as inputs complete.
    pub fn leaf_fragments(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state
            .fragments
            .iter()
            .filter(|(_, f)| f.remaining_inputs == 0 && !f.is_tail && !f.dispatched)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Whether every fragment has delivered its result.
    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().remaining_fragments == 0
    }

    /// Best-effort cancellation: flags the context and cancels every
    /// currently-dispatched job. Jobs already completing may still deliver;
    /// their results are ignored.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        for handle in state.handles.values() {
            handle.cancel();
        }
    }

    /// Dispatch a ready fragment, materializing its tail chain into the
    /// same job tree.
    pub async fn dispatch_fragment(&self, id: u32) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let job = {
            let mut state = self.state.lock().unwrap();
            self.create_job(&mut state, id)
        };
        let job_id = job.id;
        debug!(
            configuration = %self.configuration,
            fragment = id,
            job = %job_id,
            items = job.item_count(),
            "dispatching fragment"
        );
        let handle = self
            .dispatcher
            .dispatch(job, self.results_tx.clone())
            .await?;
        self.state.lock().unwrap().handles.insert(job_id, handle);
        Ok(())
    }

    /// Assemble the calculation job for a fragment: one item per task, the
    /// plan's cache hint, and nested jobs for each chained tail.
    fn create_job(&self, state: &mut RunState, id: u32) -> CalculationJob {
        // Assign job ids across the whole chain first so tails can
        // reference the jobs they must run after.
        let mut job_ids = HashMap::new();
        self.assign_job_ids(state, id, &mut job_ids);
        self.build_job(state, id, &job_ids)
    }

    fn assign_job_ids(&self, state: &mut RunState, id: u32, out: &mut HashMap<u32, JobId>) {
        let job_id = self.ids.next_job_id();
        out.insert(id, job_id);
        state.in_flight.insert(job_id, id);
        let fragment = state.fragments.get_mut(&id).unwrap();
        fragment.dispatched = true;
        let tails = fragment.plan.tails.clone();
        for tail in tails {
            self.assign_job_ids(state, tail, out);
        }
    }

    fn build_job(&self, state: &RunState, id: u32, job_ids: &HashMap<u32, JobId>) -> CalculationJob {
        let fragment = &state.fragments[&id];
        let items = fragment
            .plan
            .tasks
            .iter()
            .map(|&task| {
                let t = self.graph.task(task).unwrap();
                JobItem {
                    task,
                    function: t.function.clone(),
                    target: t.target.clone(),
                    inputs: t.input_values.iter().cloned().collect(),
                    outputs: t.outputs.iter().cloned().collect(),
                }
            })
            .collect();
        // Inputs dispatched within the same chain become ordering
        // constraints for the worker; cross-chain inputs completed before
        // this chain was dispatched.
        let required = fragment
            .plan
            .inputs
            .iter()
            .filter_map(|input| job_ids.get(input).copied())
            .collect();
        let tail = fragment
            .plan
            .tails
            .iter()
            .map(|&t| self.build_job(state, t, job_ids))
            .collect();
        CalculationJob {
            id: job_ids[&id],
            configuration: self.configuration.clone(),
            items,
            cache_hint: fragment.plan.cache_hint.clone(),
            required,
            tail,
        }
    }

    /// Deliver a batch-job result.
    ///
    /// Removes the in-flight entry (at most once — a duplicate or late
    /// delivery is ignored), marks each item's task executed or failed, and
    /// decrements input counters on dependent fragments. Returns the ids of
    /// fragments whose counter just reached zero; the caller dispatches
    /// them. Failed items do not abort the graph — dependents still run and
    /// carry partial results forward.
    pub fn result_received(&self, result: &JobResult) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        let Some(fragment_id) = state.in_flight.remove(&result.job) else {
            debug!(job = %result.job, "ignoring unknown or already-delivered job result");
            return Vec::new();
        };
        state.handles.remove(&result.job);

        for item in &result.items {
            state.executed.insert(item.task);
            if !item.success {
                warn!(
                    task = %item.task,
                    job = %result.job,
                    "task failed; dependents will see missing values"
                );
                state.failed.insert(item.task);
            }
        }

        let fragment = state.fragments.get_mut(&fragment_id).unwrap();
        fragment.completed = true;
        let outputs = fragment.plan.outputs.clone();
        state.remaining_fragments -= 1;

        let mut ready = Vec::new();
        for output in outputs {
            let consumer = state.fragments.get_mut(&output).unwrap();
            consumer.remaining_inputs -= 1;
            if consumer.remaining_inputs == 0 && !consumer.is_tail && !consumer.dispatched {
                ready.push(output);
            }
        }
        ready
    }

    pub fn executed_tasks(&self) -> HashSet<TaskId> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn failed_tasks(&self) -> HashSet<TaskId> {
        self.state.lock().unwrap().failed.clone()
    }

    /// Output identifiers shared across the whole cycle.
    pub fn shared_values(&self) -> HashSet<ValueId> {
        self.state.lock().unwrap().shared_values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{GraphPartitioner, PartitionConfig};
    use abacus_core::{ComputeTarget, TargetKind};
    use abacus_jobs::{JobError, JobItemResult, NoopHandle};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;

    /// Dispatcher that records jobs without executing them.
    #[derive(Default)]
    struct RecordingDispatcher {
        jobs: Mutex<Vec<CalculationJob>>,
    }

    #[async_trait]
    impl JobDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            job: CalculationJob,
            _results: mpsc::Sender<ResultMessage>,
        ) -> Result<Box<dyn JobHandle>, JobError> {
            self.jobs.lock().unwrap().push(job);
            Ok(Box::new(NoopHandle))
        }
    }

    fn value(target: &str, name: &str) -> ValueId {
        ValueId::new(target, name)
    }

    /// a → b → c linear chain of securities.
    fn chain_graph() -> TaskGraph {
        let mut builder = TaskGraph::builder("chain");
        let a = builder
            .add_task(
                "f",
                ComputeTarget::new("A", TargetKind::Security),
                vec![],
                BTreeSet::new(),
                [value("A", "out")].into(),
                Default::default(),
            )
            .unwrap();
        let b = builder
            .add_task(
                "f",
                ComputeTarget::new("B", TargetKind::Security),
                vec![a],
                [value("A", "out")].into(),
                [value("B", "out")].into(),
                Default::default(),
            )
            .unwrap();
        builder
            .add_task(
                "f",
                ComputeTarget::new("C", TargetKind::Security),
                vec![b],
                [value("B", "out")].into(),
                [value("C", "out")].into(),
                Default::default(),
            )
            .unwrap();
        builder.build()
    }

    fn context_for(
        graph: TaskGraph,
        config: PartitionConfig,
    ) -> (Arc<ExecutionContext>, Arc<RecordingDispatcher>) {
        let ids = Arc::new(IdSource::new());
        let plan = GraphPartitioner::new(config).partition(&graph, &ids);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let (tx, _rx) = mpsc::channel(16);
        let context = Arc::new(ExecutionContext::new(
            "Default",
            Arc::new(graph),
            &plan,
            ids,
            dispatcher.clone() as Arc<dyn JobDispatcher>,
            tx,
        ));
        (context, dispatcher)
    }

    fn no_merge_config() -> PartitionConfig {
        PartitionConfig {
            min_job_items: 1,
            max_job_items: 1,
            max_concurrency: 0,
            ..PartitionConfig::default()
        }
    }

    #[tokio::test]
    async fn fragments_gate_on_input_completion() {
        // max_concurrency 0 disables tail chaining entirely, so every
        // fragment round-trips through dispatch.
        let (context, dispatcher) = context_for(chain_graph(), no_merge_config());

        let leaves = context.leaf_fragments();
        assert_eq!(leaves.len(), 1);
        context.dispatch_fragment(leaves[0]).await.unwrap();
        assert_eq!(dispatcher.jobs.lock().unwrap().len(), 1);

        // Completing the first job readies exactly the next fragment.
        let first = dispatcher.jobs.lock().unwrap()[0].clone();
        let ready = context.result_received(&JobResult::new(
            first.id,
            Duration::from_millis(1),
            vec![JobItemResult::success(TaskId(0), vec![value("A", "out")])],
        ));
        assert_eq!(ready.len(), 1);
        assert!(!context.is_complete());

        // Delivering the same result again is a no-op.
        let again = context.result_received(&JobResult::new(
            first.id,
            Duration::from_millis(1),
            vec![],
        ));
        assert!(again.is_empty());
        assert!(context.executed_tasks().contains(&TaskId(0)));
    }

    #[tokio::test]
    async fn tail_chain_dispatches_once_with_nested_jobs() {
        // Default concurrency: the linear chain colors into one chain and
        // ships as a single job tree.
        let (context, dispatcher) = context_for(
            chain_graph(),
            PartitionConfig {
                min_job_items: 1,
                max_job_items: 1,
                ..PartitionConfig::default()
            },
        );

        let leaves = context.leaf_fragments();
        assert_eq!(leaves.len(), 1);
        context.dispatch_fragment(leaves[0]).await.unwrap();

        let jobs = dispatcher.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1, "tails ride along, no extra dispatches");
        let head = &jobs[0];
        assert_eq!(head.item_count(), 3);
        assert!(head.required.is_empty());
        // Tails reference their in-chain predecessor as required.
        assert_eq!(head.tail.len(), 1);
        assert_eq!(head.tail[0].required, vec![head.id]);
    }

    #[tokio::test]
    async fn completion_tracks_all_fragments() {
        let (context, dispatcher) = context_for(chain_graph(), no_merge_config());
        let leaves = context.leaf_fragments();
        context.dispatch_fragment(leaves[0]).await.unwrap();

        // Walk the chain to completion.
        let mut delivered = 0;
        while !context.is_complete() {
            let job = dispatcher.jobs.lock().unwrap().last().cloned().unwrap();
            let items = job
                .items
                .iter()
                .map(|i| JobItemResult::success(i.task, i.outputs.clone()))
                .collect();
            let ready =
                context.result_received(&JobResult::new(job.id, Duration::from_millis(1), items));
            delivered += 1;
            for id in ready {
                context.dispatch_fragment(id).await.unwrap();
            }
        }
        assert_eq!(delivered, 3);
        assert_eq!(context.executed_tasks().len(), 3);
        assert!(context.failed_tasks().is_empty());
    }

    #[tokio::test]
    async fn failed_items_do_not_abort() {
        let (context, dispatcher) = context_for(chain_graph(), no_merge_config());
        let leaves = context.leaf_fragments();
        context.dispatch_fragment(leaves[0]).await.unwrap();

        let job = dispatcher.jobs.lock().unwrap()[0].clone();
        let ready = context.result_received(&JobResult::new(
            job.id,
            Duration::from_millis(1),
            vec![JobItemResult::failure(TaskId(0))],
        ));
        // The dependent fragment still becomes ready.
        assert_eq!(ready.len(), 1);
        assert!(context.failed_tasks().contains(&TaskId(0)));
    }

    #[tokio::test]
    async fn cancel_skips_further_dispatch() {
        let (context, dispatcher) = context_for(chain_graph(), no_merge_config());
        context.cancel();
        assert!(context.is_cancelled());

        let leaves = context.leaf_fragments();
        context.dispatch_fragment(leaves[0]).await.unwrap();
        assert!(dispatcher.jobs.lock().unwrap().is_empty());
    }

    #[test]
    fn shared_values_seeded_with_terminal_outputs() {
        let ids = Arc::new(IdSource::new());
        let graph = chain_graph();
        let plan = GraphPartitioner::new(PartitionConfig::default()).partition(&graph, &ids);
        let (tx, _rx) = mpsc::channel(16);
        let context = ExecutionContext::new(
            "Default",
            Arc::new(graph),
            &plan,
            ids,
            Arc::new(RecordingDispatcher::default()) as Arc<dyn JobDispatcher>,
            tx,
        );
        assert!(context.shared_values().contains(&value("C", "out")));
        assert!(!context.shared_values().contains(&value("A", "out")));
    }
}
