//! Computation cycle: one stateful attempt to evaluate every calculation
//! configuration's task graph and assemble a result snapshot.
//!
//! A cycle executes at most once. Delta recomputation is expressed by
//! passing a *previous* executed cycle to [`ComputationCycle::execute`], not
//! by re-running the same cycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use abacus_core::ComputedValue;
use abacus_graph::{TaskGraph, TaskId};
use abacus_jobs::{InMemoryValueCache, ValueCache};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delta::{compute_delta, DeltaComparator};
use crate::error::EngineError;
use crate::executor::{ExecutionOutcome, GraphExecutor};
use crate::input::{populate_market_data, MarketDataProvider};
use crate::resources::EngineResource;
use crate::results::{ComputationListener, ResultSnapshot};
use crate::view::{ResultModel, ViewDefinition};

/// Lifecycle state of a computation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    AwaitingExecution,
    Executing,
    Executed,
    ExecutionInterrupted,
    Destroyed,
}

impl CycleState {
    pub fn name(&self) -> &'static str {
        match self {
            CycleState::AwaitingExecution => "AwaitingExecution",
            CycleState::Executing => "Executing",
            CycleState::Executed => "Executed",
            CycleState::ExecutionInterrupted => "ExecutionInterrupted",
            CycleState::Destroyed => "Destroyed",
        }
    }
}

/// Allocator of shared value caches, keyed by (cycle, configuration).
pub trait ValueCacheSource: Send + Sync {
    fn cache_for(&self, cycle: Uuid, configuration: &str) -> Arc<dyn ValueCache>;

    /// Drop every cache belonging to the given cycle.
    fn release_cycle(&self, cycle: Uuid);
}

/// Cache source backed by [`InMemoryValueCache`] instances.
#[derive(Debug, Default)]
pub struct InMemoryCacheSource {
    caches: Mutex<HashMap<(Uuid, String), Arc<InMemoryValueCache>>>,
}

impl InMemoryCacheSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueCacheSource for InMemoryCacheSource {
    fn cache_for(&self, cycle: Uuid, configuration: &str) -> Arc<dyn ValueCache> {
        let mut caches = self.caches.lock().unwrap();
        let cache = caches
            .entry((cycle, configuration.to_string()))
            .or_default();
        Arc::clone(cache) as Arc<dyn ValueCache>
    }

    fn release_cycle(&self, cycle: Uuid) {
        self.caches.lock().unwrap().retain(|(id, _), _| *id != cycle);
    }
}

/// The collaborators a cycle needs to execute.
pub struct CycleServices {
    pub executor: Arc<GraphExecutor>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub cache_source: Arc<dyn ValueCacheSource>,
    pub delta: Arc<dyn DeltaComparator>,
    pub listener: Option<Arc<dyn ComputationListener>>,
    /// How long each wait on a submitted graph blocks before re-checking
    /// for interruption.
    pub poll_interval: Duration,
}

impl CycleServices {
    pub fn new(
        settings: &abacus_core::EngineSettings,
        executor: Arc<GraphExecutor>,
        market_data: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self {
            executor,
            market_data,
            cache_source: Arc::new(InMemoryCacheSource::new()),
            delta: Arc::new(crate::delta::InputEquality),
            listener: None,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }

    pub fn with_cache_source(mut self, source: Arc<dyn ValueCacheSource>) -> Self {
        self.cache_source = source;
        self
    }

    pub fn with_delta_comparator(mut self, delta: Arc<dyn DeltaComparator>) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ComputationListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// One execution attempt over all of a view's calculation configurations.
pub struct ComputationCycle {
    id: Uuid,
    view: Arc<ViewDefinition>,
    graphs: HashMap<String, Arc<TaskGraph>>,
    state: Mutex<CycleState>,
    caches: Mutex<HashMap<String, Arc<dyn ValueCache>>>,
    executed: Mutex<HashMap<String, HashSet<TaskId>>>,
    failed: Mutex<HashMap<String, HashSet<TaskId>>>,
    snapshot: ResultSnapshot,
    interrupted: AtomicBool,
    cache_source: Mutex<Option<Arc<dyn ValueCacheSource>>>,
}

impl ComputationCycle {
    /// Create a cycle over the given view; `graphs` maps each configuration
    /// name to its resolved task graph.
    pub fn new(view: Arc<ViewDefinition>, graphs: HashMap<String, Arc<TaskGraph>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            view,
            graphs,
            state: Mutex::new(CycleState::AwaitingExecution),
            caches: Mutex::new(HashMap::new()),
            executed: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            snapshot: ResultSnapshot::new(),
            interrupted: AtomicBool::new(false),
            cache_source: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn view(&self) -> &Arc<ViewDefinition> {
        &self.view
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock().unwrap()
    }

    pub fn snapshot(&self) -> &ResultSnapshot {
        &self.snapshot
    }

    pub fn graph(&self, configuration: &str) -> Option<&Arc<TaskGraph>> {
        self.graphs.get(configuration)
    }

    pub fn cache(&self, configuration: &str) -> Option<Arc<dyn ValueCache>> {
        self.caches.lock().unwrap().get(configuration).cloned()
    }

    pub fn executed_tasks(&self, configuration: &str) -> HashSet<TaskId> {
        self.executed
            .lock()
            .unwrap()
            .get(configuration)
            .cloned()
            .unwrap_or_default()
    }

    pub fn failed_tasks(&self, configuration: &str) -> HashSet<TaskId> {
        self.failed
            .lock()
            .unwrap()
            .get(configuration)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn mark_executed(&self, configuration: &str, task: TaskId) {
        self.executed
            .lock()
            .unwrap()
            .entry(configuration.to_string())
            .or_default()
            .insert(task);
    }

    pub(crate) fn mark_failed(&self, configuration: &str, task: TaskId) {
        self.failed
            .lock()
            .unwrap()
            .entry(configuration.to_string())
            .or_default()
            .insert(task);
    }

    /// Request cooperative interruption; observed at the next poll of the
    /// executing graphs.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    /// Execute the cycle.
    ///
    /// Passing a previous *executed* cycle enables delta recomputation:
    /// tasks whose inputs are provably unchanged are reused instead of
    /// resubmitted. Calling `execute` twice on the same cycle is a
    /// programming error and fails immediately.
    pub async fn execute(
        &self,
        services: &CycleServices,
        previous: Option<&ComputationCycle>,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != CycleState::AwaitingExecution {
                return Err(EngineError::InvalidState {
                    expected: "AwaitingExecution",
                    actual: state.name(),
                });
            }
            *state = CycleState::Executing;
        }
        *self.cache_source.lock().unwrap() = Some(Arc::clone(&services.cache_source));

        // One shared value cache per configuration.
        for config in &self.view.configurations {
            if !self.graphs.contains_key(&config.name) {
                return Err(EngineError::UnknownConfiguration(config.name.clone()));
            }
            let cache = services.cache_source.cache_for(self.id, &config.name);
            self.caches
                .lock()
                .unwrap()
                .insert(config.name.clone(), cache);
        }

        // Market data, with per-configuration shifts and missing-data
        // sentinels.
        for config in &self.view.configurations {
            let graph = &self.graphs[&config.name];
            let cache = self.cache(&config.name).unwrap();
            populate_market_data(
                services.market_data.as_ref(),
                config,
                graph,
                cache.as_ref(),
            );
        }

        if let Some(previous) = previous {
            compute_delta(previous, self, services.delta.as_ref())?;
        }

        // Submit the executed-filtered subgraph of every configuration.
        let mut handles = Vec::new();
        for config in &self.view.configurations {
            let graph = &self.graphs[&config.name];
            let executed = self.executed_tasks(&config.name);
            let include: HashSet<TaskId> = graph
                .task_ids()
                .filter(|t| !executed.contains(t))
                .collect();
            if include.is_empty() {
                debug!(
                    cycle = %self.id,
                    configuration = %config.name,
                    "all tasks reused from previous cycle"
                );
                continue;
            }
            let subgraph = if include.len() == graph.len() {
                Arc::clone(graph)
            } else {
                Arc::new(graph.subgraph(&include))
            };
            let cache = self.cache(&config.name).unwrap();
            let handle = services
                .executor
                .execute(subgraph, &config.name, cache, services.listener.clone())
                .await?;
            handles.push((config.name.clone(), handle));
        }

        // Wait for every submitted graph, polling with a short timeout so
        // interruption is observed promptly.
        let mut outcomes = Vec::new();
        for (name, handle) in &handles {
            loop {
                if self.interrupted.load(Ordering::Relaxed) {
                    warn!(cycle = %self.id, "execution interrupted, cancelling outstanding work");
                    for (_, h) in &handles {
                        h.cancel();
                    }
                    *self.state.lock().unwrap() = CycleState::ExecutionInterrupted;
                    return Err(EngineError::Interrupted);
                }
                match tokio::time::timeout(services.poll_interval, handle.wait()).await {
                    Ok(outcome) => {
                        outcomes.push((name.clone(), outcome));
                        break;
                    }
                    Err(_) => continue,
                }
            }
        }

        for (name, outcome) in &outcomes {
            match outcome {
                ExecutionOutcome::Completed => {}
                ExecutionOutcome::Failed(message) => {
                    return Err(EngineError::ExecutionFailed(format!("{name}: {message}")));
                }
                ExecutionOutcome::Cancelled => {
                    return Err(EngineError::ExecutionFailed(format!(
                        "{name}: execution cancelled"
                    )));
                }
                ExecutionOutcome::Running => unreachable!("wait() returned a running status"),
            }
        }
        for (name, handle) in &handles {
            for task in handle.executed_tasks() {
                self.mark_executed(name, task);
            }
            for task in handle.failed_tasks() {
                self.mark_failed(name, task);
            }
        }

        self.populate_snapshot();
        *self.state.lock().unwrap() = CycleState::Executed;
        if let Some(listener) = &services.listener {
            listener.cycle_completed(self.id, &self.snapshot);
        }
        info!(cycle = %self.id, view = %self.view.name, "cycle executed");
        Ok(())
    }

    /// Fill the result snapshot from each configuration's cache, honoring
    /// the configuration's result-model policy. Values absent from the
    /// cache (failed or missing upstream) surface as missing data, not
    /// errors.
    fn populate_snapshot(&self) {
        for config in &self.view.configurations {
            let graph = &self.graphs[&config.name];
            let cache = self.cache(&config.name).unwrap();
            let ids: Vec<_> = match config.result_model {
                ResultModel::TerminalOnly => graph.terminal_outputs().iter().cloned().collect(),
                ResultModel::All => graph
                    .tasks()
                    .flat_map(|t| t.outputs.iter().cloned())
                    .collect(),
            };
            for id in ids {
                let value = cache.get(&id).unwrap_or(ComputedValue::MissingData);
                self.snapshot.record(&config.name, id, value);
            }
        }
    }

    /// Release the cycle's resources. Idempotent; terminal.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == CycleState::Destroyed {
                return;
            }
            *state = CycleState::Destroyed;
        }
        self.caches.lock().unwrap().clear();
        if let Some(source) = self.cache_source.lock().unwrap().take() {
            source.release_cycle(self.id);
        }
        debug!(cycle = %self.id, "cycle destroyed");
    }
}

impl EngineResource for ComputationCycle {
    fn release_resources(&self) {
        self.destroy();
    }
}
