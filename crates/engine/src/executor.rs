//! Graph executor: plans a graph (via the plan cache or a fresh partition),
//! dispatches its leaf fragments, and drains the job-result stream until the
//! run completes, fails, or is cancelled.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use abacus_core::{EngineSettings, ValueId};
use abacus_graph::{CostEstimator, TaskGraph, TaskId};
use abacus_jobs::{JobDispatcher, ResultMessage, ValueCache};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::context::{ExecutionContext, IdSource};
use crate::error::EngineError;
use crate::partition::{GraphPartitioner, PartitionConfig};
use crate::plan_cache::PlanCache;
use crate::results::{ComputationListener, FragmentResult};
use crate::stats::{NoopStatistics, StatisticsGatherer};

/// Terminal status of one graph execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Handle to a running graph execution: cancellable, and waitable with a
/// timeout so callers can poll for interruption.
pub struct GraphExecutionHandle {
    context: Arc<ExecutionContext>,
    status_rx: watch::Receiver<ExecutionOutcome>,
    shutdown_tx: mpsc::Sender<ResultMessage>,
}

impl std::fmt::Debug for GraphExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutionHandle")
            .field("status", &self.status_rx.borrow().clone())
            .finish_non_exhaustive()
    }
}

impl GraphExecutionHandle {
    /// Current status without blocking.
    pub fn status(&self) -> ExecutionOutcome {
        self.status_rx.borrow().clone()
    }

    /// Block until the execution reaches a terminal status.
    pub async fn wait(&self) -> ExecutionOutcome {
        let mut rx = self.status_rx.clone();
        loop {
            let status = rx.borrow().clone();
            if status != ExecutionOutcome::Running {
                return status;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Best-effort cancellation of the run and its outstanding jobs.
    pub fn cancel(&self) {
        self.context.cancel();
        let _ = self.shutdown_tx.try_send(ResultMessage::Shutdown);
    }

    pub fn executed_tasks(&self) -> HashSet<TaskId> {
        self.context.executed_tasks()
    }

    pub fn failed_tasks(&self) -> HashSet<TaskId> {
        self.context.failed_tasks()
    }
}

/// Plans and executes task graphs against the external dispatch service.
pub struct GraphExecutor {
    partitioner: GraphPartitioner,
    plan_cache: Arc<PlanCache>,
    dispatcher: Arc<dyn JobDispatcher>,
    ids: Arc<IdSource>,
    stats: Arc<dyn StatisticsGatherer>,
}

impl GraphExecutor {
    pub fn new(settings: &EngineSettings, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        Self {
            partitioner: GraphPartitioner::new(PartitionConfig::from(settings)),
            plan_cache: Arc::new(PlanCache::new(
                settings.plan_cache_capacity,
                Duration::from_secs(settings.plan_cache_ttl_secs),
            )),
            dispatcher,
            ids: Arc::new(IdSource::new()),
            stats: Arc::new(NoopStatistics),
        }
    }

    pub fn with_statistics(mut self, stats: Arc<dyn StatisticsGatherer>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.partitioner = self.partitioner.with_estimator(estimator);
        self
    }

    /// The plan cache, exposed so embedders can bump the compiled-function
    /// generation when calculation functions are recompiled.
    pub fn plan_cache(&self) -> &Arc<PlanCache> {
        &self.plan_cache
    }

    pub fn id_source(&self) -> &Arc<IdSource> {
        &self.ids
    }

    /// Start executing a graph for one calculation configuration.
    ///
    /// Returns once the leaf fragments are dispatched; the rest of the run
    /// is driven by the result-stream consumer this call spawns.
    pub async fn execute(
        &self,
        graph: Arc<TaskGraph>,
        configuration: &str,
        cache: Arc<dyn ValueCache>,
        listener: Option<Arc<dyn ComputationListener>>,
    ) -> Result<GraphExecutionHandle, EngineError> {
        let key = graph.identity_key();
        let plan = match self.plan_cache.get(&key) {
            Some(plan) => plan,
            None => {
                let plan = Arc::new(self.partitioner.partition(&graph, &self.ids));
                self.plan_cache.put(key, Arc::clone(&plan));
                plan
            }
        };
        self.stats.graph_processed(
            graph.name(),
            plan.fragment_count(),
            plan.average_items(),
            plan.average_cost(&graph),
        );

        let (results_tx, results_rx) = mpsc::channel(256);
        let context = Arc::new(ExecutionContext::new(
            configuration,
            Arc::clone(&graph),
            &plan,
            Arc::clone(&self.ids),
            Arc::clone(&self.dispatcher),
            results_tx.clone(),
        ));

        let (status_tx, status_rx) = watch::channel(ExecutionOutcome::Running);
        let consumer = ResultConsumer {
            context: Arc::clone(&context),
            cache,
            listener,
            terminal: graph.terminal_outputs().clone(),
            stats: Arc::clone(&self.stats),
            graph_name: graph.name().to_string(),
            jobs: plan.fragment_count(),
            started: Instant::now(),
        };
        tokio::spawn(async move {
            let outcome = consumer.drive(results_rx).await;
            let _ = status_tx.send(outcome);
        });

        for id in context.leaf_fragments() {
            if let Err(e) = context.dispatch_fragment(id).await {
                context.cancel();
                let _ = results_tx.send(ResultMessage::Shutdown).await;
                return Err(e);
            }
        }
        // A graph with nothing to do completes without any results.
        if context.is_complete() {
            let _ = results_tx.send(ResultMessage::Shutdown).await;
        }

        Ok(GraphExecutionHandle {
            context,
            status_rx,
            shutdown_tx: results_tx,
        })
    }
}

/// The dedicated consumer that drains one run's job-result stream.
struct ResultConsumer {
    context: Arc<ExecutionContext>,
    cache: Arc<dyn ValueCache>,
    listener: Option<Arc<dyn ComputationListener>>,
    terminal: BTreeSet<ValueId>,
    stats: Arc<dyn StatisticsGatherer>,
    graph_name: String,
    jobs: usize,
    started: Instant,
}

impl ResultConsumer {
    async fn drive(&self, mut rx: mpsc::Receiver<ResultMessage>) -> ExecutionOutcome {
        while let Some(message) = rx.recv().await {
            match message {
                ResultMessage::Result(result) => {
                    if self.context.is_cancelled() {
                        debug!(job = %result.job, "dropping result delivered after cancellation");
                        continue;
                    }
                    let ready = self.context.result_received(&result);
                    self.emit_fragment_result(&result);

                    for id in ready {
                        if let Err(e) = self.context.dispatch_fragment(id).await {
                            warn!(fragment = id, error = %e, "batch job dispatch failed");
                            self.context.cancel();
                            return ExecutionOutcome::Failed(e.to_string());
                        }
                    }
                    if self.context.is_complete() {
                        self.stats.graph_executed(
                            &self.graph_name,
                            self.jobs,
                            self.started.elapsed(),
                        );
                        return ExecutionOutcome::Completed;
                    }
                }
                ResultMessage::Shutdown => {
                    return if self.context.is_complete() {
                        self.stats.graph_executed(
                            &self.graph_name,
                            self.jobs,
                            self.started.elapsed(),
                        );
                        ExecutionOutcome::Completed
                    } else {
                        ExecutionOutcome::Cancelled
                    };
                }
            }
        }
        if self.context.is_complete() {
            ExecutionOutcome::Completed
        } else {
            ExecutionOutcome::Failed("result stream closed unexpectedly".into())
        }
    }

    /// Stream an incremental result to the listener: the terminal outputs of
    /// the tasks that just completed, read back from the shared cache.
    fn emit_fragment_result(&self, result: &abacus_jobs::JobResult) {
        let Some(listener) = &self.listener else {
            return;
        };
        let values: Vec<_> = result
            .items
            .iter()
            .filter(|item| item.success)
            .flat_map(|item| item.outputs.iter())
            .filter(|v| self.terminal.contains(*v))
            .filter_map(|v| self.cache.get(v).map(|value| (v.clone(), value)))
            .collect();
        if values.is_empty() {
            return;
        }
        listener.fragment_result(FragmentResult {
            configuration: self.context.configuration().to_string(),
            job: result.job,
            duration: result.duration,
            values,
        });
    }
}
