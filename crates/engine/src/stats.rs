use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Callback invoked after each graph is planned and after each graph
/// finishes executing.
pub trait StatisticsGatherer: Send + Sync {
    /// A plan was produced (fresh or from cache) for the named graph.
    fn graph_processed(&self, graph: &str, fragment_count: usize, avg_items: f64, avg_cost: f64);

    /// The named graph finished executing.
    fn graph_executed(&self, graph: &str, jobs: usize, duration: Duration);
}

/// Gatherer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatistics;

impl StatisticsGatherer for NoopStatistics {
    fn graph_processed(&self, _: &str, _: usize, _: f64, _: f64) {}
    fn graph_executed(&self, _: &str, _: usize, _: Duration) {}
}

/// Per-graph execution statistics.
#[derive(Debug, Clone, Default)]
pub struct GraphStatistics {
    /// Times a plan was produced for this graph.
    pub processed: u64,
    /// Times the graph finished executing.
    pub executed: u64,
    pub last_fragment_count: usize,
    pub avg_job_items: f64,
    pub avg_job_cost: f64,
    /// Rolling average of total execution duration.
    pub avg_duration: Duration,
}

/// Accumulating implementation of [`StatisticsGatherer`].
#[derive(Debug, Default)]
pub struct ExecutionStatistics {
    graphs: Mutex<HashMap<String, GraphStatistics>>,
}

impl ExecutionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the statistics for one graph.
    pub fn graph(&self, name: &str) -> Option<GraphStatistics> {
        self.graphs.lock().unwrap().get(name).cloned()
    }
}

impl StatisticsGatherer for ExecutionStatistics {
    fn graph_processed(&self, graph: &str, fragment_count: usize, avg_items: f64, avg_cost: f64) {
        let mut graphs = self.graphs.lock().unwrap();
        let entry = graphs.entry(graph.to_string()).or_default();
        entry.processed += 1;
        entry.last_fragment_count = fragment_count;
        entry.avg_job_items = avg_items;
        entry.avg_job_cost = avg_cost;
    }

    fn graph_executed(&self, graph: &str, _jobs: usize, duration: Duration) {
        let mut graphs = self.graphs.lock().unwrap();
        let entry = graphs.entry(graph.to_string()).or_default();
        entry.executed += 1;

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = entry.executed;
        entry.avg_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = entry.avg_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}
