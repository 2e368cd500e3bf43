use std::time::Duration;

use abacus_core::ValueId;
use abacus_graph::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Outcome of one job item: whether the function invocation succeeded and
/// which values it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItemResult {
    /// The graph task this item originated from.
    pub task: TaskId,
    pub success: bool,
    /// Identifiers of the values the item wrote (empty on failure).
    pub outputs: Vec<ValueId>,
}

impl JobItemResult {
    pub fn success(task: TaskId, outputs: Vec<ValueId>) -> Self {
        Self {
            task,
            success: true,
            outputs,
        }
    }

    pub fn failure(task: TaskId) -> Self {
        Self {
            task,
            success: false,
            outputs: Vec::new(),
        }
    }
}

/// Result of one batch job, delivered on the job-result stream.
///
/// Results are ordered per job but carry no global ordering guarantee; a
/// tail job's result may arrive before or after results of unrelated jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: JobId,
    /// Wall-clock execution time reported by the worker.
    pub duration: Duration,
    pub items: Vec<JobItemResult>,
    /// When the worker completed the job.
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job: JobId, duration: Duration, items: Vec<JobItemResult>) -> Self {
        Self {
            job,
            duration,
            items,
            completed_at: Utc::now(),
        }
    }

    /// Whether every item in this result succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|item| item.success)
    }
}

/// Message on the job-result stream.
///
/// The consumer blocks on the stream until it sees `Shutdown` — the poison
/// value that terminates it — or until the owning context completes.
#[derive(Debug, Clone)]
pub enum ResultMessage {
    Result(JobResult),
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_succeeded() {
        let ok = JobResult::new(
            JobId(1),
            Duration::from_millis(5),
            vec![
                JobItemResult::success(TaskId(0), vec![ValueId::new("A", "x")]),
                JobItemResult::success(TaskId(1), vec![]),
            ],
        );
        assert!(ok.all_succeeded());

        let mixed = JobResult::new(
            JobId(2),
            Duration::from_millis(5),
            vec![
                JobItemResult::success(TaskId(0), vec![]),
                JobItemResult::failure(TaskId(1)),
            ],
        );
        assert!(!mixed.all_succeeded());
    }

    #[test]
    fn failure_has_no_outputs() {
        let item = JobItemResult::failure(TaskId(3));
        assert!(!item.success);
        assert!(item.outputs.is_empty());
    }
}
