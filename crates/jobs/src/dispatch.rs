use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::JobError;
use crate::job::CalculationJob;
use crate::result::ResultMessage;

/// Handle to a dispatched batch job.
///
/// Cancellation is best-effort: a job that is already completing on a worker
/// may still deliver its result after `cancel()` returns. Callers must
/// tolerate late results being ignored.
pub trait JobHandle: Send + Sync {
    fn cancel(&self);
}

/// The external job-execution service.
///
/// Implementations ship a [`CalculationJob`] (and its chained tails) to a
/// calculation worker and deliver one [`ResultMessage::Result`] per job id —
/// tails included — on the provided channel.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Dispatch a job for execution. Returns once the job is accepted.
    async fn dispatch(
        &self,
        job: CalculationJob,
        results: mpsc::Sender<ResultMessage>,
    ) -> Result<Box<dyn JobHandle>, JobError>;
}

/// Blanket implementation so `Arc<dyn JobDispatcher>` can be used directly.
#[async_trait]
impl<T: JobDispatcher + ?Sized> JobDispatcher for Arc<T> {
    async fn dispatch(
        &self,
        job: CalculationJob,
        results: mpsc::Sender<ResultMessage>,
    ) -> Result<Box<dyn JobHandle>, JobError> {
        (**self).dispatch(job, results).await
    }
}

/// Handle for jobs that cannot be cancelled once sent.
pub struct NoopHandle;

impl JobHandle for NoopHandle {
    fn cancel(&self) {}
}
