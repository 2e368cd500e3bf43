//! Batch-job contracts: the wire model for calculation jobs, the dispatch
//! seam to the external job-execution service, the result stream fed back to
//! the engine, and the shared value-cache contract.

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod result;

pub use cache::{CacheSelectHint, InMemoryValueCache, ValueCache};
pub use dispatch::{JobDispatcher, JobHandle, NoopHandle};
pub use error::JobError;
pub use job::{CalculationJob, JobId, JobItem};
pub use result::{JobItemResult, JobResult, ResultMessage};
