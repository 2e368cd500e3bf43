//! Graph execution engine: partitions resolved task graphs into batch jobs,
//! dispatches them through an external job-execution service, tracks
//! completion through the asynchronous result stream, caches execution
//! plans across structurally-identical runs, and drives repeated full/delta
//! computation cycles that assemble result snapshots.

pub mod context;
pub mod cycle;
pub mod delta;
pub mod error;
pub mod executor;
pub mod input;
pub mod partition;
pub mod plan;
pub mod plan_cache;
pub mod recalc;
pub mod resources;
pub mod results;
pub mod stats;
pub mod view;

pub use context::{ExecutionContext, IdSource};
pub use cycle::{
    ComputationCycle, CycleServices, CycleState, InMemoryCacheSource, ValueCacheSource,
};
pub use delta::{DeltaComparator, InputEquality};
pub use error::EngineError;
pub use executor::{ExecutionOutcome, GraphExecutionHandle, GraphExecutor};
pub use input::{MarketDataProvider, MarketDataShift, StaticMarketData};
pub use partition::{GraphPartitioner, PartitionConfig};
pub use plan::{ExecutionPlan, PlanFragment};
pub use plan_cache::PlanCache;
pub use recalc::{
    decide, CycleDeadlines, CycleDriver, CycleKind, CycleTrigger, LiveDataSignal,
    RecalculationScheduler,
};
pub use resources::{EngineResource, ResourceManager, ResourceReference, ResourceRetainer};
pub use results::{ComputationListener, FragmentResult, ResultSnapshot};
pub use stats::{ExecutionStatistics, GraphStatistics, NoopStatistics, StatisticsGatherer};
pub use view::{CalculationConfiguration, ResultModel, ViewDefinition};
