//! Task-graph model: immutable dependency graphs of calculation tasks.
//!
//! A [`TaskGraph`] is the input to the execution engine — an already-resolved
//! DAG in which each [`Task`] names its input tasks, its target entity, and
//! the value identifiers it consumes and produces. Graphs are built once via
//! [`TaskGraphBuilder`] and never mutated afterwards.

pub mod graph;
pub mod task;

pub use graph::{GraphError, TaskGraph, TaskGraphBuilder};
pub use task::{CostEstimator, Task, TaskCost, TaskId, UnitCost};
