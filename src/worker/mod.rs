//! Worker system: role-bound model invocations driven by a task scheduler.
//!
//! Core components:
//! - `spec`: worker specifications and their registry
//! - `worker`: prompt building, backend calls, tool round-trips
//! - `task`: task specifications and the dependency graph
//! - `state`: task state machine (pending → running → succeeded/failed)
//! - `context`: run-scoped shared memory
//! - `scheduler`: sequential and hierarchical execution of a graph

pub mod context;
pub mod scheduler;
pub mod spec;
pub mod state;
pub mod task;
pub mod worker;

pub use context::ContextStore;
pub use scheduler::{Flow, RejectedDelegation, Roster, RunScope, ScheduleOutcome, Scheduler};
pub use spec::{OutputContract, OutputShape, WorkerRegistry, WorkerSpec};
pub use state::{RunState, TaskResult, TaskStatus, TaskTransition};
pub use task::{TaskGraph, TaskSpec};
pub use worker::{Worker, WorkerDeps};
