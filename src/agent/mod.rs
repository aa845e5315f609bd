//! Crew orchestration: classification, checkpoints, manager decisions and
//! the run entry point.

pub mod approval;
pub mod classifier;
pub mod crew;
pub mod kubernetes;
pub mod manager;

pub use approval::{CheckpointDecision, CheckpointGate, CheckpointRequest};
pub use classifier::Classification;
pub use crew::{Crew, CrewDefinition, FinalResult, RunStatus};
pub use manager::{DelegatedTask, ManagerCommand};
