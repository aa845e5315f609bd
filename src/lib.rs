//! Kube Crew: a small multi-agent orchestrator for Kubernetes requests.

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod retry;
pub mod tools;
pub mod worker;
