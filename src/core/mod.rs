//! Core domain models for hive orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, the dependency graph, and coordination
//! signals.

pub mod failure;
pub mod graph;
pub mod signal;
pub mod task;

pub use failure::{ErrorContext, FailureKind, FailureMetadata, Severity};
pub use graph::{DependencyKind, TaskGraph};
pub use signal::{Signal, SignalField, SignalKind};
pub use task::{AgentId, Feature, Priority, Task, TaskId, TaskStatus};
