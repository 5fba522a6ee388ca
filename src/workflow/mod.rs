//! The fixed six-step delivery pipeline and per-task progression through it.

pub mod state;
pub mod types;

pub use state::{CompletedStep, TaskWorkflowState};
pub use types::{Capability, StepConfig, WorkflowStep};
