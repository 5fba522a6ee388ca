//! Orchestration layer for the hive multi-agent system.
//!
//! This module turns a compiled plan into finished work: the planner seeds
//! the task graph, the scheduler drives the run loop, the coordinator owns
//! agent sessions and workspaces, and the critique gate, recovery engine,
//! and status tracker keep the run honest when agents misbehave.

mod capabilities;
mod coordinator;
mod critique;
mod messaging;
mod planner;
mod recovery;
mod scheduler;
mod tracker;

pub use capabilities::{
    helper_payload, instruction_payload, DependencyArtifact, ExecutionContext, SignalSummary,
    IMPASSE_MARKER, STEP_COMPLETE_MARKER,
};
pub use coordinator::{
    AgentCoordinator, AgentInfo, AgentOutcome, AgentStatus, CoordinationEvent,
};
pub use critique::{CritiqueGate, GateDecision};
pub use messaging::{AgentChannel, AgentMessage, ChannelId, MessageKind, MessagePriority};
pub use planner::ParsedPlan;
pub use recovery::{decide, RecoveryEngine, RecoveryLedger, RecoveryOutcome, RecoveryStrategy};
pub use scheduler::{
    RunReport, Scheduler, SchedulerConfig, SchedulerEvent, StopCause, TaskOutcome,
};
pub use tracker::{
    BudgetStatus, ProgressSnapshot, RunState, StatusTracker, TrackerEvent, TrackerEventKind,
};
