//! Task model for plan execution.
//!
//! A `Task` is one schedulable unit of work derived from a plan `Feature`.
//! Tasks are owned by the scheduler and mutated only through the explicit
//! transition methods here; the core never destroys a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::workflow::{Capability, TaskWorkflowState, WorkflowStep};

/// Unique identifier for a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for branch names and logs (first 8 chars).
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a spawned agent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Scheduling priority, also used for messages and tracker events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Lenient parse from a plan document; unknown values become `Medium`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => Priority::Low,
            "medium" | "normal" => Priority::Medium,
            "high" => Priority::High,
            "critical" | "urgent" => Priority::Critical,
            _ => Priority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current execution status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies or dispatch.
    Pending,
    /// An agent is executing the current step.
    Running,
    /// All pipeline steps finished.
    Completed,
    /// Escalated failure; requires manual intervention.
    Error { message: String },
    /// The agent could not proceed; a helper is (or will be) working on it.
    Impasse { reason: String },
    /// Dispatch is withheld while an upstream quality pause is active.
    Paused { reason: String },
}

impl TaskStatus {
    /// Terminal statuses end a task's participation in the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error { .. } => "error",
            TaskStatus::Impasse { .. } => "impasse",
            TaskStatus::Paused { .. } => "paused",
        }
    }
}

/// A plan-derived work item. Immutable after compilation; exactly one task is
/// created per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub priority: Priority,
    pub description: String,
    pub capability: Capability,
    /// Dependencies by feature name, resolved to task ids at graph seeding.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// One schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub project: String,
    pub priority: Priority,
    pub capability: Capability,
    /// Acceptance criteria carried over from the plan feature.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<String>,
    /// Suggested sub-steps carried over from the plan feature.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    /// Prerequisite task names carried over from the plan feature.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub workflow: TaskWorkflowState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

impl Task {
    pub fn new(name: &str, description: &str, project: &str, capability: Capability) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            project: project.to_string(),
            priority: Priority::default(),
            capability,
            criteria: Vec::new(),
            steps: Vec::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            workflow: TaskWorkflowState::new(capability),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            workspace_path: None,
            branch_name: None,
            agent_id: None,
            commit_hash: None,
        }
    }

    /// Materialize a compiled feature into a pending task.
    pub fn from_feature(feature: &Feature, project: &str) -> Self {
        let mut task = Self::new(&feature.name, &feature.description, project, feature.capability);
        task.priority = feature.priority;
        task.criteria = feature.criteria.clone();
        task.steps = feature.steps.clone();
        task.depends_on = feature.depends_on.clone();
        task
    }

    /// Mark the task as running.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as completed: seals the final workflow step.
    pub fn complete(&mut self) {
        self.workflow.seal();
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed beyond recovery.
    pub fn fail(&mut self, message: &str) {
        self.status = TaskStatus::Error {
            message: message.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Park the task while a helper works on it.
    pub fn mark_impasse(&mut self, reason: &str) {
        self.status = TaskStatus::Impasse {
            reason: reason.to_string(),
        };
    }

    /// Withhold dispatch because of an upstream quality pause.
    pub fn pause(&mut self, reason: &str) {
        self.status = TaskStatus::Paused {
            reason: reason.to_string(),
        };
    }

    /// Return the task to the dispatch pool at its current step.
    pub fn mark_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.agent_id = None;
    }

    /// Advance the workflow exactly one step after a completed execution.
    ///
    /// Returns `true` when the task re-enters the pool at the next step, and
    /// `false` when the pipeline is exhausted and the task completed.
    pub fn advance_workflow(&mut self) -> bool {
        if self.workflow.advance() {
            self.mark_pending();
            true
        } else {
            self.complete();
            false
        }
    }

    pub fn assign_agent(&mut self, agent_id: AgentId) {
        self.agent_id = Some(agent_id);
    }

    pub fn set_workspace(&mut self, path: PathBuf, branch: String) {
        self.workspace_path = Some(path);
        self.branch_name = Some(branch);
    }

    pub fn set_commit(&mut self, hash: String) {
        self.commit_hash = Some(hash);
    }

    pub fn current_step(&self) -> WorkflowStep {
        self.workflow.current()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending)
    }
}
