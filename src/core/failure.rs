//! Failure classification types.
//!
//! Raw failure text from agents, sessions, and gates is classified exactly
//! once at the boundary into a closed `FailureKind`. Everything downstream
//! (the recovery decision table, persistence, logging) matches exhaustively
//! on the enum instead of re-parsing strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::task::{AgentId, TaskId};
use crate::workflow::WorkflowStep;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An agent exceeded its allotted time.
    Timeout,
    /// Infrastructure failure: session died, workspace broke, process error.
    SystemFailure,
    /// A workflow step produced a wrong or unusable result.
    WorkflowStepError,
    /// An agent reported it cannot make progress.
    Impasse,
    /// The quality gate rejected the upstream artifact.
    CritiqueFailure,
    /// Anything that did not match a known category.
    Unclassified,
}

impl FailureKind {
    /// Classify raw failure text. Unknown input maps to `Unclassified`
    /// rather than failing, so callers never see a parse error here.
    pub fn classify(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "timeout" | "timed_out" | "deadline" => Self::Timeout,
            "system_failure" | "system" | "session_died" | "infrastructure" => Self::SystemFailure,
            "workflow_step_error" | "step_error" | "step_failure" => Self::WorkflowStepError,
            "impasse" | "stuck" | "blocked" => Self::Impasse,
            "critique_failure" | "quality" | "critique" => Self::CritiqueFailure,
            _ => Self::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::SystemFailure => "system_failure",
            Self::WorkflowStepError => "workflow_step_error",
            Self::Impasse => "impasse",
            Self::CritiqueFailure => "critique_failure",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How bad a failure is, from the reporter's point of view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured context attached to a failure.
///
/// Known fields are typed; `extra` carries reporter-specific detail without
/// widening the struct for every new producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<WorkflowStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Everything the recovery engine needs to know about one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub task_id: TaskId,
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub metadata: FailureMetadata,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(task_id: TaskId, kind: FailureKind, severity: Severity, message: &str) -> Self {
        Self {
            task_id,
            kind,
            severity,
            message: message.to_string(),
            metadata: FailureMetadata::default(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.metadata.step = Some(step);
        self
    }

    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.metadata.agent = Some(agent);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.metadata.attempt = attempt;
        self
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.metadata.extra.insert(key.to_string(), value.to_string());
        self
    }
}
