//! Per-task position in the delivery pipeline.
//!
//! `TaskWorkflowState` tracks where a task currently stands and which steps
//! it has already passed. The completed list is append-only and the current
//! step only ever moves forward, one step per `advance` call. The only way to
//! pass a step without doing its work is the explicit `skip`, reserved for
//! the skip-step recovery strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::types::{Capability, StepConfig, WorkflowStep};

/// One entry in a task's completed-step history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step: WorkflowStep,
    pub completed_at: DateTime<Utc>,
    /// True when recovery force-advanced past this step.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Where a task stands in the fixed pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkflowState {
    current: WorkflowStep,
    /// The step this task entered the pipeline at, derived from capability.
    initial: WorkflowStep,
    completed: Vec<CompletedStep>,
}

impl TaskWorkflowState {
    /// Create the state for a freshly compiled task.
    ///
    /// The entry step derives from the task's capability: a coder task enters
    /// at implementation, a tester at verification, everything else at the
    /// first step.
    pub fn new(capability: Capability) -> Self {
        let initial = capability.initial_step();
        Self {
            current: initial,
            initial,
            completed: Vec::new(),
        }
    }

    /// Create a state entering at an explicit step.
    pub fn starting_at(step: WorkflowStep) -> Self {
        Self {
            current: step,
            initial: step,
            completed: Vec::new(),
        }
    }

    pub fn current(&self) -> WorkflowStep {
        self.current
    }

    pub fn initial(&self) -> WorkflowStep {
        self.initial
    }

    pub fn completed_steps(&self) -> &[CompletedStep] {
        &self.completed
    }

    /// True when a step has already been passed (worked or skipped).
    pub fn has_completed(&self, step: WorkflowStep) -> bool {
        self.completed.iter().any(|c| c.step == step)
    }

    /// Whether the current step may start.
    ///
    /// Every required-previous step at or after this task's entry point must
    /// be in the completed list; steps before the entry point are satisfied
    /// by the capability-based entry itself.
    pub fn is_ready(&self) -> bool {
        let config = StepConfig::for_step(self.current);
        config
            .required_previous
            .iter()
            .filter(|step| **step >= self.initial)
            .all(|step| self.has_completed(*step))
    }

    /// Record the current step as done and move one step forward.
    ///
    /// Returns `false` at the terminal step without mutating anything: that
    /// is the full-completion signal, and `seal` records the final step.
    pub fn advance(&mut self) -> bool {
        match self.current.next() {
            Some(next) => {
                self.completed.push(CompletedStep {
                    step: self.current,
                    completed_at: Utc::now(),
                    skipped: false,
                    note: None,
                });
                self.current = next;
                true
            }
            None => false,
        }
    }

    /// Force-append the current step as completed and advance past it.
    ///
    /// Bypasses the step's quality gate; only the skip-step recovery strategy
    /// calls this. Returns `false` when the skipped step was the last one.
    pub fn skip(&mut self, reason: &str) -> bool {
        let next = self.current.next();
        self.completed.push(CompletedStep {
            step: self.current,
            completed_at: Utc::now(),
            skipped: true,
            note: Some(reason.to_string()),
        });
        match next {
            Some(step) => {
                self.current = step;
                true
            }
            None => false,
        }
    }

    /// Record the terminal step in the history when the task completes.
    ///
    /// `advance` never appends the final step (it returns `false` instead),
    /// so the completing transition calls this to leave a full trace.
    pub fn seal(&mut self) {
        if !self.has_completed(self.current) {
            self.completed.push(CompletedStep {
                step: self.current,
                completed_at: Utc::now(),
                skipped: false,
                note: None,
            });
        }
    }

    /// Steps remaining after the current one, in order.
    pub fn remaining(&self) -> Vec<WorkflowStep> {
        let mut steps = Vec::new();
        let mut step = self.current;
        while let Some(next) = step.next() {
            steps.push(next);
            step = next;
        }
        steps
    }
}
