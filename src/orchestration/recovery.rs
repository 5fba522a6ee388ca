//! Failure recovery engine.
//!
//! `decide` is the pure decision table mapping a classified failure and its
//! retry history to a strategy. `RecoveryEngine::handle_failure` executes
//! the strategy against the task graph and always returns a structured
//! outcome; no failure path panics or propagates an error to the scheduler
//! loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::failure::{ErrorContext, FailureKind, Severity};
use crate::core::graph::TaskGraph;
use crate::core::task::TaskId;
use crate::error::Result;
use crate::orchestration::coordinator::AgentCoordinator;
use crate::quality::QualityGate;
use crate::store::TaskStore;
use crate::workflow::Capability;
use crate::{hlog, hlog_warn};

/// Delay before a standard retry.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Delay before retrying a transient system failure.
pub const SHORT_RETRY_DELAY: Duration = Duration::from_millis(500);

const TIMEOUT_RETRY_LIMIT: u32 = 2;
const SYSTEM_RETRY_LIMIT: u32 = 1;
const STEP_RETRY_LIMIT: u32 = 2;

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Re-pend the task at the same step after a delay.
    Retry { delay: Duration },
    /// Park the task and bring in a specialist.
    SpawnHelper { helper: Capability },
    /// Force the workflow past the current step.
    SkipStep,
    /// Give up: persist for manual intervention and fail the task.
    Escalate,
    /// Quality halt: pause the task's dependent subtree.
    PauseDownstream,
}

impl RecoveryStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::SpawnHelper { .. } => "spawn_helper",
            Self::SkipStep => "skip_step",
            Self::Escalate => "escalate",
            Self::PauseDownstream => "pause_downstream",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Pure decision table. `retries` is the number of recoveries already
/// attempted for this task.
pub fn decide(context: &ErrorContext, retries: u32) -> RecoveryStrategy {
    match context.kind {
        FailureKind::Timeout => {
            if retries < TIMEOUT_RETRY_LIMIT {
                RecoveryStrategy::Retry { delay: RETRY_DELAY }
            } else {
                RecoveryStrategy::SpawnHelper {
                    helper: Capability::ImpasseSolver,
                }
            }
        }
        FailureKind::SystemFailure => {
            if context.severity == Severity::Critical {
                RecoveryStrategy::Escalate
            } else if retries < SYSTEM_RETRY_LIMIT {
                RecoveryStrategy::Retry {
                    delay: SHORT_RETRY_DELAY,
                }
            } else {
                RecoveryStrategy::SpawnHelper {
                    helper: Capability::RootCauseAnalyst,
                }
            }
        }
        FailureKind::WorkflowStepError => {
            if retries < STEP_RETRY_LIMIT {
                RecoveryStrategy::Retry { delay: RETRY_DELAY }
            } else {
                RecoveryStrategy::SkipStep
            }
        }
        FailureKind::Impasse => RecoveryStrategy::SpawnHelper {
            helper: Capability::ImpasseSolver,
        },
        FailureKind::CritiqueFailure => {
            if context.severity == Severity::High {
                RecoveryStrategy::PauseDownstream
            } else {
                RecoveryStrategy::SpawnHelper {
                    helper: Capability::QualityAnalyst,
                }
            }
        }
        FailureKind::Unclassified => RecoveryStrategy::Escalate,
    }
}

/// Per-task and per-kind failure accounting feeding `decide`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RecoveryLedger {
    retries: HashMap<TaskId, u32>,
    kind_counts: HashMap<FailureKind, u32>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recoveries already attempted for a task.
    pub fn retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    pub fn kind_count(&self, kind: FailureKind) -> u32 {
        self.kind_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Record one handled failure.
    pub fn record(&mut self, context: &ErrorContext) {
        *self.retries.entry(context.task_id).or_insert(0) += 1;
        *self.kind_counts.entry(context.kind).or_insert(0) += 1;
    }

    /// Seed a task's count from persisted history (resumed runs).
    pub fn seed(&mut self, task_id: TaskId, count: u32) {
        if count > 0 {
            self.retries.insert(task_id, count);
        }
    }
}

/// Result of handling one failure.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// Whether the task is still in play (anything but escalation).
    pub success: bool,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub escalated: bool,
}

pub struct RecoveryEngine {
    store: Arc<dyn TaskStore>,
    quality: Arc<dyn QualityGate>,
    coordinator: Arc<AgentCoordinator>,
    ledger: RecoveryLedger,
    pause_duration: Duration,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        quality: Arc<dyn QualityGate>,
        coordinator: Arc<AgentCoordinator>,
        pause_duration: Duration,
    ) -> Self {
        Self {
            store,
            quality,
            coordinator,
            ledger: RecoveryLedger::new(),
            pause_duration,
        }
    }

    pub fn ledger(&self) -> &RecoveryLedger {
        &self.ledger
    }

    /// Seed retry counts from persisted failure history.
    pub async fn seed_from_store(&mut self, task_ids: &[TaskId]) -> Result<()> {
        for task_id in task_ids {
            let count = self.store.failure_count(task_id).await?;
            self.ledger.seed(*task_id, count);
        }
        Ok(())
    }

    /// Execute the recovery strategy for one failure.
    ///
    /// Mutates tasks in `graph` on behalf of the scheduler loop (which is
    /// the single caller) and registers pause expiries in `paused_until`.
    pub async fn handle_failure(
        &mut self,
        context: &ErrorContext,
        graph: &mut TaskGraph,
        paused_until: &mut HashMap<TaskId, DateTime<Utc>>,
    ) -> RecoveryOutcome {
        let retries = self.ledger.retries(&context.task_id);
        let strategy = decide(context, retries);
        self.ledger.record(context);

        hlog!(
            "Recovery for task {}: kind={} severity={} retries={} -> {}",
            context.task_id.short(),
            context.kind,
            context.severity,
            retries,
            strategy
        );

        let escalated = strategy == RecoveryStrategy::Escalate;
        if let Err(e) = self.store.record_failure(context, escalated).await {
            hlog_warn!("Failed to persist failure record: {}", e);
        }

        match strategy {
            RecoveryStrategy::Retry { delay } => {
                self.release_failed_agent(context).await;
                tokio::time::sleep(delay).await;
                if let Some(task) = graph.task_mut(&context.task_id) {
                    task.mark_pending();
                }
                RecoveryOutcome {
                    success: true,
                    strategy,
                    message: format!("retrying at the same step after {:?}", delay),
                    escalated: false,
                }
            }
            RecoveryStrategy::SpawnHelper { helper } => {
                self.spawn_helper(context, helper, graph).await
            }
            RecoveryStrategy::SkipStep => {
                self.release_failed_agent(context).await;
                let Some(task) = graph.task_mut(&context.task_id) else {
                    return missing_task_outcome(strategy, context);
                };
                let step = task.current_step();
                let advanced = task.workflow.skip(&context.message);
                if advanced {
                    task.mark_pending();
                } else {
                    task.complete();
                }
                RecoveryOutcome {
                    success: true,
                    strategy,
                    message: format!("skipped step {} after repeated failures", step),
                    escalated: false,
                }
            }
            RecoveryStrategy::Escalate => {
                self.release_failed_agent(context).await;
                if let Some(task) = graph.task_mut(&context.task_id) {
                    task.fail(&context.message);
                }
                RecoveryOutcome {
                    success: false,
                    strategy,
                    message: format!(
                        "escalated for manual intervention: {}",
                        context.message
                    ),
                    escalated: true,
                }
            }
            RecoveryStrategy::PauseDownstream => {
                let expiry = Utc::now()
                    + chrono::Duration::from_std(self.pause_duration)
                        .unwrap_or(chrono::Duration::seconds(120));

                let task_name = graph
                    .task(&context.task_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| context.task_id.short());
                let reason = format!("upstream quality failure in '{}'", task_name);

                let dependents = graph.transitive_dependents(&context.task_id);
                let mut paused = 0;
                for dependent_id in dependents {
                    if let Some(dependent) = graph.task_mut(&dependent_id) {
                        if dependent.can_start() {
                            dependent.pause(&reason);
                            paused += 1;
                        }
                    }
                    paused_until.insert(dependent_id, expiry);
                }
                // The task itself sits out the same window so the gate is
                // not re-run against the identical artifact next tick.
                paused_until.insert(context.task_id, expiry);

                RecoveryOutcome {
                    success: true,
                    strategy,
                    message: format!("paused {} downstream tasks until {}", paused, expiry),
                    escalated: false,
                }
            }
        }
    }

    async fn spawn_helper(
        &mut self,
        context: &ErrorContext,
        helper: Capability,
        graph: &mut TaskGraph,
    ) -> RecoveryOutcome {
        // Root-cause help gets the diagnostic collaborator's analysis.
        let diagnosis = if helper == Capability::RootCauseAnalyst {
            match self.quality.diagnose(context).await {
                Ok(diagnosis) => Some(diagnosis),
                Err(e) => {
                    hlog_warn!("Diagnosis unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let Some(task) = graph.task_mut(&context.task_id) else {
            return missing_task_outcome(
                RecoveryStrategy::SpawnHelper { helper },
                context,
            );
        };

        task.mark_impasse(&context.message);
        match self
            .coordinator
            .spawn_helper(task, helper, &context.message, diagnosis.as_ref())
            .await
        {
            Ok(agent_id) => RecoveryOutcome {
                success: true,
                strategy: RecoveryStrategy::SpawnHelper { helper },
                message: format!("helper {} spawned as {}", helper, agent_id.short()),
                escalated: false,
            },
            Err(e) => {
                // A helper that cannot start leaves the task wedged at
                // impasse, so this degrades to escalation.
                hlog_warn!("Helper spawn failed for {}: {}", task.name, e);
                task.fail(&format!("{} (helper spawn failed: {})", context.message, e));
                if let Err(e) = self.store.record_failure(context, true).await {
                    hlog_warn!("Failed to persist escalation record: {}", e);
                }
                RecoveryOutcome {
                    success: false,
                    strategy: RecoveryStrategy::SpawnHelper { helper },
                    message: format!("helper spawn failed, escalated: {}", e),
                    escalated: true,
                }
            }
        }
    }

    async fn release_failed_agent(&self, context: &ErrorContext) {
        if let Some(agent_id) = context.metadata.agent {
            self.coordinator.release_agent(&agent_id).await;
        }
    }
}

fn missing_task_outcome(strategy: RecoveryStrategy, context: &ErrorContext) -> RecoveryOutcome {
    hlog_warn!(
        "Recovery for unknown task {} dropped",
        context.task_id.short()
    );
    RecoveryOutcome {
        success: false,
        strategy,
        message: format!("task {} not found in graph", context.task_id.short()),
        escalated: false,
    }
}
