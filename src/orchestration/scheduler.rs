//! Task scheduling loop.
//!
//! The Scheduler drives a compiled plan to completion: it polls agent
//! outcomes, routes failures through the recovery engine, expires downstream
//! pauses, and dispatches at most one ready task per iteration through the
//! coordinator. It is the single writer for task and workflow state; the
//! heartbeat sweep and message drain run as separate ticker tasks that touch
//! only the coordinator's own maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{
    AgentId, ErrorContext, FailureKind, Severity, Signal, SignalField, SignalKind, Task, TaskGraph,
    TaskId, TaskStatus,
};
use crate::error::Result;
use crate::orchestration::capabilities::{DependencyArtifact, ExecutionContext, SignalSummary};
use crate::orchestration::coordinator::{AgentCoordinator, AgentOutcome, CoordinationEvent};
use crate::orchestration::critique::{CritiqueGate, GateDecision};
use crate::orchestration::recovery::RecoveryEngine;
use crate::orchestration::tracker::{RunState, StatusTracker, TrackerEventKind};
use crate::store::{Artifact, TaskStore};
use crate::workflow::WorkflowStep;
use crate::workspace::WorkspaceManager;
use crate::{hlog, hlog_debug, hlog_trace, hlog_warn};

/// How often the heartbeat sweep looks for stale agents.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How often queued agent messages are delivered.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(1);
/// Strongest signals carried into one execution context.
const MAX_CONTEXT_SIGNALS: usize = 6;
/// Strength of the signal deposited when a task fully completes.
const COMPLETION_SIGNAL_STRENGTH: f64 = 0.8;

/// Timing knobs for the loop and its ticker tasks.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub sweep_interval: Duration,
    pub drain_interval: Duration,
    pub drain_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(crate::config::DEFAULT_TICK_MS),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            drain_batch: crate::config::DEFAULT_DRAIN_BATCH,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            drain_batch: config.drain_batch(),
            ..Self::default()
        }
    }
}

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A task has been assigned to an agent and started.
    TaskStarted { task_id: TaskId, agent_id: AgentId },
    /// A task finished one workflow step and was re-pended at the next.
    StepCompleted { task_id: TaskId, step: WorkflowStep },
    /// A task walked off the end of the pipeline.
    TaskCompleted {
        task_id: TaskId,
        commit: Option<String>,
    },
    /// A task was escalated beyond recovery.
    TaskFailed { task_id: TaskId, error: String },
    /// The token budget was exhausted; the run stops.
    BudgetExhausted { spent: u64, limit: u64 },
    /// Every task reached a terminal status.
    AllTasksSettled,
}

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// Every task is terminal.
    Completed,
    /// Nothing in flight and nothing dispatchable.
    Idle,
    BudgetExhausted,
    Cancelled,
}

impl StopCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopCause::Completed => "completed",
            StopCause::Idle => "idle",
            StopCause::BudgetExhausted => "budget_exhausted",
            StopCause::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Final status of one task at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
}

/// Summary returned when the run loop stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub stop_cause: StopCause,
    pub outcomes: Vec<TaskOutcome>,
    pub tokens_spent: u64,
    pub duration: Duration,
    pub escalations: u32,
}

impl RunReport {
    pub fn completed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TaskStatus::Error { .. }))
            .count()
    }
}

/// The run loop. Owns the task graph outright; collaborators are injected.
pub struct Scheduler {
    graph: TaskGraph,
    coordinator: Arc<AgentCoordinator>,
    coordination_rx: mpsc::Receiver<CoordinationEvent>,
    recovery: RecoveryEngine,
    gate: CritiqueGate,
    tracker: StatusTracker,
    store: Arc<dyn TaskStore>,
    workspaces: Arc<dyn WorkspaceManager>,
    signals: SignalField,
    event_tx: mpsc::Sender<SchedulerEvent>,
    cancel: CancellationToken,
    config: SchedulerConfig,
    /// Tasks withheld from dispatch until the expiry passes.
    paused_until: HashMap<TaskId, DateTime<Utc>>,
    /// Stale-agent contexts produced by the sweep ticker.
    sweep_tx: mpsc::Sender<ErrorContext>,
    sweep_rx: mpsc::Receiver<ErrorContext>,
    escalations: u32,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: TaskGraph,
        coordinator: Arc<AgentCoordinator>,
        coordination_rx: mpsc::Receiver<CoordinationEvent>,
        recovery: RecoveryEngine,
        gate: CritiqueGate,
        tracker: StatusTracker,
        store: Arc<dyn TaskStore>,
        workspaces: Arc<dyn WorkspaceManager>,
        event_tx: mpsc::Sender<SchedulerEvent>,
        cancel: CancellationToken,
        config: SchedulerConfig,
    ) -> Self {
        let (sweep_tx, sweep_rx) = mpsc::channel(64);
        Self {
            graph,
            coordinator,
            coordination_rx,
            recovery,
            gate,
            tracker,
            store,
            workspaces,
            signals: SignalField::new(),
            event_tx,
            cancel,
            config,
            paused_until: HashMap::new(),
            sweep_tx,
            sweep_rx,
            escalations: 0,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Run the loop until every task settles, the run goes idle, the budget
    /// runs out, or cancellation is requested.
    pub async fn run(&mut self) -> Result<RunReport> {
        let started = Instant::now();
        self.prepare().await;
        self.tracker.set_state(RunState::Running);
        hlog!("Run started: {} tasks in the graph", self.graph.task_count());

        let tickers = self.spawn_tickers();

        let stop_cause = loop {
            if self.cancel.is_cancelled() {
                hlog!("Run cancelled");
                break StopCause::Cancelled;
            }

            if !self.tracker.check_budget_limit() {
                let budget = self.tracker.budget();
                let limit = budget.limit.unwrap_or(0);
                hlog_warn!("Budget exhausted: {} of {} tokens spent", budget.spent, limit);
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::BudgetExhausted {
                        spent: budget.spent,
                        limit,
                    })
                    .await;
                self.tracker.push_event(TrackerEventKind::Alert {
                    message: format!(
                        "budget exhausted: {} of {} tokens spent",
                        budget.spent, limit
                    ),
                });
                break StopCause::BudgetExhausted;
            }

            self.process_outcomes().await;
            self.process_sweeps().await;
            self.process_coordination_events();
            self.expire_pauses();

            let dispatched = self.dispatch_next().await;

            if self.tracker.all_tasks_settled(&self.graph) {
                let _ = self.event_tx.send(SchedulerEvent::AllTasksSettled).await;
                break StopCause::Completed;
            }
            if !dispatched
                && self.paused_until.is_empty()
                && self.coordinator.active_count().await == 0
            {
                hlog_warn!("Run is idle: nothing in flight and nothing dispatchable");
                break StopCause::Idle;
            }

            tokio::time::sleep(self.config.tick_interval).await;
        };

        tickers.cancel();
        self.tracker.set_state(match stop_cause {
            StopCause::Completed => RunState::Completed,
            StopCause::Idle | StopCause::Cancelled => RunState::Idle,
            StopCause::BudgetExhausted => RunState::Error,
        });

        let report = self.build_report(stop_cause, started.elapsed());
        hlog!(
            "Run stopped ({}): {} completed, {} failed, {} tokens spent",
            report.stop_cause,
            report.completed_count(),
            report.failed_count(),
            report.tokens_spent
        );
        Ok(report)
    }

    /// Seed in-memory state from the store before the first iteration.
    async fn prepare(&mut self) {
        let task_ids: Vec<TaskId> = self.graph.tasks().map(|t| t.id).collect();
        if let Err(e) = self.recovery.seed_from_store(&task_ids).await {
            hlog_warn!("Failed to seed retry counts from the store: {}", e);
        }

        let now = Utc::now();
        match self.store.load_signals().await {
            Ok(signals) => {
                for signal in signals {
                    if !signal.is_expired(now) {
                        self.signals.deposit(signal);
                    }
                }
            }
            Err(e) => hlog_warn!("Failed to load signals from the store: {}", e),
        }

        for task in self.graph.tasks() {
            if let Err(e) = self.store.save_task(task).await {
                hlog_warn!("Failed to persist task {}: {}", task.name, e);
            }
        }
    }

    /// Start the heartbeat sweep and message drain as cancellable tickers.
    fn spawn_tickers(&self) -> CancellationToken {
        let ticker_cancel = self.cancel.child_token();

        {
            let coordinator = self.coordinator.clone();
            let sweep_tx = self.sweep_tx.clone();
            let cancel = ticker_cancel.clone();
            let sweep_interval = self.config.sweep_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            hlog_debug!("Heartbeat sweep ticker cancelled");
                            break;
                        }
                        _ = interval.tick() => {
                            for context in coordinator.sweep_stale(Utc::now()).await {
                                if sweep_tx.send(context).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            });
        }

        {
            let coordinator = self.coordinator.clone();
            let cancel = ticker_cancel.clone();
            let drain_interval = self.config.drain_interval;
            let batch = self.config.drain_batch;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(drain_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            hlog_debug!("Message drain ticker cancelled");
                            break;
                        }
                        _ = interval.tick() => {
                            let delivered = coordinator.drain_messages(batch).await;
                            if delivered > 0 {
                                hlog_trace!("Drained {} agent messages", delivered);
                            }
                        }
                    }
                }
            });
        }

        ticker_cancel
    }

    /// Poll the coordinator and route every outcome exactly once.
    async fn process_outcomes(&mut self) {
        for outcome in self.coordinator.poll_outcomes().await {
            match outcome {
                AgentOutcome::StepComplete {
                    task_id,
                    agent_id,
                    summary,
                } => {
                    self.handle_step_complete(task_id, agent_id, summary).await;
                }
                AgentOutcome::Impasse {
                    task_id,
                    agent_id,
                    reason,
                } => {
                    let step = self.graph.task(&task_id).map(|t| t.current_step());
                    let mut context =
                        ErrorContext::new(task_id, FailureKind::Impasse, Severity::Medium, &reason)
                            .with_agent(agent_id);
                    if let Some(step) = step {
                        context = context.with_step(step);
                    }
                    self.route_failure(context).await;
                }
                AgentOutcome::SessionDied { task_id, agent_id } => {
                    let step = self.graph.task(&task_id).map(|t| t.current_step());
                    let mut context = ErrorContext::new(
                        task_id,
                        FailureKind::SystemFailure,
                        Severity::High,
                        "agent session died without reporting a result",
                    )
                    .with_agent(agent_id);
                    if let Some(step) = step {
                        context = context.with_step(step);
                    }
                    self.route_failure(context).await;
                }
            }
        }
    }

    /// One completion event advances the workflow exactly once.
    async fn handle_step_complete(&mut self, task_id: TaskId, agent_id: AgentId, summary: String) {
        let Some(task) = self.graph.task_mut(&task_id) else {
            self.coordinator.release_agent(&agent_id).await;
            return;
        };
        let step = task.current_step();
        hlog!(
            "Task {} finished step {}: {}",
            task.name,
            step,
            first_line(&summary)
        );

        let message = format!("{}: {}", step, first_line(&summary));
        match self.workspaces.commit(task, &message).await {
            Ok(Some(hash)) => task.set_commit(hash),
            Ok(None) => {}
            Err(e) => hlog_warn!("Commit failed for task {}: {}", task.name, e),
        }

        let artifact = Artifact::new(task_id, step, &summary);
        if let Err(e) = self.store.save_artifact(&artifact).await {
            hlog_warn!("Failed to persist artifact for task {}: {}", task.name, e);
        }

        let advanced = task.workflow.advance();
        if advanced {
            task.mark_pending();
            self.coordinator.release_agent(&agent_id).await;
            let _ = self
                .event_tx
                .send(SchedulerEvent::StepCompleted { task_id, step })
                .await;
        } else {
            task.complete();
            let name = task.name.clone();
            let commit = task.commit_hash.clone();

            if let Some(task) = self.graph.task(&task_id) {
                if let Err(e) = self.coordinator.cleanup(task).await {
                    hlog_warn!("Cleanup failed for task {}: {}", name, e);
                }
            }
            let _ = self
                .event_tx
                .send(SchedulerEvent::TaskCompleted { task_id, commit })
                .await;
            self.tracker.push_event(TrackerEventKind::TaskCompleted {
                task: task_id,
                name: name.clone(),
            });
            self.deposit_signal(Signal::new(
                SignalKind::Success,
                COMPLETION_SIGNAL_STRENGTH,
                &format!("task:{}", name),
            ))
            .await;
        }
        self.persist_task(&task_id).await;
    }

    /// Drain stale-agent contexts produced by the sweep ticker.
    async fn process_sweeps(&mut self) {
        while let Ok(context) = self.sweep_rx.try_recv() {
            self.route_failure(context).await;
        }
    }

    /// Forward coordination notifications into the tracker's event queue.
    fn process_coordination_events(&mut self) {
        while let Ok(event) = self.coordination_rx.try_recv() {
            match event {
                CoordinationEvent::Spawned {
                    agent,
                    task,
                    capability,
                } => {
                    self.tracker.push_event(TrackerEventKind::AgentSpawned {
                        agent,
                        task,
                        capability,
                    });
                }
                CoordinationEvent::Stale { agent, task, idle } => {
                    self.tracker.push_event(TrackerEventKind::Alert {
                        message: format!(
                            "agent {} on task {} went stale after {:?}",
                            agent.short(),
                            task.short(),
                            idle
                        ),
                    });
                }
                CoordinationEvent::Terminated { agent, task } => {
                    hlog_trace!(
                        "Agent {} for task {} terminated",
                        agent.short(),
                        task.short()
                    );
                }
            }
        }
    }

    /// Hand one failure to the recovery engine; it fully settles before the
    /// task can be dispatched again.
    async fn route_failure(&mut self, context: ErrorContext) {
        let task_name = self.graph.task(&context.task_id).map(|t| t.name.clone());
        let outcome = self
            .recovery
            .handle_failure(&context, &mut self.graph, &mut self.paused_until)
            .await;

        if outcome.escalated {
            self.escalations += 1;
            let name = task_name.unwrap_or_else(|| context.task_id.short());
            let _ = self
                .event_tx
                .send(SchedulerEvent::TaskFailed {
                    task_id: context.task_id,
                    error: outcome.message.clone(),
                })
                .await;
            self.tracker.push_event(TrackerEventKind::TaskFailed {
                task: context.task_id,
                name,
                message: outcome.message,
            });
        }
        self.persist_task(&context.task_id).await;
    }

    /// Return paused tasks to the dispatch pool once their window passes.
    fn expire_pauses(&mut self) {
        let now = Utc::now();
        let expired: Vec<TaskId> = self
            .paused_until
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(id, _)| *id)
            .collect();
        for task_id in expired {
            self.paused_until.remove(&task_id);
            if let Some(task) = self.graph.task_mut(&task_id) {
                if matches!(task.status, TaskStatus::Paused { .. }) {
                    hlog!("Pause expired for task {}", task.name);
                    task.mark_pending();
                }
            }
        }
    }

    /// Dispatch at most one ready task through the coordinator.
    ///
    /// The first candidate runs the critique gate when its stage mandates
    /// one; a veto skips dispatch for this cycle and routes the finding
    /// through recovery.
    async fn dispatch_next(&mut self) -> bool {
        if !self.coordinator.has_capacity().await {
            return false;
        }

        let candidate = self
            .graph
            .ready_tasks()
            .iter()
            .find(|t| !self.paused_until.contains_key(&t.id))
            .map(|t| t.id);
        let Some(task_id) = candidate else {
            return false;
        };

        let Some(task) = self.graph.task(&task_id) else {
            return false;
        };
        match self.gate.check(task).await {
            GateDecision::Veto { context } => {
                hlog!("Critique gate vetoed dispatch of task {}", task.name);
                self.route_failure(context).await;
                return false;
            }
            GateDecision::Allow { signal } => {
                if let Some(signal) = signal {
                    self.deposit_signal(signal).await;
                }
            }
        }

        let context = self.build_context(&task_id).await;
        let Some(task) = self.graph.task_mut(&task_id) else {
            return false;
        };
        let name = task.name.clone();
        match self.coordinator.spawn(task, &context).await {
            Ok(agent_id) => {
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::TaskStarted { task_id, agent_id })
                    .await;
                self.tracker
                    .push_event(TrackerEventKind::TaskStarted { task: task_id, name });
                self.persist_task(&task_id).await;
                true
            }
            Err(e) => {
                hlog_warn!("Dispatch of task {} failed: {}", name, e);
                let context = ErrorContext::new(
                    task_id,
                    FailureKind::SystemFailure,
                    Severity::Medium,
                    &format!("dispatch failed: {}", e),
                );
                self.route_failure(context).await;
                false
            }
        }
    }

    /// Gather dependency artifacts and live signals for one dispatch.
    async fn build_context(&mut self, task_id: &TaskId) -> ExecutionContext {
        let mut context = ExecutionContext::default();
        let now = Utc::now();

        for prereq_id in self.graph.prerequisites(task_id) {
            let Some(prereq) = self.graph.task(&prereq_id) else {
                continue;
            };
            let Some(last) = prereq.workflow.completed_steps().last() else {
                continue;
            };
            match self.store.latest_artifact(&prereq_id, last.step).await {
                Ok(Some(artifact)) => {
                    context.dependency_artifacts.push(DependencyArtifact {
                        task_name: prereq.name.clone(),
                        step: artifact.step,
                        content: artifact.content,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    hlog_warn!("Artifact lookup failed for task {}: {}", prereq.name, e);
                }
            }
        }

        self.signals.prune(now);
        let mut reads: Vec<SignalSummary> = self
            .signals
            .read("", now)
            .into_iter()
            .map(|(signal, strength)| SignalSummary {
                context: signal.context.clone(),
                kind: signal.kind,
                strength,
            })
            .collect();
        reads.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reads.truncate(MAX_CONTEXT_SIGNALS);
        context.signals = reads;

        context
    }

    /// Persist a signal and place it in the live field.
    async fn deposit_signal(&mut self, signal: Signal) {
        if let Err(e) = self.store.save_signal(&signal).await {
            hlog_warn!("Failed to persist signal: {}", e);
        }
        self.signals.deposit(signal);
    }

    async fn persist_task(&self, task_id: &TaskId) {
        if let Some(task) = self.graph.task(task_id) {
            if let Err(e) = self.store.save_task(task).await {
                hlog_warn!("Failed to persist task {}: {}", task.name, e);
            }
        }
    }

    fn build_report(&self, stop_cause: StopCause, duration: Duration) -> RunReport {
        let outcomes = self
            .graph
            .tasks()
            .map(|task| TaskOutcome {
                task_id: task.id,
                name: task.name.clone(),
                status: task.status.clone(),
            })
            .collect();
        RunReport {
            stop_cause,
            outcomes,
            tokens_spent: self.tracker.budget().spent,
            duration,
            escalations: self.escalations,
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
