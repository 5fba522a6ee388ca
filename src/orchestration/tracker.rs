//! Run status and metrics tracking.
//!
//! The tracker owns the run-level view: lifecycle state, budget utilization
//! against the completion service's cumulative usage, per-status progress
//! counts, and a bounded priority queue of coordination events for
//! reporting. When the queue is full the oldest lowest-priority entry is
//! evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::completion::CompletionClient;
use crate::core::graph::TaskGraph;
use crate::core::task::{AgentId, Priority, TaskId, TaskStatus};
use crate::hlog;
use crate::workflow::Capability;

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle state of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initialized,
    Running,
    /// Nothing dispatchable and nothing in flight, but tasks remain.
    Idle,
    Completed,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token spend against the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStatus {
    pub spent: u64,
    pub limit: Option<u64>,
}

impl BudgetStatus {
    /// Fraction of the budget consumed; `None` when unlimited.
    pub fn utilization(&self) -> Option<f64> {
        self.limit
            .map(|limit| self.spent as f64 / limit.max(1) as f64)
    }

    pub fn within_limit(&self) -> bool {
        match self.limit {
            Some(limit) => self.spent < limit,
            None => true,
        }
    }
}

/// Per-status task counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub impasse: usize,
    pub paused: usize,
    pub total: usize,
}

/// One coordination event for reporting.
#[derive(Debug, Clone)]
pub struct TrackerEvent {
    pub priority: Priority,
    pub kind: TrackerEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TrackerEventKind {
    TaskStarted {
        task: TaskId,
        name: String,
    },
    TaskCompleted {
        task: TaskId,
        name: String,
    },
    TaskFailed {
        task: TaskId,
        name: String,
        message: String,
    },
    AgentSpawned {
        agent: AgentId,
        task: TaskId,
        capability: Capability,
    },
    Alert {
        message: String,
    },
}

impl TrackerEventKind {
    fn default_priority(&self) -> Priority {
        match self {
            Self::Alert { .. } => Priority::Critical,
            Self::TaskFailed { .. } => Priority::High,
            Self::TaskCompleted { .. } => Priority::Medium,
            Self::TaskStarted { .. } | Self::AgentSpawned { .. } => Priority::Low,
        }
    }
}

pub struct StatusTracker {
    state: RunState,
    completion: Arc<dyn CompletionClient>,
    budget_limit: Option<u64>,
    events: VecDeque<TrackerEvent>,
    capacity: usize,
}

impl StatusTracker {
    pub fn new(completion: Arc<dyn CompletionClient>, budget_limit: Option<u64>) -> Self {
        Self::with_capacity(completion, budget_limit, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(
        completion: Arc<dyn CompletionClient>,
        budget_limit: Option<u64>,
        capacity: usize,
    ) -> Self {
        Self {
            state: RunState::Initialized,
            completion,
            budget_limit,
            events: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn set_state(&mut self, state: RunState) {
        if self.state != state {
            hlog!("Run state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Current spend measured from the completion service's cumulative
    /// usage. Never decremented.
    pub fn budget(&self) -> BudgetStatus {
        BudgetStatus {
            spent: self.completion.token_usage().total(),
            limit: self.budget_limit,
        }
    }

    /// Hard budget gate: `true` while the run may keep spending.
    pub fn check_budget_limit(&self) -> bool {
        self.budget().within_limit()
    }

    pub fn progress(&self, graph: &TaskGraph) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot::default();
        for task in graph.tasks() {
            snapshot.total += 1;
            match task.status {
                TaskStatus::Pending => snapshot.pending += 1,
                TaskStatus::Running => snapshot.running += 1,
                TaskStatus::Completed => snapshot.completed += 1,
                TaskStatus::Error { .. } => snapshot.error += 1,
                TaskStatus::Impasse { .. } => snapshot.impasse += 1,
                TaskStatus::Paused { .. } => snapshot.paused += 1,
            }
        }
        snapshot
    }

    /// Terminal condition for the scheduler loop.
    pub fn all_tasks_settled(&self, graph: &TaskGraph) -> bool {
        graph.all_terminal()
    }

    /// Queue an event, evicting the oldest lowest-priority entry when full.
    pub fn push_event(&mut self, kind: TrackerEventKind) {
        let event = TrackerEvent {
            priority: kind.default_priority(),
            kind,
            at: Utc::now(),
        };
        if self.events.len() >= self.capacity {
            if let Some(evict) = self
                .events
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.priority, e.at))
                .map(|(i, _)| i)
            {
                self.events.remove(evict);
            }
        }
        self.events.push_back(event);
    }

    /// Drain all queued events, highest priority first, oldest first within
    /// a priority.
    pub fn drain_events(&mut self) -> Vec<TrackerEvent> {
        let mut events: Vec<TrackerEvent> = self.events.drain(..).collect();
        events.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.at.cmp(&b.at)));
        events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}
