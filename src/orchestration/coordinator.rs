//! Agent lifecycle coordination.
//!
//! The `AgentCoordinator` owns every live agent: spawn with full unwind on
//! partial failure, helper takeover, heartbeat sweeping, message routing,
//! and teardown. It enforces the capacity limit and the one-active-agent-
//! per-task rule through the task index.
//!
//! Lock order is agents, then channels, then the task index. Every method
//! that takes more than one lock follows it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use crate::core::failure::{ErrorContext, FailureKind, Severity};
use crate::core::task::{AgentId, Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::capabilities::{
    helper_payload, instruction_payload, ExecutionContext, IMPASSE_MARKER, STEP_COMPLETE_MARKER,
};
use crate::orchestration::messaging::{AgentChannel, AgentMessage, MessageKind, MessagePriority};
use crate::quality::Diagnosis;
use crate::session::{session_name, SessionHost};
use crate::workflow::Capability;
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{hlog, hlog_debug, hlog_warn};

/// How many trailing lines of session output the poller inspects.
const POLL_TAIL_LINES: u16 = 50;

/// Lifecycle state of a coordinated agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Active,
    /// Stepped aside while a helper works the same task.
    Waiting,
    Completed,
    Failed,
}

/// Bookkeeping for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub task_id: TaskId,
    pub session: String,
    pub capability: Capability,
    pub status: AgentStatus,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub cooperating_with: Vec<AgentId>,
}

/// Lifecycle notifications for observers (the tracker, logs).
#[derive(Debug, Clone)]
pub enum CoordinationEvent {
    Spawned {
        agent: AgentId,
        task: TaskId,
        capability: Capability,
    },
    Stale {
        agent: AgentId,
        task: TaskId,
        idle: Duration,
    },
    Terminated {
        agent: AgentId,
        task: TaskId,
    },
}

/// What the poller learned about one agent.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// The agent printed the completion marker.
    StepComplete {
        task_id: TaskId,
        agent_id: AgentId,
        summary: String,
    },
    /// The agent printed the impasse marker.
    Impasse {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
    /// The session disappeared without either marker.
    SessionDied { task_id: TaskId, agent_id: AgentId },
}

pub struct AgentCoordinator {
    agents: Arc<RwLock<HashMap<AgentId, AgentInfo>>>,
    channels: Arc<RwLock<HashMap<AgentId, AgentChannel>>>,
    by_task: Arc<RwLock<HashMap<TaskId, AgentId>>>,
    max_concurrent: usize,
    /// Base command an agent session runs; the payload is appended.
    command: Vec<String>,
    workspaces: Arc<dyn WorkspaceManager>,
    sessions: Arc<dyn SessionHost>,
    event_tx: mpsc::Sender<CoordinationEvent>,
    stale_after: Duration,
}

impl AgentCoordinator {
    pub fn new(
        workspaces: Arc<dyn WorkspaceManager>,
        sessions: Arc<dyn SessionHost>,
        event_tx: mpsc::Sender<CoordinationEvent>,
        max_concurrent: usize,
        command: Vec<String>,
        stale_after: Duration,
    ) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            by_task: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent,
            command,
            workspaces,
            sessions,
            event_tx,
            stale_after,
        }
    }

    /// Agents currently holding a pool slot.
    pub async fn active_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|info| {
                matches!(
                    info.status,
                    AgentStatus::Spawning | AgentStatus::Active | AgentStatus::Waiting
                )
            })
            .count()
    }

    pub async fn has_capacity(&self) -> bool {
        self.active_count().await < self.max_concurrent
    }

    pub async fn agent(&self, id: &AgentId) -> Option<AgentInfo> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn agent_for_task(&self, task_id: &TaskId) -> Option<AgentInfo> {
        let agent_id = *self.by_task.read().await.get(task_id)?;
        self.agents.read().await.get(&agent_id).cloned()
    }

    pub async fn agents_for_task(&self, task_id: &TaskId) -> Vec<AgentInfo> {
        self.agents
            .read()
            .await
            .values()
            .filter(|info| info.task_id == *task_id)
            .cloned()
            .collect()
    }

    /// Spawn an agent for a pending task.
    ///
    /// Allocation order is workspace, session, payload, registration. A
    /// failure at any stage unwinds everything already allocated before the
    /// error surfaces, so there are no half-spawned agents.
    pub async fn spawn(&self, task: &mut Task, context: &ExecutionContext) -> Result<AgentId> {
        if !self.has_capacity().await {
            return Err(Error::AgentPoolFull {
                max: self.max_concurrent,
            });
        }
        if self.by_task.read().await.contains_key(&task.id) {
            return Err(Error::AgentAlreadyActive {
                task: task.name.clone(),
            });
        }

        let agent_id = AgentId::new();
        let session = session_name(&task.name, &agent_id.short());

        // A task past its first step already has a working copy; reuse it.
        let (workspace, created_now) = match (&task.workspace_path, &task.branch_name) {
            (Some(path), Some(branch)) => (
                Workspace {
                    path: path.clone(),
                    branch: branch.clone(),
                },
                false,
            ),
            _ => (self.workspaces.create(task).await?, true),
        };

        let payload = instruction_payload(task, context);
        let mut command = self.command.clone();
        command.push(payload);
        if let Err(e) = self.sessions.start(&session, &workspace.path, &command).await {
            if created_now {
                hlog_warn!("Session start failed for {}, unwinding workspace", task.name);
                let _ = self.workspaces.remove(task).await;
            }
            return Err(e);
        }

        self.register(agent_id, task.id, &session, task.capability, &[])
            .await;

        task.assign_agent(agent_id);
        task.set_workspace(workspace.path, workspace.branch);
        task.start();

        hlog!(
            "Spawned {} agent {} for task '{}' in session {}",
            task.capability,
            agent_id.short(),
            task.name,
            session
        );
        let _ = self
            .event_tx
            .send(CoordinationEvent::Spawned {
                agent: agent_id,
                task: task.id,
                capability: task.capability,
            })
            .await;
        Ok(agent_id)
    }

    /// Spawn a helper that takes over a troubled task's active slot.
    ///
    /// The helper works in the task's existing workspace. The replaced agent
    /// (if any) steps to `Waiting` and both sides record the cooperation.
    pub async fn spawn_helper(
        &self,
        task: &mut Task,
        helper: Capability,
        reason: &str,
        diagnosis: Option<&Diagnosis>,
    ) -> Result<AgentId> {
        if !self.has_capacity().await {
            return Err(Error::AgentPoolFull {
                max: self.max_concurrent,
            });
        }

        let workspace_path = match &task.workspace_path {
            Some(path) => path.clone(),
            None => {
                let workspace = self.workspaces.create(task).await?;
                task.set_workspace(workspace.path.clone(), workspace.branch);
                workspace.path
            }
        };

        let agent_id = AgentId::new();
        let session = session_name(&task.name, &agent_id.short());
        let payload = helper_payload(helper, task, reason, diagnosis);
        let mut command = self.command.clone();
        command.push(payload);
        self.sessions.start(&session, &workspace_path, &command).await?;

        let replaced = self.by_task.read().await.get(&task.id).copied();
        let cooperating: Vec<AgentId> = replaced.into_iter().collect();
        self.register(agent_id, task.id, &session, helper, &cooperating)
            .await;

        if let Some(replaced_id) = replaced {
            let mut agents = self.agents.write().await;
            if let Some(info) = agents.get_mut(&replaced_id) {
                info.status = AgentStatus::Waiting;
                info.cooperating_with.push(agent_id);
            }
        }
        // Helper takes over the task's active slot.
        self.by_task.write().await.insert(task.id, agent_id);
        task.assign_agent(agent_id);

        hlog!(
            "Spawned {} helper {} for task '{}' ({})",
            helper,
            agent_id.short(),
            task.name,
            reason
        );
        let _ = self
            .event_tx
            .send(CoordinationEvent::Spawned {
                agent: agent_id,
                task: task.id,
                capability: helper,
            })
            .await;
        Ok(agent_id)
    }

    async fn register(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        session: &str,
        capability: Capability,
        cooperating_with: &[AgentId],
    ) {
        let now = Utc::now();
        let info = AgentInfo {
            id: agent_id,
            task_id,
            session: session.to_string(),
            capability,
            status: AgentStatus::Active,
            spawned_at: now,
            last_heartbeat: now,
            cooperating_with: cooperating_with.to_vec(),
        };
        self.agents.write().await.insert(agent_id, info);
        self.channels
            .write()
            .await
            .insert(agent_id, AgentChannel::new(agent_id));
        self.by_task.write().await.entry(task_id).or_insert(agent_id);
    }

    /// Refresh one agent's heartbeat timestamp.
    pub async fn record_heartbeat(&self, agent_id: &AgentId) {
        if let Some(info) = self.agents.write().await.get_mut(agent_id) {
            info.last_heartbeat = Utc::now();
        }
    }

    /// Mark agents without a recent heartbeat as failed.
    ///
    /// Runs from the sweep ticker; it is the only writer of staleness state.
    /// Returns an `ErrorContext` per newly stale agent for recovery routing.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<ErrorContext> {
        let stale_after =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::seconds(300));
        let mut contexts = Vec::new();
        let mut notifications = Vec::new();

        {
            let mut agents = self.agents.write().await;
            for info in agents.values_mut() {
                if info.status != AgentStatus::Active {
                    continue;
                }
                let idle = now.signed_duration_since(info.last_heartbeat);
                if idle <= stale_after {
                    continue;
                }
                info.status = AgentStatus::Failed;
                let idle_std = idle.to_std().unwrap_or_default();
                hlog_warn!(
                    "Agent {} on task {} stale for {:?}",
                    info.id.short(),
                    info.task_id.short(),
                    idle_std
                );
                let _ = self
                    .event_tx
                    .send(CoordinationEvent::Stale {
                        agent: info.id,
                        task: info.task_id,
                        idle: idle_std,
                    })
                    .await;
                contexts.push(
                    ErrorContext::new(
                        info.task_id,
                        FailureKind::Timeout,
                        Severity::High,
                        &format!("no heartbeat from agent for {}s", idle.num_seconds()),
                    )
                    .with_agent(info.id),
                );
                for peer in &info.cooperating_with {
                    notifications.push((info.id, *peer));
                }
            }
        }

        for (stale, peer) in notifications {
            let message = AgentMessage::new(
                stale,
                peer,
                MessageKind::Alert,
                MessagePriority::Critical,
                &format!("cooperating agent {} went stale", stale.short()),
            );
            if let Err(e) = self.enqueue(message).await {
                hlog_debug!("Stale notification dropped: {}", e);
            }
        }
        contexts
    }

    /// Enqueue a message onto the recipient's channel.
    pub async fn send_message(
        &self,
        from: AgentId,
        to: AgentId,
        kind: MessageKind,
        priority: MessagePriority,
        body: &str,
    ) -> Result<()> {
        self.enqueue(AgentMessage::new(from, to, kind, priority, body))
            .await
    }

    async fn enqueue(&self, message: AgentMessage) -> Result<()> {
        let mut channels = self.channels.write().await;
        match channels.get_mut(&message.to) {
            Some(channel) => {
                channel.push(message);
                Ok(())
            }
            None => Err(Error::AgentNotFound {
                id: message.to.to_string(),
            }),
        }
    }

    /// Deliver queued messages into recipient sessions, at most `batch` per
    /// channel. Runs from the drain ticker; it is the only consumer of the
    /// channels.
    pub async fn drain_messages(&self, batch: usize) -> usize {
        let sessions_by_agent: HashMap<AgentId, String> = self
            .agents
            .read()
            .await
            .values()
            .filter(|info| info.status == AgentStatus::Active)
            .map(|info| (info.id, info.session.clone()))
            .collect();

        let mut batches: Vec<(String, Vec<AgentMessage>)> = Vec::new();
        {
            let mut channels = self.channels.write().await;
            for (agent_id, channel) in channels.iter_mut() {
                if channel.is_empty() {
                    continue;
                }
                // Messages to inactive agents stay queued until the agent
                // returns or its channel is cleaned up.
                if let Some(session) = sessions_by_agent.get(agent_id) {
                    let messages = channel.drain_batch(batch);
                    if !messages.is_empty() {
                        batches.push((session.clone(), messages));
                    }
                }
            }
        }

        let mut delivered = 0;
        for (session, messages) in batches {
            for message in messages {
                match self
                    .sessions
                    .send_text(&session, &message.format_for_session())
                    .await
                {
                    Ok(()) => delivered += 1,
                    Err(e) => hlog_warn!("Message delivery to {} failed: {}", session, e),
                }
            }
        }
        if delivered > 0 {
            hlog_debug!("Drained {} messages", delivered);
        }
        delivered
    }

    /// Inspect live sessions for completion markers and deaths.
    ///
    /// Each outcome is reported exactly once: the agent's status moves off
    /// `Active` the moment its outcome is recorded.
    pub async fn poll_outcomes(&self) -> Vec<AgentOutcome> {
        let active: Vec<(AgentId, TaskId, String)> = self
            .agents
            .read()
            .await
            .values()
            .filter(|info| info.status == AgentStatus::Active)
            .map(|info| (info.id, info.task_id, info.session.clone()))
            .collect();

        let mut outcomes = Vec::new();
        for (agent_id, task_id, session) in active {
            if !self.sessions.is_running(&session).await {
                self.set_status(&agent_id, AgentStatus::Failed).await;
                outcomes.push(AgentOutcome::SessionDied { task_id, agent_id });
                continue;
            }

            let tail = match self.sessions.capture_tail(&session, POLL_TAIL_LINES).await {
                Ok(tail) => tail,
                Err(e) => {
                    hlog_debug!("capture_tail({}) failed: {}", session, e);
                    continue;
                }
            };

            if let Some(summary) = last_marker(&tail, STEP_COMPLETE_MARKER) {
                self.set_status(&agent_id, AgentStatus::Completed).await;
                outcomes.push(AgentOutcome::StepComplete {
                    task_id,
                    agent_id,
                    summary,
                });
            } else if let Some(reason) = last_marker(&tail, IMPASSE_MARKER) {
                self.set_status(&agent_id, AgentStatus::Completed).await;
                outcomes.push(AgentOutcome::Impasse {
                    task_id,
                    agent_id,
                    reason,
                });
            } else if let Ok(ts) = self.sessions.last_activity(&session).await {
                if let Some(activity) = DateTime::from_timestamp(ts as i64, 0) {
                    let mut agents = self.agents.write().await;
                    if let Some(info) = agents.get_mut(&agent_id) {
                        if activity > info.last_heartbeat {
                            info.last_heartbeat = activity;
                        }
                    }
                }
            }
        }
        outcomes
    }

    async fn set_status(&self, agent_id: &AgentId, status: AgentStatus) {
        if let Some(info) = self.agents.write().await.get_mut(agent_id) {
            info.status = status;
        }
    }

    /// Release one finished agent: session killed, registration dropped.
    pub async fn release_agent(&self, agent_id: &AgentId) {
        let info = self.agents.write().await.remove(agent_id);
        self.channels.write().await.remove(agent_id);
        if let Some(info) = info {
            let mut by_task = self.by_task.write().await;
            if by_task.get(&info.task_id) == Some(agent_id) {
                by_task.remove(&info.task_id);
            }
            drop(by_task);
            if let Err(e) = self.sessions.kill(&info.session).await {
                hlog_warn!("Failed to kill session {}: {}", info.session, e);
            }
            let _ = self
                .event_tx
                .send(CoordinationEvent::Terminated {
                    agent: *agent_id,
                    task: info.task_id,
                })
                .await;
        }
    }

    /// Tear down every agent tied to a task, then release its workspace.
    pub async fn cleanup(&self, task: &Task) -> Result<()> {
        let agent_ids: Vec<AgentId> = self
            .agents
            .read()
            .await
            .values()
            .filter(|info| info.task_id == task.id)
            .map(|info| info.id)
            .collect();

        for agent_id in agent_ids {
            self.release_agent(&agent_id).await;
        }

        if task.workspace_path.is_some() {
            self.workspaces.remove(task).await?;
        }
        hlog_debug!("Cleaned up task '{}'", task.name);
        Ok(())
    }
}

/// Last occurrence of `marker` in `tail`, returning the text after it.
fn last_marker(tail: &str, marker: &str) -> Option<String> {
    tail.lines()
        .rev()
        .find_map(|line| line.find(marker).map(|at| line[at + marker.len()..].trim().to_string()))
}
