//! Task and run-state persistence.
//!
//! `TaskStore` is the seam for everything the orchestrator wants to outlive
//! a single scheduling decision: task snapshots, failure history, step
//! artifacts, and coordination signals. `MemoryStore` backs tests and
//! one-shot runs; `JsonStore` writes JSON files under the state directory
//! so a run can be resumed or inspected afterwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::core::failure::ErrorContext;
use crate::core::signal::Signal;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::workflow::WorkflowStep;

/// Output produced by one workflow step of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: TaskId,
    pub step: WorkflowStep,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(task_id: TaskId, step: WorkflowStep, content: &str) -> Self {
        Self {
            task_id,
            step,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// One recorded failure event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub context: ErrorContext,
    pub escalated: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence seam for tasks, failures, artifacts, and signals.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Record a failure event, noting whether it was escalated to a human.
    async fn record_failure(&self, context: &ErrorContext, escalated: bool) -> Result<()>;
    /// Number of failures recorded for a task so far.
    async fn failure_count(&self, id: &TaskId) -> Result<u32>;
    async fn failures(&self, id: &TaskId) -> Result<Vec<FailureRecord>>;

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()>;
    /// Most recent artifact a task produced for a given step.
    async fn latest_artifact(&self, id: &TaskId, step: WorkflowStep) -> Result<Option<Artifact>>;

    async fn save_signal(&self, signal: &Signal) -> Result<()>;
    async fn load_signals(&self) -> Result<Vec<Signal>>;
}

/// In-memory store. State disappears with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    failures: RwLock<Vec<FailureRecord>>,
    artifacts: RwLock<Vec<Artifact>>,
    signals: RwLock<Vec<Signal>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn record_failure(&self, context: &ErrorContext, escalated: bool) -> Result<()> {
        self.failures.write().await.push(FailureRecord {
            context: context.clone(),
            escalated,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn failure_count(&self, id: &TaskId) -> Result<u32> {
        let count = self
            .failures
            .read()
            .await
            .iter()
            .filter(|record| record.context.task_id == *id)
            .count();
        Ok(count as u32)
    }

    async fn failures(&self, id: &TaskId) -> Result<Vec<FailureRecord>> {
        Ok(self
            .failures
            .read()
            .await
            .iter()
            .filter(|record| record.context.task_id == *id)
            .cloned()
            .collect())
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.artifacts.write().await.push(artifact.clone());
        Ok(())
    }

    async fn latest_artifact(&self, id: &TaskId, step: WorkflowStep) -> Result<Option<Artifact>> {
        Ok(self
            .artifacts
            .read()
            .await
            .iter()
            .filter(|artifact| artifact.task_id == *id && artifact.step == step)
            .max_by_key(|artifact| artifact.created_at)
            .cloned())
    }

    async fn save_signal(&self, signal: &Signal) -> Result<()> {
        self.signals.write().await.push(signal.clone());
        Ok(())
    }

    async fn load_signals(&self) -> Result<Vec<Signal>> {
        Ok(self.signals.read().await.clone())
    }
}

/// File-backed store rooted at a state directory.
///
/// Layout:
/// ```text
/// <root>/tasks/<task-id>.json
/// <root>/failures.json
/// <root>/artifacts/<task-id>/<step>.json
/// <root>/signals.json
/// ```
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the shared list files.
    list_lock: RwLock<()>,
}

impl JsonStore {
    /// Open a store at `root`, creating the directory layout if needed.
    pub async fn open(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root.join("tasks")).await?;
        tokio::fs::create_dir_all(root.join("artifacts")).await?;
        Ok(Self {
            root: root.to_path_buf(),
            list_lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, id: &TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{id}.json"))
    }

    fn artifact_path(&self, id: &TaskId, step: WorkflowStep) -> PathBuf {
        self.root
            .join("artifacts")
            .join(id.to_string())
            .join(format!("{}.json", step.as_str()))
    }

    fn failures_path(&self) -> PathBuf {
        self.root.join("failures.json")
    }

    fn signals_path(&self) -> PathBuf {
        self.root.join("signals.json")
    }

    async fn read_list<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.write_json(&self.task_path(&task.id), task).await
    }

    async fn load_task(&self, id: &TaskId) -> Result<Option<Task>> {
        match tokio::fs::read_to_string(self.task_path(id)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("tasks")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                let content = tokio::fs::read_to_string(entry.path()).await?;
                tasks.push(serde_json::from_str(&content)?);
            }
        }
        tasks.sort_by(|a: &Task, b: &Task| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn record_failure(&self, context: &ErrorContext, escalated: bool) -> Result<()> {
        let _guard = self.list_lock.write().await;
        let mut records: Vec<FailureRecord> = self.read_list(&self.failures_path()).await?;
        records.push(FailureRecord {
            context: context.clone(),
            escalated,
            recorded_at: Utc::now(),
        });
        self.write_json(&self.failures_path(), &records).await
    }

    async fn failure_count(&self, id: &TaskId) -> Result<u32> {
        let _guard = self.list_lock.read().await;
        let records: Vec<FailureRecord> = self.read_list(&self.failures_path()).await?;
        Ok(records
            .iter()
            .filter(|record| record.context.task_id == *id)
            .count() as u32)
    }

    async fn failures(&self, id: &TaskId) -> Result<Vec<FailureRecord>> {
        let _guard = self.list_lock.read().await;
        let records: Vec<FailureRecord> = self.read_list(&self.failures_path()).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.context.task_id == *id)
            .collect())
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<()> {
        let path = self.artifact_path(&artifact.task_id, artifact.step);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.write_json(&path, artifact).await
    }

    async fn latest_artifact(&self, id: &TaskId, step: WorkflowStep) -> Result<Option<Artifact>> {
        match tokio::fs::read_to_string(self.artifact_path(id, step)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn save_signal(&self, signal: &Signal) -> Result<()> {
        let _guard = self.list_lock.write().await;
        let mut signals: Vec<Signal> = self.read_list(&self.signals_path()).await?;
        signals.push(signal.clone());
        self.write_json(&self.signals_path(), &signals).await
    }

    async fn load_signals(&self) -> Result<Vec<Signal>> {
        let _guard = self.list_lock.read().await;
        self.read_list(&self.signals_path()).await
    }
}
