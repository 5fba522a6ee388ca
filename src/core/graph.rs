//! Task dependency graph.
//!
//! Directed edges run from a prerequisite task to the tasks that depend on
//! it. The graph is kept acyclic: every edge insertion re-runs cycle
//! detection and rejects the edge with the offending cycle spelled out.
//! Readiness is evaluated live from task statuses, never from a cached
//! ordering.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// Why one task depends on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DependencyKind {
    /// Plain completion ordering.
    Ordering,
    /// The dependent consumes a named artifact of the prerequisite.
    Artifact { name: String },
    /// Domain-level relationship worth surfacing in context.
    Semantic { reason: String },
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Visited,
}

/// The dependency graph of all tasks in a run.
pub struct TaskGraph {
    graph: DiGraph<Task, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task as a graph node.
    pub fn add_task(&mut self, task: Task) -> TaskId {
        let task_id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(task_id, index);
        task_id
    }

    /// Add a dependency edge: `to` depends on `from`.
    ///
    /// # Errors
    /// Fails when either task is unknown, or when the edge would create a
    /// cycle; the cycle error names the full path and the edge is not kept.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        kind: DependencyKind,
    ) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskNotFound {
                id: from.to_string(),
            })?;
        let to_index = *self.task_index.get(to).ok_or_else(|| Error::TaskNotFound {
            id: to.to_string(),
        })?;

        let edge = self.graph.add_edge(from_index, to_index, kind);

        if let Some(cycle) = self.find_cycle() {
            let path = cycle
                .iter()
                .map(|idx| self.graph[*idx].name.clone())
                .collect::<Vec<_>>()
                .join(" -> ");
            self.graph.remove_edge(edge);
            return Err(Error::CircularDependency { cycle: path });
        }

        Ok(())
    }

    /// Depth-first cycle search with visited/in-progress marking.
    ///
    /// Returns the nodes along the first cycle found, ending with a repeat
    /// of the entry node.
    fn find_cycle(&self) -> Option<Vec<NodeIndex>> {
        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
        let mut path = Vec::new();

        for start in self.graph.node_indices() {
            if marks.get(&start).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        marks: &mut HashMap<NodeIndex, Mark>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        marks.insert(node, Mark::InProgress);
        path.push(node);

        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            match marks.get(&next).copied().unwrap_or(Mark::Unvisited) {
                Mark::InProgress => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Visited => {}
            }
        }

        path.pop();
        marks.insert(node, Mark::Visited);
        None
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let idx = *self.task_index.get(id)?;
        Some(&mut self.graph[idx])
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.graph
            .node_indices()
            .map(|idx| &self.graph[idx])
            .find(|task| task.name == name)
    }

    /// Pending tasks whose prerequisites are all completed, ordered by
    /// priority then age then name so dispatch is deterministic.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph[idx].can_start()
                    && self
                        .graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == TaskStatus::Completed)
            })
            .map(|idx| &self.graph[idx])
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.name.cmp(&b.name))
        });
        ready
    }

    /// Direct prerequisites of a task.
    pub fn prerequisites(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, Direction::Incoming)
                .map(|dep| self.graph[dep].id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, Direction::Outgoing)
                .map(|dep| self.graph[dep].id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task downstream of the given one, directly or transitively.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents(id).into();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents(&next));
            }
        }

        let mut result: Vec<TaskId> = seen.into_iter().collect();
        result.sort();
        result
    }

    /// Topological ordering of all tasks (diagnostic only; the scheduler
    /// re-evaluates readiness dynamically).
    pub fn dependency_order(&self) -> Result<Vec<TaskId>> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].id).collect())
            .map_err(|cycle| {
                let name = self
                    .graph
                    .node_weight(cycle.node_id())
                    .map(|task| task.name.clone())
                    .unwrap_or_default();
                Error::CircularDependency { cycle: name }
            })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn pending_count(&self) -> usize {
        self.tasks().filter(|task| task.can_start()).count()
    }

    /// True when every task reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.tasks().all(|task| task.is_terminal())
    }

    /// True when every task completed successfully.
    pub fn all_complete(&self) -> bool {
        self.tasks()
            .all(|task| task.status == TaskStatus::Completed)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}
