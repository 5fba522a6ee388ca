//! Inter-agent messaging.
//!
//! Agents talk to each other through per-agent channels held by the
//! coordinator. Sends enqueue; a periodic drain delivers queued messages
//! into recipient sessions in priority order with a bounded batch per
//! channel per cycle, so one noisy channel cannot starve the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use crate::core::task::AgentId;

/// Unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery priority. Higher drains first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Drain order, highest first.
const PRIORITY_ORDER: [MessagePriority; 4] = [
    MessagePriority::Critical,
    MessagePriority::High,
    MessagePriority::Medium,
    MessagePriority::Low,
];

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    StatusUpdate,
    HelpRequest,
    Handoff,
    Alert,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusUpdate => "status_update",
            Self::HelpRequest => "help_request",
            Self::Handoff => "handoff",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One message between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub from: AgentId,
    pub to: AgentId,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        from: AgentId,
        to: AgentId,
        kind: MessageKind,
        priority: MessagePriority,
        body: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            kind,
            priority,
            body: body.to_string(),
            sent_at: Utc::now(),
        }
    }

    /// Single-line rendering typed into the recipient's session.
    pub fn format_for_session(&self) -> String {
        format!(
            "[hive message from={} kind={} priority={:?}] {}",
            self.from.short(),
            self.kind,
            self.priority,
            self.body.replace('\n', " ")
        )
    }
}

/// Priority-queued mailbox for one agent.
#[derive(Debug)]
pub struct AgentChannel {
    id: ChannelId,
    owner: AgentId,
    queues: [VecDeque<AgentMessage>; 4],
}

impl AgentChannel {
    pub fn new(owner: AgentId) -> Self {
        Self {
            id: ChannelId::new(),
            owner,
            queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn owner(&self) -> AgentId {
        self.owner
    }

    fn queue_index(priority: MessagePriority) -> usize {
        match priority {
            MessagePriority::Critical => 0,
            MessagePriority::High => 1,
            MessagePriority::Medium => 2,
            MessagePriority::Low => 3,
        }
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.queues[Self::queue_index(message.priority)].push_back(message);
    }

    /// Take up to `max` messages, highest priority first, FIFO within a
    /// priority.
    pub fn drain_batch(&mut self, max: usize) -> Vec<AgentMessage> {
        let mut batch = Vec::new();
        for priority in PRIORITY_ORDER {
            let queue = &mut self.queues[Self::queue_index(priority)];
            while batch.len() < max {
                match queue.pop_front() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
            if batch.len() >= max {
                break;
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}
