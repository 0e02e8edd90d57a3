//! Notification channels shared by the scheduler and agent runtimes.
//!
//! Notifications only shorten waits. Every consumer re-reads the store
//! after waking, so a dropped message delays work but never loses it.

pub mod hub;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::model::{AgentId, AgentStatus, SubtaskId, SubtaskStatus, TaskId, TaskStatus};

pub use hub::NotificationHub;

/// Addressable notification channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Assignments and cancellations for one agent
    Agent(AgentId),
    /// Status changes of one task
    Task(TaskId),
    /// Reports and agent status changes consumed by the scheduler
    Scheduler,
    /// Agent registration announcements
    Registration,
}

impl Channel {
    /// Wire name of the channel under `namespace`
    pub fn name(&self, namespace: &str) -> String {
        match self {
            Channel::Agent(id) => format!("{}:agent:{}", namespace, id),
            Channel::Task(id) => format!("{}:task:{}", namespace, id),
            Channel::Scheduler => format!("{}:scheduler", namespace),
            Channel::Registration => format!("{}:registration", namespace),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Assigned {
        subtask_id: SubtaskId,
        agent_id: AgentId,
    },
    Cancel {
        task_id: TaskId,
        subtask_id: SubtaskId,
    },
    /// An agent finished (or gave up on) a subtask
    Reported {
        subtask_id: SubtaskId,
        agent_id: AgentId,
        status: SubtaskStatus,
    },
    TaskStatus {
        task_id: TaskId,
        status: TaskStatus,
    },
    SubtaskStatus {
        task_id: TaskId,
        subtask_id: SubtaskId,
        status: SubtaskStatus,
    },
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentStatus {
        agent_id: AgentId,
        status: AgentStatus,
    },
    TaskSubmitted {
        task_id: TaskId,
    },
}

/// Stream of notifications from one channel
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, Notification>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, stream: BoxStream<'static, Notification>) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next notification; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Notification> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}
