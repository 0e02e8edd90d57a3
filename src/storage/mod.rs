//! Shared coordination store.
//!
//! The store is the single source of truth for tasks, subtasks, agents and
//! world-state facts. Record writes go through [`CoordinationStore::commit`],
//! an optimistic multi-record transaction keyed on per-record revisions.
//! Facts are unconditional, last writer wins.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod sled_store;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::core::config::{StoreBackend, StoreConfig};
use crate::core::errors::{Result, SwarmError};
use crate::model::{Agent, SharedStateFact, SkillDescriptor, Subtask, Task};
use crate::pubsub::{Channel, Notification, Subscription};

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use sled_store::SledStore;

/// One record write inside a [`CoordinationStore::commit`].
///
/// The record's `revision` is the revision the writer observed when it read
/// the record; 0 means the record must not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Task(Task),
    Subtask(Subtask),
    Agent(Agent),
}

impl Write {
    pub fn kind(&self) -> &'static str {
        match self {
            Write::Task(_) => "task",
            Write::Subtask(_) => "subtask",
            Write::Agent(_) => "agent",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Write::Task(task) => &task.id,
            Write::Subtask(subtask) => &subtask.id,
            Write::Agent(agent) => &agent.id,
        }
    }

    /// `kind/id`, unique across record kinds
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind(), self.id())
    }

    pub fn observed_revision(&self) -> u64 {
        match self {
            Write::Task(task) => task.revision,
            Write::Subtask(subtask) => subtask.revision,
            Write::Agent(agent) => agent.revision,
        }
    }

    /// The record as it will be stored, with its revision bumped
    pub fn into_next(self) -> Write {
        match self {
            Write::Task(mut task) => {
                task.revision += 1;
                Write::Task(task)
            }
            Write::Subtask(mut subtask) => {
                subtask.revision += 1;
                Write::Subtask(subtask)
            }
            Write::Agent(mut agent) => {
                agent.revision += 1;
                Write::Agent(agent)
            }
        }
    }

    /// JSON encoding of the record with its revision bumped
    pub fn encode_next(&self) -> Result<Vec<u8>> {
        let bytes = match self.clone().into_next() {
            Write::Task(task) => serde_json::to_vec(&task)?,
            Write::Subtask(subtask) => serde_json::to_vec(&subtask)?,
            Write::Agent(agent) => serde_json::to_vec(&agent)?,
        };
        Ok(bytes)
    }
}

/// Reject batches that touch the same record twice
pub(crate) fn check_batch(writes: &[Write]) -> Result<()> {
    let mut seen = HashSet::with_capacity(writes.len());
    for write in writes {
        if !seen.insert(write.key()) {
            return Err(SwarmError::internal(format!(
                "commit writes {} more than once",
                write.key()
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_revision(write: &Write, found: u64) -> Result<()> {
    let expected = write.observed_revision();
    if expected != found {
        return Err(SwarmError::StoreConflict {
            key: write.key(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Storage and notification contract shared by every backend
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Prefix applied to keys and channel names
    fn namespace(&self) -> &str;

    /// Apply all writes or none. Fails with `StoreConflict` if any stored
    /// revision differs from the revision carried by its write.
    async fn commit(&self, writes: Vec<Write>) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn get_subtask(&self, id: &str) -> Result<Option<Subtask>>;

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;

    async fn tasks(&self) -> Result<Vec<Task>>;

    /// Every subtask ever created for `task_id`, superseded ones included
    async fn subtasks_of(&self, task_id: &str) -> Result<Vec<Subtask>>;

    async fn agents(&self) -> Result<Vec<Agent>>;

    /// Unconditional write; the newer timestamp wins
    async fn put_fact(&self, fact: SharedStateFact) -> Result<()>;

    async fn get_fact(&self, key: &str) -> Result<Option<SharedStateFact>>;

    async fn facts(&self) -> Result<Vec<SharedStateFact>>;

    /// Replace the skill catalogue of one agent
    async fn put_skills(&self, agent_id: &str, skills: Vec<SkillDescriptor>) -> Result<()>;

    async fn skills(&self, agent_id: &str) -> Result<Vec<SkillDescriptor>>;

    async fn publish(&self, channel: &Channel, notification: Notification) -> Result<()>;

    async fn subscribe(&self, channel: &Channel) -> Result<Subscription>;

    /// In-flight or unacknowledged subtasks held by `agent_id`
    async fn assigned_to(&self, agent_id: &str) -> Result<Vec<Subtask>> {
        let mut held = Vec::new();
        for task in self.tasks().await? {
            for subtask in self.subtasks_of(&task.id).await? {
                if subtask.assigned_agent.as_deref() == Some(agent_id) {
                    held.push(subtask);
                }
            }
        }
        Ok(held)
    }

    /// Current facts keyed by fact key, with writer and timestamp for
    /// staleness checks
    async fn world_snapshot(&self) -> Result<BTreeMap<String, SharedStateFact>> {
        Ok(self
            .facts()
            .await?
            .into_iter()
            .map(|fact| (fact.key.clone(), fact))
            .collect())
    }
}

/// Keep whichever fact is newer
pub(crate) fn newer_fact(current: Option<&SharedStateFact>, incoming: &SharedStateFact) -> bool {
    match current {
        Some(current) => incoming.timestamp >= current.timestamp,
        None => true,
    }
}

/// Open the backend selected by `config`
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    info!(
        "Opening {:?} coordination store, namespace {}",
        config.backend, config.namespace
    );
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::with_capacity(
            config.namespace.clone(),
            config.channel_capacity,
        ))),
        StoreBackend::Sled => {
            let path = config.path.as_ref().ok_or_else(|| {
                SwarmError::Configuration("store.path is required for the sled backend".into())
            })?;
            Ok(Arc::new(SledStore::open(
                path,
                config.namespace.clone(),
                config.channel_capacity,
            )?))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(config).await?)),
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(SwarmError::Configuration(
            "redis backend requires the `redis` feature".into(),
        )),
    }
}
