use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::{check_batch, check_revision, newer_fact, CoordinationStore, Write};
use crate::core::errors::{Result, SwarmError};
use crate::model::{Agent, SharedStateFact, SkillDescriptor, Subtask, Task};
use crate::pubsub::{Channel, Notification, NotificationHub, Subscription};

/// Only the revision of a stored record, for conflict checks
#[derive(Deserialize)]
struct StoredRevision {
    revision: u64,
}

/// Persistent store on sled. Records survive a coordinator restart;
/// notifications are process-local.
pub struct SledStore {
    namespace: String,
    db: Db,
    tasks: Tree,
    subtasks: Tree,
    agents: Tree,
    facts: Tree,
    skills: Tree,
    hub: NotificationHub,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>, namespace: impl Into<String>, channel_capacity: usize) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db, namespace, channel_capacity)
    }

    /// Build on an already opened database, one set of trees per namespace
    pub fn from_db(db: Db, namespace: impl Into<String>, channel_capacity: usize) -> Result<Self> {
        let namespace = namespace.into();
        let tree = |name: &str| db.open_tree(format!("{}:{}", namespace, name));
        let store = Self {
            tasks: tree("tasks")?,
            subtasks: tree("subtasks")?,
            agents: tree("agents")?,
            facts: tree("facts")?,
            skills: tree("skills")?,
            hub: NotificationHub::new(channel_capacity),
            namespace,
            db,
        };
        info!(
            "Opened sled store for namespace {} ({} tasks, {} agents)",
            store.namespace,
            store.tasks.len(),
            store.agents.len()
        );
        Ok(store)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>> {
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let (_, bytes) = item?;
            values.push(Self::decode(&bytes)?);
        }
        Ok(values)
    }
}

#[async_trait]
impl CoordinationStore for SledStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        check_batch(&writes)?;
        let mut encoded = Vec::with_capacity(writes.len());
        for write in &writes {
            encoded.push(write.encode_next()?);
        }

        let outcome = (&self.tasks, &self.subtasks, &self.agents).transaction(
            |(tasks, subtasks, agents)| {
                for (write, bytes) in writes.iter().zip(encoded.iter()) {
                    let tree = match write {
                        Write::Task(_) => tasks,
                        Write::Subtask(_) => subtasks,
                        Write::Agent(_) => agents,
                    };
                    let key = write.id().as_bytes();
                    let found = match tree.get(key)? {
                        Some(current) => serde_json::from_slice::<StoredRevision>(&current)
                            .map_err(|e| ConflictableTransactionError::Abort(SwarmError::from(e)))?
                            .revision,
                        None => 0,
                    };
                    check_revision(write, found).map_err(ConflictableTransactionError::Abort)?;
                    tree.insert(key, bytes.as_slice())?;
                }
                Ok(())
            },
        );

        match outcome {
            Ok(()) => {
                debug!("Committed {} record(s) to sled", writes.len());
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(SwarmError::Database(e)),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Self::get(&self.tasks, id)
    }

    async fn get_subtask(&self, id: &str) -> Result<Option<Subtask>> {
        Self::get(&self.subtasks, id)
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Self::get(&self.agents, id)
    }

    async fn tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = Self::scan(&self.tasks)?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn subtasks_of(&self, task_id: &str) -> Result<Vec<Subtask>> {
        // Subtask ids are `{task_id}:{local_id}`, so a prefix scan finds them
        let prefix = format!("{}:", task_id);
        let mut subtasks = Vec::new();
        for item in self.subtasks.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let subtask: Subtask = Self::decode(&bytes)?;
            if subtask.task_id == task_id {
                subtasks.push(subtask);
            }
        }
        Ok(subtasks)
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        Self::scan(&self.agents)
    }

    async fn assigned_to(&self, agent_id: &str) -> Result<Vec<Subtask>> {
        let subtasks: Vec<Subtask> = Self::scan(&self.subtasks)?;
        Ok(subtasks
            .into_iter()
            .filter(|s| s.assigned_agent.as_deref() == Some(agent_id))
            .collect())
    }

    async fn put_fact(&self, fact: SharedStateFact) -> Result<()> {
        let encoded = serde_json::to_vec(&fact)?;
        let key = fact.key.as_bytes();
        // Retry the compare-and-swap until our value lands or a newer one wins
        loop {
            let current = self.facts.get(key)?;
            if let Some(bytes) = &current {
                let existing: SharedStateFact = Self::decode(bytes)?;
                if !newer_fact(Some(&existing), &fact) {
                    return Ok(());
                }
            }
            match self
                .facts
                .compare_and_swap(key, current, Some(encoded.as_slice()))?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    async fn get_fact(&self, key: &str) -> Result<Option<SharedStateFact>> {
        Self::get(&self.facts, key)
    }

    async fn facts(&self) -> Result<Vec<SharedStateFact>> {
        Self::scan(&self.facts)
    }

    async fn put_skills(&self, agent_id: &str, skills: Vec<SkillDescriptor>) -> Result<()> {
        self.skills
            .insert(agent_id.as_bytes(), serde_json::to_vec(&skills)?)?;
        Ok(())
    }

    async fn skills(&self, agent_id: &str) -> Result<Vec<SkillDescriptor>> {
        Ok(Self::get(&self.skills, agent_id)?.unwrap_or_default())
    }

    async fn publish(&self, channel: &Channel, notification: Notification) -> Result<()> {
        self.hub.publish(&channel.name(&self.namespace), notification);
        Ok(())
    }

    async fn subscribe(&self, channel: &Channel) -> Result<Subscription> {
        Ok(self.hub.subscribe(&channel.name(&self.namespace)))
    }
}
