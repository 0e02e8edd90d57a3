use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{check_batch, check_revision, newer_fact, CoordinationStore, Write};
use crate::core::errors::Result;
use crate::model::{Agent, SharedStateFact, SkillDescriptor, Subtask, Task};
use crate::pubsub::{Channel, Notification, NotificationHub, Subscription};

#[derive(Default)]
struct Records {
    tasks: HashMap<String, Task>,
    subtasks: HashMap<String, Subtask>,
    agents: HashMap<String, Agent>,
}

impl Records {
    fn revision_of(&self, write: &Write) -> u64 {
        let id = write.id();
        match write {
            Write::Task(_) => self.tasks.get(id).map(|t| t.revision),
            Write::Subtask(_) => self.subtasks.get(id).map(|s| s.revision),
            Write::Agent(_) => self.agents.get(id).map(|a| a.revision),
        }
        .unwrap_or(0)
    }

    fn apply(&mut self, write: Write) {
        match write.into_next() {
            Write::Task(task) => {
                self.tasks.insert(task.id.clone(), task);
            }
            Write::Subtask(subtask) => {
                self.subtasks.insert(subtask.id.clone(), subtask);
            }
            Write::Agent(agent) => {
                self.agents.insert(agent.id.clone(), agent);
            }
        }
    }
}

/// In-process store for a single coordinator process and for tests
pub struct MemoryStore {
    namespace: String,
    records: Mutex<Records>,
    facts: DashMap<String, SharedStateFact>,
    skills: DashMap<String, Vec<SkillDescriptor>>,
    hub: NotificationHub,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_capacity(namespace, 256)
    }

    pub fn with_capacity(namespace: impl Into<String>, channel_capacity: usize) -> Self {
        Self {
            namespace: namespace.into(),
            records: Mutex::new(Records::default()),
            facts: DashMap::new(),
            skills: DashMap::new(),
            hub: NotificationHub::new(channel_capacity),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("swarm")
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        check_batch(&writes)?;
        let mut records = self.records.lock().await;
        for write in &writes {
            check_revision(write, records.revision_of(write))?;
        }
        debug!("Committing {} record(s)", writes.len());
        for write in writes {
            records.apply(write);
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.records.lock().await.tasks.get(id).cloned())
    }

    async fn get_subtask(&self, id: &str) -> Result<Option<Subtask>> {
        Ok(self.records.lock().await.subtasks.get(id).cloned())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.records.lock().await.agents.get(id).cloned())
    }

    async fn tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.records.lock().await.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn subtasks_of(&self, task_id: &str) -> Result<Vec<Subtask>> {
        let records = self.records.lock().await;
        let mut subtasks: Vec<Subtask> = records
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subtasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subtasks)
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.records.lock().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn assigned_to(&self, agent_id: &str) -> Result<Vec<Subtask>> {
        let records = self.records.lock().await;
        Ok(records
            .subtasks
            .values()
            .filter(|s| s.assigned_agent.as_deref() == Some(agent_id))
            .cloned()
            .collect())
    }

    async fn put_fact(&self, fact: SharedStateFact) -> Result<()> {
        let mut entry = self.facts.entry(fact.key.clone()).or_insert_with(|| fact.clone());
        if newer_fact(Some(entry.value()), &fact) {
            *entry = fact;
        }
        Ok(())
    }

    async fn get_fact(&self, key: &str) -> Result<Option<SharedStateFact>> {
        Ok(self.facts.get(key).map(|f| f.value().clone()))
    }

    async fn facts(&self) -> Result<Vec<SharedStateFact>> {
        let mut facts: Vec<SharedStateFact> =
            self.facts.iter().map(|f| f.value().clone()).collect();
        facts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(facts)
    }

    async fn put_skills(&self, agent_id: &str, skills: Vec<SkillDescriptor>) -> Result<()> {
        self.skills.insert(agent_id.to_string(), skills);
        Ok(())
    }

    async fn skills(&self, agent_id: &str) -> Result<Vec<SkillDescriptor>> {
        Ok(self
            .skills
            .get(agent_id)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &Channel, notification: Notification) -> Result<()> {
        self.hub.publish(&channel.name(&self.namespace), notification);
        Ok(())
    }

    async fn subscribe(&self, channel: &Channel) -> Result<Subscription> {
        Ok(self.hub.subscribe(&channel.name(&self.namespace)))
    }
}
