//! Skill registry
//!
//! Catalogue of the skills each agent offers, written at registration and
//! consulted by the scheduler for capability matching and by the planner
//! for parameter schemas.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::errors::Result;
use crate::model::{AgentId, AgentStatus, SkillDescriptor};
use crate::storage::CoordinationStore;

/// Store-backed skill catalogue with a local read cache
#[derive(Clone)]
pub struct SkillRegistry {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<RwLock<HashMap<AgentId, Vec<SkillDescriptor>>>>,
}

impl SkillRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the catalogue of one agent
    pub async fn register(&self, agent_id: &str, descriptors: Vec<SkillDescriptor>) -> Result<()> {
        info!(
            "Registering {} skill(s) for agent {}",
            descriptors.len(),
            agent_id
        );
        self.store.put_skills(agent_id, descriptors.clone()).await?;
        self.cache
            .write()
            .await
            .insert(agent_id.to_string(), descriptors);
        Ok(())
    }

    /// Drop cached entries so the next lookup reads the store
    pub async fn invalidate(&self, agent_id: Option<&str>) {
        let mut cache = self.cache.write().await;
        match agent_id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
    }

    pub async fn descriptors(&self, agent_id: &str) -> Result<Vec<SkillDescriptor>> {
        if let Some(cached) = self.cache.read().await.get(agent_id) {
            return Ok(cached.clone());
        }
        let descriptors = self.store.skills(agent_id).await?;
        debug!(
            "Loaded {} skill(s) for agent {} from store",
            descriptors.len(),
            agent_id
        );
        self.cache
            .write()
            .await
            .insert(agent_id.to_string(), descriptors.clone());
        Ok(descriptors)
    }

    pub async fn lookup(&self, agent_id: &str, skill: &str) -> Result<Option<SkillDescriptor>> {
        Ok(self
            .descriptors(agent_id)
            .await?
            .into_iter()
            .find(|d| d.skill == skill))
    }

    /// Skill name to the agents whose published descriptors offer it.
    /// Offline agents are left out.
    pub async fn catalogue(&self) -> Result<BTreeMap<String, BTreeSet<AgentId>>> {
        let mut catalogue: BTreeMap<String, BTreeSet<AgentId>> = BTreeMap::new();
        for agent in self.store.agents().await? {
            if agent.status == AgentStatus::Offline {
                continue;
            }
            for descriptor in self.descriptors(&agent.id).await? {
                catalogue
                    .entry(descriptor.skill)
                    .or_default()
                    .insert(agent.id.clone());
            }
        }
        Ok(catalogue)
    }

    /// Parameter schema per skill, taken from the first agent that publishes one
    pub async fn schemas(&self) -> Result<HashMap<String, Value>> {
        let mut schemas = HashMap::new();
        for (skill, agents) in self.catalogue().await? {
            for agent_id in agents {
                let schema = self
                    .lookup(&agent_id, &skill)
                    .await?
                    .and_then(|d| d.parameter_schema);
                if let Some(schema) = schema {
                    schemas.insert(skill.clone(), schema);
                    break;
                }
            }
        }
        Ok(schemas)
    }
}
