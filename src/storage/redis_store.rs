//! Networked coordination store on Redis.
//!
//! Records are JSON strings. The revision-checked commit runs as one Lua
//! script so it is atomic on the server; notifications use PUBLISH.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{check_batch, CoordinationStore, Write};
use crate::core::config::StoreConfig;
use crate::core::errors::{Result, SwarmError};
use crate::model::{Agent, SharedStateFact, SkillDescriptor, Subtask, Task};
use crate::pubsub::{Channel, Notification, Subscription};

/// KEYS[1..n] records, KEYS[n+1..2n] index sets.
/// ARGV[1] n, ARGV[2..n+1] observed revisions, then encoded records, then ids.
const COMMIT_SCRIPT: &str = r#"
local n = tonumber(ARGV[1])
for i = 1, n do
  local current = redis.call('GET', KEYS[i])
  local found = 0
  if current then found = tonumber(cjson.decode(current)['revision']) end
  if found ~= tonumber(ARGV[1 + i]) then return {i, found} end
end
for i = 1, n do
  redis.call('SET', KEYS[i], ARGV[1 + n + i])
  redis.call('SADD', KEYS[n + i], ARGV[1 + 2 * n + i])
end
return {0, 0}
"#;

/// KEYS[1] fact values, KEYS[2] fact timestamps. ARGV key, value, micros.
const PUT_FACT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if current and tonumber(current) > tonumber(ARGV[3]) then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

fn redis_error(e: redis::RedisError) -> SwarmError {
    SwarmError::backend(format!("redis: {}", e))
}

pub struct RedisStore {
    namespace: String,
    client: redis::Client,
    conn: ConnectionManager,
    commit_script: Script,
    fact_script: Script,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url()).map_err(redis_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(redis_error)?;
        info!(
            "Connected to redis at {}:{} (namespace {})",
            config.host, config.port, config.namespace
        );
        Ok(Self {
            namespace: config.namespace.clone(),
            client,
            conn,
            commit_script: Script::new(COMMIT_SCRIPT),
            fact_script: Script::new(PUT_FACT_SCRIPT),
        })
    }

    fn record_key(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.namespace, kind, id)
    }

    fn index_key(&self, write: &Write) -> String {
        match write {
            Write::Task(_) => format!("{}:tasks", self.namespace),
            Write::Subtask(subtask) => format!("{}:task:{}:subtasks", self.namespace, subtask.task_id),
            Write::Agent(_) => format!("{}:agents", self.namespace),
        }
    }

    async fn load<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(redis_error)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_indexed<T: DeserializeOwned>(&self, kind: &str, index: String) -> Result<Vec<T>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.smembers(&index).await.map_err(redis_error)?;
        ids.sort();
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = self.load(self.record_key(kind, &id)).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        check_batch(&writes)?;
        let mut invocation = self.commit_script.prepare_invoke();
        for write in &writes {
            invocation.key(self.record_key(write.kind(), write.id()));
        }
        for write in &writes {
            invocation.key(self.index_key(write));
        }
        invocation.arg(writes.len());
        for write in &writes {
            invocation.arg(write.observed_revision());
        }
        for write in &writes {
            invocation.arg(write.encode_next()?);
        }
        for write in &writes {
            invocation.arg(write.id());
        }

        let mut conn = self.conn.clone();
        let (failed, found): (usize, u64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if failed == 0 {
            debug!("Committed {} record(s) to redis", writes.len());
            return Ok(());
        }
        let write = writes
            .get(failed - 1)
            .ok_or_else(|| SwarmError::internal("commit script returned an unknown index"))?;
        Err(SwarmError::StoreConflict {
            key: write.key(),
            expected: write.observed_revision(),
            found,
        })
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.load(self.record_key("task", id)).await
    }

    async fn get_subtask(&self, id: &str) -> Result<Option<Subtask>> {
        self.load(self.record_key("subtask", id)).await
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        self.load(self.record_key("agent", id)).await
    }

    async fn tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .load_indexed("task", format!("{}:tasks", self.namespace))
            .await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn subtasks_of(&self, task_id: &str) -> Result<Vec<Subtask>> {
        self.load_indexed(
            "subtask",
            format!("{}:task:{}:subtasks", self.namespace, task_id),
        )
        .await
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        self.load_indexed("agent", format!("{}:agents", self.namespace))
            .await
    }

    async fn put_fact(&self, fact: SharedStateFact) -> Result<()> {
        let encoded = serde_json::to_string(&fact)?;
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .fact_script
            .key(format!("{}:facts", self.namespace))
            .key(format!("{}:facts:ts", self.namespace))
            .arg(&fact.key)
            .arg(encoded)
            .arg(fact.timestamp.timestamp_micros())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if applied == 0 {
            debug!("Fact {} not written, a newer value exists", fact.key);
        }
        Ok(())
    }

    async fn get_fact(&self, key: &str) -> Result<Option<SharedStateFact>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(format!("{}:facts", self.namespace), key)
            .await
            .map_err(redis_error)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn facts(&self) -> Result<Vec<SharedStateFact>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, String)> = conn
            .hgetall(format!("{}:facts", self.namespace))
            .await
            .map_err(redis_error)?;
        let mut facts = Vec::with_capacity(raw.len());
        for (_, value) in raw {
            facts.push(serde_json::from_str::<SharedStateFact>(&value)?);
        }
        facts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(facts)
    }

    async fn put_skills(&self, agent_id: &str, skills: Vec<SkillDescriptor>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                format!("{}:skills", self.namespace),
                agent_id,
                serde_json::to_string(&skills)?,
            )
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn skills(&self, agent_id: &str) -> Result<Vec<SkillDescriptor>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(format!("{}:skills", self.namespace), agent_id)
            .await
            .map_err(redis_error)?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &Channel, notification: Notification) -> Result<()> {
        let payload = serde_json::to_string(&notification)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(channel.name(&self.namespace), payload)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &Channel) -> Result<Subscription> {
        let name = channel.name(&self.namespace);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_error)?;
        pubsub.subscribe(&name).await.map_err(redis_error)?;
        debug!("Subscribed to redis channel {}", name);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to read notification payload: {}", e);
                    return None;
                }
            };
            match serde_json::from_str::<Notification>(&payload) {
                Ok(notification) => Some(notification),
                Err(e) => {
                    warn!("Failed to decode notification: {}", e);
                    None
                }
            }
        });
        Ok(Subscription::new(name, stream.boxed()))
    }
}
