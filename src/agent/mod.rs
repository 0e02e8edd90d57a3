//! Agent runtime: the robot-side loop.
//!
//! An agent registers its skills, heartbeats, picks up subtasks assigned to
//! it, invokes the matching skill endpoint under a timeout and reports the
//! outcome back through the store. It never schedules anything itself.

pub mod skill;

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::{AgentConfig, SwarmConfig};
use crate::core::errors::{Result, SwarmError};
use crate::model::{
    Agent, AgentId, AgentStatus, Embodiment, FailureKind, FailureReason, SharedStateFact, Subtask,
    SubtaskStatus,
};
use crate::pubsub::{Channel, Notification, Subscription};
use crate::registry::SkillRegistry;
use crate::storage::{CoordinationStore, Write};

pub use skill::{FactUpdate, FnSkill, SkillEndpoint, SkillOutcome, SkillSet};

/// State key whose value also becomes the agent's reported location
const POSITION_KEY: &str = "position";

/// Returned by [`AgentRuntime::register`]
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationAck {
    pub agent_id: AgentId,
    /// Channel name the agent receives assignments on
    pub assignment_channel: String,
    pub registration_channel: String,
}

/// How one attempt ended on the agent side
#[derive(Debug)]
enum Attempt {
    Finished(SkillOutcome),
    Failed(FailureReason),
    /// The scheduler withdrew the subtask mid-flight
    Aborted,
}

#[derive(Clone)]
pub struct AgentRuntime {
    id: AgentId,
    embodiment: Embodiment,
    location: Option<String>,
    skills: SkillSet,
    store: Arc<dyn CoordinationStore>,
    registry: SkillRegistry,
    config: AgentConfig,
    cas_retry_limit: u32,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AgentRuntime {
    pub fn new(
        id: impl Into<AgentId>,
        embodiment: Embodiment,
        skills: SkillSet,
        store: Arc<dyn CoordinationStore>,
        config: &SwarmConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            embodiment,
            location: None,
            skills,
            registry: SkillRegistry::new(store.clone()),
            store,
            config: config.agent.clone(),
            cas_retry_limit: config.scheduler.cas_retry_limit.max(1),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish the skill catalogue and upsert the agent record as Idle.
    ///
    /// Subtasks still recorded as in flight on this agent belong to a
    /// previous run and are reported failed so the scheduler can recover
    /// them.
    pub async fn register(&self) -> Result<RegistrationAck> {
        self.registry
            .register(&self.id, self.skills.descriptors(&self.id))
            .await?;

        let mut registered = false;
        for _ in 0..self.cas_retry_limit {
            let now = Utc::now();
            let mut agent = match self.store.get_agent(&self.id).await? {
                Some(mut existing) => {
                    existing.embodiment = self.embodiment;
                    existing.capabilities = self.skills.names().into_iter().collect();
                    existing
                }
                None => Agent::new(&self.id, self.embodiment, self.skills.names()),
            };
            agent.status = AgentStatus::Idle;
            agent.current_subtask = None;
            agent.last_heartbeat = now;
            if self.location.is_some() {
                agent.location = self.location.clone();
            }

            let mut writes = Vec::new();
            for subtask in self.store.assigned_to(&self.id).await? {
                if !subtask.status.is_in_flight() {
                    continue;
                }
                let mut stale = subtask;
                stale.status = SubtaskStatus::Failed;
                stale.failure = Some(FailureReason::new(
                    FailureKind::HeartbeatLost,
                    format!("agent {} restarted during execution", self.id),
                ));
                stale.touch();
                writes.push(Write::Subtask(stale));
            }
            writes.push(Write::Agent(agent));

            match self.store.commit(writes).await {
                Ok(()) => {
                    registered = true;
                    break;
                }
                Err(e) if e.is_conflict() => {
                    debug!("Agent {} record changed during registration: {}", self.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        if !registered {
            return Err(SwarmError::internal(format!(
                "registration of agent {} kept conflicting",
                self.id
            )));
        }

        info!(
            "Agent {} registered with skills {:?}",
            self.id,
            self.skills.names()
        );
        self.publish(
            &Channel::Registration,
            Notification::AgentRegistered {
                agent_id: self.id.clone(),
            },
        )
        .await;
        self.publish(
            &Channel::Scheduler,
            Notification::AgentStatus {
                agent_id: self.id.clone(),
                status: AgentStatus::Idle,
            },
        )
        .await;

        Ok(RegistrationAck {
            agent_id: self.id.clone(),
            assignment_channel: Channel::Agent(self.id.clone()).name(self.store.namespace()),
            registration_channel: Channel::Registration.name(self.store.namespace()),
        })
    }

    /// Register, then run the heartbeat and execution loops in the background
    pub async fn start(&self) -> Result<AgentHandle> {
        self.register().await?;
        let heartbeat = {
            let runtime = self.clone();
            tokio::spawn(async move { runtime.heartbeat_loop().await })
        };
        let worker = {
            let runtime = self.clone();
            tokio::spawn(async move { runtime.run().await })
        };
        Ok(AgentHandle {
            runtime: self.clone(),
            tasks: vec![heartbeat, worker],
        })
    }

    async fn publish(&self, channel: &Channel, notification: Notification) {
        if let Err(e) = self.store.publish(channel, notification).await {
            warn!("Agent {} failed to publish on {:?}: {}", self.id, channel, e);
        }
    }

    /// Refresh `last_heartbeat`. Re-registers when the scheduler already
    /// declared this agent Offline.
    pub async fn heartbeat(&self) -> Result<()> {
        for _ in 0..self.cas_retry_limit {
            let Some(mut agent) = self.store.get_agent(&self.id).await? else {
                self.register().await?;
                return Ok(());
            };
            if agent.status == AgentStatus::Offline {
                info!("Agent {} was marked Offline, registering again", self.id);
                self.register().await?;
                return Ok(());
            }
            agent.last_heartbeat = Utc::now();
            match self.store.commit(vec![Write::Agent(agent)]).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::internal(format!(
            "heartbeat of agent {} kept conflicting",
            self.id
        )))
    }

    async fn heartbeat_loop(self) {
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.heartbeat_interval();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.heartbeat().await {
                warn!("Heartbeat failed for agent {}: {}", self.id, e);
            }
        }
        debug!("Heartbeat loop of agent {} stopped", self.id);
    }

    /// Execution loop. Finishes the subtask in hand before honouring a
    /// shutdown request.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut inbox = match self.store.subscribe(&Channel::Agent(self.id.clone())).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Agent {} inbox unavailable, polling only: {}", self.id, e);
                None
            }
        };

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if let Err(e) = self.reconcile().await {
                warn!("Agent {} could not reconcile its status: {}", self.id, e);
            }
            match self.next_assignment().await {
                Ok(Some(subtask)) => {
                    self.execute(subtask, &mut inbox).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Agent {} failed to read assignments: {}", self.id, e),
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                Some(notification) = next_notification(&mut inbox) => {
                    debug!("Agent {} woken by {:?}", self.id, notification);
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("Agent {} stopped", self.id);
    }

    /// Oldest subtask assigned to this agent and not yet started
    async fn next_assignment(&self) -> Result<Option<Subtask>> {
        Ok(self
            .store
            .assigned_to(&self.id)
            .await?
            .into_iter()
            .filter(|s| s.status == SubtaskStatus::Assigned)
            .min_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id))))
    }

    /// Go back to Idle when the subtask this agent is marked busy with was
    /// withdrawn before it could report.
    async fn reconcile(&self) -> Result<()> {
        let Some(agent) = self.store.get_agent(&self.id).await? else {
            return Ok(());
        };
        let Some(current) = agent.current_subtask.clone() else {
            return Ok(());
        };
        let still_ours = match self.store.get_subtask(&current).await? {
            Some(subtask) => subtask.assigned_agent.as_deref() == Some(self.id.as_str()),
            None => false,
        };
        if !still_ours {
            self.release_self(&current).await?;
        }
        Ok(())
    }

    async fn release_self(&self, subtask_id: &str) -> Result<()> {
        for _ in 0..self.cas_retry_limit {
            let Some(mut agent) = self.store.get_agent(&self.id).await? else {
                return Ok(());
            };
            if agent.current_subtask.as_deref() != Some(subtask_id) {
                return Ok(());
            }
            agent.current_subtask = None;
            if agent.status != AgentStatus::Offline {
                agent.status = AgentStatus::Idle;
            }
            match self.store.commit(vec![Write::Agent(agent)]).await {
                Ok(()) => {
                    debug!("Agent {} released from withdrawn subtask {}", self.id, subtask_id);
                    self.publish(
                        &Channel::Scheduler,
                        Notification::AgentStatus {
                            agent_id: self.id.clone(),
                            status: AgentStatus::Idle,
                        },
                    )
                    .await;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::internal(format!(
            "agent {} could not release subtask {}",
            self.id, subtask_id
        )))
    }

    /// Assigned→Running, guarded by ownership. `None` when the subtask was
    /// withdrawn first.
    async fn claim(&self, subtask_id: &str) -> Result<Option<Subtask>> {
        for _ in 0..self.cas_retry_limit {
            let Some(subtask) = self.store.get_subtask(subtask_id).await? else {
                return Ok(None);
            };
            if subtask.status != SubtaskStatus::Assigned
                || subtask.assigned_agent.as_deref() != Some(self.id.as_str())
            {
                return Ok(None);
            }
            let mut running = subtask;
            running.status = SubtaskStatus::Running;
            running.touch();
            match self.store.commit(vec![Write::Subtask(running.clone())]).await {
                Ok(()) => {
                    // Commit bumped the stored revision
                    running.revision += 1;
                    return Ok(Some(running));
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn execute(&self, assigned: Subtask, inbox: &mut Option<Subscription>) {
        let running = match self.claim(&assigned.id).await {
            Ok(Some(running)) => running,
            Ok(None) => {
                debug!("Subtask {} withdrawn before agent {} started", assigned.id, self.id);
                return;
            }
            Err(e) => {
                error!("Agent {} could not start subtask {}: {}", self.id, assigned.id, e);
                return;
            }
        };
        info!(
            "Agent {} running subtask {} ({}), attempt {}",
            self.id, running.id, running.skill, running.attempts
        );
        self.publish(
            &Channel::Task(running.task_id.clone()),
            Notification::SubtaskStatus {
                task_id: running.task_id.clone(),
                subtask_id: running.id.clone(),
                status: SubtaskStatus::Running,
            },
        )
        .await;

        let attempt = self.attempt(&running, inbox).await;
        if let Err(e) = self.report(&running, attempt).await {
            error!("Agent {} failed to report subtask {}: {}", self.id, running.id, e);
        }
    }

    async fn attempt(&self, subtask: &Subtask, inbox: &mut Option<Subscription>) -> Attempt {
        let probability = self.config.failure_probability;
        if probability > 0.0 && fastrand::f64() < probability {
            return Attempt::Failed(FailureReason::new(
                FailureKind::InjectedFault,
                format!("injected fault in {}", subtask.skill),
            ));
        }
        let Some(skill) = self.skills.get(&subtask.skill) else {
            return Attempt::Failed(FailureReason::new(
                FailureKind::Execution,
                format!("agent {} has no skill '{}'", self.id, subtask.skill),
            ));
        };

        let timeout = self.config.skill_timeout(&subtask.skill);
        let invocation = tokio::time::timeout(timeout, skill.invoke(&subtask.parameters));
        tokio::pin!(invocation);

        loop {
            tokio::select! {
                result = &mut invocation => {
                    return match result {
                        Ok(Ok(outcome)) => Attempt::Finished(outcome),
                        Ok(Err(e)) => Attempt::Failed(failure_from_error(&subtask.skill, e)),
                        Err(_) => {
                            skill.abort().await;
                            let e = SwarmError::SkillTimeout {
                                skill: subtask.skill.clone(),
                                timeout,
                            };
                            Attempt::Failed(FailureReason::new(FailureKind::Timeout, e.to_string()))
                        }
                    };
                }
                Some(notification) = next_notification(inbox) => {
                    if let Notification::Cancel { subtask_id, .. } = notification {
                        if subtask_id == subtask.id {
                            info!("Agent {} aborting subtask {}", self.id, subtask.id);
                            skill.abort().await;
                            return Attempt::Aborted;
                        }
                    }
                }
            }
        }
    }

    /// Write the terminal status, conditional on the subtask still being
    /// ours and Running. A rejected report only frees the agent.
    async fn report(&self, running: &Subtask, attempt: Attempt) -> Result<()> {
        let outcome = match attempt {
            Attempt::Aborted => return self.release_self(&running.id).await,
            Attempt::Finished(outcome) if outcome.success => Ok(outcome),
            Attempt::Finished(outcome) => {
                let kind = if outcome.replan {
                    FailureKind::PlanningLevel
                } else {
                    FailureKind::Execution
                };
                Err(FailureReason::new(kind, outcome.message))
            }
            Attempt::Failed(reason) => Err(reason),
        };

        for _ in 0..self.cas_retry_limit {
            let current = self.store.get_subtask(&running.id).await?;
            let Some(mut subtask) = current.filter(|s| {
                s.status == SubtaskStatus::Running
                    && s.assigned_agent.as_deref() == Some(self.id.as_str())
            }) else {
                info!(
                    "Report for subtask {} by agent {} rejected, subtask was withdrawn",
                    running.id, self.id
                );
                return self.release_self(&running.id).await;
            };
            let Some(mut agent) = self.store.get_agent(&self.id).await? else {
                return Err(SwarmError::not_found("agent", self.id.clone()));
            };

            let now = Utc::now();
            agent.last_heartbeat = now;
            match &outcome {
                Ok(done) => {
                    subtask.status = SubtaskStatus::Done;
                    subtask.result = Some(done.result.clone().unwrap_or_else(|| {
                        serde_json::json!({ "message": done.message })
                    }));
                    subtask.done_at = Some(now);
                    if let Some(position) = done.state.get(POSITION_KEY) {
                        agent.location = Some(location_name(position));
                    }
                }
                Err(reason) => {
                    subtask.status = SubtaskStatus::Failed;
                    subtask.failure = Some(reason.clone());
                    if agent.status == AgentStatus::Busy {
                        agent.status = AgentStatus::Error;
                    }
                }
            }
            subtask.touch();
            let status = subtask.status;

            match self
                .store
                .commit(vec![Write::Subtask(subtask), Write::Agent(agent)])
                .await
            {
                Ok(()) => {
                    match &outcome {
                        Ok(done) => {
                            info!("Agent {} finished subtask {}: {}", self.id, running.id, done.message);
                            self.record_state(done).await;
                        }
                        Err(reason) => {
                            warn!("Agent {} failed subtask {}: {}", self.id, running.id, reason);
                        }
                    }
                    self.publish(
                        &Channel::Scheduler,
                        Notification::Reported {
                            subtask_id: running.id.clone(),
                            agent_id: self.id.clone(),
                            status,
                        },
                    )
                    .await;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Conflict while reporting subtask {}: {}", running.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::internal(format!(
            "report of subtask {} kept conflicting",
            running.id
        )))
    }

    /// Agent-scoped facts for the state a skill reported, then its edits to
    /// world facts. Edits read the current value and write it back under
    /// last-writer-wins.
    async fn record_state(&self, outcome: &SkillOutcome) {
        for (key, value) in &outcome.state {
            let fact = SharedStateFact::new(format!("{}.{}", self.id, key), value.clone(), &self.id);
            if let Err(e) = self.store.put_fact(fact).await {
                warn!("Agent {} failed to record {}: {}", self.id, key, e);
            }
        }
        for (key, update) in &outcome.facts {
            if let Err(e) = self.update_fact(key, update).await {
                warn!("Agent {} failed to update fact {}: {}", self.id, key, e);
            }
        }
    }

    async fn update_fact(&self, key: &str, update: &FactUpdate) -> Result<()> {
        let current = self.store.get_fact(key).await?.map(|fact| fact.value);
        let fact = SharedStateFact::new(key, update.apply(current), &self.id);
        debug!("Agent {} sets {} to {}", self.id, key, fact.value);
        self.store.put_fact(fact).await
    }

    /// Mark this agent Offline. Subtasks it still owns are reported failed
    /// so the scheduler reassigns them.
    pub async fn deregister(&self) -> Result<()> {
        for _ in 0..self.cas_retry_limit {
            let Some(mut agent) = self.store.get_agent(&self.id).await? else {
                return Ok(());
            };
            let mut writes = Vec::new();
            for subtask in self.store.assigned_to(&self.id).await? {
                if !subtask.status.is_in_flight() {
                    continue;
                }
                let mut orphan = subtask;
                orphan.status = SubtaskStatus::Failed;
                orphan.failure = Some(FailureReason::new(
                    FailureKind::HeartbeatLost,
                    format!("agent {} shut down", self.id),
                ));
                orphan.touch();
                writes.push(Write::Subtask(orphan));
            }
            agent.status = AgentStatus::Offline;
            writes.push(Write::Agent(agent));
            match self.store.commit(writes).await {
                Ok(()) => {
                    info!("Agent {} deregistered", self.id);
                    self.publish(
                        &Channel::Scheduler,
                        Notification::AgentStatus {
                            agent_id: self.id.clone(),
                            status: AgentStatus::Offline,
                        },
                    )
                    .await;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::internal(format!(
            "could not deregister agent {}",
            self.id
        )))
    }
}

/// Failure for an endpoint that returned an error instead of an outcome
fn failure_from_error(skill: &str, error: SwarmError) -> FailureReason {
    match error {
        SwarmError::SkillTimeout { .. } => FailureReason::new(FailureKind::Timeout, error.to_string()),
        SwarmError::Planning { .. } => {
            FailureReason::new(FailureKind::PlanningLevel, error.to_string())
        }
        SwarmError::SkillExecution { .. } => {
            FailureReason::new(FailureKind::Execution, error.to_string())
        }
        other => {
            let wrapped = SwarmError::SkillExecution {
                skill: skill.to_string(),
                message: other.to_string(),
            };
            FailureReason::new(FailureKind::Execution, wrapped.to_string())
        }
    }
}

fn location_name(value: &Value) -> String {
    match value {
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

async fn next_notification(subscription: &mut Option<Subscription>) -> Option<Notification> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Background loops of a started agent
pub struct AgentHandle {
    runtime: AgentRuntime,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    /// Finish the subtask in hand, stop both loops and go Offline
    pub async fn stop(self) -> Result<()> {
        self.runtime.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Agent {} loop ended abnormally: {}", self.runtime.id, e);
            }
        }
        self.runtime.deregister().await
    }

    /// Stop abruptly without touching the store, as a crashed robot would
    pub fn kill(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SkillDescriptor, Task};
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn skills() -> SkillSet {
        SkillSet::new()
            .with(FnSkill::new("navigate_to_target", |params: Value| async move {
                let target = params["target"].as_str().unwrap_or("home").to_string();
                Ok(SkillOutcome::success(format!("arrived at {}", target))
                    .with_state(POSITION_KEY, json!(target)))
            }))
            .with(FnSkill::new("grasp_object", |_| async {
                Ok(SkillOutcome::failure("gripper jammed"))
            }))
            .with(FnSkill::new("wipe_table", |_| async {
                Err(SwarmError::backend("sponge driver offline"))
            }))
            .with(FnSkill::new("wait_forever", |_| async {
                std::future::pending::<()>().await;
                Ok(SkillOutcome::success("unreachable"))
            }))
    }

    fn runtime(store: Arc<dyn CoordinationStore>) -> AgentRuntime {
        let mut config = SwarmConfig::development();
        config.agent.skill_timeouts_ms.insert("wait_forever".to_string(), 50);
        AgentRuntime::new("robot_1", Embodiment::SingleArm, skills(), store, &config)
            .with_location("dock")
    }

    /// Put a subtask in the Assigned state the way the scheduler would
    async fn assign(store: &Arc<dyn CoordinationStore>, skill: &str, params: Value) -> Subtask {
        let mut subtask = Subtask::new("t1", skill, skill, skill, params);
        subtask.status = SubtaskStatus::Assigned;
        subtask.assigned_agent = Some("robot_1".to_string());
        subtask.attempts = 1;
        let mut agent = store.get_agent("robot_1").await.unwrap().unwrap();
        agent.status = AgentStatus::Busy;
        agent.current_subtask = Some(subtask.id.clone());
        store
            .commit(vec![Write::Subtask(subtask.clone()), Write::Agent(agent)])
            .await
            .unwrap();
        store.get_subtask(&subtask.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_register_publishes_catalogue() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let ack = runtime(store.clone()).register().await.unwrap();
        assert_eq!(ack.assignment_channel, "test:agent:robot_1");

        let agent = store.get_agent("robot_1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.location.as_deref(), Some("dock"));
        assert!(agent.can_execute("grasp_object"));
        assert_eq!(store.skills("robot_1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_successful_execution_reports_done() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "navigate_to_target", json!({"target": "table"})).await;

        runtime.execute(subtask.clone(), &mut None).await;

        let reported = store.get_subtask(&subtask.id).await.unwrap().unwrap();
        assert_eq!(reported.status, SubtaskStatus::Done);
        assert!(reported.has_pending_report());
        assert!(reported.done_at.is_some());

        let agent = store.get_agent("robot_1").await.unwrap().unwrap();
        assert_eq!(agent.location.as_deref(), Some("table"));
        let fact = store.get_fact("robot_1.position").await.unwrap().unwrap();
        assert_eq!(fact.value, json!("table"));
    }

    #[tokio::test]
    async fn test_grasp_moves_object_out_of_its_receptacle() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        store
            .put_fact(SharedStateFact::new(
                "kitchenTable",
                json!({"type": "table", "contains": ["apple", "cup"]}),
                "scene",
            ))
            .await
            .unwrap();
        let grasp = FnSkill::new("grasp_object", |params: Value| async move {
            let object = params["object"].as_str().unwrap_or("object").to_string();
            Ok(SkillOutcome::success("grasped")
                .with_state("holding", json!(object))
                .with_fact("kitchenTable", FactUpdate::remove("contains", json!(object)))
                .with_fact(object, FactUpdate::field("on", json!("robot_1"))))
        });
        let runtime = AgentRuntime::new(
            "robot_1",
            Embodiment::DualArm,
            SkillSet::new().with(grasp),
            store.clone(),
            &SwarmConfig::development(),
        );
        runtime.register().await.unwrap();
        let subtask = assign(&store, "grasp_object", json!({"object": "apple"})).await;

        runtime.execute(subtask, &mut None).await;

        let table = store.get_fact("kitchenTable").await.unwrap().unwrap();
        assert_eq!(table.value, json!({"type": "table", "contains": ["cup"]}));
        assert_eq!(table.writer, "robot_1");
        let apple = store.get_fact("apple").await.unwrap().unwrap();
        assert_eq!(apple.value, json!({"on": "robot_1"}));
        let holding = store.get_fact("robot_1.holding").await.unwrap().unwrap();
        assert_eq!(holding.value, json!("apple"));
    }

    #[tokio::test]
    async fn test_failed_execution_marks_agent_error() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "grasp_object", json!({})).await;

        runtime.execute(subtask.clone(), &mut None).await;

        let reported = store.get_subtask(&subtask.id).await.unwrap().unwrap();
        assert_eq!(reported.status, SubtaskStatus::Failed);
        assert_eq!(reported.failure.unwrap().kind, FailureKind::Execution);
        let agent = store.get_agent("robot_1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_endpoint_error_becomes_execution_failure() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "wipe_table", json!({})).await;

        runtime.execute(subtask.clone(), &mut None).await;

        let failure = store.get_subtask(&subtask.id).await.unwrap().unwrap().failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.message.starts_with("Skill 'wipe_table' failed"));
        assert!(failure.message.contains("sponge driver offline"));
    }

    #[tokio::test]
    async fn test_skill_timeout() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "wait_forever", json!({})).await;

        runtime.execute(subtask.clone(), &mut None).await;

        let reported = store.get_subtask(&subtask.id).await.unwrap().unwrap();
        assert_eq!(reported.status, SubtaskStatus::Failed);
        assert_eq!(reported.failure.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_withdrawn_subtask_is_not_started() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "navigate_to_target", json!({})).await;

        let mut withdrawn = subtask.clone();
        withdrawn.status = SubtaskStatus::Failed;
        withdrawn.assigned_agent = None;
        store.commit(vec![Write::Subtask(withdrawn)]).await.unwrap();

        runtime.execute(subtask.clone(), &mut None).await;
        runtime.reconcile().await.unwrap();

        let agent = store.get_agent("robot_1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_subtask.is_none());
        assert!(store.get_fact("robot_1.position").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reregistration_fails_orphaned_work() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "navigate_to_target", json!({})).await;

        runtime.register().await.unwrap();

        let orphan = store.get_subtask(&subtask.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, SubtaskStatus::Failed);
        assert_eq!(orphan.failure.as_ref().unwrap().kind, FailureKind::HeartbeatLost);
        assert!(orphan.has_pending_report());
    }

    /// Memory store whose conditional commits can be made to always lose
    struct Contended {
        inner: MemoryStore,
        losing: AtomicBool,
    }

    #[async_trait]
    impl CoordinationStore for Contended {
        fn namespace(&self) -> &str {
            self.inner.namespace()
        }
        async fn commit(&self, writes: Vec<Write>) -> Result<()> {
            if self.losing.load(Ordering::SeqCst) {
                return Err(SwarmError::StoreConflict {
                    key: writes.first().map(|w| w.key()).unwrap_or_default(),
                    expected: 0,
                    found: 1,
                });
            }
            self.inner.commit(writes).await
        }
        async fn get_task(&self, id: &str) -> Result<Option<Task>> {
            self.inner.get_task(id).await
        }
        async fn get_subtask(&self, id: &str) -> Result<Option<Subtask>> {
            self.inner.get_subtask(id).await
        }
        async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
            self.inner.get_agent(id).await
        }
        async fn tasks(&self) -> Result<Vec<Task>> {
            self.inner.tasks().await
        }
        async fn subtasks_of(&self, task_id: &str) -> Result<Vec<Subtask>> {
            self.inner.subtasks_of(task_id).await
        }
        async fn agents(&self) -> Result<Vec<Agent>> {
            self.inner.agents().await
        }
        async fn put_fact(&self, fact: SharedStateFact) -> Result<()> {
            self.inner.put_fact(fact).await
        }
        async fn get_fact(&self, key: &str) -> Result<Option<SharedStateFact>> {
            self.inner.get_fact(key).await
        }
        async fn facts(&self) -> Result<Vec<SharedStateFact>> {
            self.inner.facts().await
        }
        async fn put_skills(&self, agent_id: &str, skills: Vec<SkillDescriptor>) -> Result<()> {
            self.inner.put_skills(agent_id, skills).await
        }
        async fn skills(&self, agent_id: &str) -> Result<Vec<SkillDescriptor>> {
            self.inner.skills(agent_id).await
        }
        async fn publish(&self, channel: &Channel, notification: Notification) -> Result<()> {
            self.inner.publish(channel, notification).await
        }
        async fn subscribe(&self, channel: &Channel) -> Result<Subscription> {
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn test_contended_registration_is_an_error() {
        let contended = Arc::new(Contended {
            inner: MemoryStore::new("test"),
            losing: AtomicBool::new(true),
        });
        let store: Arc<dyn CoordinationStore> = contended.clone();
        let mut announcements = store.subscribe(&Channel::Registration).await.unwrap();

        let err = runtime(store.clone()).register().await.unwrap_err();
        assert!(matches!(err, SwarmError::Internal(_)));
        assert!(store.get_agent("robot_1").await.unwrap().is_none());
        let nothing = tokio::time::timeout(Duration::from_millis(50), announcements.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_contended_release_is_an_error() {
        let contended = Arc::new(Contended {
            inner: MemoryStore::new("test"),
            losing: AtomicBool::new(false),
        });
        let store: Arc<dyn CoordinationStore> = contended.clone();
        let runtime = runtime(store.clone());
        runtime.register().await.unwrap();
        let subtask = assign(&store, "navigate_to_target", json!({})).await;

        contended.losing.store(true, Ordering::SeqCst);
        assert!(runtime.release_self(&subtask.id).await.is_err());

        contended.losing.store(false, Ordering::SeqCst);
        runtime.release_self(&subtask.id).await.unwrap();
        let agent = store.get_agent("robot_1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_certain_fault_injection() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        let mut config = SwarmConfig::development();
        config.agent.failure_probability = 1.0;
        let runtime = AgentRuntime::new("robot_1", Embodiment::Wheeled, skills(), store.clone(), &config);
        runtime.register().await.unwrap();
        let subtask = assign(&store, "navigate_to_target", json!({})).await;

        runtime.execute(subtask.clone(), &mut None).await;

        let reported = store.get_subtask(&subtask.id).await.unwrap().unwrap();
        assert_eq!(reported.failure.unwrap().kind, FailureKind::InjectedFault);
    }
}
