//! Scheduler/dispatcher.
//!
//! Single logical owner of the task and subtask lifecycle. All state lives
//! in the coordination store; the scheduler holds nothing that a restart
//! would lose beyond in-flight oracle calls, which [`Scheduler::recover`]
//! re-issues.

pub mod dispatch;
pub mod policy;
pub mod reports;

use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::{SchedulerConfig, SwarmConfig};
use crate::core::errors::{Result, SwarmError};
use crate::model::{
    Agent, AgentStatus, FailureKind, FailureReason, Subtask, SubtaskStatus, Task, TaskId,
    TaskReport, TaskStatus,
};
use crate::planning::{
    AcceptedPlan, AgentCapabilities, CompletedStep, PlanContext, PlanRequest, PlanningClient,
    PlanningOracle,
};
use crate::pubsub::{Channel, Notification, Subscription};
use crate::registry::SkillRegistry;
use crate::storage::{CoordinationStore, Write};

pub use dispatch::select_agent;
pub use policy::{Recovery, RecoveryPolicy};

/// Coordinates planning, dispatch and recovery for every task in the store
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn CoordinationStore>,
    registry: SkillRegistry,
    planner: PlanningClient,
    config: SchedulerConfig,
    heartbeat_timeout: Duration,
    policy: RecoveryPolicy,
    /// Serializes lifecycle writes per task inside this process
    task_locks: Arc<DashMap<TaskId, Arc<Mutex<()>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        oracle: Arc<dyn PlanningOracle>,
        config: &SwarmConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: SkillRegistry::new(store.clone()),
            planner: PlanningClient::new(oracle, config.oracle.clone()),
            policy: RecoveryPolicy::from_config(&config.scheduler),
            config: config.scheduler.clone(),
            heartbeat_timeout: config.agent.heartbeat_timeout(),
            task_locks: Arc::new(DashMap::new()),
            shutdown: Arc::new(shutdown),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    async fn lock_task(&self, task_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .task_locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Accept an instruction and return its task id. Planning happens in the
    /// background; follow progress with [`Scheduler::task_report`] or
    /// [`Scheduler::subscribe_task`].
    pub async fn submit(&self, instruction: impl Into<String>) -> Result<TaskId> {
        self.submit_with_id(cuid2::create_id(), instruction).await
    }

    /// Submit under a caller-chosen id
    pub async fn submit_with_id(
        &self,
        task_id: impl Into<TaskId>,
        instruction: impl Into<String>,
    ) -> Result<TaskId> {
        let task = Task::new(task_id, instruction);
        match self.store.commit(vec![Write::Task(task.clone())]).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(SwarmError::already_exists("task", task.id)),
            Err(e) => return Err(e),
        }
        info!("Submitted task {}: {}", task.id, task.instruction);
        let submitted = Notification::TaskSubmitted {
            task_id: task.id.clone(),
        };
        for channel in [Channel::Task(task.id.clone()), Channel::Scheduler] {
            if let Err(e) = self.store.publish(&channel, submitted.clone()).await {
                warn!("Failed to announce task {}: {}", task.id, e);
            }
        }
        Ok(task.id)
    }

    /// The task with the subtasks of its current plan
    pub async fn task_report(&self, task_id: &str) -> Result<TaskReport> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SwarmError::not_found("task", task_id))?;
        let subtasks = self.current_subtasks(&task).await?;
        Ok(TaskReport { task, subtasks })
    }

    pub async fn subscribe_task(&self, task_id: &str) -> Result<Subscription> {
        self.store.subscribe(&Channel::Task(task_id.to_string())).await
    }

    /// Registered agents with their live status
    pub async fn agent_statuses(&self) -> Result<Vec<Agent>> {
        self.store.agents().await
    }

    /// Wait until the task is Succeeded or Failed
    pub async fn wait_for_completion(&self, task_id: &str, timeout: Duration) -> Result<TaskReport> {
        let mut updates = self.subscribe_task(task_id).await?;
        let wait = async {
            loop {
                let report = self.task_report(task_id).await?;
                if report.task.status.is_terminal() {
                    return Ok::<_, SwarmError>(report);
                }
                tokio::select! {
                    _ = updates.recv() => {}
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SwarmError::internal(format!(
                "task {} not finished after {:?}",
                task_id, timeout
            ))),
        }
    }

    /// Cancel a task: unfinished subtasks fail with `Cancelled` and agents
    /// executing them are asked to abort.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let _guard = self.lock_task(task_id).await;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SwarmError::not_found("task", task_id))?;
        if task.status.is_terminal() {
            return Err(SwarmError::invalid_transition(
                task_id,
                format!("task already {:?}", task.status),
            ));
        }
        info!("Cancelling task {}", task_id);
        self.fail_task(
            task_id,
            FailureReason::new(FailureKind::Cancelled, "cancelled by request"),
            FailureKind::Cancelled,
        )
        .await
    }

    /// Return tasks stuck in Planning to Pending so the next pass re-plans
    /// them. Run on a single coordinator at start-up.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut task in self.store.tasks().await? {
            if task.status != TaskStatus::Planning {
                continue;
            }
            task.status = TaskStatus::Pending;
            task.touch();
            match self.store.commit(vec![Write::Task(task.clone())]).await {
                Ok(()) => {
                    info!("Recovered task {} from interrupted planning", task.id);
                    recovered += 1;
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Spawn the scheduling loop
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Scheduling loop: one pass per wake-up, woken by notifications or the
    /// poll interval.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        if let Err(e) = self.recover().await {
            error!("Failed to recover interrupted planning: {}", e);
        }
        let mut inbox = match self.store.subscribe(&Channel::Scheduler).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Scheduler inbox unavailable, polling only: {}", e);
                None
            }
        };
        let mut registrations = match self.store.subscribe(&Channel::Registration).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Registration channel unavailable: {}", e);
                None
            }
        };
        info!("Scheduler started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            if let Err(e) = self.run_pass().await {
                error!("Scheduling pass failed: {}", e);
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                Some(notification) = next_notification(&mut inbox) => {
                    debug!("Scheduler woken by {:?}", notification);
                }
                Some(notification) = next_notification(&mut registrations) => {
                    if let Notification::AgentRegistered { agent_id } = notification {
                        self.registry.invalidate(Some(&agent_id)).await;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("Scheduler stopped");
    }

    /// One scheduling pass over the whole store. Returns the number of new
    /// assignments.
    pub async fn run_pass(&self) -> Result<usize> {
        self.reap_stale_agents().await?;
        for task in self.store.tasks().await? {
            match task.status {
                TaskStatus::Pending => self.begin_planning(task).await?,
                TaskStatus::Executing => self.advance_task(&task.id).await?,
                _ => {}
            }
        }
        self.dispatch_ready().await
    }

    /// Subtasks of the task's current plan, in plan order, from one read
    pub(crate) async fn current_subtasks(&self, task: &Task) -> Result<Vec<Subtask>> {
        let mut by_id: HashMap<String, Subtask> = self
            .store
            .subtasks_of(&task.id)
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        Ok(task
            .subtask_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    pub(crate) async fn notify_task(&self, task: &Task) {
        let notification = Notification::TaskStatus {
            task_id: task.id.clone(),
            status: task.status,
        };
        for channel in [Channel::Task(task.id.clone()), Channel::Scheduler] {
            if let Err(e) = self.store.publish(&channel, notification.clone()).await {
                warn!("Failed to publish status of task {}: {}", task.id, e);
            }
        }
    }

    pub(crate) async fn notify_subtask(&self, subtask: &Subtask) {
        let notification = Notification::SubtaskStatus {
            task_id: subtask.task_id.clone(),
            subtask_id: subtask.id.clone(),
            status: subtask.status,
        };
        let channel = Channel::Task(subtask.task_id.clone());
        if let Err(e) = self.store.publish(&channel, notification).await {
            warn!("Failed to publish status of subtask {}: {}", subtask.id, e);
        }
    }

    /// Claim a Pending task and plan it in the background
    async fn begin_planning(&self, task: Task) -> Result<()> {
        let mut claimed = task;
        claimed.status = TaskStatus::Planning;
        claimed.touch();
        match self.store.commit(vec![Write::Task(claimed.clone())]).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!("Task {} claimed by another pass", claimed.id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        debug!("Planning task {}", claimed.id);
        self.notify_task(&claimed).await;
        self.spawn_planning(claimed.id, Vec::new());
        Ok(())
    }

    pub(crate) fn spawn_planning(&self, task_id: TaskId, completed: Vec<Subtask>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.plan_and_accept(task_id, completed).await;
        });
    }

    async fn plan_and_accept(&self, task_id: TaskId, completed: Vec<Subtask>) {
        let outcome = self.request_plan(&task_id, &completed).await;
        let _guard = self.lock_task(&task_id).await;
        let result = match outcome {
            Ok(plan) => self.accept_plan(&task_id, plan).await,
            Err(e) => {
                warn!("Planning failed for task {}: {}", task_id, e);
                self.fail_task(
                    &task_id,
                    FailureReason::new(FailureKind::PlanningExhausted, e.to_string()),
                    FailureKind::Cancelled,
                )
                .await
            }
        };
        if let Err(e) = result {
            error!("Failed to record planning outcome for task {}: {}", task_id, e);
        }
    }

    async fn request_plan(&self, task_id: &str, completed: &[Subtask]) -> Result<AcceptedPlan> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SwarmError::not_found("task", task_id))?;

        let agents: Vec<Agent> = self
            .store
            .agents()
            .await?
            .into_iter()
            .filter(|a| a.status != AgentStatus::Offline)
            .collect();

        let mut context = PlanContext {
            capabilities: self.registry.catalogue().await?.into_keys().collect(),
            schemas: self.registry.schemas().await?,
            completed: completed.iter().map(|s| s.local_id.clone()).collect(),
            ..Default::default()
        };
        for agent in &agents {
            context
                .agents
                .insert(agent.id.clone(), agent.capabilities.clone());
        }

        let mut request = PlanRequest::new(task.instruction.clone());
        request.world_state = self.store.world_snapshot().await?;
        request.agents = agents
            .iter()
            .map(|a| AgentCapabilities {
                agent_id: a.id.clone(),
                embodiment: a.embodiment,
                skills: a.capabilities.iter().cloned().collect(),
                location: a.location.clone(),
            })
            .collect();
        request.completed = completed
            .iter()
            .map(|s| CompletedStep {
                id: s.local_id.clone(),
                skill: s.skill.clone(),
                description: s.description.clone(),
                result: s.result.clone(),
            })
            .collect();

        self.planner.plan(request, &context).await
    }

    /// Persist an accepted plan together with its task. Caller holds the
    /// task lock.
    async fn accept_plan(&self, task_id: &str, plan: AcceptedPlan) -> Result<()> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SwarmError::not_found("task", task_id))?;
        if task.status != TaskStatus::Planning {
            info!(
                "Discarding plan for task {} in status {:?}",
                task_id, task.status
            );
            return Ok(());
        }

        // Re-plans get fresh local ids so they never collide with superseded steps
        let prefix = if task.replan_count > 0 {
            format!("r{}-", task.replan_count)
        } else {
            String::new()
        };
        let known: HashSet<String> = plan.subtasks.iter().map(|d| d.id.clone()).collect();
        let now = Utc::now();

        let mut writes = Vec::with_capacity(plan.subtasks.len() + 1);
        for descriptor in &plan.subtasks {
            let description = if descriptor.description.is_empty() {
                descriptor.skill.clone()
            } else {
                descriptor.description.clone()
            };
            let local_id = format!("{}{}", prefix, descriptor.id);
            let mut subtask = Subtask::new(
                &task.id,
                &local_id,
                description,
                descriptor.skill.clone(),
                descriptor.parameters.clone(),
            );
            subtask.predecessors = descriptor
                .depends_on
                .iter()
                .filter(|d| known.contains(*d))
                .map(|d| Subtask::qualified_id(&task.id, &format!("{}{}", prefix, d)))
                .collect::<BTreeSet<_>>();
            subtask.preferred_agent = descriptor.agent.clone();
            if subtask.predecessors.is_empty() {
                subtask.status = SubtaskStatus::Ready;
                subtask.ready_at = Some(now);
            }
            task.subtask_ids.push(subtask.id.clone());
            writes.push(Write::Subtask(subtask));
        }

        task.status = TaskStatus::Executing;
        task.retry_count = plan.attempts;
        task.touch();
        writes.push(Write::Task(task.clone()));
        self.store.commit(writes).await?;

        info!(
            "Task {} executing with {} subtask(s) after {} planning attempt(s)",
            task.id,
            plan.subtasks.len(),
            plan.attempts
        );
        self.notify_task(&task).await;
        Ok(())
    }
}

async fn next_notification(subscription: &mut Option<Subscription>) -> Option<Notification> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
