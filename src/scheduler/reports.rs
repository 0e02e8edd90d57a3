//! Report handling: acknowledgements, DAG promotion, completion, failure
//! propagation and heartbeat loss.

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::{Recovery, Scheduler};
use crate::core::errors::{Result, SwarmError};
use crate::model::{
    Agent, AgentId, AgentStatus, FailureKind, FailureReason, Subtask, SubtaskId, SubtaskStatus,
    Task, TaskStatus,
};
use crate::pubsub::{Channel, Notification};
use crate::storage::Write;

/// Release `agent` from `subtask_id` if it still holds it
fn release(agent: &mut Agent, subtask_id: &str) -> bool {
    if agent.current_subtask.as_deref() != Some(subtask_id) {
        return false;
    }
    agent.current_subtask = None;
    if matches!(agent.status, AgentStatus::Busy | AgentStatus::Error) {
        agent.status = AgentStatus::Idle;
    }
    true
}

impl Scheduler {
    /// Process reports for one executing task, promote newly unblocked
    /// subtasks and settle the task when every subtask is Done.
    pub(crate) async fn advance_task(&self, task_id: &str) -> Result<()> {
        let _guard = self.lock_task(task_id).await;
        for _ in 0..self.config.cas_retry_limit {
            match self.advance_once(task_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!("Conflict while advancing task {}: {}", task_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            "Task {} still contended after {} rounds, retrying next pass",
            task_id, self.config.cas_retry_limit
        );
        Ok(())
    }

    async fn advance_once(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::Executing {
            return Ok(());
        }

        let subtasks = self.current_subtasks(&task).await?;
        let mut acknowledged = false;
        for subtask in subtasks.iter().filter(|s| s.has_pending_report()) {
            acknowledged = true;
            match subtask.status {
                SubtaskStatus::Done => self.acknowledge_done(subtask).await?,
                SubtaskStatus::Failed => match self.acknowledge_failure(&task, subtask).await? {
                    Recovery::Retry => {}
                    Recovery::Replan => return self.start_replan(task_id).await,
                    Recovery::Exhaust => {
                        let cause = subtask.failure.as_ref().map_or(FailureKind::Execution, |f| f.kind);
                        let message = format!(
                            "subtask {} failed after {} attempt(s): {}",
                            subtask.id,
                            subtask.attempts,
                            subtask
                                .failure
                                .as_ref()
                                .map(|f| f.message.as_str())
                                .unwrap_or("no reason given")
                        );
                        return self
                            .fail_task(task_id, FailureReason::new(cause, message), FailureKind::Cancelled)
                            .await;
                    }
                },
                _ => {}
            }
        }

        // Promotion needs one consistent view taken after the acknowledgements
        let (task, subtasks) = if acknowledged {
            let Some(task) = self.store.get_task(task_id).await? else {
                return Ok(());
            };
            let subtasks = self.current_subtasks(&task).await?;
            (task, subtasks)
        } else {
            (task, subtasks)
        };

        self.promote_ready(&subtasks).await?;

        if !subtasks.is_empty() && subtasks.iter().all(|s| s.status == SubtaskStatus::Done) {
            let mut done = task;
            done.status = TaskStatus::Succeeded;
            done.touch();
            self.store.commit(vec![Write::Task(done.clone())]).await?;
            info!("Task {} succeeded ({} subtasks)", done.id, subtasks.len());
            self.notify_task(&done).await;
        }
        Ok(())
    }

    async fn acknowledge_done(&self, subtask: &Subtask) -> Result<()> {
        let mut acked = subtask.clone();
        let Some(agent_id) = acked.assigned_agent.take() else {
            return Ok(());
        };
        acked.touch();

        let mut writes = vec![];
        if let Some(mut agent) = self.store.get_agent(&agent_id).await? {
            release(&mut agent, &acked.id);
            agent
                .last_success
                .insert(acked.skill.clone(), acked.done_at.unwrap_or_else(Utc::now));
            writes.push(Write::Agent(agent));
        }
        writes.push(Write::Subtask(acked.clone()));
        self.store.commit(writes).await?;

        debug!("Acknowledged completion of {} by {}", acked.id, agent_id);
        self.publish_agent_status(&agent_id).await;
        Ok(())
    }

    async fn acknowledge_failure(&self, task: &Task, subtask: &Subtask) -> Result<Recovery> {
        let recovery = self.policy.decide(subtask, task);
        let mut acked = subtask.clone();
        let Some(agent_id) = acked.assigned_agent.take() else {
            return Ok(recovery);
        };
        acked.touch();
        if recovery == Recovery::Retry {
            acked.status = SubtaskStatus::Ready;
            acked.ready_at = Some(Utc::now());
            if self.config.exclude_failed_agent {
                acked.excluded_agents.insert(agent_id.clone());
            }
        }

        let mut writes = vec![];
        if let Some(mut agent) = self.store.get_agent(&agent_id).await? {
            if release(&mut agent, &acked.id) {
                writes.push(Write::Agent(agent));
            }
        }
        writes.push(Write::Subtask(acked.clone()));
        self.store.commit(writes).await?;

        let reason = acked
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();
        warn!(
            "Subtask {} failed on {} (attempt {}): {}; {:?}",
            acked.id, agent_id, acked.attempts, reason, recovery
        );
        self.notify_subtask(&acked).await;
        self.publish_agent_status(&agent_id).await;
        Ok(recovery)
    }

    /// Blocked→Ready for every subtask whose predecessors are all Done in
    /// `subtasks`, which must come from a single read.
    async fn promote_ready(&self, subtasks: &[Subtask]) -> Result<usize> {
        let done: HashSet<&str> = subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Done)
            .map(|s| s.id.as_str())
            .collect();
        let now = Utc::now();

        let promoted: Vec<Subtask> = subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Blocked)
            .filter(|s| s.predecessors.iter().all(|p| done.contains(p.as_str())))
            .map(|s| {
                let mut ready = s.clone();
                ready.status = SubtaskStatus::Ready;
                ready.ready_at = Some(now);
                ready.touch();
                ready
            })
            .collect();
        if promoted.is_empty() {
            return Ok(0);
        }

        self.store
            .commit(promoted.iter().cloned().map(Write::Subtask).collect())
            .await?;
        for subtask in &promoted {
            debug!("Subtask {} is ready", subtask.id);
            self.notify_subtask(subtask).await;
        }
        Ok(promoted.len())
    }

    /// Writes that take every unfinished subtask out of play with `kind`.
    /// In-flight subtasks are returned so their agents can be asked to abort.
    async fn retire_writes(
        &self,
        subtasks: &[Subtask],
        kind: FailureKind,
        message: &str,
    ) -> Result<(Vec<Write>, Vec<(AgentId, SubtaskId)>)> {
        let mut writes = Vec::new();
        let mut agents: BTreeMap<AgentId, Agent> = BTreeMap::new();
        let mut aborts = Vec::new();

        for subtask in subtasks {
            let mut next = subtask.clone();
            if subtask.has_pending_report() {
                // Finished but unacknowledged: keep the outcome, free the agent
                if let Some(agent_id) = next.assigned_agent.take() {
                    let agent = match agents.remove(&agent_id) {
                        Some(agent) => Some(agent),
                        None => self.store.get_agent(&agent_id).await?,
                    };
                    if let Some(mut agent) = agent {
                        release(&mut agent, &next.id);
                        agents.insert(agent_id, agent);
                    }
                }
            } else if subtask.status.is_in_flight() {
                if let Some(agent_id) = next.assigned_agent.take() {
                    aborts.push((agent_id, next.id.clone()));
                }
                next.status = SubtaskStatus::Failed;
                next.failure = Some(FailureReason::new(kind, message));
            } else if matches!(subtask.status, SubtaskStatus::Blocked | SubtaskStatus::Ready) {
                next.status = SubtaskStatus::Failed;
                next.failure = Some(FailureReason::new(kind, message));
            } else {
                continue;
            }
            next.touch();
            writes.push(Write::Subtask(next));
        }
        writes.extend(agents.into_values().map(Write::Agent));
        Ok((writes, aborts))
    }

    async fn send_aborts(&self, task_id: &str, aborts: Vec<(AgentId, SubtaskId)>) {
        for (agent_id, subtask_id) in aborts {
            let notification = Notification::Cancel {
                task_id: task_id.to_string(),
                subtask_id,
            };
            if let Err(e) = self
                .store
                .publish(&Channel::Agent(agent_id.clone()), notification)
                .await
            {
                warn!("Failed to send abort to agent {}: {}", agent_id, e);
            }
        }
    }

    /// Fail the task and every unfinished subtask of its DAG. No automatic
    /// continuation past a failure. Caller holds the task lock.
    pub(crate) async fn fail_task(
        &self,
        task_id: &str,
        failure: FailureReason,
        subtask_kind: FailureKind,
    ) -> Result<()> {
        for _ in 0..self.config.cas_retry_limit {
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| SwarmError::not_found("task", task_id))?;
            if task.status.is_terminal() {
                return Ok(());
            }
            let subtasks = self.current_subtasks(&task).await?;
            let (mut writes, aborts) = self
                .retire_writes(&subtasks, subtask_kind, &failure.message)
                .await?;
            task.status = TaskStatus::Failed;
            task.failure = Some(failure.clone());
            task.touch();
            writes.push(Write::Task(task.clone()));

            match self.store.commit(writes).await {
                Ok(()) => {
                    warn!("Task {} failed: {}", task_id, failure);
                    self.send_aborts(task_id, aborts).await;
                    self.notify_task(&task).await;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Conflict while failing task {}: {}", task_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::internal(format!(
            "could not fail task {} after {} conflicting commits",
            task_id, self.config.cas_retry_limit
        )))
    }

    /// Supersede the unfinished part of the DAG and plan it again, grounded
    /// in the results of the Done subtasks. Caller holds the task lock.
    async fn start_replan(&self, task_id: &str) -> Result<()> {
        for _ in 0..self.config.cas_retry_limit {
            let Some(mut task) = self.store.get_task(task_id).await? else {
                return Ok(());
            };
            if task.status != TaskStatus::Executing {
                return Ok(());
            }
            let subtasks = self.current_subtasks(&task).await?;
            let done: Vec<Subtask> = subtasks
                .iter()
                .filter(|s| s.status == SubtaskStatus::Done)
                .cloned()
                .collect();
            let (mut writes, aborts) = self
                .retire_writes(&subtasks, FailureKind::Superseded, "superseded by re-plan")
                .await?;

            task.status = TaskStatus::Planning;
            task.replan_count += 1;
            task.subtask_ids = done.iter().map(|s| s.id.clone()).collect();
            task.touch();
            writes.push(Write::Task(task.clone()));

            match self.store.commit(writes).await {
                Ok(()) => {
                    info!(
                        "Re-planning task {} (re-plan {}), keeping {} completed subtask(s)",
                        task_id,
                        task.replan_count,
                        done.len()
                    );
                    self.send_aborts(task_id, aborts).await;
                    self.notify_task(&task).await;
                    self.spawn_planning(task.id.clone(), done);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Conflict while superseding task {}: {}", task_id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::internal(format!(
            "could not re-plan task {} after {} conflicting commits",
            task_id, self.config.cas_retry_limit
        )))
    }

    /// Mark agents with lapsed heartbeats Offline and fail their in-flight
    /// subtasks with `HeartbeatLost`. The failures are then handled like any
    /// other failure report.
    pub async fn reap_stale_agents(&self) -> Result<usize> {
        let now = Utc::now();
        let mut reaped = 0;
        for agent in self.store.agents().await? {
            if agent.status == AgentStatus::Offline || !agent.is_stale(now, self.heartbeat_timeout) {
                continue;
            }
            let lost = SwarmError::AgentHeartbeatLost {
                agent_id: agent.id.clone(),
            };

            let mut writes = Vec::new();
            for subtask in self.store.assigned_to(&agent.id).await? {
                if !subtask.status.is_in_flight() {
                    continue;
                }
                let mut failed = subtask;
                failed.status = SubtaskStatus::Failed;
                failed.failure = Some(FailureReason::new(FailureKind::HeartbeatLost, lost.to_string()));
                failed.touch();
                writes.push(Write::Subtask(failed));
            }
            let in_flight = writes.len();
            let mut offline = agent.clone();
            offline.status = AgentStatus::Offline;
            writes.push(Write::Agent(offline));

            match self.store.commit(writes).await {
                Ok(()) => {
                    warn!("{}; {} in-flight subtask(s) failed", lost, in_flight);
                    reaped += 1;
                    self.publish_agent_status(&agent.id).await;
                }
                Err(e) if e.is_conflict() => {
                    debug!("Agent {} changed while reaping: {}", agent.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    async fn publish_agent_status(&self, agent_id: &str) {
        let status = match self.store.get_agent(agent_id).await {
            Ok(Some(agent)) => agent.status,
            _ => return,
        };
        let notification = Notification::AgentStatus {
            agent_id: agent_id.to_string(),
            status,
        };
        if let Err(e) = self.store.publish(&Channel::Scheduler, notification).await {
            warn!("Failed to publish status of agent {}: {}", agent_id, e);
        }
    }
}
