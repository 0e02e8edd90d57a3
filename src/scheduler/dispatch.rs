use chrono::Utc;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

use super::Scheduler;
use crate::core::errors::{Result, SwarmError};
use crate::model::{Agent, AgentStatus, Subtask, SubtaskStatus, TaskStatus};
use crate::pubsub::{Channel, Notification};
use crate::storage::Write;

/// Most recent success with the skill first, then least loaded, then
/// earliest registered.
fn rank(a: &Agent, b: &Agent, skill: &str) -> Ordering {
    b.last_success
        .get(skill)
        .cmp(&a.last_success.get(skill))
        .then(a.assignments_total.cmp(&b.assignments_total))
        .then(a.registered_at.cmp(&b.registered_at))
        .then(a.id.cmp(&b.id))
}

/// Pick an idle, capable agent for `subtask`.
///
/// Agents that already failed this subtask are skipped while another
/// candidate exists. An idle agent named by the plan wins outright.
pub fn select_agent<'a>(subtask: &Subtask, idle: &'a [Agent], exclude_failed: bool) -> Option<&'a Agent> {
    let capable: Vec<&Agent> = idle
        .iter()
        .filter(|a| a.status == AgentStatus::Idle && a.can_execute(&subtask.skill))
        .collect();
    if capable.is_empty() {
        return None;
    }

    let fresh: Vec<&Agent> = capable
        .iter()
        .copied()
        .filter(|a| !subtask.excluded_agents.contains(&a.id))
        .collect();
    let pool = if exclude_failed && !fresh.is_empty() {
        fresh
    } else {
        capable
    };

    if let Some(preferred) = &subtask.preferred_agent {
        if let Some(agent) = pool.iter().find(|a| &a.id == preferred) {
            return Some(*agent);
        }
    }
    pool.into_iter().min_by(|a, b| rank(a, b, &subtask.skill))
}

impl Scheduler {
    /// Idle agents with a fresh heartbeat
    async fn idle_agents(&self) -> Result<Vec<Agent>> {
        let now = Utc::now();
        Ok(self
            .store
            .agents()
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Idle && !a.is_stale(now, self.heartbeat_timeout))
            .collect())
    }

    /// Match every Ready subtask to an idle agent that publishes the skill
    /// in the catalogue. Returns the number of assignments made by this call.
    pub async fn dispatch_ready(&self) -> Result<usize> {
        let mut ready = Vec::new();
        for task in self.store.tasks().await? {
            if task.status != TaskStatus::Executing {
                continue;
            }
            ready.extend(
                self.current_subtasks(&task)
                    .await?
                    .into_iter()
                    .filter(|s| s.status == SubtaskStatus::Ready),
            );
        }
        if ready.is_empty() {
            return Ok(0);
        }
        ready.sort_by(|a, b| a.ready_at.cmp(&b.ready_at).then(a.id.cmp(&b.id)));

        let catalogue = self.registry.catalogue().await?;
        let mut idle = self.idle_agents().await?;
        let mut assigned = 0;
        for subtask in ready {
            let offering: Vec<Agent> = match catalogue.get(&subtask.skill) {
                Some(offered_by) => idle
                    .iter()
                    .filter(|a| offered_by.contains(&a.id))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            let Some(agent) =
                select_agent(&subtask, &offering, self.config.exclude_failed_agent).cloned()
            else {
                debug!(
                    "{}; subtask {} stays Ready",
                    SwarmError::AgentUnavailable {
                        skill: subtask.skill.clone()
                    },
                    subtask.id
                );
                continue;
            };
            match self.assign(&subtask, &agent).await {
                Ok(()) => {
                    assigned += 1;
                    idle.retain(|a| a.id != agent.id);
                }
                Err(e) if e.is_conflict() => {
                    debug!("{}; moving on", e);
                    idle = self.idle_agents().await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(assigned)
    }

    /// Subtask Ready→Assigned and agent Idle→Busy in one conditional commit
    async fn assign(&self, subtask: &Subtask, agent: &Agent) -> Result<()> {
        let mut next = subtask.clone();
        next.status = SubtaskStatus::Assigned;
        next.assigned_agent = Some(agent.id.clone());
        next.attempts += 1;
        next.touch();

        let mut busy = agent.clone();
        busy.status = AgentStatus::Busy;
        busy.current_subtask = Some(next.id.clone());
        busy.assignments_total += 1;

        self.store
            .commit(vec![Write::Subtask(next.clone()), Write::Agent(busy)])
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    SwarmError::AssignmentConflict {
                        subtask_id: subtask.id.clone(),
                    }
                } else {
                    e
                }
            })?;

        info!(
            "Assigned subtask {} ({}) to agent {}, attempt {}",
            next.id, next.skill, agent.id, next.attempts
        );
        let notification = Notification::Assigned {
            subtask_id: next.id.clone(),
            agent_id: agent.id.clone(),
        };
        if let Err(e) = self
            .store
            .publish(&Channel::Agent(agent.id.clone()), notification)
            .await
        {
            warn!("Failed to notify agent {}: {}", agent.id, e);
        }
        self.notify_subtask(&next).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Embodiment;
    use serde_json::json;

    fn agent(id: &str, skills: &[&str]) -> Agent {
        Agent::new(id, Embodiment::SingleArm, skills.iter().copied())
    }

    fn subtask(skill: &str) -> Subtask {
        let mut subtask = Subtask::new("t1", "s0", "step", skill, json!({}));
        subtask.status = SubtaskStatus::Ready;
        subtask
    }

    #[test]
    fn test_only_capable_idle_agents() {
        let mut busy = agent("a", &["grasp_object"]);
        busy.status = AgentStatus::Busy;
        let agents = vec![busy, agent("b", &["navigate_to_target"])];
        assert!(select_agent(&subtask("grasp_object"), &agents, true).is_none());

        let agents = vec![agent("c", &["grasp_object"])];
        assert_eq!(
            select_agent(&subtask("grasp_object"), &agents, true).map(|a| a.id.as_str()),
            Some("c")
        );
    }

    #[test]
    fn test_tie_break_order() {
        let now = Utc::now();
        let mut warm = agent("warm", &["grasp_object"]);
        warm.last_success.insert("grasp_object".to_string(), now);
        warm.assignments_total = 10;
        let mut light = agent("light", &["grasp_object"]);
        light.assignments_total = 1;
        let mut early = agent("early", &["grasp_object"]);
        early.assignments_total = 1;
        early.registered_at = light.registered_at - chrono::Duration::seconds(30);

        let all = vec![light.clone(), early.clone(), warm.clone()];
        let pick = |agents: &[Agent]| {
            select_agent(&subtask("grasp_object"), agents, true).map(|a| a.id.clone())
        };
        assert_eq!(pick(&all), Some("warm".to_string()));
        assert_eq!(pick(&[light.clone(), early.clone()]), Some("early".to_string()));

        let mut heavy = early;
        heavy.assignments_total = 5;
        assert_eq!(pick(&[light, heavy]), Some("light".to_string()));
    }

    #[test]
    fn test_failed_agent_excluded_only_with_alternative() {
        let mut task = subtask("grasp_object");
        task.excluded_agents.insert("a".to_string());

        let only = vec![agent("a", &["grasp_object"])];
        assert_eq!(
            select_agent(&task, &only, true).map(|a| a.id.as_str()),
            Some("a")
        );

        let mut a = agent("a", &["grasp_object"]);
        a.last_success
            .insert("grasp_object".to_string(), Utc::now());
        let both = vec![a, agent("b", &["grasp_object"])];
        assert_eq!(
            select_agent(&task, &both, true).map(|a| a.id.as_str()),
            Some("b")
        );
        assert_eq!(
            select_agent(&task, &both, false).map(|a| a.id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn test_preferred_agent() {
        let mut task = subtask("grasp_object");
        task.preferred_agent = Some("b".to_string());
        let agents = vec![agent("a", &["grasp_object"]), agent("b", &["grasp_object"])];
        assert_eq!(
            select_agent(&task, &agents, true).map(|a| a.id.as_str()),
            Some("b")
        );
    }
}
