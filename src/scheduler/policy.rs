use crate::core::config::SchedulerConfig;
use crate::model::{FailureKind, Subtask, Task};

/// What to do with a subtask whose attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Back to Ready for another attempt
    Retry,
    /// Supersede the unfinished part of the DAG and ask the oracle again
    Replan,
    /// Attempt budget spent; the task fails
    Exhaust,
}

/// Threshold-based choice between retrying a subtask and re-planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub replan_after_attempts: Option<u32>,
    pub max_replans: u32,
}

impl RecoveryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            replan_after_attempts: config.replan_after_attempts,
            max_replans: config.max_replans,
        }
    }

    /// Decide for a failed `subtask` whose attempts already include the one
    /// that just failed.
    pub fn decide(&self, subtask: &Subtask, task: &Task) -> Recovery {
        let planning_level = subtask
            .failure
            .as_ref()
            .map_or(false, |f| f.kind == FailureKind::PlanningLevel);
        let threshold_hit = self
            .replan_after_attempts
            .map_or(false, |threshold| subtask.attempts >= threshold);

        if (planning_level || threshold_hit) && task.replan_count < self.max_replans {
            return Recovery::Replan;
        }
        if subtask.attempts < self.max_attempts {
            Recovery::Retry
        } else {
            Recovery::Exhaust
        }
    }
}
