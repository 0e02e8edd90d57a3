use std::time::Duration;
use thiserror::Error;

/// Unified error type for the coordinator, the store and the agent runtime
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The planning oracle produced nothing usable for this attempt
    #[error("Planning failed: {reason}")]
    Planning { reason: String },

    /// Every planning attempt failed
    #[error("Planning exhausted after {attempts} attempts: {last_reason}")]
    PlanningExhausted { attempts: u32, last_reason: String },

    /// Lost a race for a subtask or agent during assignment
    #[error("Assignment conflict on subtask {subtask_id}")]
    AssignmentConflict { subtask_id: String },

    /// The skill endpoint reported failure or faulted
    #[error("Skill '{skill}' failed: {message}")]
    SkillExecution { skill: String, message: String },

    /// The skill endpoint did not answer within its bound
    #[error("Skill '{skill}' timed out after {timeout:?}")]
    SkillTimeout { skill: String, timeout: Duration },

    /// No idle agent offers the capability right now
    #[error("No idle agent offers skill '{skill}'")]
    AgentUnavailable { skill: String },

    /// The agent stopped sending heartbeats
    #[error("Heartbeat lost for agent {agent_id}")]
    AgentHeartbeatLost { agent_id: String },

    /// A conditional write observed a stale revision
    #[error("Store conflict on {key}: expected revision {expected}, found {found}")]
    StoreConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Invalid state transition requested by a caller
    #[error("Invalid transition for {id}: {message}")]
    InvalidTransition { id: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration invalid: {0}")]
    Configuration(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SwarmError {
    pub fn planning(reason: impl Into<String>) -> Self {
        Self::Planning {
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_transition(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Lost an optimistic-concurrency race; the caller should re-read and retry
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::StoreConflict { .. } | Self::AssignmentConflict { .. }
        )
    }

    /// Transient conditions that the detecting component recovers from locally
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Planning { .. }
            | Self::AssignmentConflict { .. }
            | Self::StoreConflict { .. }
            | Self::SkillExecution { .. }
            | Self::SkillTimeout { .. }
            | Self::AgentUnavailable { .. }
            | Self::Backend(_)
            | Self::Json(_)
            | Self::Io(_) => true,

            Self::PlanningExhausted { .. }
            | Self::AgentHeartbeatLost { .. }
            | Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidTransition { .. }
            | Self::Configuration(_)
            | Self::Yaml(_)
            | Self::Internal(_) => false,

            // Unclassified failures of external services
            Self::Database(_) | Self::Other(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = SwarmError::StoreConflict {
            key: "subtask/a".to_string(),
            expected: 2,
            found: 3,
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());

        let timeout = SwarmError::SkillTimeout {
            skill: "grasp_object".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_conflict());

        let exhausted = SwarmError::PlanningExhausted {
            attempts: 5,
            last_reason: "cycle".to_string(),
        };
        assert!(!exhausted.is_retryable());

        assert!(!SwarmError::Configuration("no api key".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SwarmError::SkillExecution {
            skill: "grasp_object".to_string(),
            message: "gripper jammed".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("grasp_object"));
        assert!(display.contains("gripper jammed"));

        let err = SwarmError::not_found("task", "task_123");
        assert_eq!(err.to_string(), "task not found: task_123");
    }
}
