use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// Type aliases
pub type TaskId = String;
pub type SubtaskId = String;
pub type AgentId = String;

/// Lifecycle of a submitted instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// A natural-language goal and the current subtask DAG realising it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub instruction: String,
    pub status: TaskStatus,
    /// Subtasks of the current plan. Superseded subtasks stay in the store
    /// but are dropped from this list on re-plan.
    pub subtask_ids: Vec<SubtaskId>,
    /// Planning attempts consumed by the last planning round
    pub retry_count: u32,
    pub replan_count: u32,
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store revision observed when this copy was read; 0 means never stored
    pub revision: u64,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, instruction: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            instruction: instruction.into(),
            status: TaskStatus::Pending,
            subtask_ids: Vec::new(),
            retry_count: 0,
            replan_count: 0,
            failure: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Subtask lifecycle. Blocked until every predecessor is Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubtaskStatus {
    Blocked,
    Ready,
    Assigned,
    Running,
    Done,
    Failed,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Done | SubtaskStatus::Failed)
    }

    /// Owned by an agent right now
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SubtaskStatus::Assigned | SubtaskStatus::Running)
    }
}

/// Why a subtask attempt (or a whole task) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The skill endpoint reported failure or faulted
    Execution,
    Timeout,
    HeartbeatLost,
    /// The failure points at the plan rather than at the execution
    PlanningLevel,
    Cancelled,
    /// Replaced by a partial re-plan
    Superseded,
    InjectedFault,
    /// Planning never produced an acceptable plan
    PlanningExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// One skill invocation within a task's dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// `{task_id}:{local_id}`
    pub id: SubtaskId,
    pub task_id: TaskId,
    /// Identifier the plan used for this step
    pub local_id: String,
    pub description: String,
    pub skill: String,
    pub parameters: Value,
    pub predecessors: BTreeSet<SubtaskId>,
    /// Agent the plan named for this step, preferred when it is idle
    pub preferred_agent: Option<AgentId>,
    pub status: SubtaskStatus,
    pub assigned_agent: Option<AgentId>,
    /// Incremented every time the subtask is handed to an agent
    pub attempts: u32,
    /// Agents that failed this subtask and are avoided on the next match
    pub excluded_agents: BTreeSet<AgentId>,
    pub result: Option<Value>,
    pub failure: Option<FailureReason>,
    pub ready_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl Subtask {
    pub fn new(
        task_id: &str,
        local_id: &str,
        description: impl Into<String>,
        skill: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            id: Self::qualified_id(task_id, local_id),
            task_id: task_id.to_string(),
            local_id: local_id.to_string(),
            description: description.into(),
            skill: skill.into(),
            parameters,
            predecessors: BTreeSet::new(),
            preferred_agent: None,
            status: SubtaskStatus::Blocked,
            assigned_agent: None,
            attempts: 0,
            excluded_agents: BTreeSet::new(),
            result: None,
            failure: None,
            ready_at: None,
            done_at: None,
            updated_at: Utc::now(),
            revision: 0,
        }
    }

    pub fn qualified_id(task_id: &str, local_id: &str) -> SubtaskId {
        format!("{}:{}", task_id, local_id)
    }

    /// A terminal report the scheduler has not yet acknowledged
    pub fn has_pending_report(&self) -> bool {
        self.status.is_terminal() && self.assigned_agent.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Physical form of a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Embodiment {
    SingleArm,
    DualArm,
    Humanoid,
    Wheeled,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Offline,
    Idle,
    Busy,
    Error,
}

/// A registered robot and its live status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub embodiment: Embodiment,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Last reported location or pose name
    pub location: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub current_subtask: Option<SubtaskId>,
    /// Most recent successful execution, per skill
    pub last_success: BTreeMap<String, DateTime<Utc>>,
    /// Assignments handed to this agent over its lifetime
    pub assignments_total: u64,
    pub revision: u64,
}

impl Agent {
    pub fn new<I, S>(id: impl Into<AgentId>, embodiment: Embodiment, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: id.into(),
            embodiment,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Idle,
            last_heartbeat: now,
            location: None,
            registered_at: now,
            current_subtask: None,
            last_success: BTreeMap::new(),
            assignments_total: 0,
            revision: 0,
        }
    }

    pub fn can_execute(&self, skill: &str) -> bool {
        self.capabilities.contains(skill)
    }

    /// Heartbeat older than `timeout` as of `now`
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now.signed_duration_since(self.last_heartbeat) > timeout,
            Err(_) => false,
        }
    }
}

/// Blackboard entry. Last writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedStateFact {
    pub key: String,
    pub value: Value,
    pub writer: AgentId,
    pub timestamp: DateTime<Utc>,
}

impl SharedStateFact {
    pub fn new(key: impl Into<String>, value: Value, writer: impl Into<AgentId>) -> Self {
        Self {
            key: key.into(),
            value,
            writer: writer.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A callable skill offered by one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub agent: AgentId,
    pub skill: String,
    /// Where the agent serves this skill, e.g. `local://robot_1/grasp_object`
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema for the parameters, when the skill publishes one
    pub parameter_schema: Option<Value>,
}

/// A task together with the subtasks of its current plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: Task,
    pub subtasks: Vec<Subtask>,
}

impl TaskReport {
    pub fn subtask(&self, local_id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.local_id == local_id)
    }
}
