//! Coordination layer for a swarm of heterogeneous robots.
//!
//! A natural-language instruction is decomposed by a planning oracle into a
//! DAG of skill invocations, which the scheduler dispatches to capable idle
//! agents through a shared coordination store.

// Core infrastructure modules
pub mod core;
pub mod model;
pub mod pubsub;
pub mod storage;

// Coordinator side
pub mod planning;
pub mod registry;
pub mod scene;
pub mod scheduler;

// Robot side
pub mod agent;

// Re-exports for convenience
pub use crate::core::config::SwarmConfig;
pub use crate::core::errors::{Result, SwarmError};
pub use agent::{
    AgentHandle, AgentRuntime, FactUpdate, FnSkill, SkillEndpoint, SkillOutcome, SkillSet,
};
pub use model::{
    Agent, AgentStatus, Embodiment, FailureKind, FailureReason, SharedStateFact, Subtask,
    SubtaskStatus, Task, TaskReport, TaskStatus,
};
pub use planning::{
    CompletionModel, ModelPlanner, PlanRequest, PlanResponse, PlanningOracle, SubtaskDescriptor,
};
pub use pubsub::{Channel, Notification, Subscription};
pub use registry::SkillRegistry;
pub use scene::{seed_scene, Scene};
pub use scheduler::Scheduler;
pub use storage::{open_store, CoordinationStore, MemoryStore, SledStore};
