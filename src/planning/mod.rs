//! Planning oracle client.
//!
//! Turns an instruction plus world state into a validated subtask DAG,
//! retrying the external oracle a bounded number of times.

pub mod prompt;
pub mod validate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::OracleConfig;
use crate::core::errors::{Result, SwarmError};
use crate::model::{AgentId, Embodiment, SharedStateFact};

pub use validate::{validate_plan, PlanContext};

/// What the oracle knows about one registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub agent_id: AgentId,
    pub embodiment: Embodiment,
    pub skills: Vec<String>,
    pub location: Option<String>,
}

/// A finished step carried into a re-plan as grounding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub id: String,
    pub skill: String,
    pub description: String,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub instruction: String,
    /// Blackboard facts with their writer and last update time
    pub world_state: BTreeMap<String, SharedStateFact>,
    /// Why the previous attempt was rejected
    pub prior_error: Option<String>,
    pub agents: Vec<AgentCapabilities>,
    /// Steps already done; a re-plan only covers the remainder
    pub completed: Vec<CompletedStep>,
    /// 1-based attempt number within this planning round
    pub attempt: u32,
}

impl PlanRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            attempt: 1,
            ..Default::default()
        }
    }

    pub fn is_replan(&self) -> bool {
        !self.completed.is_empty()
    }
}

/// One step of a proposed plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub skill: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default, alias = "predecessors")]
    pub depends_on: Vec<String>,
    /// Agent the oracle wants for this step, if any
    #[serde(default, alias = "robot_name")]
    pub agent: Option<AgentId>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl SubtaskDescriptor {
    pub fn new(id: impl Into<String>, skill: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            skill: skill.into(),
            parameters,
            depends_on: Vec::new(),
            agent: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.depends_on.push(predecessor.into());
        self
    }

    pub fn on_agent(mut self, agent: impl Into<AgentId>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub subtasks: Vec<SubtaskDescriptor>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// External planning service
#[async_trait]
pub trait PlanningOracle: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
}

/// Text completion backend used by [`ModelPlanner`]
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Oracle adaptor for text models: renders the prompt, parses the fenced
/// JSON answer.
pub struct ModelPlanner<M> {
    model: M,
}

impl<M: CompletionModel> ModelPlanner<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M: CompletionModel> PlanningOracle for ModelPlanner<M> {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let text = prompt::render_prompt(request);
        debug!("Planning prompt is {} bytes", text.len());
        let answer = self.model.complete(&text).await?;
        let taken: HashSet<String> = request.completed.iter().map(|s| s.id.clone()).collect();
        prompt::parse_plan(&answer, &taken)
    }
}

/// A plan that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedPlan {
    /// Steps in a topological order
    pub subtasks: Vec<SubtaskDescriptor>,
    pub attempts: u32,
}

/// Bounded-retry wrapper around a [`PlanningOracle`]
#[derive(Clone)]
pub struct PlanningClient {
    oracle: Arc<dyn PlanningOracle>,
    config: OracleConfig,
}

impl PlanningClient {
    pub fn new(oracle: Arc<dyn PlanningOracle>, config: OracleConfig) -> Self {
        Self { oracle, config }
    }

    /// Ask the oracle until it returns an acceptable plan or the retry budget
    /// runs out. Timeouts, transient oracle errors and invalid plans all
    /// consume one attempt, and the next request carries the reason. An
    /// oracle error that is not retryable ends the round at once.
    pub async fn plan(&self, mut request: PlanRequest, context: &PlanContext) -> Result<AcceptedPlan> {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_reason = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            request.attempt = attempt;
            let outcome = tokio::time::timeout(self.config.call_timeout(), self.oracle.plan(&request)).await;
            let reason = match outcome {
                Err(_) => format!(
                    "oracle call timed out after {:?}",
                    self.config.call_timeout()
                ),
                Ok(Err(e)) if !e.is_retryable() => {
                    warn!("Planning attempt {}/{} hit a permanent error: {}", attempt, max_attempts, e);
                    return Err(SwarmError::PlanningExhausted {
                        attempts: attempt,
                        last_reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(response)) => match validate_plan(&response, context) {
                    Ok(subtasks) => {
                        info!(
                            "Accepted plan with {} subtask(s) on attempt {}",
                            subtasks.len(),
                            attempt
                        );
                        return Ok(AcceptedPlan {
                            subtasks,
                            attempts: attempt,
                        });
                    }
                    Err(e) => e.to_string(),
                },
            };
            warn!(
                "Planning attempt {}/{} rejected: {}",
                attempt, max_attempts, reason
            );
            request.prior_error = Some(reason.clone());
            last_reason = reason;
        }

        Err(SwarmError::PlanningExhausted {
            attempts: max_attempts,
            last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned answers and records every request
    struct Scripted {
        answers: Mutex<Vec<Result<PlanResponse>>>,
        seen: Mutex<Vec<PlanRequest>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<PlanResponse>>) -> Self {
            Self {
                answers: Mutex::new(answers),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PlanningOracle for Scripted {
        async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
            self.seen.lock().unwrap().push(request.clone());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                return Err(SwarmError::planning("script exhausted"));
            }
            answers.remove(0)
        }
    }

    struct Slow;

    #[async_trait]
    impl PlanningOracle for Slow {
        async fn plan(&self, _request: &PlanRequest) -> Result<PlanResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PlanResponse::default())
        }
    }

    fn context() -> PlanContext {
        PlanContext {
            capabilities: ["navigate_to_target", "grasp_object"]
                .iter()
                .map(|s| s.to_string())
                .collect::<HashSet<_>>(),
            ..Default::default()
        }
    }

    fn cyclic() -> PlanResponse {
        PlanResponse {
            subtasks: vec![
                SubtaskDescriptor::new("a", "grasp_object", json!({})).after("b"),
                SubtaskDescriptor::new("b", "grasp_object", json!({})).after("a"),
            ],
            reasoning: None,
        }
    }

    fn valid() -> PlanResponse {
        PlanResponse {
            subtasks: vec![
                SubtaskDescriptor::new("go", "navigate_to_target", json!({"target": "table"})),
                SubtaskDescriptor::new("pick", "grasp_object", json!({"object": "apple"})).after("go"),
            ],
            reasoning: None,
        }
    }

    #[tokio::test]
    async fn test_retry_carries_prior_error() {
        let oracle = Arc::new(Scripted::new(vec![Ok(cyclic()), Ok(valid())]));
        let client = PlanningClient::new(oracle.clone(), OracleConfig::default());

        let plan = client
            .plan(PlanRequest::new("fetch the apple"), &context())
            .await
            .unwrap();
        assert_eq!(plan.attempts, 2);
        assert_eq!(plan.subtasks.len(), 2);

        let seen = oracle.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].prior_error.is_none());
        assert!(seen[1].prior_error.as_deref().unwrap().contains("cycle"));
        assert_eq!(seen[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let oracle = Arc::new(Scripted::new(vec![]));
        let config = OracleConfig {
            max_retries: 3,
            ..Default::default()
        };
        let client = PlanningClient::new(oracle.clone(), config);
        let err = client
            .plan(PlanRequest::new("anything"), &context())
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::PlanningExhausted { attempts: 3, .. }));
        assert_eq!(oracle.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_oracle_error_stops_retries() {
        let oracle = Arc::new(Scripted::new(vec![
            Err(SwarmError::Configuration("missing api key".to_string())),
            Ok(valid()),
        ]));
        let client = PlanningClient::new(oracle.clone(), OracleConfig::default());
        let err = client
            .plan(PlanRequest::new("anything"), &context())
            .await
            .unwrap_err();
        match err {
            SwarmError::PlanningExhausted { attempts, last_reason } => {
                assert_eq!(attempts, 1);
                assert!(last_reason.contains("missing api key"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(oracle.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_attempt() {
        let config = OracleConfig {
            max_retries: 2,
            call_timeout_ms: 20,
        };
        let client = PlanningClient::new(Arc::new(Slow), config);
        let err = client
            .plan(PlanRequest::new("anything"), &context())
            .await
            .unwrap_err();
        match err {
            SwarmError::PlanningExhausted { attempts, last_reason } => {
                assert_eq!(attempts, 2);
                assert!(last_reason.contains("timed out"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
