//! Shared fixtures for the integration suites: a scripted planning oracle,
//! simulated skills and a small harness around scheduler and agents.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarmdag::core::errors::Result;
use swarmdag::model::SkillDescriptor;
use swarmdag::{
    AgentHandle, AgentRuntime, CompletionModel, CoordinationStore, Embodiment, FnSkill,
    MemoryStore, PlanRequest, PlanResponse, PlanningOracle, Scheduler, SkillOutcome, SkillSet,
    SubtaskDescriptor, SwarmConfig,
};

/// Replays canned answers in order, repeating the last one, and records
/// every request it receives.
pub struct ScriptedOracle {
    answers: Mutex<VecDeque<Result<PlanResponse>>>,
    fallback: Mutex<Option<PlanResponse>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedOracle {
    pub fn new(answers: Vec<Result<PlanResponse>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            fallback: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always answers with `plan`
    pub fn always(plan: PlanResponse) -> Arc<Self> {
        Self::new(vec![Ok(plan)])
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlanningOracle for ScriptedOracle {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.answers.lock().unwrap().pop_front();
        match next {
            Some(Ok(plan)) => {
                *self.fallback.lock().unwrap() = Some(plan.clone());
                Ok(plan)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.fallback.lock().unwrap().clone().unwrap_or_default()),
        }
    }
}

/// Text model that replays canned answers, repeating the last one
pub struct ScriptedModel {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut answers = self.answers.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };
        Ok(answer.unwrap_or_default())
    }
}

pub fn plan(subtasks: Vec<SubtaskDescriptor>) -> PlanResponse {
    PlanResponse {
        subtasks,
        reasoning: None,
    }
}

/// pick at A, move to B, place: two dependency edges
pub fn pick_move_place() -> PlanResponse {
    plan(vec![
        SubtaskDescriptor::new("pick", "grasp_object", json!({"object": "apple", "location": "A"})),
        SubtaskDescriptor::new("move", "navigate_to_target", json!({"target": "B"})).after("pick"),
        SubtaskDescriptor::new("place", "place_to_affordance", json!({"affordance": "B"}))
            .after("move"),
    ])
}

/// Catalogue entry for agents written straight into the store
pub fn grasp_descriptor(agent: &str) -> SkillDescriptor {
    SkillDescriptor {
        agent: agent.to_string(),
        skill: "grasp_object".to_string(),
        endpoint: format!("local://{}/grasp_object", agent),
        description: String::new(),
        parameter_schema: None,
    }
}

pub fn ok_skill(name: &str) -> FnSkill {
    let message = format!("{} done", name);
    FnSkill::new(name, move |params: Value| {
        let message = message.clone();
        async move {
            let mut outcome = SkillOutcome::success(message).with_result(params.clone());
            if let Some(target) = params.get("target") {
                outcome = outcome.with_state("position", target.clone());
            }
            Ok(outcome)
        }
    })
}

pub fn failing_skill(name: &str) -> FnSkill {
    FnSkill::new(name, |_| async { Ok(SkillOutcome::failure("gripper jammed")) })
}

/// Fails the first `failures` invocations, then succeeds
pub fn flaky_skill(name: &str, failures: u32) -> (FnSkill, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let skill = FnSkill::new(name, move |_| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call <= failures {
                Ok(SkillOutcome::failure(format!("attempt {} slipped", call)))
            } else {
                Ok(SkillOutcome::success(format!("attempt {} held", call)))
            }
        }
    });
    (skill, calls)
}

/// Never returns on its own
pub fn stuck_skill(name: &str) -> FnSkill {
    FnSkill::new(name, |_| async {
        std::future::pending::<()>().await;
        Ok(SkillOutcome::success("unreachable"))
    })
}

pub fn manipulation_skills() -> SkillSet {
    SkillSet::new()
        .with(ok_skill("grasp_object"))
        .with(ok_skill("navigate_to_target"))
        .with(ok_skill("place_to_affordance"))
}

pub struct Harness {
    pub store: Arc<dyn CoordinationStore>,
    pub scheduler: Scheduler,
    pub config: SwarmConfig,
    agents: Vec<AgentHandle>,
}

impl Harness {
    pub fn new(oracle: Arc<dyn PlanningOracle>, config: SwarmConfig) -> Self {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new("test"));
        Self::with_store(store, oracle, config)
    }

    pub fn with_store(
        store: Arc<dyn CoordinationStore>,
        oracle: Arc<dyn PlanningOracle>,
        config: SwarmConfig,
    ) -> Self {
        let scheduler = Scheduler::new(store.clone(), oracle, &config);
        Self {
            store,
            scheduler,
            config,
            agents: Vec::new(),
        }
    }

    pub fn runtime(&self, id: &str, skills: SkillSet) -> AgentRuntime {
        AgentRuntime::new(id, Embodiment::SingleArm, skills, self.store.clone(), &self.config)
    }

    pub async fn start_agent(&mut self, id: &str, skills: SkillSet) {
        let handle = self.runtime(id, skills).start().await.unwrap();
        self.agents.push(handle);
        // Distinct registration times keep the tie-break deterministic
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pub fn take_agent(&mut self, id: &str) -> Option<AgentHandle> {
        let index = self.agents.iter().position(|a| a.runtime().id() == id)?;
        Some(self.agents.remove(index))
    }

    pub async fn stop(self) {
        self.scheduler.shutdown();
        for agent in self.agents {
            let _ = agent.stop().await;
        }
    }
}

pub fn config() -> SwarmConfig {
    SwarmConfig::development()
}

pub const WAIT: Duration = Duration::from_secs(10);
