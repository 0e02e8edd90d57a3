use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use swarmdag::core::logging::init_tracing;
use swarmdag::{
    open_store, seed_scene, AgentRuntime, CompletionModel, Embodiment, FactUpdate, FnSkill, ModelPlanner,
    Scene, Scheduler, SkillOutcome, SkillSet, SwarmConfig,
};

// Stand-in for a language model: always answers with the same grouped plan
struct CannedModel;

#[async_trait]
impl CompletionModel for CannedModel {
    async fn complete(&self, prompt: &str) -> swarmdag::Result<String> {
        tracing::debug!("Prompt:\n{}", prompt);
        Ok(r#"The apple is on the kitchen table; the humanoid can carry it.

```json
{
  "reasoning": "Fetch the apple, carry it over and put it down.",
  "subtask_list": [
    {"robot_name": "humanoid_1", "subtask": "Walk to the kitchen table", "skill": "navigate_to_target",
     "parameters": {"target": "kitchenTable"}, "subtask_order": 1},
    {"robot_name": "rover_1", "subtask": "Clear the path to the serving table", "skill": "navigate_to_target",
     "parameters": {"target": "servingTable"}, "subtask_order": 1},
    {"robot_name": "humanoid_1", "subtask": "Pick up the apple", "skill": "grasp_object",
     "parameters": {"object": "apple", "from": "kitchenTable"}, "subtask_order": 2},
    {"robot_name": "humanoid_1", "subtask": "Carry it to the serving table", "skill": "navigate_to_target",
     "parameters": {"target": "servingTable"}, "subtask_order": 3},
    {"robot_name": "humanoid_1", "subtask": "Put the apple down", "skill": "place_to_affordance",
     "parameters": {"object": "apple", "affordance": "servingTable"}, "subtask_order": 4}
  ]
}
```"#
            .to_string())
    }
}

// Simulated skills: short sleeps standing in for motion
fn navigate() -> FnSkill {
    FnSkill::new("navigate_to_target", |params: Value| async move {
        let target = params["target"].as_str().unwrap_or("home").to_string();
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(SkillOutcome::success(format!("arrived at {}", target))
            .with_state("position", json!(target)))
    })
    .with_description("Drive or walk to a named location")
    .with_schema(json!({
        "type": "object",
        "properties": {"target": {"type": "string"}},
        "required": ["target"]
    }))
}

fn grasp() -> FnSkill {
    FnSkill::new("grasp_object", |params: Value| async move {
        let object = params["object"].as_str().unwrap_or("object").to_string();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut outcome =
            SkillOutcome::success(format!("holding {}", object)).with_state("holding", json!(object));
        if let Some(from) = params["from"].as_str() {
            outcome = outcome.with_fact(from, FactUpdate::remove("contains", json!(object)));
        }
        Ok(outcome.with_fact(object, FactUpdate::field("on", json!("gripper"))))
    })
    .with_description("Grasp a named object within reach")
}

fn place() -> FnSkill {
    FnSkill::new("place_to_affordance", |params: Value| async move {
        let affordance = params["affordance"].as_str().unwrap_or("table").to_string();
        let object = params["object"].as_str().unwrap_or("object").to_string();
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(SkillOutcome::success(format!("placed on {}", affordance))
            .with_state("holding", Value::Null)
            .with_fact(affordance.clone(), FactUpdate::insert("contains", json!(object)))
            .with_fact(object, FactUpdate::field("on", json!(affordance))))
    })
    .with_description("Put the held object on a surface")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = SwarmConfig::from_yaml_file("config.yaml")?;
    init_tracing(&config.logging);

    let store = open_store(&config.store).await?;
    seed_scene(store.as_ref(), &Scene::load("scene.yaml")?).await?;

    let humanoid = AgentRuntime::new(
        "humanoid_1",
        Embodiment::Humanoid,
        SkillSet::new().with(navigate()).with(grasp()).with(place()),
        store.clone(),
        &config,
    )
    .with_location("dock")
    .start()
    .await?;
    let rover = AgentRuntime::new(
        "rover_1",
        Embodiment::Wheeled,
        SkillSet::new().with(navigate()),
        store.clone(),
        &config,
    )
    .start()
    .await?;

    let oracle = Arc::new(ModelPlanner::new(CannedModel));
    let scheduler = Scheduler::new(store.clone(), oracle, &config);
    let scheduler_loop = scheduler.start();

    let task_id = scheduler
        .submit("Bring the apple from the kitchen table to the serving table")
        .await?;
    let report = scheduler
        .wait_for_completion(&task_id, Duration::from_secs(60))
        .await?;

    println!("Task {} finished as {:?}", report.task.id, report.task.status);
    for subtask in &report.subtasks {
        println!(
            "  {:<8} {:<22} {:?} after {} attempt(s): {}",
            subtask.local_id,
            subtask.skill,
            subtask.status,
            subtask.attempts,
            subtask
                .result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    for (key, value) in store.world_snapshot().await? {
        println!("  {} = {}", key, value.value);
    }
    for agent in scheduler.agent_statuses().await? {
        println!(
            "  {} is {:?} at {}",
            agent.id,
            agent.status,
            agent.location.as_deref().unwrap_or("unknown")
        );
    }

    scheduler.shutdown();
    scheduler_loop.await?;
    humanoid.stop().await?;
    rover.stop().await?;
    Ok(())
}
