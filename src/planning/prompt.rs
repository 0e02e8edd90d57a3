//! Prompt rendering and answer parsing for text-model planners.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use super::{PlanRequest, PlanResponse, SubtaskDescriptor};
use crate::core::errors::{Result, SwarmError};

const INSTRUCTIONS: &str = r#"You are a robotics expert specializing in task decomposition. Break the task into subtasks that a single robot can execute with one of its skills, and state the dependencies between them. Independent subtasks must not depend on each other so they can run in parallel.

Answer with a short reasoning paragraph followed by a fenced JSON block:
```json
{
  "reasoning": "...",
  "subtasks": [
    {"id": "s1", "description": "...", "skill": "...", "parameters": {}, "depends_on": [], "agent": null}
  ]
}
```"#;

/// Build the planning prompt for `request`
pub fn render_prompt(request: &PlanRequest) -> String {
    let mut prompt = String::from(INSTRUCTIONS);

    prompt.push_str("\n\n## Robots\n");
    if request.agents.is_empty() {
        prompt.push_str("No robot is registered.\n");
    }
    for agent in &request.agents {
        let _ = writeln!(
            prompt,
            "- {} ({:?}) at {}: skills {}",
            agent.agent_id,
            agent.embodiment,
            agent.location.as_deref().unwrap_or("unknown location"),
            agent.skills.join(", ")
        );
    }

    prompt.push_str("\n## Scene\n");
    if request.world_state.is_empty() {
        prompt.push_str("No scene information.\n");
    }
    let now = Utc::now();
    for (key, fact) in &request.world_state {
        let age = (now - fact.timestamp).num_seconds().max(0);
        let _ = writeln!(
            prompt,
            "- {}: {} (reported by {}, {}s ago)",
            key, fact.value, fact.writer, age
        );
    }

    if request.is_replan() {
        prompt.push_str("\n## Already completed\nPlan only the remaining work. You may depend on these ids.\n");
        for step in &request.completed {
            let result = step
                .result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no result".to_string());
            let _ = writeln!(
                prompt,
                "- {} [{}] {}: {}",
                step.id, step.skill, step.description, result
            );
        }
    }

    if let Some(error) = &request.prior_error {
        let _ = write!(
            prompt,
            "\n## Previous answer was rejected\n{}\nFix this problem in your new answer.\n",
            error
        );
    }

    let _ = write!(prompt, "\n# Task\n{}\n", request.instruction);
    prompt
}

/// The fenced ```json block of `text`, or the whole text when there is none
pub fn extract_json_block(text: &str) -> &str {
    const START: &str = "```json";
    const END: &str = "```";
    match text.find(START) {
        Some(start) => {
            let body = &text[start + START.len()..];
            match body.find(END) {
                Some(end) => body[..end].trim(),
                None => body.trim(),
            }
        }
        None => text.trim(),
    }
}

/// Entry of the ordered-group answer format, where every subtask of group
/// `n` waits for all subtasks of the previous group.
#[derive(Debug, Deserialize)]
struct GroupedEntry {
    #[serde(default, alias = "robot_name")]
    agent: Option<String>,
    #[serde(default, alias = "subtask", alias = "task")]
    description: String,
    skill: String,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(alias = "task_order")]
    subtask_order: Value,
}

fn order_of(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| SwarmError::planning(format!("invalid subtask_order {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| SwarmError::planning(format!("invalid subtask_order '{}'", s))),
        other => Err(SwarmError::planning(format!(
            "invalid subtask_order {}",
            other
        ))),
    }
}

/// `base`, or `base_{n}` for the smallest `n` that is not taken yet
fn fresh_id(base: String, taken: &HashSet<String>) -> String {
    if !taken.contains(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Group entries get synthesized ids, so they must steer clear of the ids
/// in `taken` (completed steps of an earlier plan).
fn from_groups(entries: Vec<GroupedEntry>, taken: &HashSet<String>) -> Result<Vec<SubtaskDescriptor>> {
    let mut groups: BTreeMap<i64, Vec<GroupedEntry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(order_of(&entry.subtask_order)?).or_default().push(entry);
    }

    let mut used = taken.clone();
    let mut subtasks = Vec::new();
    let mut previous: Vec<String> = Vec::new();
    for (order, entries) in groups {
        let mut current = Vec::new();
        for (position, entry) in entries.into_iter().enumerate() {
            let id = fresh_id(format!("g{}_{}", order, position), &used);
            used.insert(id.clone());
            subtasks.push(SubtaskDescriptor {
                id: id.clone(),
                description: entry.description,
                skill: entry.skill,
                parameters: entry
                    .parameters
                    .unwrap_or_else(|| Value::Object(Default::default())),
                depends_on: previous.clone(),
                agent: entry.agent,
            });
            current.push(id);
        }
        previous = current;
    }
    Ok(subtasks)
}

fn is_grouped(entries: &[Value]) -> bool {
    entries
        .iter()
        .any(|e| e.get("subtask_order").is_some() || e.get("task_order").is_some())
}

fn parse_entries(entries: Vec<Value>, taken: &HashSet<String>) -> Result<Vec<SubtaskDescriptor>> {
    if is_grouped(&entries) {
        let grouped: Vec<GroupedEntry> = serde_json::from_value(Value::Array(entries))
            .map_err(|e| SwarmError::planning(format!("malformed subtask list: {}", e)))?;
        from_groups(grouped, taken)
    } else {
        serde_json::from_value(Value::Array(entries))
            .map_err(|e| SwarmError::planning(format!("malformed subtask list: {}", e)))
    }
}

/// Parse a model answer into a plan.
///
/// Accepts a bare subtask array, `{"subtasks": [...]}` with explicit
/// `depends_on`, or `{"subtask_list": [...]}` with `subtask_order` groups.
/// Ids synthesized for groups never reuse an id in `taken`.
pub fn parse_plan(text: &str, taken: &HashSet<String>) -> Result<PlanResponse> {
    let block = extract_json_block(text);
    let value: Value = serde_json::from_str(block)
        .map_err(|e| SwarmError::planning(format!("answer is not valid JSON: {}", e)))?;

    match value {
        Value::Array(entries) => Ok(PlanResponse {
            subtasks: parse_entries(entries, taken)?,
            reasoning: None,
        }),
        Value::Object(mut object) => {
            let reasoning = object
                .remove("reasoning")
                .or_else(|| object.remove("reasoning_explanation"))
                .and_then(|r| r.as_str().map(str::to_string));
            let entries = match object
                .remove("subtasks")
                .or_else(|| object.remove("subtask_list"))
            {
                Some(Value::Array(entries)) => entries,
                Some(_) => return Err(SwarmError::planning("subtask list is not an array")),
                None => return Err(SwarmError::planning("answer has no subtask list")),
            };
            Ok(PlanResponse {
                subtasks: parse_entries(entries, taken)?,
                reasoning,
            })
        }
        _ => Err(SwarmError::planning("answer is neither an object nor an array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Embodiment, SharedStateFact};
    use crate::planning::{AgentCapabilities, CompletedStep};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_explicit_form() {
        let answer = r#"The robot must first drive over.
```json
{
  "reasoning": "navigate then grasp",
  "subtasks": [
    {"id": "go", "skill": "navigate_to_target", "parameters": {"target": "table"}},
    {"id": "pick", "skill": "grasp_object", "parameters": {"object": "apple"}, "depends_on": ["go"]}
  ]
}
```
done"#;
        let plan = parse_plan(answer, &HashSet::new()).unwrap();
        assert_eq!(plan.reasoning.as_deref(), Some("navigate then grasp"));
        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.subtasks[1].depends_on, vec!["go".to_string()]);
        assert_eq!(plan.subtasks[0].parameters, json!({"target": "table"}));
    }

    #[test]
    fn test_parse_grouped_form() {
        let answer = r#"```json
{
  "reasoning_explanation": "two robots fetch in parallel, then one places",
  "subtask_list": [
    {"robot_name": "robot_1", "subtask": "fetch apple", "skill": "grasp_object", "subtask_order": "0"},
    {"robot_name": "robot_2", "subtask": "fetch pear", "skill": "grasp_object", "subtask_order": "0"},
    {"robot_name": "robot_1", "subtask": "place both", "skill": "place_to_affordance", "subtask_order": 1}
  ]
}
```"#;
        let plan = parse_plan(answer, &HashSet::new()).unwrap();
        let ids: Vec<&str> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["g0_0", "g0_1", "g1_0"]);
        assert!(plan.subtasks[0].depends_on.is_empty());
        assert_eq!(
            plan.subtasks[2].depends_on,
            vec!["g0_0".to_string(), "g0_1".to_string()]
        );
        assert_eq!(plan.subtasks[1].agent.as_deref(), Some("robot_2"));
        assert_eq!(plan.subtasks[2].description, "place both");
    }

    #[test]
    fn test_grouped_ids_skip_taken_ids() {
        let answer = r#"[
  {"skill": "navigate_to_target", "subtask_order": 1},
  {"skill": "grasp_object", "subtask_order": 2},
  {"skill": "grasp_object", "subtask_order": 2}
]"#;
        let taken: HashSet<String> = ["g1_0", "g2_1", "g2_1_1"].iter().map(|s| s.to_string()).collect();
        let plan = parse_plan(answer, &taken).unwrap();
        let ids: Vec<&str> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["g1_0_1", "g2_0", "g2_1_2"]);
        assert_eq!(plan.subtasks[1].depends_on, vec!["g1_0_1".to_string()]);
    }

    #[test]
    fn test_parse_failures() {
        let none = HashSet::new();
        assert!(parse_plan("no json here", &none).is_err());
        assert!(parse_plan("```json\n{\"foo\": 1}\n```", &none).is_err());
        assert!(parse_plan("```json\n[{\"id\": \"a\"}]\n```", &none).is_err());
    }

    #[test]
    fn test_render_prompt_mentions_context() {
        let mut request = PlanRequest::new("put the apple in the fridge");
        request.agents.push(AgentCapabilities {
            agent_id: "robot_1".to_string(),
            embodiment: Embodiment::DualArm,
            skills: vec!["grasp_object".to_string()],
            location: Some("kitchen".to_string()),
        });
        let mut table = SharedStateFact::new("table_1", json!({"contains": ["apple"]}), "robot_2");
        table.timestamp = Utc::now() - chrono::Duration::seconds(90);
        request.world_state.insert(table.key.clone(), table);
        request.completed.push(CompletedStep {
            id: "go".to_string(),
            skill: "navigate_to_target".to_string(),
            description: "drive to the table".to_string(),
            result: None,
        });
        request.prior_error = Some("dependency graph contains a cycle".to_string());

        let prompt = render_prompt(&request);
        assert!(prompt.contains("robot_1"));
        assert!(prompt.contains("kitchen"));
        assert!(prompt.contains("table_1"));
        assert!(prompt.contains("reported by robot_2, 90s ago"));
        assert!(prompt.contains("Already completed"));
        assert!(prompt.contains("contains a cycle"));
        assert!(prompt.ends_with("put the apple in the fridge\n"));
    }
}
