use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{PlanResponse, SubtaskDescriptor};
use crate::core::errors::{Result, SwarmError};
use crate::model::AgentId;

/// What a plan is checked against
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    /// Skills offered by at least one registered agent
    pub capabilities: HashSet<String>,
    /// Skills per agent, for plans that name an agent
    pub agents: HashMap<AgentId, BTreeSet<String>>,
    /// Parameter schemas keyed by skill
    pub schemas: HashMap<String, Value>,
    /// Ids of steps already done; a re-plan may depend on them
    pub completed: HashSet<String>,
}

/// Check a proposed plan and return its steps in a topological order.
///
/// Dependencies on already completed steps are satisfied and dropped.
pub fn validate_plan(response: &PlanResponse, context: &PlanContext) -> Result<Vec<SubtaskDescriptor>> {
    if response.subtasks.is_empty() {
        return Err(SwarmError::planning("plan contains no subtasks"));
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for (position, step) in response.subtasks.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(SwarmError::planning(format!(
                "subtask at position {} has an empty id",
                position
            )));
        }
        if context.completed.contains(&step.id) {
            return Err(SwarmError::planning(format!(
                "subtask id '{}' collides with a completed step",
                step.id
            )));
        }
        if indices.insert(step.id.as_str(), graph.add_node(position)).is_some() {
            return Err(SwarmError::planning(format!(
                "duplicate subtask id '{}'",
                step.id
            )));
        }
    }

    for step in &response.subtasks {
        check_capability(step, context)?;
        check_parameters(step, context)?;

        let to = indices[step.id.as_str()];
        for dependency in &step.depends_on {
            if dependency == &step.id {
                return Err(SwarmError::planning(format!(
                    "subtask '{}' depends on itself, which is a cycle",
                    step.id
                )));
            }
            match indices.get(dependency.as_str()) {
                Some(&from) => {
                    graph.add_edge(from, to, ());
                }
                None if context.completed.contains(dependency) => {}
                None => {
                    return Err(SwarmError::planning(format!(
                        "subtask '{}' depends on unknown subtask '{}'",
                        step.id, dependency
                    )))
                }
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(SwarmError::planning(
            "dependency graph contains a cycle",
        ));
    }
    let order = toposort(&graph, None)
        .map_err(|_| SwarmError::planning("dependency graph contains a cycle"))?;

    Ok(order
        .into_iter()
        .map(|index| {
            let mut step = response.subtasks[graph[index]].clone();
            step.depends_on.retain(|d| !context.completed.contains(d));
            step.depends_on.sort();
            step.depends_on.dedup();
            step
        })
        .collect())
}

fn check_capability(step: &SubtaskDescriptor, context: &PlanContext) -> Result<()> {
    if !context.capabilities.contains(&step.skill) {
        return Err(SwarmError::planning(format!(
            "subtask '{}' requires unknown capability '{}'",
            step.id, step.skill
        )));
    }
    if let Some(agent) = &step.agent {
        match context.agents.get(agent) {
            Some(skills) if skills.contains(&step.skill) => {}
            Some(_) => {
                return Err(SwarmError::planning(format!(
                    "subtask '{}' names agent '{}', which does not offer '{}'",
                    step.id, agent, step.skill
                )))
            }
            None => {
                return Err(SwarmError::planning(format!(
                    "subtask '{}' names unregistered agent '{}'",
                    step.id, agent
                )))
            }
        }
    }
    Ok(())
}

fn check_parameters(step: &SubtaskDescriptor, context: &PlanContext) -> Result<()> {
    let Some(schema) = context.schemas.get(&step.skill) else {
        return Ok(());
    };
    let validator = jsonschema::validator_for(schema).map_err(|e| {
        SwarmError::planning(format!(
            "parameter schema for '{}' does not compile: {}",
            step.skill, e
        ))
    })?;
    if let Err(error) = validator.validate(&step.parameters) {
        return Err(SwarmError::planning(format!(
            "parameters of subtask '{}' rejected by '{}' schema: {}",
            step.id, step.skill, error
        )));
    }
    Ok(())
}
