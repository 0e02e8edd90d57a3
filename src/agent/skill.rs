use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use crate::core::errors::Result;
use crate::model::SkillDescriptor;

/// Edit to a world fact, applied to the fact's current value
#[derive(Debug, Clone, PartialEq)]
pub enum FactUpdate {
    /// Replace the whole value
    Set(Value),
    /// Set one attribute of an object value
    Field { field: String, value: Value },
    /// Add `item` to the array attribute `field` unless already present
    Insert { field: String, item: Value },
    /// Drop every `item` from the array attribute `field`
    Remove { field: String, item: Value },
}

impl FactUpdate {
    pub fn set(value: Value) -> Self {
        Self::Set(value)
    }

    pub fn field(field: impl Into<String>, value: Value) -> Self {
        Self::Field {
            field: field.into(),
            value,
        }
    }

    pub fn insert(field: impl Into<String>, item: Value) -> Self {
        Self::Insert {
            field: field.into(),
            item,
        }
    }

    pub fn remove(field: impl Into<String>, item: Value) -> Self {
        Self::Remove {
            field: field.into(),
            item,
        }
    }

    /// The fact value after this edit. Attribute edits on a missing or
    /// non-object value start from an empty object.
    pub fn apply(&self, current: Option<Value>) -> Value {
        let mut object = match (self, current) {
            (Self::Set(value), _) => return value.clone(),
            (_, Some(Value::Object(object))) => object,
            _ => Map::new(),
        };
        match self {
            Self::Set(_) => {}
            Self::Field { field, value } => {
                object.insert(field.clone(), value.clone());
            }
            Self::Insert { field, item } => {
                let slot = object
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !slot.is_array() {
                    *slot = Value::Array(Vec::new());
                }
                if let Value::Array(items) = slot {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
            }
            Self::Remove { field, item } => {
                if let Some(Value::Array(items)) = object.get_mut(field) {
                    items.retain(|existing| existing != item);
                }
            }
        }
        Value::Object(object)
    }
}

/// What a skill endpoint reports back
#[derive(Debug, Clone, PartialEq)]
pub struct SkillOutcome {
    pub success: bool,
    pub message: String,
    pub result: Option<Value>,
    /// Agent state after the call, e.g. `position` or `grasped`
    pub state: BTreeMap<String, Value>,
    /// Edits to world facts such as scene entries, in order
    pub facts: Vec<(String, FactUpdate)>,
    /// The failure means the plan is wrong, not the execution
    pub replan: bool,
}

impl SkillOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            result: None,
            state: BTreeMap::new(),
            facts: Vec::new(),
            replan: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(message)
        }
    }

    /// Failure that asks the coordinator for a new plan
    pub fn needs_replan(message: impl Into<String>) -> Self {
        Self {
            replan: true,
            ..Self::failure(message)
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, update: FactUpdate) -> Self {
        self.facts.push((key.into(), update));
        self
    }
}

/// A callable skill on a robot
#[async_trait]
pub trait SkillEndpoint: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn parameter_schema(&self) -> Option<Value> {
        None
    }

    async fn invoke(&self, parameters: &Value) -> Result<SkillOutcome>;

    /// Best-effort request to stop an in-progress invocation
    async fn abort(&self) {}
}

type SkillFn = dyn Fn(Value) -> BoxFuture<'static, Result<SkillOutcome>> + Send + Sync;

/// Skill endpoint backed by an async closure
pub struct FnSkill {
    name: String,
    description: String,
    schema: Option<Value>,
    handler: Box<SkillFn>,
}

impl FnSkill {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SkillOutcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            schema: None,
            handler: Box::new(move |parameters| Box::pin(handler(parameters))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

#[async_trait]
impl SkillEndpoint for FnSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameter_schema(&self) -> Option<Value> {
        self.schema.clone()
    }

    async fn invoke(&self, parameters: &Value) -> Result<SkillOutcome> {
        (self.handler)(parameters.clone()).await
    }
}

/// Skill name to endpoint lookup table for one agent
#[derive(Clone, Default)]
pub struct SkillSet {
    skills: HashMap<String, Arc<dyn SkillEndpoint>>,
}

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Arc<dyn SkillEndpoint>) -> &mut Self {
        self.skills.insert(skill.name().to_string(), skill);
        self
    }

    pub fn with(mut self, skill: impl SkillEndpoint + 'static) -> Self {
        self.register(Arc::new(skill));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SkillEndpoint>> {
        self.skills.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Catalogue entries published at registration
    pub fn descriptors(&self, agent_id: &str) -> Vec<SkillDescriptor> {
        let mut descriptors: Vec<SkillDescriptor> = self
            .skills
            .values()
            .map(|skill| SkillDescriptor {
                agent: agent_id.to_string(),
                skill: skill.name().to_string(),
                endpoint: format!("local://{}/{}", agent_id, skill.name()),
                description: skill.description().to_string(),
                parameter_schema: skill.parameter_schema(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.skill.cmp(&b.skill));
        descriptors
    }
}
