//! Scene description loaded into the blackboard at start-up.
//!
//! ```yaml
//! scene:
//!   - name: kitchenTable
//!     type: table
//!     contains: [apple]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::core::errors::Result;
use crate::model::SharedStateFact;
use crate::storage::CoordinationStore;

/// Writer recorded on facts that come from the scene file
pub const SCENE_WRITER: &str = "scene";

/// A named receptacle, object or location with free-form attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub scene: Vec<SceneEntry>,
}

impl Scene {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}

/// Write one fact per named entry. Entries without a name are skipped.
pub async fn seed_scene(store: &dyn CoordinationStore, scene: &Scene) -> Result<usize> {
    let mut seeded = 0;
    for entry in &scene.scene {
        let Some(name) = &entry.name else {
            warn!("Skipping scene entry without a name: {:?}", entry.attributes);
            continue;
        };
        let value = serde_json::to_value(&entry.attributes)?;
        store
            .put_fact(SharedStateFact::new(name.clone(), value, SCENE_WRITER))
            .await?;
        seeded += 1;
    }
    info!("Seeded {} scene fact(s)", seeded);
    Ok(seeded)
}
