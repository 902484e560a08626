//! In-memory definition store.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::DefinitionStore;
use crate::definition::{Definitions, LinkDef, OrchestrationDef, StageDef};
use crate::error::{EngineError, Result};

/// Definition store that keeps every record in memory.
#[derive(Default)]
pub struct MemoryDefinitionStore {
    orchestrations: RwLock<HashMap<String, OrchestrationDef>>,
    stages: RwLock<HashMap<String, StageDef>>,
    links: RwLock<HashMap<String, LinkDef>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a definitions document, rejecting duplicate names.
    pub fn from_definitions(defs: Definitions) -> Result<Self> {
        let mut orchestrations = HashMap::new();
        for orchestration in defs.orchestrations {
            insert_unique(&mut orchestrations, "orchestration", orchestration.name.clone(), orchestration)?;
        }
        let mut stages = HashMap::new();
        for stage in defs.stages {
            insert_unique(&mut stages, "stage", stage.name.clone(), stage)?;
        }
        let mut links = HashMap::new();
        for link in defs.links {
            insert_unique(&mut links, "link", link.name.clone(), link)?;
        }

        Ok(Self {
            orchestrations: RwLock::new(orchestrations),
            stages: RwLock::new(stages),
            links: RwLock::new(links),
        })
    }

    /// Load a YAML definitions file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            EngineError::failed_precondition(format!(
                "cannot read definitions file {}: {}",
                path.display(),
                e
            ))
        })?;
        let defs = Definitions::from_yaml(&yaml).map_err(|e| {
            EngineError::invalid_argument(format!(
                "malformed definitions file {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(
            path = %path.display(),
            orchestrations = defs.orchestrations.len(),
            stages = defs.stages.len(),
            links = defs.links.len(),
            "Loaded definitions"
        );

        Self::from_definitions(defs)
    }

    pub async fn add_orchestration(&self, orchestration: OrchestrationDef) -> Result<()> {
        let mut map = self.orchestrations.write().await;
        insert_unique(&mut map, "orchestration", orchestration.name.clone(), orchestration)
    }

    pub async fn add_stage(&self, stage: StageDef) -> Result<()> {
        let mut map = self.stages.write().await;
        insert_unique(&mut map, "stage", stage.name.clone(), stage)
    }

    pub async fn add_link(&self, link: LinkDef) -> Result<()> {
        let mut map = self.links.write().await;
        insert_unique(&mut map, "link", link.name.clone(), link)
    }
}

fn insert_unique<T>(map: &mut HashMap<String, T>, what: &str, name: String, value: T) -> Result<()> {
    if map.contains_key(&name) {
        return Err(EngineError::already_exists(format!("{} '{}'", what, name)));
    }
    map.insert(name, value);
    Ok(())
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn load_orchestration(&self, name: &str) -> Result<OrchestrationDef> {
        self.orchestrations
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("orchestration '{}'", name)))
    }

    async fn load_stage(&self, name: &str) -> Result<StageDef> {
        self.stages
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("stage '{}'", name)))
    }

    async fn load_link(&self, name: &str) -> Result<LinkDef> {
        self.links
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("link '{}'", name)))
    }
}
