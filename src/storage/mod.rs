//! Definition storage.
//!
//! The engine only reads definitions; how they are persisted is up to the
//! implementation. Reads within one build are assumed snapshot-consistent.

use async_trait::async_trait;

use crate::definition::{LinkDef, OrchestrationDef, StageDef};
use crate::error::Result;

pub mod memory;

pub use memory::MemoryDefinitionStore;

/// Interface for loading orchestration, stage and link definitions.
///
/// Implementations:
/// - `MemoryDefinitionStore`: in-process maps, optionally seeded from YAML
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Load an orchestration record. Fails NotFound if absent.
    async fn load_orchestration(&self, name: &str) -> Result<OrchestrationDef>;

    /// Load a stage definition. Fails NotFound if absent.
    async fn load_stage(&self, name: &str) -> Result<StageDef>;

    /// Load a link definition. Fails NotFound if absent.
    async fn load_link(&self, name: &str) -> Result<LinkDef>;
}
