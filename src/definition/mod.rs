//! Declared orchestration records.
//!
//! These are the shapes the definition store hands to the graph builder.
//! They are plain data; nothing here talks to the network.

use std::fmt;

use serde::Deserialize;

/// A stage: one remote unary RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageDef {
    pub name: String,
    /// Network address of the server, `host:port` or a full `http(s)://` URI.
    pub address: String,
    /// Service to call. May be omitted when the server exposes exactly one.
    #[serde(default)]
    pub service: Option<String>,
    /// Method to call. May be omitted when the service has exactly one.
    #[serde(default)]
    pub method: Option<String>,
    /// Join several field-targeted input links through a merge worker.
    #[serde(default)]
    pub merge: bool,
}

impl StageDef {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            service: None,
            method: None,
            merge: false,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_merge(mut self) -> Self {
        self.merge = true;
        self
    }
}

/// One end of a link: a stage and optionally one of its message fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct LinkEnd {
    pub stage: String,
    /// `None` routes the whole message.
    #[serde(default)]
    pub field: Option<String>,
}

impl LinkEnd {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            field: None,
        }
    }

    pub fn field(stage: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            field: Some(field.into()),
        }
    }
}

impl fmt::Display for LinkEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.stage, field),
            None => f.write_str(&self.stage),
        }
    }
}

/// A directed edge from a stage's output to another stage's input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinkDef {
    pub name: String,
    pub source: LinkEnd,
    pub target: LinkEnd,
}

impl LinkDef {
    pub fn new(name: impl Into<String>, source: LinkEnd, target: LinkEnd) -> Self {
        Self {
            name: name.into(),
            source,
            target,
        }
    }
}

/// An orchestration: the stage and link names that make up one graph.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct OrchestrationDef {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
}

/// Lifecycle phase of an orchestration, tracked by the engine registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    /// True once the orchestration reached a terminal phase.
    pub fn is_finished(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A document of definitions, as read from a YAML resource file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Definitions {
    pub orchestrations: Vec<OrchestrationDef>,
    pub stages: Vec<StageDef>,
    pub links: Vec<LinkDef>,
}

impl Definitions {
    /// Parse a definitions document from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}
