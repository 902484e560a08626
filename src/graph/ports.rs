//! Per-stage link registration.
//!
//! A stage's input side accepts at most one full-message link and at most
//! one link per target field. Its output side fans out freely, but the same
//! link may only be registered once.

use crate::error::{EngineError, Result};

/// A link registered on a stage's input side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InputPort {
    pub(crate) link: String,
    /// Target field; `None` for a full-message link.
    pub(crate) field: Option<String>,
}

/// Input side of one stage.
#[derive(Debug, Default)]
pub(crate) struct InputPorts {
    stage: String,
    ports: Vec<InputPort>,
}

impl InputPorts {
    pub(crate) fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ports: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, link: &str, field: Option<&str>) -> Result<()> {
        let clash = self
            .ports
            .iter()
            .find(|p| p.field.as_deref() == field);
        if let Some(existing) = clash {
            let what = match field {
                Some(field) => format!("field '{}'", field),
                None => "the full message".to_string(),
            };
            return Err(EngineError::failed_precondition(format!(
                "stage '{}' already receives {} from link '{}', cannot add link '{}'",
                self.stage, what, existing.link, link
            )));
        }

        self.ports.push(InputPort {
            link: link.to_string(),
            field: field.map(str::to_string),
        });
        Ok(())
    }

    pub(crate) fn ports(&self) -> &[InputPort] {
        &self.ports
    }

    pub(crate) fn len(&self) -> usize {
        self.ports.len()
    }
}

/// Output side of one stage.
#[derive(Debug, Default)]
pub(crate) struct OutputPorts {
    stage: String,
    links: Vec<String>,
}

impl OutputPorts {
    pub(crate) fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            links: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, link: &str) -> Result<()> {
        if self.links.iter().any(|l| l == link) {
            return Err(EngineError::failed_precondition(format!(
                "link '{}' is already registered on the output of stage '{}'",
                link, self.stage
            )));
        }
        self.links.push(link.to_string());
        Ok(())
    }

    pub(crate) fn links(&self) -> &[String] {
        &self.links
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }
}
