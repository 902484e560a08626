//! Link routing applied to producer output at run time.

use prost_reflect::{DynamicMessage, FieldDescriptor, ReflectMessage, Value};

use crate::error::{EngineError, Result};
use crate::schema::MessageSchema;

/// Moves one stage's output into the shape of another stage's input.
///
/// A source field extracts that sub-message from the output. A target field
/// places the value into a fresh message of the target's input type.
/// Values crossing between compatible types are transcoded.
#[derive(Debug, Clone)]
pub struct Route {
    source_field: Option<FieldDescriptor>,
    target: MessageSchema,
    target_field: Option<(FieldDescriptor, MessageSchema)>,
}

impl Route {
    /// Route the whole output into the whole target input.
    pub fn whole(target: MessageSchema) -> Self {
        Self {
            source_field: None,
            target,
            target_field: None,
        }
    }

    /// Extract a sub-message of the output first.
    pub fn from_field(mut self, field: FieldDescriptor) -> Self {
        self.source_field = Some(field);
        self
    }

    /// Place the value into one field of the target input.
    pub fn into_field(mut self, field: FieldDescriptor) -> Result<Self> {
        let schema = field
            .kind()
            .as_message()
            .cloned()
            .map(MessageSchema::new)
            .ok_or_else(|| {
                EngineError::invalid_argument(format!("field '{}' is not a message", field.full_name()))
            })?;
        self.target_field = Some((field, schema));
        Ok(self)
    }

    /// Schema of the messages this route produces.
    pub fn target(&self) -> &MessageSchema {
        &self.target
    }

    pub fn target_field(&self) -> Option<&FieldDescriptor> {
        self.target_field.as_ref().map(|(field, _)| field)
    }

    pub fn apply(&self, output: &DynamicMessage) -> Result<DynamicMessage> {
        let value = match &self.source_field {
            Some(field) => output
                .get_field(field)
                .as_message()
                .cloned()
                .ok_or_else(|| {
                    EngineError::invalid_argument(format!(
                        "field '{}' of {} does not hold a message",
                        field.name(),
                        output.descriptor().full_name()
                    ))
                })?,
            None => output.clone(),
        };

        match &self.target_field {
            Some((field, schema)) => {
                let inner = schema.transcode(&value)?;
                let mut message = self.target.new_empty();
                message
                    .try_set_field(field, Value::Message(inner))
                    .map_err(|e| EngineError::invalid_argument(e.to_string()))?;
                Ok(message)
            }
            None => self.target.transcode(&value),
        }
    }
}
