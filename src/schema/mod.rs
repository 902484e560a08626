//! Message schemas discovered through reflection.
//!
//! A [`MessageSchema`] is a handle to a remote message type. It supports
//! projecting onto a message-typed field and a structural compatibility check
//! keyed by field number, mirroring protobuf wire compatibility: only field
//! numbers present on both sides are compared, names never matter.

use std::collections::HashSet;
use std::fmt;
use std::mem::discriminant;

use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage};

use crate::error::{EngineError, Result};

#[cfg(test)]
mod tests;

/// Structural handle to a protobuf message type.
#[derive(Clone, PartialEq, Eq)]
pub struct MessageSchema {
    descriptor: MessageDescriptor,
}

impl MessageSchema {
    pub fn new(descriptor: MessageDescriptor) -> Self {
        Self { descriptor }
    }

    /// Fully-qualified type name. Diagnostic only.
    pub fn full_name(&self) -> &str {
        self.descriptor.full_name()
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Returns the schema of a singular, message-typed field.
    ///
    /// Scalar, repeated and map fields cannot be projected and yield `None`.
    pub fn field(&self, name: &str) -> Option<MessageSchema> {
        self.projectable_field(name)
            .and_then(|field| field.kind().as_message().cloned())
            .map(MessageSchema::new)
    }

    /// Like [`field`](Self::field), but returns the field descriptor itself.
    pub(crate) fn projectable_field(&self, name: &str) -> Option<FieldDescriptor> {
        let field = self.descriptor.get_field_by_name(name)?;
        if field.is_list() || field.is_map() || field.kind().as_message().is_none() {
            return None;
        }
        Some(field)
    }

    /// Project onto a field, failing NotFound when it cannot be projected.
    pub fn project(&self, name: &str) -> Result<MessageSchema> {
        self.field(name).ok_or_else(|| {
            EngineError::not_found(format!(
                "field '{}' of {} does not exist or is not a message",
                name,
                self.full_name()
            ))
        })
    }

    /// Structural compatibility over the overlapping field numbers.
    ///
    /// For every field number present in both schemas the cardinality and
    /// the field type must match; message-typed fields are compared
    /// recursively. Fields present on one side only are ignored.
    pub fn compatible(&self, other: &MessageSchema) -> bool {
        let mut assumed = HashSet::new();
        messages_compatible(&self.descriptor, &other.descriptor, &mut assumed)
    }

    /// A zero-valued message of this type.
    pub fn new_empty(&self) -> DynamicMessage {
        DynamicMessage::new(self.descriptor.clone())
    }

    /// Re-read a message of another (compatible) type as this type.
    ///
    /// Goes through the wire encoding, so unknown field numbers are kept as
    /// unknown fields and shared field numbers carry over.
    pub fn transcode(&self, message: &DynamicMessage) -> Result<DynamicMessage> {
        if message.descriptor() == self.descriptor {
            return Ok(message.clone());
        }
        let mut target = self.new_empty();
        target.transcode_from(message).map_err(|e| {
            EngineError::invalid_argument(format!(
                "cannot read {} as {}: {}",
                message.descriptor().full_name(),
                self.full_name(),
                e
            ))
        })?;
        Ok(target)
    }
}

impl fmt::Debug for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageSchema").field(&self.full_name()).finish()
    }
}

impl fmt::Display for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_name())
    }
}

/// Compare two message descriptors.
///
/// `assumed` holds the pairs currently under comparison; meeting one again
/// means a recursive type closed a cycle, which is treated as compatible.
fn messages_compatible(
    a: &MessageDescriptor,
    b: &MessageDescriptor,
    assumed: &mut HashSet<(String, String)>,
) -> bool {
    let pair = (a.full_name().to_string(), b.full_name().to_string());
    if !assumed.insert(pair) {
        return true;
    }

    a.fields().all(|field_a| match b.get_field(field_a.number()) {
        Some(field_b) => fields_compatible(&field_a, &field_b, assumed),
        None => true,
    })
}

fn fields_compatible(
    a: &FieldDescriptor,
    b: &FieldDescriptor,
    assumed: &mut HashSet<(String, String)>,
) -> bool {
    if a.is_list() != b.is_list() || a.is_map() != b.is_map() {
        return false;
    }

    match (a.kind(), b.kind()) {
        (Kind::Message(ma), Kind::Message(mb)) => messages_compatible(&ma, &mb, assumed),
        (ka, kb) => discriminant(&ka) == discriminant(&kb),
    }
}
