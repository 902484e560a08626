//! Flow units: the correlation-tagged tokens moving between workers.

use prost_reflect::DynamicMessage;

/// Correlation identifier. Sources assign 1, 2, 3, ...
pub type FlowId = u64;

/// One unit of data, or the end of a stream.
///
/// A terminal unit carries no payload. It travels only along the control
/// path and is never placed into a message field. Its id correlates with no
/// data flow: a source stamps it with the next id it would have assigned,
/// and downstream workers forward it unchanged. A worker whose input closed
/// without a terminal uses one past the last id it saw.
#[derive(Debug, Clone)]
pub struct Flow {
    id: FlowId,
    payload: Option<DynamicMessage>,
}

impl Flow {
    pub fn data(id: FlowId, payload: DynamicMessage) -> Self {
        Self {
            id,
            payload: Some(payload),
        }
    }

    pub fn terminal(id: FlowId) -> Self {
        Self { id, payload: None }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_none()
    }

    pub fn payload(&self) -> Option<&DynamicMessage> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<DynamicMessage> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{demo_pool, int_message, message};

    #[test]
    fn test_data_flow_carries_payload() {
        let pool = demo_pool();
        let flow = Flow::data(7, int_message(&message(&pool, "demo.Number"), 3));
        assert_eq!(flow.id(), 7);
        assert!(!flow.is_terminal());
        assert!(flow.payload().is_some());
    }

    #[test]
    fn test_terminal_flow_has_no_payload() {
        let flow = Flow::terminal(4);
        assert!(flow.is_terminal());
        assert!(flow.into_payload().is_none());
    }
}
