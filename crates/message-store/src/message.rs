use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{MessageError, MessageId, MessageStatus, OrchestrationId, StatusEntry};

/// Ties a message to one step (or the fallback step) of an orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationLink {
    pub orchestration_id: OrchestrationId,
    pub orchestration_name: String,
    pub step_name: String,
    /// Index of the step; `None` for the fallback step.
    pub step_number: Option<i32>,
    pub fallback: bool,
}

impl OrchestrationLink {
    /// Link for a command of a normal step.
    pub fn step(
        orchestration_id: OrchestrationId,
        orchestration_name: impl Into<String>,
        step_name: impl Into<String>,
        step_number: i32,
    ) -> Self {
        Self {
            orchestration_id,
            orchestration_name: orchestration_name.into(),
            step_name: step_name.into(),
            step_number: Some(step_number),
            fallback: false,
        }
    }

    /// Link for a compensation command.
    pub fn fallback(
        orchestration_id: OrchestrationId,
        orchestration_name: impl Into<String>,
        step_name: impl Into<String>,
    ) -> Self {
        Self {
            orchestration_id,
            orchestration_name: orchestration_name.into(),
            step_name: step_name.into(),
            step_number: None,
            fallback: true,
        }
    }

    /// A fallback link has no step number and a normal link always has one.
    pub fn is_consistent(&self) -> bool {
        self.fallback == self.step_number.is_none()
    }
}

/// A routable command or event envelope.
///
/// Messages travel over the bus as a wire record (see [`Message::to_wire`])
/// that never carries status history: receivers reload the authoritative copy
/// from the repository by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the repository on first persistence.
    pub id: Option<MessageId>,

    #[serde(default)]
    pub orchestration: Option<OrchestrationLink>,

    pub module: String,
    pub component: String,
    pub method: String,

    /// Opaque, caller-encoded payload.
    pub payload: Vec<u8>,

    /// Newest first.
    #[serde(skip)]
    pub(crate) history: Vec<StatusEntry>,
}

impl Message {
    /// Builds an unpersisted message with a JSON-encoded payload.
    pub fn new<T: Serialize + ?Sized>(
        module: impl Into<String>,
        component: impl Into<String>,
        method: impl Into<String>,
        payload: &T,
    ) -> Result<Self, MessageError> {
        let payload = serde_json::to_vec(payload).map_err(MessageError::Encoding)?;
        Ok(Self::from_raw(module, component, method, payload))
    }

    /// Builds an unpersisted message from pre-encoded payload bytes.
    pub fn from_raw(
        module: impl Into<String>,
        component: impl Into<String>,
        method: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: None,
            orchestration: None,
            module: module.into(),
            component: component.into(),
            method: method.into(),
            payload,
            history: Vec::new(),
        }
    }

    /// Attaches orchestration linkage.
    pub fn with_orchestration(mut self, link: OrchestrationLink) -> Self {
        self.orchestration = Some(link);
        self
    }

    pub fn raw_payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the JSON payload into `T`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_slice(&self.payload).map_err(MessageError::Decoding)
    }

    /// Status history, newest first.
    pub fn history(&self) -> &[StatusEntry] {
        &self.history
    }

    /// The most recent status entry, if the message has been persisted.
    pub fn latest(&self) -> Option<&StatusEntry> {
        self.history.first()
    }

    /// Current status; `None` means the message was never persisted.
    pub fn status(&self) -> Option<MessageStatus> {
        self.latest().map(|entry| entry.status)
    }

    /// The most recent error text recorded for this message.
    pub fn error(&self) -> Option<&str> {
        self.history.iter().find_map(|entry| entry.error.as_deref())
    }

    pub fn orchestration_id(&self) -> Option<OrchestrationId> {
        self.orchestration.as_ref().map(|link| link.orchestration_id)
    }

    pub fn step_number(&self) -> Option<i32> {
        self.orchestration.as_ref().and_then(|link| link.step_number)
    }

    pub fn is_fallback(&self) -> bool {
        self.orchestration.as_ref().is_some_and(|link| link.fallback)
    }

    /// Encodes the wire record (no status history).
    pub fn to_wire(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encoding)
    }

    /// Decodes a wire record. The result has an empty history.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct IngestRequest {
        symbol: String,
        days: u32,
    }

    #[test]
    fn new_message_is_unpersisted() {
        let payload = IngestRequest {
            symbol: "AAPL".to_string(),
            days: 30,
        };
        let message = Message::new("backtest", "ingest", "start", &payload).unwrap();

        assert!(message.id.is_none());
        assert!(message.status().is_none());
        assert!(message.history().is_empty());
        assert_eq!(message.parse_payload::<IngestRequest>().unwrap(), payload);
    }

    #[test]
    fn parse_payload_rejects_shape_mismatch() {
        let message = Message::new("backtest", "ingest", "start", &vec![1, 2, 3]).unwrap();
        let result = message.parse_payload::<IngestRequest>();
        assert!(matches!(result, Err(MessageError::Decoding(_))));
    }

    #[test]
    fn raw_payload_is_passed_through() {
        let message = Message::from_raw("finance", "quotes", "fetch", vec![0xde, 0xad]);
        assert_eq!(message.raw_payload(), &[0xde, 0xad]);
    }

    #[test]
    fn wire_record_drops_history() {
        let mut message = Message::from_raw("finance", "quotes", "fetch", b"{}".to_vec());
        message.id = Some(MessageId::new());
        message.history = vec![StatusEntry::new(MessageStatus::Created, None)];

        let decoded = Message::from_wire(&message.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.id, message.id);
        assert!(decoded.history().is_empty());
    }

    #[test]
    fn malformed_wire_record_is_rejected() {
        let result = Message::from_wire(b"not json");
        assert!(matches!(result, Err(MessageError::Wire(_))));
    }

    #[test]
    fn error_comes_from_newest_entry_that_has_one() {
        let mut message = Message::from_raw("backtest", "engine", "run", Vec::new());
        message.history = vec![
            StatusEntry::new(MessageStatus::Complete, Some("engine crashed".to_string())),
            StatusEntry::new(MessageStatus::Received, None),
        ];
        assert_eq!(message.status(), Some(MessageStatus::Complete));
        assert_eq!(message.error(), Some("engine crashed"));
    }

    #[test]
    fn link_consistency() {
        let id = OrchestrationId::new();
        assert!(OrchestrationLink::step(id, "saga", "ingest", 0).is_consistent());
        assert!(OrchestrationLink::fallback(id, "saga", "cleanup").is_consistent());

        let mut broken = OrchestrationLink::fallback(id, "saga", "cleanup");
        broken.step_number = Some(3);
        assert!(!broken.is_consistent());
    }
}
