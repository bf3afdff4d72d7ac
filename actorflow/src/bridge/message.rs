//! Queue deliveries and the task envelope they carry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ActorflowError, ErrorKind, Result};

/// Why the previous delivery of a message failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Error description.
    pub message: String,
}

impl From<&ActorflowError> for LastError {
    fn from(error: &ActorflowError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One delivery of a raw queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-assigned message id, stable across redeliveries.
    pub message_id: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Delivery attempt, starting at 0.
    pub attempt: u32,
    /// Failure of the previous attempt; `None` on the first delivery.
    pub last_error: Option<LastError>,
}

impl Delivery {
    /// Creates a first delivery of `body`.
    #[must_use]
    pub fn new(message_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            attempt: 0,
            last_error: None,
        }
    }

    /// Creates a first delivery of an encoded task under a fresh id.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload cannot be encoded.
    pub fn for_task(task: &TaskMessage) -> Result<Self> {
        Ok(Self::new(Uuid::new_v4().to_string(), task.encode()?))
    }

    /// Sets the delivery attempt.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Records the failure of the previous attempt.
    #[must_use]
    pub fn with_last_error(mut self, error: &ActorflowError) -> Self {
        self.last_error = Some(LastError::from(error));
        self
    }

    /// Decodes the body.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if the body is not a task envelope.
    pub fn decode(&self) -> Result<TaskMessage> {
        TaskMessage::decode(&self.message_id, &self.body)
    }
}

/// Routing envelope of an inbound task.
///
/// ```json
/// {"namespace": "counter", "destination": "c1", "operation": "increment", "payload": {"by": 2}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Namespace of the destination unit.
    pub namespace: String,
    /// Logical name of the destination unit.
    pub destination: String,
    /// Operation to invoke.
    pub operation: String,
    /// Operation arguments.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskMessage {
    /// Creates a task with a null payload.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        destination: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            destination: destination.into(),
            operation: operation.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Encodes the envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes and checks an envelope.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` for invalid JSON, missing fields, or a blank
    /// namespace or operation.
    pub fn decode(message_id: &str, body: &[u8]) -> Result<Self> {
        let task: Self = serde_json::from_slice(body)
            .map_err(|e| ActorflowError::malformed(message_id, e.to_string()))?;
        if task.namespace.trim().is_empty() {
            return Err(ActorflowError::malformed(message_id, "namespace is blank"));
        }
        if task.operation.trim().is_empty() {
            return Err(ActorflowError::malformed(message_id, "operation is blank"));
        }
        Ok(task)
    }
}
