//! Error types for the actorflow runtime.
//!
//! Every failure that crosses a unit boundary is typed and inspectable. The
//! queue bridge uses [`ActorflowError::is_retryable`] to decide between
//! re-delivery and the dead-letter sink.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::registry::UnitIdentity;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ActorflowError>;

/// Coarse classification of an [`ActorflowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The logical name or namespace was rejected.
    InvalidName,
    /// The call arguments were rejected.
    InvalidArgument,
    /// The addressed operation does not exist.
    UnknownOperation,
    /// No unit kind is registered for the namespace.
    UnknownNamespace,
    /// A handler failed.
    Handler,
    /// The call exceeded its deadline.
    Timeout,
    /// Another owner committed to the same identity.
    ConcurrentMutation,
    /// An inbound message could not be decoded.
    MalformedMessage,
    /// The storage backend failed.
    Storage,
    /// The call observed a cancellation request.
    Cancelled,
    /// Encoding or decoding state failed.
    Serialization,
    /// A pipeline run ended in the failed state.
    PipelineFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidName => "invalid_name",
            Self::InvalidArgument => "invalid_argument",
            Self::UnknownOperation => "unknown_operation",
            Self::UnknownNamespace => "unknown_namespace",
            Self::Handler => "handler",
            Self::Timeout => "timeout",
            Self::ConcurrentMutation => "concurrent_mutation",
            Self::MalformedMessage => "malformed_message",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::Serialization => "serialization",
            Self::PipelineFailed => "pipeline_failed",
        };
        f.write_str(s)
    }
}

/// The main error type for actorflow operations.
#[derive(Debug, Clone, Error)]
pub enum ActorflowError {
    /// A logical name or namespace was empty or malformed.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The arguments passed to an operation were rejected.
    #[error("Invalid argument for '{operation}': {reason}")]
    InvalidArgument {
        /// The operation being called.
        operation: String,
        /// Why the arguments were rejected.
        reason: String,
    },

    /// The unit has no operation with this name.
    #[error("Unknown operation '{operation}' on {identity}")]
    UnknownOperation {
        /// The addressed unit.
        identity: UnitIdentity,
        /// The missing operation.
        operation: String,
    },

    /// The gateway has no unit kind for this namespace.
    #[error("No unit kind registered for namespace '{namespace}'")]
    UnknownNamespace {
        /// The unregistered namespace.
        namespace: String,
    },

    /// A handler returned a fault.
    #[error("{0}")]
    Handler(#[from] HandlerError),

    /// The call did not complete before its deadline.
    #[error("Call to '{operation}' on {identity} timed out after {timeout_ms}ms")]
    Timeout {
        /// The addressed unit.
        identity: UnitIdentity,
        /// The operation being called.
        operation: String,
        /// The deadline that expired.
        timeout_ms: u64,
    },

    /// The persisted revision moved underneath the call.
    #[error("Concurrent mutation of {identity}: expected revision {expected}, found {current}")]
    ConcurrentMutation {
        /// The contested unit.
        identity: UnitIdentity,
        /// The revision this instance believed current.
        expected: u64,
        /// The revision found in storage.
        current: u64,
    },

    /// An inbound task message could not be decoded.
    #[error("Malformed message '{message_id}': {reason}")]
    MalformedMessage {
        /// The queue message id.
        message_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The storage backend failed for reasons other than a revision conflict.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The call observed a cancellation request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// State or payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A pipeline run failed; the persisted state carries the partial progress.
    #[error("Pipeline {identity} failed at step '{step}': {error}")]
    PipelineFailed {
        /// The orchestrator identity.
        identity: UnitIdentity,
        /// The first failing step id.
        step: String,
        /// The recorded step error.
        error: String,
        /// The persisted pipeline state at the time of failure.
        state: Box<crate::pipeline::PipelineState>,
    },
}

impl ActorflowError {
    /// Creates an invalid name error.
    #[must_use]
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Creates a malformed message error.
    #[must_use]
    pub fn malformed(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. } => ErrorKind::InvalidName,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            Self::UnknownNamespace { .. } => ErrorKind::UnknownNamespace,
            Self::Handler(_) => ErrorKind::Handler,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConcurrentMutation { .. } => ErrorKind::ConcurrentMutation,
            Self::MalformedMessage { .. } => ErrorKind::MalformedMessage,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::PipelineFailed { .. } => ErrorKind::PipelineFailed,
        }
    }

    /// Returns true if re-delivering the same call may succeed.
    ///
    /// `ConcurrentMutation` counts as retryable because the gateway evicts
    /// the stale instance before surfacing it, so the next attempt reloads
    /// ownership from storage.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handler(err) => err.retryable,
            Self::Timeout { .. }
            | Self::ConcurrentMutation { .. }
            | Self::Storage(_)
            | Self::Cancelled(_) => true,
            Self::InvalidName { .. }
            | Self::InvalidArgument { .. }
            | Self::UnknownOperation { .. }
            | Self::UnknownNamespace { .. }
            | Self::MalformedMessage { .. }
            | Self::Serialization(_)
            | Self::PipelineFailed { .. } => false,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));

        match self {
            Self::Handler(err) => {
                map.insert("operation".to_string(), serde_json::json!(err.operation));
                if let Some(ref details) = err.details {
                    map.insert("details".to_string(), details.clone());
                }
            }
            Self::UnknownOperation { identity, .. }
            | Self::Timeout { identity, .. }
            | Self::ConcurrentMutation { identity, .. } => {
                map.insert("identity".to_string(), serde_json::json!(identity.to_string()));
            }
            Self::PipelineFailed {
                identity, step, state, ..
            } => {
                map.insert("identity".to_string(), serde_json::json!(identity.to_string()));
                map.insert("step".to_string(), serde_json::json!(step));
                map.insert(
                    "state".to_string(),
                    serde_json::to_value(state.as_ref()).unwrap_or(serde_json::Value::Null),
                );
            }
            _ => {}
        }

        map
    }
}

impl From<serde_json::Error> for ActorflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A handler fault as seen by the caller.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Handler '{operation}' failed: {message}")]
pub struct HandlerError {
    /// The operation whose handler failed.
    pub operation: String,
    /// The fault message, including the cause chain.
    pub message: String,
    /// Whether the bridge may re-deliver the call.
    pub retryable: bool,
    /// Structured data attached by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    /// Wraps a fault raised by the handler of `operation`.
    #[must_use]
    pub fn from_fault(operation: impl Into<String>, fault: HandlerFault) -> Self {
        Self {
            operation: operation.into(),
            retryable: fault.is_retryable(),
            message: fault.message,
            details: fault.details,
        }
    }
}

/// How a handler fault should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Re-delivery may succeed.
    Transient,
    /// Re-delivery will fail the same way.
    Permanent,
    /// The arguments were rejected; surfaced as `InvalidArgument`.
    InvalidArgument,
}

/// The failure a handler returns from inside a unit.
///
/// Anything convertible to [`anyhow::Error`] becomes a transient fault, so
/// handlers can use `?` on ordinary library errors.
#[derive(Debug, Clone)]
pub struct HandlerFault {
    /// How callers should treat the fault.
    pub kind: FaultKind,
    /// The fault message.
    pub message: String,
    /// Structured data for the caller.
    pub details: Option<serde_json::Value>,
}

impl HandlerFault {
    /// Creates a transient fault.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transient,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a fault that must not be retried.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Permanent,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a fault rejecting the call arguments.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::InvalidArgument,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns true for transient faults.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == FaultKind::Transient
    }

    /// Converts into the caller-facing error for `operation`.
    #[must_use]
    pub fn into_error(self, operation: &str) -> ActorflowError {
        match self.kind {
            FaultKind::InvalidArgument => ActorflowError::invalid_argument(operation, self.message),
            FaultKind::Transient | FaultKind::Permanent => {
                ActorflowError::Handler(HandlerError::from_fault(operation, self))
            }
        }
    }
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<anyhow::Error> for HandlerFault {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<ActorflowError> for HandlerFault {
    fn from(err: ActorflowError) -> Self {
        let kind = match err {
            ActorflowError::InvalidArgument { .. } => FaultKind::InvalidArgument,
            ref other if other.is_retryable() => FaultKind::Transient,
            _ => FaultKind::Permanent,
        };
        let details = match err {
            ActorflowError::Handler(ref inner) => inner.details.clone(),
            _ => None,
        };
        Self {
            kind,
            message: err.to_string(),
            details,
        }
    }
}

impl From<serde_json::Error> for HandlerFault {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(format!("invalid payload: {err}"))
    }
}

/// Error raised when a handler touches a state field it did not declare.
#[derive(Debug, Clone, Error)]
#[error("Undeclared field: operation '{operation}' attempted to {access} '{field}'")]
pub struct UndeclaredFieldError {
    /// The operation attempting access.
    pub operation: String,
    /// The undeclared field.
    pub field: String,
    /// `read` or `write`.
    pub access: &'static str,
}

impl From<UndeclaredFieldError> for HandlerFault {
    fn from(err: UndeclaredFieldError) -> Self {
        Self::permanent(err.to_string())
    }
}
