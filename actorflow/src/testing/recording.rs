//! A unit kind that records every call it receives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{HandlerFault, Result};
use crate::registry::UnitIdentity;
use crate::unit::{Handler, OperationContext, OperationSpec, UnitKind};

/// One call observed by a [`RecordingKind`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// The unit that received the call.
    pub identity: UnitIdentity,
    /// The operation name.
    pub operation: String,
    /// The arguments as received.
    pub args: serde_json::Value,
}

#[derive(Debug, Clone)]
enum Response {
    Succeed(serde_json::Value),
    Fail(HandlerFault),
    Echo,
}

/// Builder for a scripted, recording unit kind.
///
/// Each operation either returns a fixed value, fails with a fixed fault,
/// or echoes its arguments. Every call is recorded in order, including the
/// failing ones.
#[derive(Debug, Clone)]
pub struct RecordingKind {
    namespace: String,
    responses: Vec<(String, Response)>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RecordingKind {
    /// Starts a recording kind for `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            responses: Vec::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `operation` returns `result`.
    #[must_use]
    pub fn succeed(mut self, operation: impl Into<String>, result: serde_json::Value) -> Self {
        self.responses.push((operation.into(), Response::Succeed(result)));
        self
    }

    /// `operation` fails with `fault`.
    #[must_use]
    pub fn fail(mut self, operation: impl Into<String>, fault: HandlerFault) -> Self {
        self.responses.push((operation.into(), Response::Fail(fault)));
        self
    }

    /// `operation` returns its arguments.
    #[must_use]
    pub fn echo(mut self, operation: impl Into<String>) -> Self {
        self.responses.push((operation.into(), Response::Echo));
        self
    }

    /// Builds the unit kind. Recording continues across clones of `self`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for a bad namespace or duplicate operation.
    pub fn kind(&self) -> Result<UnitKind> {
        let mut builder = UnitKind::builder(self.namespace.clone());
        for (operation, response) in &self.responses {
            builder = builder.operation(
                OperationSpec::new(operation.clone()),
                Arc::new(RecordingHandler {
                    response: response.clone(),
                    calls: Arc::clone(&self.calls),
                }),
            );
        }
        builder.build()
    }

    /// All recorded calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls to `operation`.
    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Call counts per operation.
    #[must_use]
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for call in self.calls.lock().iter() {
            *counts.entry(call.operation.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Forgets recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

struct RecordingHandler {
    response: Response,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerFault> {
        self.calls.lock().push(RecordedCall {
            identity: ctx.identity().clone(),
            operation: ctx.operation().to_string(),
            args: args.clone(),
        });
        match &self.response {
            Response::Succeed(value) => Ok(value.clone()),
            Response::Fail(fault) => Err(fault.clone()),
            Response::Echo => Ok(args),
        }
    }
}
