//! Unit handles: the caller-facing side of the gateway.

use futures::future::{self, Either};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn, Instrument};

use super::{Gateway, Slot};
use crate::cancellation::CancellationToken;
use crate::errors::{ActorflowError, HandlerError, Result};
use crate::observability::unit_span;
use crate::registry::UnitIdentity;
use crate::storage::StateBlob;
use crate::unit::{ExecutionUnit, InvocationEnv};

/// Committed state of a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSnapshot {
    /// The unit.
    pub identity: UnitIdentity,
    /// Last committed revision; 0 if never persisted.
    pub revision: u64,
    /// Committed state fields.
    pub state: StateBlob,
}

/// A location-transparent reference to one unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    gateway: Gateway,
    identity: UnitIdentity,
}

impl UnitHandle {
    pub(crate) fn new(gateway: Gateway, identity: UnitIdentity) -> Self {
        Self { gateway, identity }
    }

    /// The addressed identity.
    #[must_use]
    pub fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    /// Calls `operation` with the gateway's default deadline.
    ///
    /// # Errors
    ///
    /// Any [`ActorflowError`] raised while locating or running the unit.
    pub async fn call(&self, operation: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        self.call_with_timeout(operation, args, self.gateway.call_timeout())
            .await
    }

    /// Calls `operation` with an explicit deadline.
    ///
    /// Calls on one identity run one at a time in arrival order. When the
    /// deadline passes the caller gets `Timeout`; the call itself keeps
    /// running and only its cancellation token is tripped. A call that is
    /// still queued when that happens never starts.
    ///
    /// # Errors
    ///
    /// `Timeout`, `UnknownNamespace`, or whatever the unit returns.
    pub async fn call_with_timeout(
        &self,
        operation: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let slot = self.gateway.slot(&self.identity)?;
        let cancel = CancellationToken::shared();
        let env = InvocationEnv {
            cancel: Arc::clone(&cancel),
            gateway: Some(self.gateway.clone()),
        };
        let span = unit_span(&self.identity, operation);
        let op = operation.to_string();
        let identity = self.identity.clone();

        // Polling once enqueues this call on the slot before the task exists.
        let mut acquire = Box::pin(Arc::clone(&slot.unit).lock_owned());
        let turn = match futures::poll!(acquire.as_mut()) {
            Poll::Ready(guard) => Either::Left(future::ready(guard)),
            Poll::Pending => Either::Right(acquire),
        };

        let task = tokio::spawn(run_call(slot, turn, identity, op, args, env).instrument(span));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ActorflowError::Cancelled(format!(
                "call task aborted: {join_err}"
            ))),
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                cancel.cancel(format!("deadline of {timeout_ms}ms exceeded"));
                warn!(
                    identity = %self.identity.short(),
                    operation,
                    timeout_ms,
                    "call timed out"
                );
                Err(ActorflowError::Timeout {
                    identity: self.identity.clone(),
                    operation: operation.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Calls `operation` with serde-encoded arguments and result.
    ///
    /// # Errors
    ///
    /// `Serialization` if either side fails to encode, otherwise as
    /// [`UnitHandle::call`].
    pub async fn call_typed<A, R>(&self, operation: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let value = self.call(operation, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Reads the committed state, waiting behind queued calls.
    ///
    /// # Errors
    ///
    /// `UnknownNamespace` or a storage failure.
    pub async fn snapshot(&self) -> Result<UnitSnapshot> {
        let slot = self.gateway.slot(&self.identity)?;
        let mut unit = slot.unit.lock().await;
        let (state, revision) = unit.snapshot().await?;
        Ok(UnitSnapshot {
            identity: self.identity.clone(),
            revision,
            state,
        })
    }
}

async fn run_call(
    slot: Arc<Slot>,
    turn: impl Future<Output = OwnedMutexGuard<ExecutionUnit>>,
    identity: UnitIdentity,
    operation: String,
    args: serde_json::Value,
    env: InvocationEnv,
) -> Result<serde_json::Value> {
    let mut unit = turn.await;
    slot.touch();
    env.cancel.check()?;

    let outcome = AssertUnwindSafe(unit.invoke(&operation, args, env))
        .catch_unwind()
        .await;
    slot.touch();
    match outcome {
        Ok(result) => {
            if let Err(ref e) = result {
                debug!(error = %e, retryable = e.is_retryable(), "call failed");
            }
            result
        }
        Err(panic) => {
            unit.invalidate();
            let message = panic_message(panic.as_ref());
            error!(identity = %identity.short(), panic = %message, "handler panicked");
            Err(ActorflowError::Handler(HandlerError {
                operation,
                message: format!("handler panicked: {message}"),
                retryable: false,
                details: None,
            }))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerFault;
    use crate::testing::{counter_kind, echo_kind};
    use crate::unit::{OperationSpec, UnitKind};
    use serde::Deserialize;

    fn gateway() -> Gateway {
        let panicky = UnitKind::builder("panicky")
            .operation_fn(OperationSpec::open("boom"), |_, _| -> std::result::Result<_, HandlerFault> {
                panic!("kaboom")
            })
            .build()
            .unwrap();
        Gateway::builder()
            .register(counter_kind())
            .register(echo_kind())
            .register(panicky)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_typed() {
        #[derive(Deserialize)]
        struct Count {
            count: i64,
        }

        let handle = gateway().resolve("counter", "c1").unwrap();
        let out: Count = handle
            .call_typed("increment", &serde_json::json!({"by": 3}))
            .await
            .unwrap();
        assert_eq!(out.count, 3);
    }

    #[tokio::test]
    async fn test_snapshot_reports_revision() {
        let handle = gateway().resolve("counter", "c1").unwrap();
        let before = handle.snapshot().await.unwrap();
        assert_eq!(before.revision, 0);

        handle.call("increment", serde_json::json!({})).await.unwrap();
        let after = handle.snapshot().await.unwrap();
        assert_eq!(after.revision, 1);
        assert_eq!(after.state["count"], 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_error() {
        let gateway = gateway();
        let handle = gateway.resolve("panicky", "p1").unwrap();

        let err = handle.call("boom", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, ActorflowError::Handler(ref h) if h.message.contains("kaboom")));
        assert!(!err.is_retryable());

        // The slot survives and keeps serving calls.
        assert!(handle.call("boom", serde_json::Value::Null).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_trips_cancellation() {
        let gateway = gateway();
        let handle = gateway.resolve("echo", "e1").unwrap();

        let err = handle
            .call_with_timeout(
                "sleep",
                serde_json::json!({"ms": 5_000}),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActorflowError::Timeout { timeout_ms: 100, .. }));
        assert!(err.is_retryable());

        // The detached call observes cancellation and frees the unit.
        let value = handle
            .call("echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(value["x"], 1);
    }
}
