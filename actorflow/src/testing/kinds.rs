//! Fixture unit kinds.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::HandlerFault;
use crate::unit::{Handler, OperationContext, OperationSpec, UnitKind};

/// A counter in namespace `counter`.
///
/// Operations:
/// - `increment` `{"by"?: n}` adds `by` (default 1), returns `{"count"}`
/// - `increment_slow` `{"pause_ms"?: n}` reads the count, sleeps (or yields
///   when `pause_ms` is absent), then writes `count + 1`
/// - `get` returns `{"count"}`
/// - `set` `{"value": n}` overwrites the count
#[must_use]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
pub fn counter_kind() -> UnitKind {
    UnitKind::builder("counter")
        .default_field("count", serde_json::json!(0))
        .operation_fn(
            OperationSpec::new("increment").reads(["count"]).writes(["count"]),
            |state, args| {
                let by = args.get("by").and_then(serde_json::Value::as_i64).unwrap_or(1);
                let count = state.get_as::<i64>("count")?.unwrap_or(0) + by;
                state.set("count", count)?;
                Ok(serde_json::json!({ "count": count }))
            },
        )
        .operation(
            OperationSpec::new("increment_slow").reads(["count"]).writes(["count"]),
            Arc::new(SlowIncrementHandler),
        )
        .operation_fn(OperationSpec::new("get").reads(["count"]), |state, _| {
            let count = state.get_as::<i64>("count")?.unwrap_or(0);
            Ok(serde_json::json!({ "count": count }))
        })
        .operation_fn(
            OperationSpec::new("set").writes(["count"]).requires(["value"]),
            |state, args| {
                let value = args["value"]
                    .as_i64()
                    .ok_or_else(|| HandlerFault::invalid_argument("'value' must be an integer"))?;
                state.set("count", value)?;
                Ok(serde_json::json!({ "count": value }))
            },
        )
        .build()
        .unwrap()
}

/// A unit in namespace `failing` whose operations always fail.
///
/// - `fail` raises a transient fault
/// - `fail_permanent` raises a non-retryable fault
/// - `reject` rejects its arguments
#[must_use]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
pub fn failing_kind() -> UnitKind {
    UnitKind::builder("failing")
        .operation_fn(OperationSpec::new("fail"), |_, args| {
            Err(HandlerFault::new("transient failure").with_details(args))
        })
        .operation_fn(OperationSpec::new("fail_permanent"), |_, _| {
            Err(HandlerFault::permanent("permanent failure"))
        })
        .operation_fn(OperationSpec::new("reject"), |_, _| {
            Err(HandlerFault::invalid_argument("arguments rejected"))
        })
        .build()
        .unwrap()
}

struct SlowIncrementHandler;

#[async_trait]
impl Handler for SlowIncrementHandler {
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerFault> {
        let count = ctx.state().get_as::<i64>("count")?.unwrap_or(0);
        match args.get("pause_ms").and_then(serde_json::Value::as_u64) {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => tokio::task::yield_now().await,
        }
        ctx.state_mut().set("count", count + 1)?;
        Ok(serde_json::json!({ "count": count + 1 }))
    }
}

struct SleepHandler;

#[async_trait]
impl Handler for SleepHandler {
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerFault> {
        let ms = args.get("ms").and_then(serde_json::Value::as_u64).unwrap_or(0);
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(serde_json::json!({ "slept_ms": ms }))
            }
            () = ctx.cancellation().cancelled() => {
                let reason = ctx.cancellation().reason().unwrap_or_default();
                Err(HandlerFault::new(format!("sleep cancelled: {reason}")))
            }
        }
    }
}

/// A stateless unit in namespace `echo`.
///
/// - `echo` returns its arguments
/// - `sleep` `{"ms": n}` waits `n` milliseconds unless cancelled first
#[must_use]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
pub fn echo_kind() -> UnitKind {
    UnitKind::builder("echo")
        .operation_fn(OperationSpec::new("echo"), |_, args| Ok(args))
        .operation(OperationSpec::new("sleep"), Arc::new(SleepHandler))
        .build()
        .unwrap()
}
