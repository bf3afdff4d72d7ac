//! The pipeline orchestrator unit kind.
//!
//! An orchestrator is an ordinary execution unit whose `execute` operation
//! walks a [`PipelineSpec`], calling other units through the gateway and
//! checkpointing its [`PipelineState`] after every step.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use super::spec::{PipelineSpec, PipelineStep};
use super::state::{CompletedStep, PipelineResult, PipelineState, PipelineStatus, StepError};
use crate::errors::{ActorflowError, HandlerFault, Result};
use crate::events::{
    EventRecord, EventSink, PIPELINE_COMPLETED, PIPELINE_FAILED, PIPELINE_STARTED,
    PIPELINE_STEP_COMPLETED,
};
use crate::observability::pipeline_span;
use crate::unit::{Handler, OperationContext, OperationSpec, UnitKind};

/// Namespace the orchestrator kind registers under by default.
pub const PIPELINE_NAMESPACE: &str = "pipeline";

/// State field holding the serialized [`PipelineState`].
pub(crate) const STATE_FIELD: &str = "pipeline";

/// Arguments of the `execute` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExecuteArgs {
    pub run: String,
    pub spec: PipelineSpec,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Builds the orchestrator kind under [`PIPELINE_NAMESPACE`].
///
/// # Errors
///
/// Never fails for the default namespace; the `Result` comes from
/// [`pipeline_kind_in`].
pub fn pipeline_kind(events: Arc<dyn EventSink>) -> Result<UnitKind> {
    pipeline_kind_in(PIPELINE_NAMESPACE, events)
}

/// Builds the orchestrator kind under a custom namespace.
///
/// # Errors
///
/// Returns `InvalidName` for a malformed namespace.
pub fn pipeline_kind_in(namespace: &str, events: Arc<dyn EventSink>) -> Result<UnitKind> {
    let default_state = serde_json::to_value(PipelineState::default())?;
    UnitKind::builder(namespace)
        .default_field(STATE_FIELD, default_state)
        .operation(
            OperationSpec::new("execute")
                .reads([STATE_FIELD])
                .writes([STATE_FIELD])
                .requires(["run", "spec"]),
            Arc::new(ExecuteHandler { events }),
        )
        .operation(
            OperationSpec::new("status").reads([STATE_FIELD]),
            Arc::new(StatusHandler),
        )
        .build()
}

fn load_state(ctx: &OperationContext) -> std::result::Result<PipelineState, HandlerFault> {
    Ok(ctx.state().get_as::<PipelineState>(STATE_FIELD)?.unwrap_or_default())
}

async fn save_state(
    ctx: &mut OperationContext,
    state: &PipelineState,
) -> std::result::Result<(), HandlerFault> {
    ctx.state_mut().set(STATE_FIELD, state)?;
    ctx.checkpoint().await?;
    Ok(())
}

/// The fault returned for a failed run; carries the state for the client.
fn failure_fault(state: &PipelineState) -> HandlerFault {
    let (step, error) = state
        .failure()
        .map(|e| (e.step.clone(), e.error.clone()))
        .unwrap_or_default();
    HandlerFault::permanent(format!("pipeline failed at step '{step}': {error}")).with_details(
        serde_json::json!({
            "step": step,
            "error": error,
            "state": state,
        }),
    )
}

/// Describes a step error the way the error log records it.
fn describe(err: &ActorflowError) -> String {
    match err {
        ActorflowError::Handler(h) => h.message.clone(),
        other => other.to_string(),
    }
}

struct ExecuteHandler {
    events: Arc<dyn EventSink>,
}

impl ExecuteHandler {
    fn publish(&self, record: EventRecord) {
        self.events.try_emit(record);
    }

    async fn run(
        &self,
        ctx: &mut OperationContext,
        args: &ExecuteArgs,
        mut state: PipelineState,
    ) -> std::result::Result<serde_json::Value, HandlerFault> {
        let identity = ctx.identity().clone();
        state.status = PipelineStatus::Processing;
        state.run = Some(args.run.clone());
        state.started_at = Some(Utc::now());
        save_state(ctx, &state).await?;
        info!(steps = args.spec.len(), run = %args.run, "pipeline started");
        self.publish(EventRecord::new(PIPELINE_STARTED, &identity));

        for step in &args.spec.steps {
            let step_id = step.step_id();
            match self.run_step(ctx, &args.run, step, &args.input, &state).await {
                Ok((target, result)) => {
                    state.completed.push(CompletedStep {
                        step: step_id.clone(),
                        target,
                        operation: step.operation.clone(),
                        result: result.clone(),
                        completed_at: Utc::now(),
                    });
                    save_state(ctx, &state).await?;
                    info!(step = %step_id, "pipeline step completed");
                    self.publish(
                        EventRecord::new(PIPELINE_STEP_COMPLETED, &identity).with_result(
                            serde_json::json!({ "step": step_id, "result": result }),
                        ),
                    );
                }
                Err((target, err)) => {
                    warn!(step = %step_id, error = %err, "pipeline step failed");
                    let description = describe(&err);
                    state.errors.push(StepError {
                        step: step_id.clone(),
                        target,
                        operation: step.operation.clone(),
                        error: description.clone(),
                        kind: err.kind(),
                        failed_at: Utc::now(),
                    });
                    state.status = PipelineStatus::Failed;
                    state.finished_at = Some(Utc::now());
                    save_state(ctx, &state).await?;
                    self.publish(
                        EventRecord::new(PIPELINE_FAILED, &identity).with_error(
                            serde_json::json!({ "step": step_id, "error": description }),
                        ),
                    );
                    return Err(failure_fault(&state));
                }
            }
        }

        state.status = PipelineStatus::Completed;
        state.finished_at = Some(Utc::now());
        save_state(ctx, &state).await?;
        let result = PipelineResult::from_state(identity.to_string(), &state);
        info!(steps = state.completed.len(), "pipeline completed");
        self.publish(
            EventRecord::new(PIPELINE_COMPLETED, &identity)
                .with_result(serde_json::to_value(&result.results)?),
        );
        Ok(serde_json::to_value(result)?)
    }

    async fn run_step(
        &self,
        ctx: &OperationContext,
        run: &str,
        step: &PipelineStep,
        input: &serde_json::Value,
        state: &PipelineState,
    ) -> std::result::Result<(String, serde_json::Value), (String, ActorflowError)> {
        let step_id = step.step_id();
        let logical_name = step.instance.as_deref().unwrap_or(run);

        let gateway = ctx
            .gateway()
            .map_err(|f| (step.target.clone(), f.into_error(&step.operation)))?;
        let identity = gateway
            .registry()
            .resolve(&step.target, logical_name)
            .map_err(|e| (step.target.clone(), e))?;
        let target = identity.to_string();

        ctx.check_cancelled()
            .map_err(|f| (target.clone(), ActorflowError::Cancelled(f.message)))?;

        let results = state.results();
        let used: serde_json::Map<String, serde_json::Value> = step
            .uses
            .iter()
            .filter_map(|id| results.get(id).map(|r| (id.clone(), r.clone())))
            .collect();
        let envelope = serde_json::json!({
            "pipeline": ctx.identity().to_string(),
            "step": step_id,
            "input": input,
            "args": step.args,
            "results": used,
        });

        match ctx.call(&identity, &step.operation, envelope).await {
            Ok(result) => Ok((target, result)),
            Err(e) => Err((target, e)),
        }
    }
}

#[async_trait]
impl Handler for ExecuteHandler {
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerFault> {
        let args: ExecuteArgs = serde_json::from_value(args)?;
        let state = load_state(ctx)?;
        let identity = ctx.identity().clone();

        match state.status {
            PipelineStatus::Completed => {
                info!(identity = %identity.short(), "run already completed, returning stored result");
                return Ok(serde_json::to_value(PipelineResult::from_state(
                    identity.to_string(),
                    &state,
                ))?);
            }
            PipelineStatus::Failed => return Err(failure_fault(&state)),
            PipelineStatus::Processing => {
                return Err(HandlerFault::permanent(
                    "pipeline run was interrupted while processing; start a new run",
                ));
            }
            PipelineStatus::Pending => {}
        }

        args.spec
            .validate()
            .map_err(|e| HandlerFault::invalid_argument(e.to_string()))?;

        let span = pipeline_span(&identity);
        self.run(ctx, &args, state).instrument(span).await
    }
}

struct StatusHandler;

#[async_trait]
impl Handler for StatusHandler {
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        _args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerFault> {
        Ok(serde_json::to_value(load_state(ctx)?)?)
    }
}
