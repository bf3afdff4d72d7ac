//! Typed client for orchestrator units.

use super::orchestrator::{ExecuteArgs, PIPELINE_NAMESPACE};
use super::spec::PipelineSpec;
use super::state::{PipelineResult, PipelineState};
use crate::errors::{ActorflowError, Result};
use crate::gateway::{Gateway, UnitHandle};

/// Runs pipelines through the gateway.
///
/// Each run is addressed by its logical name; the orchestrator for that
/// name persists the run and refuses to execute it a second time.
#[derive(Debug, Clone)]
pub struct PipelineClient {
    gateway: Gateway,
    namespace: String,
}

impl PipelineClient {
    /// Creates a client for orchestrators in [`PIPELINE_NAMESPACE`].
    #[must_use]
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            namespace: PIPELINE_NAMESPACE.to_string(),
        }
    }

    /// Uses orchestrators registered under another namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// The orchestrator handle for run `run`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for an empty run name.
    pub fn handle(&self, run: &str) -> Result<UnitHandle> {
        self.gateway.resolve(&self.namespace, run)
    }

    /// Executes `spec` with `input` as run `run`.
    ///
    /// A run that already completed returns its stored result without
    /// calling any step again.
    ///
    /// # Errors
    ///
    /// `PipelineFailed` with the persisted partial progress when a step
    /// fails (now or in an earlier call); `InvalidArgument` for an invalid
    /// spec; otherwise any gateway error.
    pub async fn execute_pipeline(
        &self,
        run: &str,
        spec: &PipelineSpec,
        input: serde_json::Value,
    ) -> Result<PipelineResult> {
        let handle = self.handle(run)?;
        let args = serde_json::to_value(ExecuteArgs {
            run: run.to_string(),
            spec: spec.clone(),
            input,
        })?;

        match handle.call("execute", args).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(err) => Err(into_pipeline_failure(&handle, err)),
        }
    }

    /// Reads the persisted state of run `run`.
    ///
    /// # Errors
    ///
    /// Any gateway error.
    pub async fn status(&self, run: &str) -> Result<PipelineState> {
        let value = self.handle(run)?.call("status", serde_json::Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn into_pipeline_failure(handle: &UnitHandle, err: ActorflowError) -> ActorflowError {
    let ActorflowError::Handler(ref inner) = err else {
        return err;
    };
    let Some(details) = inner.details.as_ref() else {
        return err;
    };
    let Some(state) = details
        .get("state")
        .and_then(|s| serde_json::from_value::<PipelineState>(s.clone()).ok())
    else {
        return err;
    };
    let (step, error) = state
        .failure()
        .map(|e| (e.step.clone(), e.error.clone()))
        .unwrap_or_default();
    ActorflowError::PipelineFailed {
        identity: handle.identity().clone(),
        step,
        error,
        state: Box::new(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HandlerFault;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{pipeline_kind, PipelineStatus, PipelineStep};
    use crate::testing::RecordingKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_failure_is_typed() {
        let a = RecordingKind::new("A").succeed("score", serde_json::json!({"score": 10}));
        let b = RecordingKind::new("B").fail("build", HandlerFault::new("quota exceeded"));
        let gateway = Gateway::builder()
            .register(pipeline_kind(Arc::new(CollectingEventSink::new())).unwrap())
            .register(a.kind().unwrap())
            .register(b.kind().unwrap())
            .build()
            .unwrap();
        let client = PipelineClient::new(gateway);
        let spec = PipelineSpec::new()
            .step(PipelineStep::new("A", "score"))
            .step(PipelineStep::new("B", "build"));

        let err = client
            .execute_pipeline("wf_9", &spec, serde_json::json!({"x": 1}))
            .await
            .unwrap_err();
        let ActorflowError::PipelineFailed { step, error, state, .. } = err else {
            panic!("expected PipelineFailed, got {err:?}");
        };
        assert_eq!(step, "B.build");
        assert_eq!(error, "quota exceeded");
        assert_eq!(state.status, PipelineStatus::Failed);

        assert_eq!(client.status("wf_9").await.unwrap(), *state);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let gateway = Gateway::builder().build().unwrap();
        let client = PipelineClient::new(gateway);
        let err = client
            .execute_pipeline("wf_1", &PipelineSpec::new(), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ActorflowError::UnknownNamespace { .. }));

        assert!(client.handle("").is_err());
    }
}
