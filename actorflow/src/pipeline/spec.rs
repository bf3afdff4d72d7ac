//! Pipeline and step specifications.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::errors::ActorflowError;

/// A step of a pipeline: one operation on one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Step identifier; defaults to `"{target}.{operation}"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Namespace (unit role) of the target unit.
    pub target: String,
    /// Logical name of the target; defaults to the run's logical name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Operation to invoke.
    pub operation: String,
    /// Step-specific arguments.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
    /// Earlier steps whose results this step receives.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,
}

impl PipelineStep {
    /// Creates a step invoking `operation` on the `target` role.
    #[must_use]
    pub fn new(target: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: None,
            target: target.into(),
            instance: None,
            operation: operation.into(),
            args: serde_json::Value::Null,
            uses: Vec::new(),
        }
    }

    /// Sets an explicit step id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Targets a specific logical name instead of the run's.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Sets step-specific arguments.
    #[must_use]
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Passes the results of earlier steps to this one.
    #[must_use]
    pub fn uses(mut self, steps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.uses.extend(steps.into_iter().map(Into::into));
        self
    }

    /// The effective step id.
    #[must_use]
    pub fn step_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.target, self.operation))
    }
}

/// Error raised when a pipeline specification is invalid.
#[derive(Debug, Clone, Error)]
#[error("Pipeline validation failed: {message}")]
pub struct PipelineValidationError {
    /// What is wrong.
    pub message: String,
    /// Step ids involved.
    pub steps: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
        }
    }

    /// Attaches the step ids involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }
}

impl From<PipelineValidationError> for ActorflowError {
    fn from(err: PipelineValidationError) -> Self {
        Self::invalid_argument("execute", err.to_string())
    }
}

/// An ordered list of steps. Order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// The steps.
    pub steps: Vec<PipelineStep>,
}

impl PipelineSpec {
    /// Creates an empty specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Checks the specification before anything runs.
    ///
    /// # Errors
    ///
    /// Fails on an empty pipeline, a blank target or operation, a duplicate
    /// step id, or a `uses` entry that does not name an earlier step.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.steps.is_empty() {
            return Err(PipelineValidationError::new("pipeline has no steps"));
        }

        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            let id = step.step_id();
            if step.target.trim().is_empty() || step.operation.trim().is_empty() {
                return Err(PipelineValidationError::new(format!(
                    "Step '{id}' needs a target and an operation"
                ))
                .with_steps(vec![id]));
            }
            for used in &step.uses {
                if !seen.contains(used.as_str()) {
                    return Err(PipelineValidationError::new(format!(
                        "Step '{id}' uses '{used}', which is not an earlier step"
                    ))
                    .with_steps(vec![id.clone(), used.clone()]));
                }
            }
            if !seen.insert(id.clone()) {
                return Err(PipelineValidationError::new(format!(
                    "Step id '{id}' appears more than once"
                ))
                .with_steps(vec![id]));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_step_id() {
        let step = PipelineStep::new("A", "score");
        assert_eq!(step.step_id(), "A.score");
        assert_eq!(step.with_id("first").step_id(), "first");
    }

    #[test]
    fn test_valid_spec() {
        let spec = PipelineSpec::new()
            .step(PipelineStep::new("A", "score"))
            .step(PipelineStep::new("B", "build").uses(["A.score"]));
        assert!(spec.validate().is_ok());
        assert_eq!(spec.len(), 2);
    }

    #[test]
    fn test_empty_spec_rejected() {
        assert!(PipelineSpec::new().validate().is_err());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let spec = PipelineSpec::new()
            .step(PipelineStep::new("A", "score"))
            .step(PipelineStep::new("A", "score"));
        let err = spec.validate().unwrap_err();
        assert_eq!(err.steps, vec!["A.score"]);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let spec = PipelineSpec::new()
            .step(PipelineStep::new("A", "score").uses(["B.build"]))
            .step(PipelineStep::new("B", "build"));
        assert!(spec.validate().is_err());

        let self_ref = PipelineSpec::new().step(PipelineStep::new("A", "score").uses(["A.score"]));
        assert!(self_ref.validate().is_err());
    }

    #[test]
    fn test_blank_operation_rejected() {
        let spec = PipelineSpec::new().step(PipelineStep::new("A", " "));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validation_error_is_invalid_argument() {
        let err: ActorflowError = PipelineValidationError::new("pipeline has no steps").into();
        assert!(matches!(err, ActorflowError::InvalidArgument { .. }));
    }

    #[test]
    fn test_spec_serde_defaults() {
        let spec: PipelineSpec = serde_json::from_value(serde_json::json!({
            "steps": [{"target": "A", "operation": "score"}]
        }))
        .unwrap();
        assert_eq!(spec.steps[0], PipelineStep::new("A", "score"));
    }
}
