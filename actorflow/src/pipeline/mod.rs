//! Pipeline orchestration.
//!
//! A pipeline is an ordered list of operations on other units. Its
//! orchestrator is itself a unit, so a run has a durable identity, is
//! processed single-flight, and keeps its progress across restarts:
//!
//! - [`PipelineSpec`] / [`PipelineStep`]: what to run
//! - [`PipelineState`]: what the orchestrator persists after every step
//! - [`pipeline_kind`]: the orchestrator unit kind to register
//! - [`PipelineClient`]: typed `execute_pipeline` and `status`

mod client;
mod orchestrator;
mod spec;
mod state;

pub use client::PipelineClient;
pub use orchestrator::{pipeline_kind, pipeline_kind_in, PIPELINE_NAMESPACE};
pub use spec::{PipelineSpec, PipelineStep, PipelineValidationError};
pub use state::{CompletedStep, PipelineResult, PipelineState, PipelineStatus, StepError};
