//! # Actorflow
//!
//! Durable, addressable execution units with pipeline orchestration and a
//! queue bridge.
//!
//! - **Registry**: deterministic identities derived from logical names
//! - **Execution units**: single-flight per identity, state committed
//!   all-or-nothing with a revision check against storage
//! - **Gateway**: location-transparent handles with deadlines
//! - **Pipelines**: fail-fast, durably checkpointed step sequences run by an
//!   orchestrator unit
//! - **Queue bridge**: acknowledge, redeliver with backoff, or dead-letter
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use actorflow::prelude::*;
//!
//! let gateway = Gateway::builder()
//!     .register(pipeline_kind(Arc::new(LoggingEventSink::info()))?)
//!     .register(scoring_kind())
//!     .register(build_kind())
//!     .build()?;
//!
//! let spec = PipelineSpec::new()
//!     .step(PipelineStep::new("scoring", "score"))
//!     .step(PipelineStep::new("build", "build").uses(["scoring.score"]));
//!
//! let result = PipelineClient::new(gateway)
//!     .execute_pipeline("wf_42", &spec, serde_json::json!({"x": 1}))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bridge;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod testing;
pub mod unit;

#[cfg(test)]
mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{
        BatchReport, DeadLetterSink, Delivery, Disposition, InMemoryDeadLetterSink,
        InMemoryQueue, Queue, QueueBridge, TaskMessage,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::ActorflowConfig;
    pub use crate::errors::{ActorflowError, ErrorKind, HandlerFault, Result};
    pub use crate::events::{EventRecord, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::gateway::{Gateway, GatewayBuilder, UnitHandle};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{
        pipeline_kind, PipelineClient, PipelineResult, PipelineSpec, PipelineState,
        PipelineStatus, PipelineStep,
    };
    pub use crate::registry::{HashRegistry, Registry, UnitIdentity};
    pub use crate::retry::RetryPolicy;
    pub use crate::storage::{FileStateStore, InMemoryStateStore, StateStore};
    pub use crate::unit::{OperationContext, OperationSpec, StateTxn, UnitKind};
}
