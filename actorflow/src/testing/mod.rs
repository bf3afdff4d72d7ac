//! Testing utilities for actorflow.
//!
//! This module provides:
//! - Ready-made unit kinds (`counter`, `failing`, `echo`)
//! - A recording unit kind that captures every call it receives

mod kinds;
mod recording;

pub use kinds::{counter_kind, echo_kind, failing_kind};
pub use recording::{RecordedCall, RecordingKind};
