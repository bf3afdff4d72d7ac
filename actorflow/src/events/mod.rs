//! Outbound event publication.
//!
//! Publishing is fire-and-forget: sinks never fail the caller, and a sink
//! that cannot keep up drops events rather than blocking a unit.

mod channel;
mod record;
mod sink;

pub use channel::{ChannelEventSink, DeliveryMetrics};
pub use record::{
    EventRecord, PIPELINE_COMPLETED, PIPELINE_FAILED, PIPELINE_STARTED, PIPELINE_STEP_COMPLETED,
};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
