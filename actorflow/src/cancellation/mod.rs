//! Cooperative cancellation.
//!
//! Gateway deadlines and consumer shutdown both trip a [`CancellationToken`];
//! handlers observe it at safe points.

mod token;

pub use token::CancellationToken;
