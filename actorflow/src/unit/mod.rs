//! Execution units.
//!
//! A unit is an isolated, single-threaded owner of one piece of durable
//! state. Its behaviour comes from a [`UnitKind`]: the table of operations
//! shared by every unit in a namespace.

mod context;
mod kind;
mod runtime;
mod txn;

pub use context::OperationContext;
pub use kind::{FnHandler, Handler, Operation, OperationSpec, UnitKind, UnitKindBuilder};
pub use runtime::{ExecutionUnit, InvocationEnv};
pub use txn::StateTxn;
