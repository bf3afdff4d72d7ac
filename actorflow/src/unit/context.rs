//! Per-call context handed to handlers.

use std::sync::Arc;
use tracing::debug;

use super::txn::StateTxn;
use crate::cancellation::CancellationToken;
use crate::errors::{ActorflowError, HandlerFault};
use crate::gateway::Gateway;
use crate::registry::UnitIdentity;
use crate::storage::StateStore;

/// What a handler can see and do during one call.
pub struct OperationContext {
    identity: UnitIdentity,
    operation: String,
    txn: StateTxn,
    revision: u64,
    store: Arc<dyn StateStore>,
    cancel: Arc<CancellationToken>,
    gateway: Option<Gateway>,
    conflict: Option<ActorflowError>,
}

impl OperationContext {
    pub(crate) fn new(
        identity: UnitIdentity,
        operation: String,
        txn: StateTxn,
        revision: u64,
        store: Arc<dyn StateStore>,
        cancel: Arc<CancellationToken>,
        gateway: Option<Gateway>,
    ) -> Self {
        Self {
            identity,
            operation,
            txn,
            revision,
            store,
            cancel,
            gateway,
            conflict: None,
        }
    }

    /// The unit being invoked.
    #[must_use]
    pub fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    /// The operation being run.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The last committed revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Read access to state.
    #[must_use]
    pub fn state(&self) -> &StateTxn {
        &self.txn
    }

    /// Write access to state.
    pub fn state_mut(&mut self) -> &mut StateTxn {
        &mut self.txn
    }

    /// The cancellation token for this call.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails if the caller gave up on this call.
    ///
    /// # Errors
    ///
    /// Returns a transient fault once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), HandlerFault> {
        self.cancel.check().map_err(HandlerFault::from)
    }

    /// The gateway for calling other units.
    ///
    /// # Errors
    ///
    /// Fails when the unit runs outside a gateway.
    pub fn gateway(&self) -> Result<&Gateway, HandlerFault> {
        self.gateway
            .as_ref()
            .ok_or_else(|| HandlerFault::permanent("no gateway available for nested calls"))
    }

    /// Calls an operation on another unit.
    ///
    /// Checks cancellation first. Calling the unit's own identity is
    /// rejected since its queue is blocked by this very call.
    ///
    /// # Errors
    ///
    /// Returns the callee's error unchanged.
    pub async fn call(
        &self,
        target: &UnitIdentity,
        operation: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ActorflowError> {
        self.cancel.check()?;
        if target == &self.identity {
            return Err(ActorflowError::invalid_argument(
                operation,
                format!("reentrant call to {target}"),
            ));
        }
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| ActorflowError::invalid_argument(operation, "no gateway available"))?;
        gateway.handle(target.clone()).call(operation, args).await
    }

    /// Durably commits buffered writes without ending the call.
    ///
    /// Writes after the last checkpoint are still discarded if the handler
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns a fault if storage rejects the write; a revision conflict
    /// also fails the whole call with `ConcurrentMutation`.
    pub async fn checkpoint(&mut self) -> Result<u64, HandlerFault> {
        if !self.txn.is_dirty() {
            return Ok(self.revision);
        }
        let state = self.txn.materialize();
        match self.store.save(&self.identity, &state, self.revision).await {
            Ok(revision) => {
                debug!(
                    identity = %self.identity.short(),
                    operation = %self.operation,
                    revision,
                    "checkpoint committed"
                );
                self.revision = revision;
                self.txn.mark_committed(state);
                Ok(revision)
            }
            Err(e) => {
                let err = e.into_actorflow(&self.identity);
                let fault = HandlerFault::from(err.clone());
                if matches!(err, ActorflowError::ConcurrentMutation { .. }) {
                    self.conflict = Some(err);
                }
                Err(fault)
            }
        }
    }

    pub(crate) fn into_parts(self) -> (StateTxn, u64, Option<ActorflowError>) {
        (self.txn, self.revision, self.conflict)
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("identity", &self.identity)
            .field("operation", &self.operation)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}
