//! The execution unit: one identity, its cached state, its operations.

use std::sync::Arc;
use tracing::{debug, warn};

use super::context::OperationContext;
use super::kind::UnitKind;
use super::txn::StateTxn;
use crate::cancellation::CancellationToken;
use crate::errors::{ActorflowError, Result};
use crate::gateway::Gateway;
use crate::registry::UnitIdentity;
use crate::storage::{StateBlob, StateStore, NO_REVISION};

/// Ambient inputs of one invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationEnv {
    /// Tripped when the caller stops waiting.
    pub cancel: Arc<CancellationToken>,
    /// Used by handlers for nested calls.
    pub gateway: Option<Gateway>,
}

impl InvocationEnv {
    /// An environment without a gateway.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
struct Resident {
    state: StateBlob,
    revision: u64,
}

/// A single stateful unit.
///
/// State is loaded lazily on the first call and cached between calls. The
/// cache is dropped whenever its relation to storage becomes uncertain
/// (revision conflict, panic), forcing a reload on the next call.
///
/// `invoke` takes `&mut self`, so exclusive access is enforced by whoever
/// owns the unit; the gateway keeps each one behind a fair async mutex.
pub struct ExecutionUnit {
    identity: UnitIdentity,
    kind: Arc<UnitKind>,
    store: Arc<dyn StateStore>,
    resident: Option<Resident>,
}

impl ExecutionUnit {
    /// Creates an unloaded unit.
    #[must_use]
    pub fn new(identity: UnitIdentity, kind: Arc<UnitKind>, store: Arc<dyn StateStore>) -> Self {
        Self {
            identity,
            kind,
            store,
            resident: None,
        }
    }

    /// The unit's identity.
    #[must_use]
    pub fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    /// True once state has been loaded and not invalidated since.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.resident.is_some()
    }

    /// The cached revision, if loaded.
    #[must_use]
    pub fn revision(&self) -> Option<u64> {
        self.resident.as_ref().map(|r| r.revision)
    }

    /// Drops cached state.
    pub fn invalidate(&mut self) {
        self.resident = None;
    }

    async fn ensure_loaded(&mut self) -> Result<&Resident> {
        if self.resident.is_none() {
            let loaded = self
                .store
                .load(&self.identity)
                .await
                .map_err(|e| e.into_actorflow(&self.identity))?;
            let resident = match loaded {
                Some(stored) => {
                    debug!(
                        identity = %self.identity.short(),
                        revision = stored.revision,
                        "unit state loaded"
                    );
                    Resident {
                        state: stored.state,
                        revision: stored.revision,
                    }
                }
                None => {
                    debug!(identity = %self.identity.short(), "unit initialised from defaults");
                    Resident {
                        state: self.kind.default_state().clone(),
                        revision: NO_REVISION,
                    }
                }
            };
            self.resident = Some(resident);
        }
        self.resident
            .as_ref()
            .ok_or_else(|| ActorflowError::Storage("unit state unavailable".to_string()))
    }

    /// Returns the committed state and revision.
    ///
    /// # Errors
    ///
    /// Fails if state cannot be loaded.
    pub async fn snapshot(&mut self) -> Result<(StateBlob, u64)> {
        let resident = self.ensure_loaded().await?;
        Ok((resident.state.clone(), resident.revision))
    }

    /// Runs `operation` with `args`.
    ///
    /// Buffered writes are committed with one compare-and-swap after the
    /// handler succeeds. On failure they are discarded; anything committed
    /// by a checkpoint stays.
    ///
    /// # Errors
    ///
    /// `UnknownOperation`, `InvalidArgument`, `Handler`,
    /// `ConcurrentMutation`, `Storage`.
    pub async fn invoke(
        &mut self,
        operation: &str,
        args: serde_json::Value,
        env: InvocationEnv,
    ) -> Result<serde_json::Value> {
        let op = self
            .kind
            .operation(operation)
            .cloned()
            .ok_or_else(|| ActorflowError::UnknownOperation {
                identity: self.identity.clone(),
                operation: operation.to_string(),
            })?;
        op.spec
            .check_args(&args)
            .map_err(|reason| ActorflowError::invalid_argument(operation, reason))?;

        let resident = self.ensure_loaded().await?.clone();
        let txn = StateTxn::new(
            operation,
            op.spec.reads.clone(),
            op.spec.writes.clone(),
            resident.state,
        );
        let mut ctx = OperationContext::new(
            self.identity.clone(),
            operation.to_string(),
            txn,
            resident.revision,
            Arc::clone(&self.store),
            env.cancel,
            env.gateway,
        );

        let outcome = op.handler.handle(&mut ctx, args).await;
        let (txn, revision, conflict) = ctx.into_parts();

        if let Some(err) = conflict {
            warn!(identity = %self.identity.short(), operation, error = %err, "checkpoint conflict");
            self.invalidate();
            return Err(err);
        }

        // Checkpoints may have advanced the committed state either way.
        self.resident = Some(Resident {
            state: txn.base().clone(),
            revision,
        });

        match outcome {
            Ok(value) => {
                self.commit(&txn, revision).await?;
                Ok(value)
            }
            Err(fault) => {
                debug!(
                    identity = %self.identity.short(),
                    operation,
                    discarded = ?txn.dirty_fields(),
                    error = %fault,
                    "handler failed, buffered writes discarded"
                );
                Err(fault.into_error(operation))
            }
        }
    }

    async fn commit(&mut self, txn: &StateTxn, revision: u64) -> Result<()> {
        if !txn.is_dirty() {
            return Ok(());
        }
        let state = txn.materialize();
        match self.store.save(&self.identity, &state, revision).await {
            Ok(new_revision) => {
                debug!(
                    identity = %self.identity.short(),
                    revision = new_revision,
                    fields = ?txn.dirty_fields(),
                    "state committed"
                );
                self.resident = Some(Resident {
                    state,
                    revision: new_revision,
                });
                Ok(())
            }
            Err(e) => {
                let err = e.into_actorflow(&self.identity);
                if matches!(err, ActorflowError::ConcurrentMutation { .. }) {
                    warn!(identity = %self.identity.short(), error = %err, "commit conflict");
                    self.invalidate();
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("identity", &self.identity)
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}
