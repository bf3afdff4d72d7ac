//! Persistence substrate for unit state.
//!
//! Every unit owns one state blob stored under its identity together with a
//! revision counter. Writes are compare-and-swap on that revision: a save
//! that names a stale `expected_revision` is rejected with
//! [`StoreError::Conflict`], which is how a second owner of the same
//! identity is detected.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::ActorflowError;
use crate::registry::UnitIdentity;

/// Structured unit state keyed by field name.
pub type StateBlob = serde_json::Map<String, serde_json::Value>;

/// Revision value meaning "nothing persisted yet".
pub const NO_REVISION: u64 = 0;

/// A persisted state blob and its revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Monotonic revision, starting at 1 for the first save.
    pub revision: u64,
    /// The state fields.
    pub state: StateBlob,
    /// When this revision was written.
    pub updated_at: DateTime<Utc>,
}

/// Errors returned by a [`StateStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The stored revision did not match the expected one.
    #[error("revision conflict: expected {expected}, found {current}")]
    Conflict {
        /// The revision the writer expected.
        expected: u64,
        /// The revision actually stored.
        current: u64,
    },

    /// The backend could not be read or written.
    #[error("storage I/O failed: {0}")]
    Io(String),

    /// A stored record could not be decoded.
    #[error("stored state is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Converts into the crate error for `identity`.
    #[must_use]
    pub fn into_actorflow(self, identity: &UnitIdentity) -> ActorflowError {
        match self {
            Self::Conflict { expected, current } => ActorflowError::ConcurrentMutation {
                identity: identity.clone(),
                expected,
                current,
            },
            Self::Io(msg) => ActorflowError::Storage(msg),
            Self::Corrupt(msg) => ActorflowError::Serialization(msg),
        }
    }
}

/// Storage backend for unit state.
///
/// Implementations must make `save` atomic with respect to the revision
/// check. Distinct identities never contend with each other.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Loads the latest state, or `None` if the identity was never saved.
    async fn load(&self, identity: &UnitIdentity) -> Result<Option<StoredState>, StoreError>;

    /// Saves `state` if the stored revision equals `expected_revision`.
    ///
    /// Pass [`NO_REVISION`] for the first save. Returns the new revision.
    async fn save(
        &self,
        identity: &UnitIdentity,
        state: &StateBlob,
        expected_revision: u64,
    ) -> Result<u64, StoreError>;
}
