//! In-memory state store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{StateBlob, StateStore, StoreError, StoredState, NO_REVISION};
use crate::registry::UnitIdentity;

/// Process-local state store.
///
/// Survives unit eviction but not process exit. Cloning shares the
/// underlying map, which lets tests model two processes over one substrate.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    entries: std::sync::Arc<DashMap<UnitIdentity, StoredState>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been saved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the stored revision for `identity`, or [`NO_REVISION`].
    #[must_use]
    pub fn revision(&self, identity: &UnitIdentity) -> u64 {
        self.entries
            .get(identity)
            .map_or(NO_REVISION, |entry| entry.revision)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, identity: &UnitIdentity) -> Result<Option<StoredState>, StoreError> {
        Ok(self.entries.get(identity).map(|entry| entry.clone()))
    }

    async fn save(
        &self,
        identity: &UnitIdentity,
        state: &StateBlob,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        match self.entries.entry(identity.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().revision;
                if current != expected_revision {
                    return Err(StoreError::Conflict {
                        expected: expected_revision,
                        current,
                    });
                }
                let revision = current + 1;
                occupied.insert(StoredState {
                    revision,
                    state: state.clone(),
                    updated_at: Utc::now(),
                });
                Ok(revision)
            }
            Entry::Vacant(vacant) => {
                if expected_revision != NO_REVISION {
                    return Err(StoreError::Conflict {
                        expected: expected_revision,
                        current: NO_REVISION,
                    });
                }
                vacant.insert(StoredState {
                    revision: 1,
                    state: state.clone(),
                    updated_at: Utc::now(),
                });
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(value: i64) -> StateBlob {
        let mut map = StateBlob::new();
        map.insert("count".to_string(), serde_json::json!(value));
        map
    }

    fn identity() -> UnitIdentity {
        UnitIdentity::derive("counter", "c1", None)
    }

    #[tokio::test]
    async fn test_load_absent() {
        let store = InMemoryStateStore::new();
        assert!(store.load(&identity()).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_increments_revision() {
        let store = InMemoryStateStore::new();
        let id = identity();

        assert_eq!(store.save(&id, &blob(1), NO_REVISION).await.unwrap(), 1);
        assert_eq!(store.save(&id, &blob(2), 1).await.unwrap(), 2);

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.state["count"], 2);
        assert_eq!(store.revision(&id), 2);
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = InMemoryStateStore::new();
        let id = identity();
        store.save(&id, &blob(1), NO_REVISION).await.unwrap();

        let err = store.save(&id, &blob(9), NO_REVISION).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, current: 1 }));

        let stored = store.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.state["count"], 1);
    }

    #[tokio::test]
    async fn test_expected_revision_on_absent_conflicts() {
        let store = InMemoryStateStore::new();
        let err = store.save(&identity(), &blob(1), 3).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 3, current: 0 }));
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = InMemoryStateStore::new();
        let other = store.clone();
        store.save(&identity(), &blob(1), NO_REVISION).await.unwrap();
        assert_eq!(other.revision(&identity()), 1);
    }
}
