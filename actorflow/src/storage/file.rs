//! File-backed state store.
//!
//! Each identity is one JSON document at `<root>/<namespace>/<id>.json`.
//! Writes go to a temporary sibling, are flushed to disk, and are renamed
//! into place, so a reader never observes a half-written record.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{StateBlob, StateStore, StoreError, StoredState, NO_REVISION};
use crate::registry::UnitIdentity;

/// Durable state store on the local filesystem.
///
/// The revision check is serialized per identity within this process.
/// Processes sharing a directory get last-rename-wins semantics between the
/// check and the rename; use one owner process per directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
    write_locks: Arc<DashMap<UnitIdentity, Arc<Mutex<()>>>>,
}

impl FileStateStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Arc::new(DashMap::new()),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, identity: &UnitIdentity) -> PathBuf {
        self.root
            .join(identity.namespace())
            .join(format!("{}.json", identity.id()))
    }

    fn lock_for(&self, identity: &UnitIdentity) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read(path: &Path) -> Result<Option<StoredState>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!("{}: {e}", path.display()))),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, identity: &UnitIdentity) -> Result<Option<StoredState>, StoreError> {
        Self::read(&self.path_for(identity)).await
    }

    async fn save(
        &self,
        identity: &UnitIdentity,
        state: &StateBlob,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        let lock = self.lock_for(identity);
        let result = {
            let _guard = lock.lock().await;
            self.write_checked(identity, state, expected_revision).await
        };
        drop(lock);
        // Forget the lock once no other save holds or waits on it.
        self.write_locks
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

impl FileStateStore {
    async fn write_checked(
        &self,
        identity: &UnitIdentity,
        state: &StateBlob,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        let path = self.path_for(identity);
        let current = Self::read(&path)
            .await?
            .map_or(NO_REVISION, |stored| stored.revision);
        if current != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                current,
            });
        }

        let record = StoredState {
            revision: current + 1,
            state: state.clone(),
            updated_at: Utc::now(),
        };
        let bytes =
            serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("{}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        Self::write_synced(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;

        debug!(identity = %identity.short(), revision = record.revision, "state file written");
        Ok(record.revision)
    }

    async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.write_locks.len()
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

    #[tokio::test]
    async fn test_round_trip_through_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let id = UnitIdentity::derive("counter", "c1", None);

        let store = FileStateStore::new(dir.path());
        assert!(store.load(&id).await.unwrap().is_none());
        assert_eq!(store.save(&id, &blob(1), NO_REVISION).await.unwrap(), 1);

        // A fresh instance stands in for a restarted process.
        let reopened = FileStateStore::new(dir.path());
        let stored = reopened.load(&id).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.state["count"], 1);
    }

    #[tokio::test]
    async fn test_conflict_on_stale_revision() {
        let dir = tempfile::tempdir().unwrap();
        let id = UnitIdentity::derive("counter", "c1", None);
        let store = FileStateStore::new(dir.path());

        store.save(&id, &blob(1), NO_REVISION).await.unwrap();
        store.save(&id, &blob(2), 1).await.unwrap();

        let err = store.save(&id, &blob(3), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, current: 2 }));
    }

    #[tokio::test]
    async fn test_write_locks_released_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        for i in 0..10 {
            let id = UnitIdentity::derive("counter", &format!("c{i}"), None);
            store.save(&id, &blob(1), NO_REVISION).await.unwrap();
        }
        let id = UnitIdentity::derive("counter", "c0", None);
        assert!(store.save(&id, &blob(2), NO_REVISION).await.is_err());

        assert_eq!(store.tracked_locks(), 0);
        assert_eq!(store.load(&id).await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_layout_by_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let id = UnitIdentity::derive("scoring", "wf", None);
        let store = FileStateStore::new(dir.path());
        store.save(&id, &blob(1), NO_REVISION).await.unwrap();

        let expected = dir.path().join("scoring").join(format!("{}.json", id.id()));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let id = UnitIdentity::derive("scoring", "wf", None);
        let path = dir.path().join("scoring");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(format!("{}.json", id.id())), b"{not json").unwrap();

        let store = FileStateStore::new(dir.path());
        assert!(matches!(store.load(&id).await, Err(StoreError::Corrupt(_))));
    }
}
