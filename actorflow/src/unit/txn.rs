//! Buffered state access for one operation call.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{HandlerFault, UndeclaredFieldError};
use crate::storage::StateBlob;

/// Field-level view of a unit's state during one call.
///
/// Reads see the committed state overlaid with this call's own writes.
/// Writes are buffered and only reach storage when the runtime commits,
/// either at a checkpoint or after the handler returns successfully.
#[derive(Debug, Clone)]
pub struct StateTxn {
    operation: String,
    reads: Option<BTreeSet<String>>,
    writes: Option<BTreeSet<String>>,
    base: StateBlob,
    pending: BTreeMap<String, Option<serde_json::Value>>,
}

impl StateTxn {
    pub(crate) fn new(
        operation: impl Into<String>,
        reads: Option<BTreeSet<String>>,
        writes: Option<BTreeSet<String>>,
        base: StateBlob,
    ) -> Self {
        Self {
            operation: operation.into(),
            reads,
            writes,
            base,
            pending: BTreeMap::new(),
        }
    }

    fn check_read(&self, field: &str) -> Result<(), UndeclaredFieldError> {
        let declared = match (&self.reads, &self.writes) {
            (None, _) => true,
            (Some(reads), writes) => {
                reads.contains(field) || writes.as_ref().is_some_and(|w| w.contains(field))
            }
        };
        if declared {
            Ok(())
        } else {
            Err(UndeclaredFieldError {
                operation: self.operation.clone(),
                field: field.to_string(),
                access: "read",
            })
        }
    }

    fn check_write(&self, field: &str) -> Result<(), UndeclaredFieldError> {
        match &self.writes {
            Some(writes) if !writes.contains(field) => Err(UndeclaredFieldError {
                operation: self.operation.clone(),
                field: field.to_string(),
                access: "write",
            }),
            _ => Ok(()),
        }
    }

    /// Reads a field.
    ///
    /// # Errors
    ///
    /// Fails if the operation did not declare the field.
    pub fn get(&self, field: &str) -> Result<Option<&serde_json::Value>, UndeclaredFieldError> {
        self.check_read(field)?;
        Ok(match self.pending.get(field) {
            Some(pending) => pending.as_ref(),
            None => self.base.get(field),
        })
    }

    /// Reads and decodes a field.
    ///
    /// # Errors
    ///
    /// Fails if the field is undeclared or does not decode as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, HandlerFault> {
        match self.get(field)? {
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                HandlerFault::permanent(format!("field '{field}' has unexpected shape: {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Buffers a write.
    ///
    /// # Errors
    ///
    /// Fails if the field is undeclared or the value does not serialize.
    pub fn set(&mut self, field: &str, value: impl Serialize) -> Result<(), HandlerFault> {
        self.check_write(field)?;
        let value = serde_json::to_value(value)
            .map_err(|e| HandlerFault::permanent(format!("field '{field}': {e}")))?;
        self.pending.insert(field.to_string(), Some(value));
        Ok(())
    }

    /// Buffers a removal.
    ///
    /// # Errors
    ///
    /// Fails if the field is undeclared.
    pub fn remove(&mut self, field: &str) -> Result<(), UndeclaredFieldError> {
        self.check_write(field)?;
        self.pending.insert(field.to_string(), None);
        Ok(())
    }

    /// Returns true if any write is buffered.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns the names of buffered fields.
    #[must_use]
    pub fn dirty_fields(&self) -> Vec<&str> {
        self.pending.keys().map(String::as_str).collect()
    }

    /// Returns the state as it would be committed.
    #[must_use]
    pub fn materialize(&self) -> StateBlob {
        let mut state = self.base.clone();
        for (field, value) in &self.pending {
            match value {
                Some(value) => {
                    state.insert(field.clone(), value.clone());
                }
                None => {
                    state.remove(field);
                }
            }
        }
        state
    }

    /// Folds the buffered writes into the base after a durable commit.
    pub(crate) fn mark_committed(&mut self, committed: StateBlob) {
        self.base = committed;
        self.pending.clear();
    }

    pub(crate) fn base(&self) -> &StateBlob {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StateBlob {
        let mut state = StateBlob::new();
        state.insert("count".to_string(), serde_json::json!(1));
        state.insert("label".to_string(), serde_json::json!("a"));
        state
    }

    fn declared(reads: &[&str], writes: &[&str]) -> StateTxn {
        StateTxn::new(
            "op",
            Some(reads.iter().map(ToString::to_string).collect()),
            Some(writes.iter().map(ToString::to_string).collect()),
            base(),
        )
    }

    #[test]
    fn test_reads_see_own_writes() {
        let mut txn = StateTxn::new("op", None, None, base());
        txn.set("count", 5).unwrap();

        assert_eq!(txn.get("count").unwrap(), Some(&serde_json::json!(5)));
        assert_eq!(txn.get_as::<i64>("count").unwrap(), Some(5));
        assert_eq!(txn.base()["count"], 1);
    }

    #[test]
    fn test_remove_hides_field() {
        let mut txn = StateTxn::new("op", None, None, base());
        txn.remove("label").unwrap();

        assert!(txn.get("label").unwrap().is_none());
        assert!(!txn.materialize().contains_key("label"));
    }

    #[test]
    fn test_undeclared_read_rejected() {
        let txn = declared(&["count"], &[]);
        assert!(txn.get("count").is_ok());
        let err = txn.get("label").unwrap_err();
        assert_eq!(err.access, "read");
    }

    #[test]
    fn test_written_fields_are_readable() {
        let txn = declared(&[], &["count"]);
        assert!(txn.get("count").is_ok());
    }

    #[test]
    fn test_undeclared_write_rejected() {
        let mut txn = declared(&["count", "label"], &["count"]);
        assert!(txn.set("count", 2).is_ok());
        let fault = txn.set("label", "b").unwrap_err();
        assert!(!fault.is_retryable());
        assert!(txn.remove("label").is_err());
    }

    #[test]
    fn test_materialize_and_commit() {
        let mut txn = StateTxn::new("op", None, None, base());
        assert!(!txn.is_dirty());
        txn.set("count", 2).unwrap();
        txn.set("new", true).unwrap();
        assert_eq!(txn.dirty_fields(), vec!["count", "new"]);

        let state = txn.materialize();
        assert_eq!(state["count"], 2);
        assert_eq!(state["new"], true);

        txn.mark_committed(state);
        assert!(!txn.is_dirty());
        assert_eq!(txn.base()["count"], 2);
    }

    #[test]
    fn test_get_as_shape_mismatch() {
        let txn = StateTxn::new("op", None, None, base());
        let fault = txn.get_as::<i64>("label").unwrap_err();
        assert!(fault.message.contains("label"));
    }
}
