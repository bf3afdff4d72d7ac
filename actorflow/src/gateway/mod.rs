//! Remote call gateway.
//!
//! The gateway is the only way to reach a unit. It owns one slot per
//! resident identity; each slot holds the single [`ExecutionUnit`] for that
//! identity behind a fair async mutex. A call takes its place in the mutex
//! queue before it is handed to the runtime, so calls on one identity run
//! one at a time in the order they reached the gateway while different
//! identities run in parallel.

mod handle;

pub use handle::{UnitHandle, UnitSnapshot};

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ActorflowConfig;
use crate::errors::{ActorflowError, Result};
use crate::registry::{HashRegistry, Registry, UnitIdentity};
use crate::storage::{FileStateStore, InMemoryStateStore, StateStore};
use crate::unit::{ExecutionUnit, UnitKind};

/// Default deadline for a call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct Slot {
    pub(crate) unit: Arc<Mutex<ExecutionUnit>>,
    last_used: parking_lot::Mutex<Instant>,
}

impl Slot {
    fn new(unit: ExecutionUnit) -> Self {
        Self {
            unit: Arc::new(Mutex::new(unit)),
            last_used: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

struct GatewayInner {
    kinds: HashMap<String, Arc<UnitKind>>,
    store: Arc<dyn StateStore>,
    registry: Arc<dyn Registry>,
    call_timeout: Duration,
    slots: DashMap<UnitIdentity, Arc<Slot>>,
}

/// Location-transparent entry point for calling units.
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Starts building a gateway.
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Returns a handle for an already-resolved identity.
    ///
    /// No unit is loaded until the first call.
    #[must_use]
    pub fn handle(&self, identity: UnitIdentity) -> UnitHandle {
        UnitHandle::new(self.clone(), identity)
    }

    /// Resolves a logical name and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` from the registry.
    pub fn resolve(&self, namespace: &str, logical_name: &str) -> Result<UnitHandle> {
        let identity = self.inner.registry.resolve(namespace, logical_name)?;
        Ok(self.handle(identity))
    }

    /// The registry used for name resolution.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.registry
    }

    /// The storage backend.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    /// The default call deadline.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Registered namespaces, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of units currently resident.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Returns true if `identity` has a resident unit.
    #[must_use]
    pub fn is_resident(&self, identity: &UnitIdentity) -> bool {
        self.inner.slots.contains_key(identity)
    }

    /// Drops the resident unit for `identity` if nothing is using it.
    ///
    /// Returns true if a unit was evicted. State stays in storage and is
    /// reloaded by the next call.
    pub fn evict(&self, identity: &UnitIdentity) -> bool {
        // The map holds one reference; any other means a call is queued or running.
        let evicted = self
            .inner
            .slots
            .remove_if(identity, |_, slot| Arc::strong_count(slot) == 1)
            .is_some();
        if evicted {
            debug!(identity = %identity.short(), "unit evicted");
        }
        evicted
    }

    /// Evicts every unused unit idle for at least `idle_for`.
    ///
    /// Returns the number of units evicted.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let before = self.inner.slots.len();
        self.inner
            .slots
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.idle_for() < idle_for);
        let evicted = before.saturating_sub(self.inner.slots.len());
        if evicted > 0 {
            info!(evicted, resident = self.inner.slots.len(), "idle units evicted");
        }
        evicted
    }

    fn kind_for(&self, identity: &UnitIdentity) -> Result<Arc<UnitKind>> {
        self.inner
            .kinds
            .get(identity.namespace())
            .cloned()
            .ok_or_else(|| ActorflowError::UnknownNamespace {
                namespace: identity.namespace().to_string(),
            })
    }

    /// Returns the slot for `identity`, creating the unit if needed.
    pub(crate) fn slot(&self, identity: &UnitIdentity) -> Result<Arc<Slot>> {
        if let Some(slot) = self.inner.slots.get(identity) {
            return Ok(Arc::clone(slot.value()));
        }
        let kind = self.kind_for(identity)?;
        let slot = self
            .inner
            .slots
            .entry(identity.clone())
            .or_insert_with(|| {
                debug!(identity = %identity.short(), "unit activated");
                Arc::new(Slot::new(ExecutionUnit::new(
                    identity.clone(),
                    kind,
                    Arc::clone(&self.inner.store),
                )))
            })
            .value()
            .clone();
        Ok(slot)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("namespaces", &self.namespaces())
            .field("resident", &self.resident_count())
            .field("call_timeout", &self.inner.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    kinds: Vec<UnitKind>,
    store: Option<Arc<dyn StateStore>>,
    registry: Option<Arc<dyn Registry>>,
    call_timeout: Duration,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    /// Creates a builder with in-memory storage and an unsalted registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kinds: Vec::new(),
            store: None,
            registry: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Creates a builder from runtime configuration.
    ///
    /// Uses file storage when `storage.root` is set and salts the registry
    /// when `registry.salt` is set.
    #[must_use]
    pub fn from_config(config: &ActorflowConfig) -> Self {
        let mut builder = Self::new().with_call_timeout(config.gateway.call_timeout());
        if let Some(root) = &config.storage.root {
            builder = builder.with_store(Arc::new(FileStateStore::new(root)));
        }
        if let Some(salt) = &config.registry.salt {
            builder = builder.with_registry(Arc::new(HashRegistry::with_salt(salt.clone())));
        }
        builder
    }

    /// Registers a unit kind.
    #[must_use]
    pub fn register(mut self, kind: UnitKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Sets the storage backend.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the default call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Builds the gateway.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if two kinds claim the same namespace.
    pub fn build(self) -> Result<Gateway> {
        let mut kinds = HashMap::with_capacity(self.kinds.len());
        for kind in self.kinds {
            let namespace = kind.namespace().to_string();
            if kinds.insert(namespace.clone(), Arc::new(kind)).is_some() {
                return Err(ActorflowError::invalid_name(
                    namespace,
                    "namespace registered twice",
                ));
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(HashRegistry::new()));

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                kinds,
                store,
                registry,
                call_timeout: self.call_timeout,
                slots: DashMap::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{counter_kind, echo_kind};

    fn gateway() -> Gateway {
        Gateway::builder()
            .register(counter_kind())
            .register(echo_kind())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_duplicate_namespace() {
        let result = Gateway::builder()
            .register(counter_kind())
            .register(counter_kind())
            .build();
        assert!(matches!(result, Err(ActorflowError::InvalidName { .. })));
    }

    #[test]
    fn test_namespaces_sorted() {
        assert_eq!(gateway().namespaces(), vec!["counter", "echo"]);
    }

    #[tokio::test]
    async fn test_units_activate_lazily() {
        let gateway = gateway();
        let handle = gateway.resolve("counter", "c1").unwrap();
        assert_eq!(gateway.resident_count(), 0);

        handle.call("increment", serde_json::json!({})).await.unwrap();
        assert_eq!(gateway.resident_count(), 1);
        assert!(gateway.is_resident(handle.identity()));
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let gateway = gateway();
        let err = gateway
            .resolve("ghost", "g1")
            .unwrap()
            .call("anything", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ActorflowError::UnknownNamespace { ref namespace } if namespace == "ghost"));
        assert!(!err.is_retryable());
        assert_eq!(gateway.resident_count(), 0);
    }

    #[tokio::test]
    async fn test_evict_then_reload() {
        let gateway = gateway();
        let handle = gateway.resolve("counter", "c1").unwrap();
        handle.call("increment", serde_json::json!({})).await.unwrap();

        assert!(gateway.evict(handle.identity()));
        assert!(!gateway.evict(handle.identity()));
        assert_eq!(gateway.resident_count(), 0);

        let value = handle.call("increment", serde_json::json!({})).await.unwrap();
        assert_eq!(value["count"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let gateway = gateway();
        let old = gateway.resolve("counter", "old").unwrap();
        old.call("increment", serde_json::json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = gateway.resolve("counter", "fresh").unwrap();
        fresh.call("increment", serde_json::json!({})).await.unwrap();

        assert_eq!(gateway.evict_idle(Duration::from_secs(60)), 1);
        assert!(!gateway.is_resident(old.identity()));
        assert!(gateway.is_resident(fresh.identity()));
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ActorflowConfig::default()
            .with_call_timeout_ms(250)
            .with_storage_root(dir.path())
            .with_salt("tenant-a");
        let gateway = GatewayBuilder::from_config(&config)
            .register(counter_kind())
            .build()
            .unwrap();

        assert_eq!(gateway.call_timeout(), Duration::from_millis(250));
        assert_eq!(
            gateway.registry().resolve("counter", "c1").unwrap(),
            UnitIdentity::derive("counter", "c1", Some("tenant-a"))
        );
    }
}
