//! Durable unit registry.
//!
//! Maps a logical name inside a namespace to a stable [`UnitIdentity`]. The
//! derivation is a salted SHA-256 digest, so it is pure, identical across
//! processes and restarts, and collision-free for practical purposes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::errors::{ActorflowError, Result};

#[allow(clippy::unwrap_used)]
fn namespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap())
}

/// The stable token naming one execution unit.
///
/// Displayed and parsed as `namespace:hexdigest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitIdentity {
    namespace: String,
    id: String,
}

impl UnitIdentity {
    /// Derives an identity without validating its inputs.
    ///
    /// Use [`Registry::resolve`] for caller-supplied names.
    #[must_use]
    pub fn derive(namespace: &str, logical_name: &str, salt: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        if let Some(salt) = salt {
            hasher.update(salt.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(logical_name.as_bytes());

        Self {
            namespace: namespace.to_string(),
            id: hex::encode(hasher.finalize()),
        }
    }

    /// Parses the `namespace:hexdigest` display form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if either part is malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let (namespace, id) = raw
            .split_once(':')
            .ok_or_else(|| ActorflowError::invalid_name(raw, "expected 'namespace:id'"))?;

        validate_namespace(namespace)?;
        if id.len() != 64 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ActorflowError::invalid_name(raw, "id must be 64 hex characters"));
        }

        Ok(Self {
            namespace: namespace.to_string(),
            id: id.to_ascii_lowercase(),
        })
    }

    /// Returns the namespace (unit kind) of this identity.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a short form for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}:{}", self.namespace, &self.id[..12])
    }
}

impl fmt::Display for UnitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl FromStr for UnitIdentity {
    type Err = ActorflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(ActorflowError::invalid_name(namespace, "namespace cannot be empty"));
    }
    if !namespace_pattern().is_match(namespace) {
        return Err(ActorflowError::invalid_name(
            namespace,
            "namespace must match ^[A-Za-z][A-Za-z0-9_-]*$",
        ));
    }
    Ok(())
}

fn validate_logical_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ActorflowError::invalid_name(
            name,
            "logical name cannot be empty or whitespace-only",
        ));
    }
    Ok(())
}

/// Resolves logical names to identities.
///
/// Passed explicitly to every component that needs to address a unit, so
/// tests can substitute their own naming scheme.
pub trait Registry: Send + Sync {
    /// Resolves `logical_name` inside `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` when either input is empty or malformed.
    fn resolve(&self, namespace: &str, logical_name: &str) -> Result<UnitIdentity>;
}

/// The default registry: salted SHA-256 over namespace and name.
#[derive(Debug, Clone, Default)]
pub struct HashRegistry {
    salt: Option<String>,
}

impl HashRegistry {
    /// Creates an unsalted registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose identities are namespaced by `salt`.
    ///
    /// Deployments sharing storage must agree on the salt.
    #[must_use]
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self {
            salt: Some(salt.into()),
        }
    }

    /// Returns a resolver bound to one namespace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for a malformed namespace.
    pub fn namespace(self: &Arc<Self>, namespace: &str) -> Result<Namespace> {
        validate_namespace(namespace)?;
        Ok(Namespace {
            registry: Arc::clone(self) as Arc<dyn Registry>,
            namespace: namespace.to_string(),
        })
    }
}

impl Registry for HashRegistry {
    fn resolve(&self, namespace: &str, logical_name: &str) -> Result<UnitIdentity> {
        validate_namespace(namespace)?;
        validate_logical_name(logical_name)?;
        Ok(UnitIdentity::derive(namespace, logical_name, self.salt.as_deref()))
    }
}

/// A registry bound to a single namespace.
#[derive(Clone)]
pub struct Namespace {
    registry: Arc<dyn Registry>,
    namespace: String,
}

impl Namespace {
    /// Binds an arbitrary registry to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for a malformed namespace.
    pub fn new(registry: Arc<dyn Registry>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self { registry, namespace })
    }

    /// Returns the bound namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.namespace
    }

    /// Resolves a logical name in this namespace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for an empty logical name.
    pub fn resolve(&self, logical_name: &str) -> Result<UnitIdentity> {
        self.registry.resolve(&self.namespace, logical_name)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
