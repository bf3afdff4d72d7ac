//! Unit kinds: the operation table shared by every unit of a namespace.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Debug};
use std::sync::Arc;

use super::context::OperationContext;
use super::txn::StateTxn;
use crate::errors::{HandlerFault, Result};
use crate::registry::validate_namespace;
use crate::storage::StateBlob;

/// Trait for operation handlers.
///
/// A handler runs with exclusive access to its unit: no other call on the
/// same identity starts until it returns.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Runs the operation.
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerFault>;
}

/// A synchronous handler that only touches its own state.
pub struct FnHandler<F>
where
    F: Fn(&mut StateTxn, serde_json::Value) -> std::result::Result<serde_json::Value, HandlerFault>
        + Send
        + Sync,
{
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&mut StateTxn, serde_json::Value) -> std::result::Result<serde_json::Value, HandlerFault>
        + Send
        + Sync,
{
    /// Wraps a closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut StateTxn, serde_json::Value) -> std::result::Result<serde_json::Value, HandlerFault>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: &mut OperationContext,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerFault> {
        (self.func)(ctx.state_mut(), args)
    }
}

/// Declares an operation's name, state access and required arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    /// The operation name.
    pub name: String,
    /// Fields the handler may read; `None` allows any.
    pub reads: Option<BTreeSet<String>>,
    /// Fields the handler may write; `None` allows any.
    pub writes: Option<BTreeSet<String>>,
    /// Keys that must be present in an object argument.
    pub required_args: Vec<String>,
}

impl OperationSpec {
    /// Declares an operation with no state access.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reads: Some(BTreeSet::new()),
            writes: Some(BTreeSet::new()),
            required_args: Vec::new(),
        }
    }

    /// Declares an operation with unrestricted state access.
    #[must_use]
    pub fn open(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reads: None,
            writes: None,
            required_args: Vec::new(),
        }
    }

    /// Adds readable fields.
    #[must_use]
    pub fn reads(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.reads
            .get_or_insert_with(BTreeSet::new)
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds writable fields.
    #[must_use]
    pub fn writes(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.writes
            .get_or_insert_with(BTreeSet::new)
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Requires the argument to be an object with these keys.
    #[must_use]
    pub fn requires(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_args.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Checks `args` against the declared requirements.
    ///
    /// Returns the reason on failure.
    pub(crate) fn check_args(&self, args: &serde_json::Value) -> std::result::Result<(), String> {
        if self.required_args.is_empty() {
            return Ok(());
        }
        let Some(obj) = args.as_object() else {
            return Err(format!("expected an object, got {}", json_type(args)));
        };
        let missing: Vec<&str> = self
            .required_args
            .iter()
            .filter(|key| !obj.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required keys: {}", missing.join(", ")))
        }
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A registered operation.
#[derive(Clone)]
pub struct Operation {
    /// The declaration.
    pub spec: OperationSpec,
    /// The handler.
    pub handler: Arc<dyn Handler>,
}

impl Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("spec", &self.spec).finish_non_exhaustive()
    }
}

/// Everything units of one namespace share: default state and operations.
#[derive(Debug, Clone)]
pub struct UnitKind {
    namespace: String,
    default_state: StateBlob,
    operations: HashMap<String, Operation>,
}

impl UnitKind {
    /// Starts building a kind for `namespace`.
    #[must_use]
    pub fn builder(namespace: impl Into<String>) -> UnitKindBuilder {
        UnitKindBuilder {
            namespace: namespace.into(),
            default_state: StateBlob::new(),
            operations: Vec::new(),
        }
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the state a never-persisted unit starts with.
    #[must_use]
    pub fn default_state(&self) -> &StateBlob {
        &self.default_state
    }

    /// Looks up an operation.
    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    /// Returns operation names, sorted.
    #[must_use]
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder for [`UnitKind`].
pub struct UnitKindBuilder {
    namespace: String,
    default_state: StateBlob,
    operations: Vec<Operation>,
}

impl UnitKindBuilder {
    /// Sets a field of the default state.
    #[must_use]
    pub fn default_field(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.default_state.insert(field.into(), value);
        self
    }

    /// Registers an operation.
    #[must_use]
    pub fn operation(mut self, spec: OperationSpec, handler: Arc<dyn Handler>) -> Self {
        self.operations.push(Operation { spec, handler });
        self
    }

    /// Registers a synchronous state-only operation.
    #[must_use]
    pub fn operation_fn<F>(self, spec: OperationSpec, func: F) -> Self
    where
        F: Fn(&mut StateTxn, serde_json::Value) -> std::result::Result<serde_json::Value, HandlerFault>
            + Send
            + Sync
            + 'static,
    {
        self.operation(spec, Arc::new(FnHandler::new(func)))
    }

    /// Builds the kind.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` for a malformed namespace, an empty operation
    /// name, or a duplicate operation.
    pub fn build(self) -> Result<UnitKind> {
        validate_namespace(&self.namespace)?;

        let mut operations = HashMap::with_capacity(self.operations.len());
        for op in self.operations {
            if op.spec.name.trim().is_empty() {
                return Err(crate::errors::ActorflowError::invalid_name(
                    &op.spec.name,
                    "operation name cannot be empty",
                ));
            }
            if operations.contains_key(&op.spec.name) {
                return Err(crate::errors::ActorflowError::invalid_name(
                    &op.spec.name,
                    format!("operation registered twice on '{}'", self.namespace),
                ));
            }
            operations.insert(op.spec.name.clone(), op);
        }

        Ok(UnitKind {
            namespace: self.namespace,
            default_state: self.default_state,
            operations,
        })
    }
}
