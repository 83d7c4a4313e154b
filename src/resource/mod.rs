//! Side-effect resources for a declarative dependency graph.
//!
//! A side-effect resource performs an external action when created instead
//! of allocating a tracked object. It cannot be patched or undone, so:
//!
//! - `create` runs the effect once and tags the result with a fresh id;
//! - any input drift reported by [`diff`] forces a full replacement;
//! - deletion is a no-op.
//!
//! The set of resource kinds is closed. [`ResourceKind`] is both the
//! registry (by name) and the dispatch point for [`SideEffect`]
//! implementations.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::connection::ConnectionSpec;
use crate::error::ProvisionError;
use crate::retry::ConnectRetryPolicy;
use crate::session::{Connector, open_session};

mod file_transfer;
mod remote_command;

pub use file_transfer::{FileTransfer, FileTransferInputs, TransferSource};
pub use remote_command::{RemoteCommand, RemoteCommandInputs};

/// Resource inputs and outputs: a mapping from key to structured value.
pub type Inputs = Map<String, Value>;

/// Explicit context handed to every effect.
#[derive(Clone, Debug)]
pub struct ProvisionContext<C> {
    connector: C,
    retry: ConnectRetryPolicy,
}

impl<C: Connector> ProvisionContext<C> {
    /// Creates a context using the default connection retry budgets.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            retry: ConnectRetryPolicy::default(),
        }
    }

    /// Overrides the connection retry budgets.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: ConnectRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the configured retry budgets.
    #[must_use]
    pub const fn retry_policy(&self) -> &ConnectRetryPolicy {
        &self.retry
    }

    /// Opens a fresh session for a single effect invocation.
    ///
    /// # Errors
    ///
    /// See [`open_session`].
    pub fn open_session(&self, spec: &ConnectionSpec) -> Result<C::Session, ProvisionError> {
        open_session(&self.connector, spec, &self.retry)
    }
}

/// The one capability a concrete resource supplies.
pub trait SideEffect {
    /// Registry name of the resource kind.
    const KIND: ResourceKind;

    /// Validates `inputs`, performs the effect, and returns the outputs.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisionError`] describing why the effect did not
    /// complete. Nothing partial is returned.
    fn perform_effect<C: Connector>(
        &self,
        context: &ProvisionContext<C>,
        inputs: &Inputs,
    ) -> Result<Inputs, ProvisionError>;
}

/// Closed set of resource kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Copies a local file or inline content to the remote host.
    FileTransfer,
    /// Runs shell commands on the remote host.
    RemoteCommand,
}

impl ResourceKind {
    /// Every registered kind.
    pub const ALL: [Self; 2] = [Self::FileTransfer, Self::RemoteCommand];

    /// Registry name of the kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FileTransfer => "file_transfer",
            Self::RemoteCommand => "remote_command",
        }
    }

    /// Looks a kind up by its registry name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Dispatches to the kind's [`SideEffect`] implementation.
    ///
    /// # Errors
    ///
    /// Propagates the effect's error unchanged.
    pub fn perform_effect<C: Connector>(
        self,
        context: &ProvisionContext<C>,
        inputs: &Inputs,
    ) -> Result<Inputs, ProvisionError> {
        match self {
            Self::FileTransfer => FileTransfer.perform_effect(context, inputs),
            Self::RemoteCommand => RemoteCommand.perform_effect(context, inputs),
        }
    }

    /// Performs the effect and tags the outputs with a fresh identifier.
    ///
    /// # Errors
    ///
    /// Propagates the effect's error unchanged; the resource is then
    /// considered not created.
    pub fn create<C: Connector>(
        self,
        context: &ProvisionContext<C>,
        inputs: &Inputs,
    ) -> Result<CreateResult, ProvisionError> {
        let id = Uuid::new_v4().simple().to_string();
        let outputs = self.perform_effect(context, inputs)?;
        Ok(CreateResult { id, outputs })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a successful create.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateResult {
    /// Tracking identifier; carries no meaning beyond uniqueness.
    pub id: String,
    /// Outputs produced by the effect.
    pub outputs: Inputs,
}

/// Result of comparing previous and proposed inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffResult {
    /// Whether the resource must be replaced.
    pub changed: bool,
    /// Keys that were added, removed, or changed in value.
    pub changed_keys: BTreeSet<String>,
    /// Always `true`: the new effect is applied before any teardown of the
    /// old one, which has none.
    pub replace_before_delete: bool,
}

/// Compares two input mappings key by key with deep value equality.
///
/// Mapping-valued fields compare independently of key order.
#[must_use]
pub fn diff(previous: &Inputs, proposed: &Inputs) -> DiffResult {
    let mut changed_keys: BTreeSet<String> = previous
        .iter()
        .filter(|&(key, value)| proposed.get(key) != Some(value))
        .map(|(key, _)| key.clone())
        .collect();
    changed_keys.extend(
        proposed
            .keys()
            .filter(|key| !previous.contains_key(key.as_str()))
            .cloned(),
    );

    DiffResult {
        changed: !changed_keys.is_empty(),
        changed_keys,
        replace_before_delete: true,
    }
}

pub(crate) fn parse_inputs<T>(kind: ResourceKind, inputs: &Inputs) -> Result<T, ProvisionError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(Value::Object(inputs.clone()))
        .map_err(|err| ProvisionError::Configuration(format!("invalid {kind} inputs: {err}")))
}
