//! Core library for the sshprov provisioning tool.
//!
//! The crate models one-shot SSH side effects (copying a file, running a
//! command sequence) as resources in a declarative dependency graph. Each
//! effect opens a fresh session with bounded retries for a host that is
//! still booting, runs once, and is replaced whenever its inputs drift.
//! The installer workflow in [`install`] assembles those resources into the
//! controller installation plan applied by the `sshprov` binary.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod install;
pub mod resource;
pub mod retry;
pub mod session;
pub mod state_store;
pub mod test_support;

pub use config::{ConfigError, InstallConfig};
pub use connection::{ConnectionSpec, Secret};
pub use engine::{
    ApplyReport, Engine, Graph, GraphError, Node, NodeOutcome, NodeReport, PlanEntry,
    PlannedAction, preview,
};
pub use error::{ProvisionError, TransientClass};
pub use install::{InstallError, build_install_graph, exports};
pub use resource::{
    CreateResult, DiffResult, FileTransfer, FileTransferInputs, Inputs, ProvisionContext,
    RemoteCommand, RemoteCommandInputs, ResourceKind, SideEffect, TransferSource, diff,
};
pub use retry::{ConnectRetryPolicy, RetryPolicy};
pub use session::{CommandOutput, Connector, RemoteSession, Ssh2Connector, Ssh2Session};
pub use state_store::{ResourceRecord, State, StateStore, StateStoreError};
