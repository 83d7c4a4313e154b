//! The controller installer workflow as a resource graph.
//!
//! Three copies ship the installer archive, the secrets file, and the
//! installer script to `/tmp` on the target. Once all three succeed, the
//! script runs and the secrets file is removed on a best-effort basis.

use std::borrow::Cow;

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::config::{ConfigError, InstallConfig, expand_tilde, read_local_file};
use crate::connection::ConnectionSpec;
use crate::engine::{Graph, GraphError, Node};
use crate::error::ProvisionError;
use crate::resource::{FileTransferInputs, RemoteCommandInputs, ResourceKind, TransferSource};

/// Remote path of the installer archive.
pub const REMOTE_ARCHIVE_PATH: &str = "/tmp/controller-installer.tar.gz";
/// Remote path of the secrets file.
pub const REMOTE_SECRETS_PATH: &str = "/tmp/secrets.env";
/// Remote path of the installer script.
pub const REMOTE_SCRIPT_PATH: &str = "/tmp/install_controller.sh";

/// Node copying the installer archive.
pub const COPY_ARCHIVE_NODE: &str = "copy-controller-installer-archive";
/// Node copying the secrets file.
pub const COPY_SECRETS_NODE: &str = "copy-secrets-file";
/// Node copying the installer script.
pub const COPY_SCRIPT_NODE: &str = "copy-controller-installer";
/// Node running the installer.
pub const RUN_INSTALLER_NODE: &str = "run-controller-installer";

/// Errors raised while assembling the installer graph.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InstallError {
    /// Raised when configuration is invalid or a local file is unreadable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when resource inputs cannot be rendered.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// Raised when the graph is malformed.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Builds the four-node installer graph.
///
/// # Errors
///
/// Returns [`InstallError`] when the configuration is invalid, the secrets
/// file or private key cannot be read, or inputs cannot be rendered.
pub fn build_install_graph(config: &InstallConfig) -> Result<Graph, InstallError> {
    let connection = config.connection_spec()?;
    let secrets = read_local_file(&expand_tilde(&config.secrets_file_path))?;

    let mut graph = Graph::new();
    graph.add(copy_node(
        COPY_ARCHIVE_NODE,
        &connection,
        TransferSource::LocalFile(local_path(&config.installer_archive_path)),
        REMOTE_ARCHIVE_PATH,
    )?)?;
    graph.add(copy_node(
        COPY_SECRETS_NODE,
        &connection,
        TransferSource::Inline(secrets),
        REMOTE_SECRETS_PATH,
    )?)?;
    graph.add(copy_node(
        COPY_SCRIPT_NODE,
        &connection,
        TransferSource::LocalFile(local_path(&config.installer_script_path)),
        REMOTE_SCRIPT_PATH,
    )?)?;

    let install = format!("bash {}", quoted(REMOTE_SCRIPT_PATH));
    let remove_secrets = format!("rm -f {}", quoted(REMOTE_SECRETS_PATH));
    let run = RemoteCommandInputs::new(connection, vec![install]).with_cleanup(vec![remove_secrets]);
    graph.add(
        Node::new(RUN_INSTALLER_NODE, ResourceKind::RemoteCommand, run.to_inputs()?)
            .with_dependencies([COPY_ARCHIVE_NODE, COPY_SECRETS_NODE, COPY_SCRIPT_NODE]),
    )?;
    Ok(graph)
}

/// Operator-facing values published after a successful apply, in display
/// order. Database entries appear only when a database is configured.
#[must_use]
pub fn exports(config: &InstallConfig) -> Vec<(&'static str, String)> {
    let username = config
        .username
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();
    let mut values = vec![
        ("controller_host", config.host.clone()),
        ("controller_host_username", username),
    ];
    if config.has_database() {
        values.extend([
            ("db_name", config.database_name.clone().unwrap_or_default()),
            (
                "db_server_name",
                config.database_server.clone().unwrap_or_default(),
            ),
            (
                "db_admin_username",
                config.database_admin_username.clone().unwrap_or_default(),
            ),
        ]);
    }
    values
}

fn copy_node(
    name: &str,
    connection: &ConnectionSpec,
    source: TransferSource,
    destination: &str,
) -> Result<Node, ProvisionError> {
    let inputs = FileTransferInputs::new(connection.clone(), source, destination).to_inputs()?;
    Ok(Node::new(name, ResourceKind::FileTransfer, inputs))
}

fn local_path(configured: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(expand_tilde(configured))
}

fn quoted(path: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(path))
}
