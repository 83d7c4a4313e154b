//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::io::{self, Read};
use std::time::Duration;

use camino::Utf8Path;
use cap_std::{
    ambient_authority,
    fs_utf8::{Dir, File},
};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::connection::{ConnectionSpec, DEFAULT_SSH_PORT, Secret};
use crate::retry::{ConnectRetryPolicy, DEFAULT_RETRY_DELAY};
use crate::state_store::DEFAULT_STATE_PATH;

const CONFIG_FILE_NAME: &str = "sshprov.toml";

/// Default local path of the installer archive.
pub const DEFAULT_INSTALLER_ARCHIVE_PATH: &str = "controller-installer.tar.gz";

/// Default local path of the installer script.
pub const DEFAULT_INSTALLER_SCRIPT_PATH: &str = "install_controller.sh";

/// Default local path of the rendered secrets file.
pub const DEFAULT_SECRETS_FILE_PATH: &str = "secrets.env";

/// Installer workflow settings derived from configuration files and
/// `SSHPROV_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SSHPROV",
    discovery(
        app_name = "sshprov",
        env_var = "SSHPROV_CONFIG_PATH",
        config_file_name = "sshprov.toml",
        dotfile_name = ".sshprov.toml",
        project_file_name = "sshprov.toml"
    )
)]
pub struct InstallConfig {
    /// Hostname or address of the machine to provision.
    pub host: String,
    /// SSH port. Defaults to 22.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub port: u16,
    /// Remote account name; falls back to the local `$USER`.
    pub username: Option<String>,
    /// Password for password authentication.
    pub password: Option<String>,
    /// Path to a PEM private key. Preferred over the password when both are
    /// set. Supports `~/` expansion.
    pub private_key_path: Option<String>,
    /// Passphrase protecting the private key.
    pub private_key_passphrase: Option<String>,
    /// Local installer archive, copied to the remote host unchanged.
    #[ortho_config(default = DEFAULT_INSTALLER_ARCHIVE_PATH.to_owned())]
    pub installer_archive_path: String,
    /// Local installer script.
    #[ortho_config(default = DEFAULT_INSTALLER_SCRIPT_PATH.to_owned())]
    pub installer_script_path: String,
    /// Local, already-rendered secrets file. Its contents are shipped as
    /// inline content and removed remotely after the installer runs.
    #[ortho_config(default = DEFAULT_SECRETS_FILE_PATH.to_owned())]
    pub secrets_file_path: String,
    /// Where applied resources are recorded.
    #[ortho_config(default = DEFAULT_STATE_PATH.to_owned())]
    pub state_path: String,
    /// Seconds to wait between connection attempts.
    #[ortho_config(default = DEFAULT_RETRY_DELAY.as_secs())]
    pub connect_retry_delay_secs: u64,
    /// Name of the external database, when one backs the installation.
    pub database_name: Option<String>,
    /// Server hosting the external database.
    pub database_server: Option<String>,
    /// Administrator account of the external database.
    pub database_admin_username: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const HOST: FieldMetadata = FieldMetadata::new("target host", "SSHPROV_HOST", "host");
const INSTALLER_ARCHIVE: FieldMetadata = FieldMetadata::new(
    "installer archive path",
    "SSHPROV_INSTALLER_ARCHIVE_PATH",
    "installer_archive_path",
);
const INSTALLER_SCRIPT: FieldMetadata = FieldMetadata::new(
    "installer script path",
    "SSHPROV_INSTALLER_SCRIPT_PATH",
    "installer_script_path",
);
const SECRETS_FILE: FieldMetadata = FieldMetadata::new(
    "secrets file path",
    "SSHPROV_SECRETS_FILE_PATH",
    "secrets_file_path",
);
const STATE_PATH: FieldMetadata =
    FieldMetadata::new("state file path", "SSHPROV_STATE_PATH", "state_path");
const USERNAME: FieldMetadata = FieldMetadata::new("SSH username", "SSHPROV_USERNAME", "username");
const PRIVATE_KEY: FieldMetadata = FieldMetadata::new(
    "SSH private key path",
    "SSHPROV_PRIVATE_KEY_PATH",
    "private_key_path",
);
const DATABASE_NAME: FieldMetadata =
    FieldMetadata::new("database name", "SSHPROV_DATABASE_NAME", "database_name");
const DATABASE_SERVER: FieldMetadata = FieldMetadata::new(
    "database server",
    "SSHPROV_DATABASE_SERVER",
    "database_server",
);
const DATABASE_ADMIN: FieldMetadata = FieldMetadata::new(
    "database admin username",
    "SSHPROV_DATABASE_ADMIN_USERNAME",
    "database_admin_username",
);

impl InstallConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_optional_field(
        value: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        match value {
            Some(set) => Self::require_field(set, metadata),
            None => Ok(()),
        }
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("sshprov")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when values contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.host, &HOST)?;
        if self.port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "port must be between 1 and 65535: check SSHPROV_PORT or port in sshprov.toml",
            )));
        }
        Self::require_optional_field(self.username.as_deref(), &USERNAME)?;
        Self::require_optional_field(self.private_key_path.as_deref(), &PRIVATE_KEY)?;
        if self.password.is_none() && self.private_key_path.is_none() {
            return Err(ConfigError::MissingField(format!(
                "missing SSH credentials: set SSHPROV_PASSWORD or SSHPROV_PRIVATE_KEY_PATH, \
                 or add password or private_key_path to {CONFIG_FILE_NAME}"
            )));
        }
        Self::require_field(&self.installer_archive_path, &INSTALLER_ARCHIVE)?;
        Self::require_field(&self.installer_script_path, &INSTALLER_SCRIPT)?;
        Self::require_field(&self.secrets_file_path, &SECRETS_FILE)?;
        Self::require_field(&self.state_path, &STATE_PATH)?;
        self.validate_database()
    }

    fn validate_database(&self) -> Result<(), ConfigError> {
        let fields = [
            (self.database_name.as_deref(), &DATABASE_NAME),
            (self.database_server.as_deref(), &DATABASE_SERVER),
            (self.database_admin_username.as_deref(), &DATABASE_ADMIN),
        ];
        if fields.iter().all(|(value, _)| value.is_none()) {
            return Ok(());
        }
        for (value, metadata) in fields {
            Self::require_field(value.unwrap_or_default(), metadata)?;
        }
        Ok(())
    }

    /// Whether an external database backs the installation.
    #[must_use]
    pub const fn has_database(&self) -> bool {
        self.database_name.is_some()
    }

    /// Builds the connection used by every installer step, reading the
    /// private key from disk when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails or the key cannot be
    /// read.
    pub fn connection_spec(&self) -> Result<ConnectionSpec, ConfigError> {
        self.validate()?;
        let mut spec = ConnectionSpec::new(self.host.trim()).with_port(self.port);
        if let Some(username) = &self.username {
            spec = spec.with_username(username.trim());
        }
        if let Some(password) = &self.password {
            spec = spec.with_password(password.as_str());
        }
        if let Some(key_path) = &self.private_key_path {
            let key = read_local_file(&expand_tilde(key_path))?;
            let passphrase = self.private_key_passphrase.as_deref().map(Secret::from);
            spec = spec.with_private_key(key, passphrase);
        }
        Ok(spec)
    }

    /// Connection retry budgets using the configured delay.
    #[must_use]
    pub fn retry_policy(&self) -> ConnectRetryPolicy {
        ConnectRetryPolicy::default().with_delay(Duration::from_secs(self.connect_retry_delay_secs))
    }
}

/// Expands a leading `~/` using `$HOME`.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Opens a local file through a directory handle on its parent. Relative
/// paths resolve against the working directory.
///
/// # Errors
///
/// Returns the underlying I/O error when the parent directory or the file
/// cannot be opened.
pub(crate) fn open_local_file(path: &Utf8Path) -> io::Result<File> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Dir::open_ambient_dir(parent, ambient_authority())?.open(file_name)
}

/// Reads a local UTF-8 file through a directory handle on its parent.
///
/// # Errors
///
/// Returns [`ConfigError::FileRead`] when the file cannot be opened or read.
pub(crate) fn read_local_file(path: &str) -> Result<String, ConfigError> {
    let file_error = |err: io::Error| ConfigError::FileRead {
        path: path.to_owned(),
        message: err.to_string(),
    };
    let mut contents = String::new();
    open_local_file(Utf8Path::new(path))
        .and_then(|mut file| file.read_to_string(&mut contents))
        .map_err(file_error)?;
    Ok(contents)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates values that are present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Raised when a file named by the configuration cannot be read.
    #[error("failed to read {path}: {message}")]
    FileRead {
        /// Path as configured, after `~/` expansion.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
