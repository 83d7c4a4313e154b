//! Copies a local file or an inline string to a path on the remote host.
//!
//! No partial-file cleanup is attempted: a failed transfer may leave a
//! truncated file at the destination.

use std::io::{Cursor, Read};

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::config::open_local_file;
use crate::connection::ConnectionSpec;
use crate::error::ProvisionError;
use crate::session::{Connector, RemoteSession, with_session};

use super::{Inputs, ProvisionContext, ResourceKind, SideEffect, parse_inputs};

const CONNECTION_KEY: &str = "connection";
const LOCAL_FILE_KEY: &str = "local_file_path";
const INLINE_CONTENT_KEY: &str = "inline_content";
const DESTINATION_KEY: &str = "destination_path";

/// Where the transferred bytes come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferSource {
    /// A file on the local filesystem, streamed as-is.
    LocalFile(Utf8PathBuf),
    /// In-memory text, transferred as UTF-8.
    Inline(String),
}

impl TransferSource {
    fn open(&self) -> Result<Box<dyn Read>, ProvisionError> {
        match self {
            Self::LocalFile(path) => open_local_file(path)
                .map(|file| Box::new(file) as Box<dyn Read>)
                .map_err(|err| {
                    ProvisionError::RemoteEffect(format!("failed to open {path}: {err}"))
                }),
            Self::Inline(content) => Ok(Box::new(Cursor::new(content.clone().into_bytes()))),
        }
    }
}

/// Typed view of file-transfer inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileTransferInputs {
    /// Host to copy to.
    pub connection: ConnectionSpec,
    /// Bytes to copy.
    pub source: TransferSource,
    /// Absolute path on the remote host.
    pub destination_path: Utf8PathBuf,
}

#[derive(Deserialize)]
struct RawFileTransferInputs {
    connection: ConnectionSpec,
    #[serde(default)]
    local_file_path: Option<Utf8PathBuf>,
    #[serde(default)]
    inline_content: Option<String>,
    destination_path: Utf8PathBuf,
}

impl FileTransferInputs {
    /// Bundles the typed inputs.
    pub fn new(
        connection: ConnectionSpec,
        source: TransferSource,
        destination_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            connection,
            source,
            destination_path: destination_path.into(),
        }
    }

    /// Renders the inputs as the mapping stored in the graph and state.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when the connection cannot
    /// be serialised.
    pub fn to_inputs(&self) -> Result<Inputs, ProvisionError> {
        let connection = serde_json::to_value(&self.connection).map_err(|err| {
            ProvisionError::Configuration(format!("unserialisable connection: {err}"))
        })?;
        let mut inputs = Inputs::new();
        inputs.insert(CONNECTION_KEY.to_owned(), connection);
        match &self.source {
            TransferSource::LocalFile(path) => {
                inputs.insert(LOCAL_FILE_KEY.to_owned(), Value::String(path.to_string()));
            }
            TransferSource::Inline(content) => {
                inputs.insert(INLINE_CONTENT_KEY.to_owned(), Value::String(content.clone()));
            }
        }
        inputs.insert(
            DESTINATION_KEY.to_owned(),
            Value::String(self.destination_path.to_string()),
        );
        Ok(inputs)
    }

    /// Parses and validates a raw input mapping.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when fields are missing,
    /// both or neither source is set, the destination is relative, or the
    /// connection is invalid.
    pub fn from_inputs(inputs: &Inputs) -> Result<Self, ProvisionError> {
        let raw: RawFileTransferInputs = parse_inputs(FileTransfer::KIND, inputs)?;
        let source = match (raw.local_file_path, raw.inline_content) {
            (Some(path), None) => TransferSource::LocalFile(path),
            (None, Some(content)) => TransferSource::Inline(content),
            (Some(_), Some(_)) => {
                return Err(ProvisionError::configuration(
                    "set only one of local_file_path or inline_content",
                ));
            }
            (None, None) => {
                return Err(ProvisionError::configuration(
                    "one of local_file_path or inline_content is required",
                ));
            }
        };
        if !raw.destination_path.is_absolute() {
            return Err(ProvisionError::Configuration(format!(
                "destination_path must be absolute, got {}",
                raw.destination_path
            )));
        }
        raw.connection.validate()?;

        Ok(Self {
            connection: raw.connection,
            source,
            destination_path: raw.destination_path,
        })
    }
}

/// Copy-file side effect.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileTransfer;

impl SideEffect for FileTransfer {
    const KIND: ResourceKind = ResourceKind::FileTransfer;

    fn perform_effect<C: Connector>(
        &self,
        context: &ProvisionContext<C>,
        inputs: &Inputs,
    ) -> Result<Inputs, ProvisionError> {
        let transfer = FileTransferInputs::from_inputs(inputs)?;
        let mut reader = transfer.source.open()?;

        let session = context.open_session(&transfer.connection)?;
        let written = with_session(session, |session| {
            session.upload(&transfer.destination_path, reader.as_mut())
        })?;

        info!(
            host = %transfer.connection.host,
            destination = %transfer.destination_path,
            bytes = written,
            "transferred file"
        );
        Ok(inputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;
    use crate::retry::ConnectRetryPolicy;
    use crate::test_support::{ScriptedConnector, SessionEvent};

    #[fixture]
    fn connector() -> ScriptedConnector {
        ScriptedConnector::new()
    }

    fn context(connector: &ScriptedConnector) -> ProvisionContext<ScriptedConnector> {
        ProvisionContext::new(connector.clone())
            .with_retry_policy(ConnectRetryPolicy::default().with_delay(Duration::ZERO))
    }

    fn connection() -> ConnectionSpec {
        ConnectionSpec::new("vm.example")
            .with_username("controller")
            .with_password("secret")
    }

    #[rstest]
    fn local_file_is_copied_byte_for_byte(connector: ScriptedConnector) {
        let mut local = tempfile::NamedTempFile::new().expect("create temp file");
        let payload: Vec<u8> = (0..=255_u8).cycle().take(100_000).collect();
        local.write_all(&payload).expect("write payload");
        let path = Utf8PathBuf::from_path_buf(local.path().to_path_buf()).expect("utf8 path");

        let inputs = FileTransferInputs::new(
            connection(),
            TransferSource::LocalFile(path),
            "/tmp/controller-installer.tar.gz",
        )
        .to_inputs()
        .expect("render inputs");

        let outputs = FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect("transfer should succeed");

        assert_eq!(outputs, inputs);
        assert_eq!(
            connector.remote_file("/tmp/controller-installer.tar.gz"),
            Some(payload)
        );
    }

    #[rstest]
    fn inline_content_is_copied_as_utf8(connector: ScriptedConnector) {
        let content = "export CTR_FQDN=\"ctl.example\"\nexport NAME=\"Zoë\"\n";
        let inputs = FileTransferInputs::new(
            connection(),
            TransferSource::Inline(content.to_owned()),
            "/tmp/secrets.env",
        )
        .to_inputs()
        .expect("render inputs");

        FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect("transfer should succeed");

        assert_eq!(
            connector.remote_file("/tmp/secrets.env"),
            Some(content.as_bytes().to_vec())
        );
        assert_eq!(
            connector.events(),
            vec![
                SessionEvent::Connected,
                SessionEvent::Uploaded(String::from("/tmp/secrets.env")),
                SessionEvent::Closed,
            ]
        );
    }

    #[rstest]
    #[case(json!({ "local_file_path": "/etc/hosts", "inline_content": "x" }))]
    #[case(json!({}))]
    fn contradictory_sources_fail_before_connecting(
        connector: ScriptedConnector,
        #[case] sources: Value,
    ) {
        let mut inputs = Inputs::new();
        inputs.insert(
            String::from("connection"),
            serde_json::to_value(connection()).expect("serialise connection"),
        );
        inputs.insert(String::from("destination_path"), json!("/tmp/out"));
        if let Value::Object(extra) = sources {
            inputs.extend(extra);
        }

        let err = FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect_err("source must be exactly one");

        assert!(matches!(err, ProvisionError::Configuration(_)), "{err}");
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[rstest]
    fn relative_destination_is_rejected(connector: ScriptedConnector) {
        let inputs = FileTransferInputs::new(
            connection(),
            TransferSource::Inline(String::from("x")),
            "tmp/out",
        )
        .to_inputs()
        .expect("render inputs");

        let err = FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect_err("relative destination");

        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert_eq!(connector.connect_attempts(), 0);
    }

    /// Test binaries run from the package root.
    #[rstest]
    #[case::bare_name("Cargo.toml")]
    #[case::nested("src/lib.rs")]
    fn relative_local_file_resolves_against_working_directory(
        connector: ScriptedConnector,
        #[case] relative: &str,
    ) {
        let expected = std::fs::read(relative).expect("read fixture from package root");
        let inputs = FileTransferInputs::new(
            connection(),
            TransferSource::LocalFile(Utf8PathBuf::from(relative)),
            "/tmp/copied",
        )
        .to_inputs()
        .expect("render inputs");

        FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect("transfer should succeed");

        assert_eq!(connector.remote_file("/tmp/copied"), Some(expected));
    }

    #[rstest]
    fn missing_local_file_is_an_effect_error(connector: ScriptedConnector) {
        let inputs = FileTransferInputs::new(
            connection(),
            TransferSource::LocalFile(Utf8PathBuf::from("/definitely/not/here.tar.gz")),
            "/tmp/out",
        )
        .to_inputs()
        .expect("render inputs");

        let err = FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect_err("local file is missing");

        assert!(matches!(err, ProvisionError::RemoteEffect(_)), "{err}");
    }

    #[rstest]
    fn upload_failure_still_closes_session(connector: ScriptedConnector) {
        connector.fail_uploads("sftp subsystem unavailable");
        let inputs = FileTransferInputs::new(
            connection(),
            TransferSource::Inline(String::from("x")),
            "/tmp/out",
        )
        .to_inputs()
        .expect("render inputs");

        let err = FileTransfer
            .perform_effect(&context(&connector), &inputs)
            .expect_err("upload fails");

        assert!(matches!(err, ProvisionError::Transport(_)));
        assert_eq!(connector.events().last(), Some(&SessionEvent::Closed));
    }
}
