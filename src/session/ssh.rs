//! `libssh2`-backed connector.
//!
//! Host keys are accepted without verification (trust on first use). The
//! target is a freshly provisioned VM whose key cannot be known in advance;
//! the fingerprint is logged so operators can compare it out of band.

use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use ssh2::{HashType, Session};
use tracing::debug;

use crate::connection::ConnectionSpec;
use crate::error::{ProvisionError, TransientClass};
use crate::retry::AttemptError;

use super::{CommandOutput, Connector, RemoteSession, copy_stream, drain_streams};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PASSWORD_METHOD: &str = "password";
const PUBLICKEY_METHOD: &str = "publickey";

/// Connects with `libssh2` over a plain TCP socket.
#[derive(Clone, Copy, Debug)]
pub struct Ssh2Connector {
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Default for Ssh2Connector {
    fn default() -> Self {
        Self::new()
    }
}

impl Ssh2Connector {
    /// Creates a connector with default socket and handshake timeouts.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Overrides the per-address TCP connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn open_socket(&self, spec: &ConnectionSpec) -> Result<TcpStream, AttemptError> {
        let addresses: Vec<SocketAddr> = (spec.host.as_str(), spec.port)
            .to_socket_addrs()
            .map_err(|err| fatal(&format!("failed to resolve {}", spec.host), err))?
            .collect();

        let mut last_error = None;
        for address in &addresses {
            match TcpStream::connect_timeout(address, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_error = Some(format!("{address}: {err}")),
            }
        }

        Err(AttemptError::Transient {
            class: TransientClass::Unreachable,
            message: last_error
                .unwrap_or_else(|| format!("{} resolved to no addresses", spec.host)),
        })
    }

    fn authenticate(
        session: &Session,
        spec: &ConnectionSpec,
        username: &str,
    ) -> Result<(), AttemptError> {
        let method = if spec.private_key.is_some() {
            PUBLICKEY_METHOD
        } else if spec.password.is_some() {
            PASSWORD_METHOD
        } else {
            return Err(AttemptError::Fatal(ProvisionError::configuration(
                "connection has neither a password nor a private key",
            )));
        };

        let offered = session
            .auth_methods(username)
            .map_err(|err| fatal("failed to query authentication methods", err))?
            .to_owned();
        if session.authenticated() {
            return Ok(());
        }
        if !offered.split(',').any(|candidate| candidate == method) {
            return Err(AttemptError::Transient {
                class: TransientClass::AuthMethodUnavailable,
                message: format!("server offers [{offered}], need {method}"),
            });
        }

        let result = match (&spec.private_key, &spec.password) {
            (Some(key), _) => session.userauth_pubkey_memory(
                username,
                None,
                key.expose(),
                spec.private_key_passphrase.as_ref().map(|p| p.expose()),
            ),
            (None, Some(password)) => session.userauth_password(username, password.expose()),
            (None, None) => Ok(()),
        };
        result.map_err(|err| fatal(&format!("authentication as {username} rejected"), err))?;

        if session.authenticated() {
            Ok(())
        } else {
            Err(AttemptError::Fatal(ProvisionError::Transport(format!(
                "authentication as {username} did not complete"
            ))))
        }
    }
}

impl Connector for Ssh2Connector {
    type Session = Ssh2Session;

    fn connect(&self, spec: &ConnectionSpec) -> Result<Ssh2Session, AttemptError> {
        let username = resolve_username(spec)?;
        let stream = self.open_socket(spec)?;

        let mut session = Session::new().map_err(|err| fatal("failed to create session", err))?;
        session.set_tcp_stream(stream);
        session.set_timeout(timeout_millis(self.handshake_timeout));
        session
            .handshake()
            .map_err(|err| fatal("ssh handshake failed", err))?;
        log_host_key(&session, spec);

        Self::authenticate(&session, spec, &username)?;
        // Remote commands may legitimately run for a long time.
        session.set_timeout(0);
        Ok(Ssh2Session { session })
    }
}

/// Session produced by [`Ssh2Connector`].
pub struct Ssh2Session {
    session: Session,
}

impl std::fmt::Debug for Ssh2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh2Session")
            .field("authenticated", &self.session.authenticated())
            .finish_non_exhaustive()
    }
}

impl RemoteSession for Ssh2Session {
    fn upload(
        &mut self,
        destination: &Utf8Path,
        source: &mut dyn Read,
    ) -> Result<u64, ProvisionError> {
        let sftp = self
            .session
            .sftp()
            .map_err(|err| ProvisionError::transport("failed to open sftp channel", err))?;
        let mut remote = sftp
            .create(destination.as_std_path())
            .map_err(|err| {
                ProvisionError::transport(&format!("failed to create {destination}"), err)
            })?;
        let written = copy_stream(source, &mut remote)?;
        remote
            .close()
            .map_err(|err| ProvisionError::transport(&format!("failed to close {destination}"), err))?;
        drop(remote);
        drop(sftp);
        Ok(written)
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, ProvisionError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| ProvisionError::transport("failed to open exec channel", err))?;
        channel
            .exec(command)
            .map_err(|err| ProvisionError::transport("failed to dispatch command", err))?;

        self.session.set_blocking(false);
        let drained = drain_streams(&mut channel.stream(0), &mut channel.stderr(), || {
            thread::sleep(DRAIN_POLL_INTERVAL);
        });
        self.session.set_blocking(true);
        let (stdout, stderr) = drained
            .map_err(|err| ProvisionError::transport("failed to read command output", err))?;
        channel
            .wait_close()
            .map_err(|err| ProvisionError::transport("failed to close exec channel", err))?;
        let exit_status = channel.exit_status().ok();

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    fn close(self) -> Result<(), ProvisionError> {
        self.session
            .disconnect(None, "provisioning step complete", None)
            .map_err(|err| ProvisionError::transport("failed to disconnect", err))
    }
}

fn resolve_username(spec: &ConnectionSpec) -> Result<String, AttemptError> {
    spec.username
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| {
            AttemptError::Fatal(ProvisionError::configuration(
                "connection has no username and USER is not set",
            ))
        })
}

fn log_host_key(session: &Session, spec: &ConnectionSpec) {
    if let Some(hash) = session.host_key_hash(HashType::Sha256) {
        let fingerprint: String = hash.iter().map(|byte| format!("{byte:02x}")).collect();
        debug!(host = %spec.host, %fingerprint, "accepting host key without verification");
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn fatal(action: &str, err: impl std::fmt::Display) -> AttemptError {
    AttemptError::Fatal(ProvisionError::transport(action, err))
}
