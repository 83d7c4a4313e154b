//! Authenticated SSH sessions with bounded connection retry.
//!
//! A session is opened fresh for every side effect, owned by that single
//! invocation, and closed before the invocation returns. Connection
//! establishment is the only place where failures are retried; everything
//! after the session is open fails fast.

use std::io::{self, ErrorKind, Read, Write};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::ConnectionSpec;
use crate::error::ProvisionError;
use crate::retry::{AttemptError, ConnectRetryPolicy, retry_classified};

mod ssh;

pub use ssh::{Ssh2Connector, Ssh2Session};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Captured output of one remote command.
///
/// A non-zero `exit_status` is data, not a failure.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Everything the command wrote to standard output.
    pub stdout: String,
    /// Everything the command wrote to standard error.
    pub stderr: String,
    /// Exit status reported by the remote shell, when one was sent.
    #[serde(default)]
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }
}

/// An open, authenticated connection to a remote host.
pub trait RemoteSession {
    /// Streams `source` to `destination` over a file-transfer sub-channel,
    /// closing the sub-channel before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::RemoteEffect`] when the local source cannot
    /// be read and [`ProvisionError::Transport`] when the channel fails.
    fn upload(&mut self, destination: &Utf8Path, source: &mut dyn Read)
    -> Result<u64, ProvisionError>;

    /// Runs `command` in a fresh remote shell and drains both output streams
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Transport`] when the command cannot be
    /// dispatched or its streams cannot be read.
    fn exec(&mut self, command: &str) -> Result<CommandOutput, ProvisionError>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Transport`] when the disconnect fails.
    fn close(self) -> Result<(), ProvisionError>;
}

/// Makes a single connection attempt and classifies its failure.
pub trait Connector: Send + Sync {
    /// Session type produced on success.
    type Session: RemoteSession;

    /// Attempts to connect and authenticate once.
    ///
    /// # Errors
    ///
    /// Returns [`AttemptError::Transient`] for failures worth retrying and
    /// [`AttemptError::Fatal`] otherwise.
    fn connect(&self, spec: &ConnectionSpec) -> Result<Self::Session, AttemptError>;
}

/// Opens a session against `spec`, retrying transient failures per `policy`.
///
/// # Errors
///
/// Returns [`ProvisionError::Configuration`] for an invalid spec (before any
/// connection attempt), [`ProvisionError::Connectivity`] once a transient
/// class exhausts its budget, or the fatal error of the failing attempt.
pub fn open_session<C: Connector>(
    connector: &C,
    spec: &ConnectionSpec,
    policy: &ConnectRetryPolicy,
) -> Result<C::Session, ProvisionError> {
    spec.validate()?;
    let address = spec.address();
    let session = retry_classified(&spec.host, policy, |attempt| {
        debug!(%address, attempt, "connecting");
        connector.connect(spec)
    })?;
    debug!(%address, "session established");
    Ok(session)
}

/// Runs `effect` against `session` and closes the session afterwards on
/// every path.
///
/// A close failure is logged and dropped; it never replaces the outcome of
/// `effect`.
///
/// # Errors
///
/// Returns the error produced by `effect`.
pub fn with_session<S, T>(
    mut session: S,
    effect: impl FnOnce(&mut S) -> Result<T, ProvisionError>,
) -> Result<T, ProvisionError>
where
    S: RemoteSession,
{
    let outcome = effect(&mut session);
    if let Err(err) = session.close() {
        warn!(error = %err, "failed to close session cleanly");
    }
    outcome
}

/// Copies `source` into `sink`, separating local read failures from remote
/// write failures.
///
/// # Errors
///
/// Returns [`ProvisionError::RemoteEffect`] for read failures and
/// [`ProvisionError::Transport`] for write failures.
pub fn copy_stream(source: &mut dyn Read, sink: &mut dyn Write) -> Result<u64, ProvisionError> {
    let mut buffer = vec![0_u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(ProvisionError::RemoteEffect(format!(
                    "failed to read transfer source: {err}"
                )));
            }
        };
        let chunk = buffer.get(..read).unwrap_or_default();
        sink.write_all(chunk)
            .map_err(|err| ProvisionError::transport("failed to write remote file", err))?;
        total = total.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
    }
    sink.flush()
        .map_err(|err| ProvisionError::transport("failed to flush remote file", err))?;
    Ok(total)
}

struct Drain<'a> {
    source: &'a mut dyn Read,
    buffer: Vec<u8>,
    done: bool,
}

impl<'a> Drain<'a> {
    fn new(source: &'a mut dyn Read) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Reads one chunk; returns whether the stream moved (bytes or end of
    /// stream).
    fn pump(&mut self, chunk: &mut [u8]) -> io::Result<bool> {
        if self.done {
            return Ok(false);
        }
        match self.source.read(chunk) {
            Ok(0) => {
                self.done = true;
                Ok(true)
            }
            Ok(read) => {
                self.buffer
                    .extend_from_slice(chunk.get(..read).unwrap_or_default());
                Ok(true)
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

/// Reads two non-blocking streams in turn until both reach end of stream.
///
/// The streams of one exec channel share a flow-control window, so neither
/// may be read to completion before the other. `idle` runs after every round
/// in which neither stream moved.
///
/// # Errors
///
/// Returns the first read error other than `WouldBlock` or `Interrupted`.
pub fn drain_streams(
    stdout: &mut dyn Read,
    stderr: &mut dyn Read,
    mut idle: impl FnMut(),
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut chunk = vec![0_u8; COPY_BUFFER_SIZE];
    let mut out = Drain::new(stdout);
    let mut err = Drain::new(stderr);
    while !(out.done && err.done) {
        let out_moved = out.pump(&mut chunk)?;
        let err_moved = err.pump(&mut chunk)?;
        if !out_moved && !err_moved {
            idle();
        }
    }
    Ok((out.buffer, err.buffer))
}
