//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedConnector`] stands in for a remote host: connection attempts
//! follow a pre-seeded script, uploads land in an in-memory filesystem, and
//! commands return queued outputs. Every interaction is recorded as a
//! [`SessionEvent`] so tests can assert on ordering.

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;

use crate::connection::ConnectionSpec;
use crate::error::{ProvisionError, TransientClass};
use crate::retry::AttemptError;
use crate::session::{CommandOutput, Connector, RemoteSession, copy_stream};

/// Interaction recorded by [`ScriptedConnector`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// A session was handed out.
    Connected,
    /// A file-transfer sub-channel wrote `path`.
    Uploaded(String),
    /// A command was dispatched.
    Dispatched(String),
    /// A command's output streams were fully drained.
    Drained(String),
    /// The session was closed.
    Closed,
}

#[derive(Clone, Debug)]
enum ExecResponse {
    Output(CommandOutput),
    Fail(String),
}

#[derive(Debug, Default)]
struct RemoteState {
    connect_script: VecDeque<AttemptError>,
    connect_attempts: u32,
    files: BTreeMap<String, Vec<u8>>,
    exec_responses: VecDeque<ExecResponse>,
    events: Vec<SessionEvent>,
    upload_failure: Option<String>,
    close_failure: Option<String>,
}

/// In-memory remote host driven by scripted responses.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<RemoteState>>,
}

impl ScriptedConnector {
    /// Creates a connector whose attempts succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `count` transient failures of `class` ahead of later attempts.
    pub fn push_transient_failures(&self, class: TransientClass, count: u32) {
        let mut state = self.state();
        for _ in 0..count {
            state.connect_script.push_back(AttemptError::Transient {
                class,
                message: format!("scripted {class}"),
            });
        }
    }

    /// Queues a fatal connection failure.
    pub fn push_fatal_failure(&self, message: &str) {
        self.state()
            .connect_script
            .push_back(AttemptError::Fatal(ProvisionError::Transport(
                message.to_owned(),
            )));
    }

    /// Queues the output of the next dispatched command.
    pub fn push_output(
        &self,
        exit_status: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.state()
            .exec_responses
            .push_back(ExecResponse::Output(CommandOutput {
                stdout: stdout.into(),
                stderr: stderr.into(),
                exit_status,
            }));
    }

    /// Makes the next dispatched command fail at the channel level.
    pub fn push_exec_failure(&self, message: &str) {
        self.state()
            .exec_responses
            .push_back(ExecResponse::Fail(message.to_owned()));
    }

    /// Makes every upload fail with `message`.
    pub fn fail_uploads(&self, message: &str) {
        self.state().upload_failure = Some(message.to_owned());
    }

    /// Makes every session close fail with `message`.
    pub fn fail_close(&self, message: &str) {
        self.state().close_failure = Some(message.to_owned());
    }

    /// Number of connection attempts made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Contents of a remote file, if it was written.
    #[must_use]
    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Snapshot of recorded interactions.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.state().events.clone()
    }

    /// Commands dispatched so far, in order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<String> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Dispatched(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn connect(&self, _spec: &ConnectionSpec) -> Result<ScriptedSession, AttemptError> {
        let mut state = self.state();
        state.connect_attempts = state.connect_attempts.saturating_add(1);
        if let Some(failure) = state.connect_script.pop_front() {
            return Err(failure);
        }
        state.events.push(SessionEvent::Connected);
        Ok(ScriptedSession {
            state: Arc::clone(&self.state),
        })
    }
}

/// Session handed out by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedSession {
    state: Arc<Mutex<RemoteState>>,
}

impl ScriptedSession {
    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteSession for ScriptedSession {
    fn upload(
        &mut self,
        destination: &Utf8Path,
        source: &mut dyn Read,
    ) -> Result<u64, ProvisionError> {
        if let Some(message) = self.state().upload_failure.clone() {
            return Err(ProvisionError::Transport(message));
        }
        let mut buffer = Vec::new();
        let written = copy_stream(source, &mut buffer)?;
        let mut state = self.state();
        state.files.insert(destination.to_string(), buffer);
        state
            .events
            .push(SessionEvent::Uploaded(destination.to_string()));
        Ok(written)
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, ProvisionError> {
        let mut state = self.state();
        state
            .events
            .push(SessionEvent::Dispatched(command.to_owned()));
        match state.exec_responses.pop_front() {
            Some(ExecResponse::Fail(message)) => Err(ProvisionError::Transport(message)),
            Some(ExecResponse::Output(output)) => {
                state.events.push(SessionEvent::Drained(command.to_owned()));
                Ok(output)
            }
            None => {
                state.events.push(SessionEvent::Drained(command.to_owned()));
                Ok(CommandOutput {
                    exit_status: Some(0),
                    ..CommandOutput::default()
                })
            }
        }
    }

    fn close(self) -> Result<(), ProvisionError> {
        let mut state = self.state();
        state.events.push(SessionEvent::Closed);
        state
            .close_failure
            .clone()
            .map_or(Ok(()), |message| Err(ProvisionError::Transport(message)))
    }
}
