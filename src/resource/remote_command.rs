//! Runs an ordered list of shell commands on the remote host.
//!
//! Each command runs in its own exec channel and both output streams are
//! drained before the next command is dispatched. Exit statuses are
//! reported as data. Only channel-level failures abort the sequence.
//!
//! Cleanup commands run after the main sequence, including after an
//! aborting failure. Their failures are logged and ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ConnectionSpec;
use crate::error::ProvisionError;
use crate::session::{CommandOutput, Connector, RemoteSession, with_session};

use super::{Inputs, ProvisionContext, ResourceKind, SideEffect, parse_inputs};

const RESULTS_KEY: &str = "results";
const CLEANUP_RESULTS_KEY: &str = "cleanup_results";

/// Typed view of remote-command inputs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommandInputs {
    /// Host to run on.
    pub connection: ConnectionSpec,
    /// Commands to run, in order.
    pub commands: Vec<String>,
    /// Best-effort commands run after `commands`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_commands: Vec<String>,
}

impl RemoteCommandInputs {
    /// Bundles the typed inputs with no cleanup commands.
    pub fn new(connection: ConnectionSpec, commands: Vec<String>) -> Self {
        Self {
            connection,
            commands,
            cleanup_commands: Vec::new(),
        }
    }

    /// Adds best-effort cleanup commands.
    #[must_use]
    pub fn with_cleanup(mut self, cleanup_commands: Vec<String>) -> Self {
        self.cleanup_commands = cleanup_commands;
        self
    }

    /// Renders the inputs as the mapping stored in the graph and state.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when serialisation fails.
    pub fn to_inputs(&self) -> Result<Inputs, ProvisionError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(inputs)) => Ok(inputs),
            Ok(other) => Err(ProvisionError::Configuration(format!(
                "remote command inputs rendered as {other}"
            ))),
            Err(err) => Err(ProvisionError::Configuration(format!(
                "unserialisable remote command inputs: {err}"
            ))),
        }
    }

    /// Parses and validates a raw input mapping.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when fields are missing or
    /// the connection is invalid.
    pub fn from_inputs(inputs: &Inputs) -> Result<Self, ProvisionError> {
        let parsed: Self = parse_inputs(RemoteCommand::KIND, inputs)?;
        parsed.connection.validate()?;
        Ok(parsed)
    }
}

/// Remote-execution side effect.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteCommand;

impl SideEffect for RemoteCommand {
    const KIND: ResourceKind = ResourceKind::RemoteCommand;

    fn perform_effect<C: Connector>(
        &self,
        context: &ProvisionContext<C>,
        inputs: &Inputs,
    ) -> Result<Inputs, ProvisionError> {
        let spec = RemoteCommandInputs::from_inputs(inputs)?;
        let session = context.open_session(&spec.connection)?;

        let (results, cleanup_results) = with_session(session, |session| {
            let outcome = run_sequence(session, &spec.commands);
            let cleanup_results = run_cleanup(session, &spec.cleanup_commands);
            outcome.map(|results| (results, cleanup_results))
        })?;

        info!(
            host = %spec.connection.host,
            commands = results.len(),
            "remote commands completed"
        );

        let mut outputs = inputs.clone();
        outputs.insert(RESULTS_KEY.to_owned(), to_value(&results)?);
        if !cleanup_results.is_empty() {
            outputs.insert(CLEANUP_RESULTS_KEY.to_owned(), to_value(&cleanup_results)?);
        }
        Ok(outputs)
    }
}

fn run_sequence<S: RemoteSession>(
    session: &mut S,
    commands: &[String],
) -> Result<Vec<CommandOutput>, ProvisionError> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        debug!(%command, "dispatching remote command");
        let output = session.exec(command)?;
        if !output.is_success() {
            info!(%command, exit_status = ?output.exit_status, "remote command exited non-zero");
        }
        results.push(output);
    }
    Ok(results)
}

fn run_cleanup<S: RemoteSession>(session: &mut S, commands: &[String]) -> Vec<CommandOutput> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        match session.exec(command) {
            Ok(output) => {
                if !output.is_success() {
                    warn!(
                        %command,
                        exit_status = ?output.exit_status,
                        stderr = %output.stderr.trim(),
                        "cleanup command failed; ignoring"
                    );
                }
                results.push(output);
            }
            Err(err) => warn!(%command, error = %err, "cleanup command not run; ignoring"),
        }
    }
    results
}

fn to_value(results: &[CommandOutput]) -> Result<Value, ProvisionError> {
    serde_json::to_value(results)
        .map_err(|err| ProvisionError::RemoteEffect(format!("unserialisable results: {err}")))
}

#[cfg(test)]
mod tests {
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

    fn inputs(commands: &[&str], cleanup: &[&str]) -> Inputs {
        RemoteCommandInputs::new(
            ConnectionSpec::new("vm.example")
                .with_username("controller")
                .with_password("secret"),
            commands.iter().map(|c| (*c).to_owned()).collect(),
        )
        .with_cleanup(cleanup.iter().map(|c| (*c).to_owned()).collect())
        .to_inputs()
        .expect("render inputs")
    }

    fn results(outputs: &Inputs, key: &str) -> Vec<CommandOutput> {
        serde_json::from_value(outputs.get(key).cloned().expect("results present"))
            .expect("results deserialise")
    }

    #[rstest]
    fn results_follow_command_order(connector: ScriptedConnector) {
        connector.push_output(Some(0), "one\n", "");
        connector.push_output(Some(0), "two\n", "warn\n");
        connector.push_output(Some(0), "three\n", "");

        let outputs = RemoteCommand
            .perform_effect(&context(&connector), &inputs(&["c1", "c2", "c3"], &[]))
            .expect("commands should run");

        let collected = results(&outputs, "results");
        let stdout: Vec<&str> = collected.iter().map(|r| r.stdout.as_str()).collect();
        assert_eq!(stdout, vec!["one\n", "two\n", "three\n"]);
        assert_eq!(collected.get(1).map(|r| r.stderr.as_str()), Some("warn\n"));
        assert_eq!(outputs.get("commands"), Some(&json!(["c1", "c2", "c3"])));
        assert!(!outputs.contains_key("cleanup_results"));
    }

    #[rstest]
    fn each_command_is_drained_before_the_next_is_dispatched(connector: ScriptedConnector) {
        RemoteCommand
            .perform_effect(&context(&connector), &inputs(&["c1", "c2"], &[]))
            .expect("commands should run");

        assert_eq!(
            connector.events(),
            vec![
                SessionEvent::Connected,
                SessionEvent::Dispatched(String::from("c1")),
                SessionEvent::Drained(String::from("c1")),
                SessionEvent::Dispatched(String::from("c2")),
                SessionEvent::Drained(String::from("c2")),
                SessionEvent::Closed,
            ]
        );
    }

    #[rstest]
    fn non_zero_exit_is_captured_not_raised(connector: ScriptedConnector) {
        connector.push_output(Some(2), "", "no such file\n");
        connector.push_output(Some(0), "after\n", "");

        let outputs = RemoteCommand
            .perform_effect(&context(&connector), &inputs(&["false", "echo after"], &[]))
            .expect("exit codes are data");

        let collected = results(&outputs, "results");
        assert_eq!(collected.len(), 2);
        assert_eq!(collected.first().and_then(|r| r.exit_status), Some(2));
        assert_eq!(
            collected.first().map(|r| r.stderr.as_str()),
            Some("no such file\n")
        );
    }

    #[rstest]
    fn dispatch_failure_aborts_and_still_runs_cleanup(connector: ScriptedConnector) {
        connector.push_output(Some(0), "", "");
        connector.push_exec_failure("channel closed by peer");

        let err = RemoteCommand
            .perform_effect(
                &context(&connector),
                &inputs(&["c1", "c2", "c3"], &["rm -f /tmp/secrets.env"]),
            )
            .expect_err("dispatch failure aborts");

        assert_eq!(
            err,
            ProvisionError::Transport(String::from("channel closed by peer"))
        );
        assert_eq!(
            connector.dispatched(),
            vec![
                String::from("c1"),
                String::from("c2"),
                String::from("rm -f /tmp/secrets.env"),
            ]
        );
        assert_eq!(connector.events().last(), Some(&SessionEvent::Closed));
    }

    #[rstest]
    fn cleanup_failures_are_ignored(connector: ScriptedConnector) {
        connector.push_output(Some(0), "installed\n", "");
        connector.push_output(Some(1), "", "rm: cannot remove\n");

        let outputs = RemoteCommand
            .perform_effect(
                &context(&connector),
                &inputs(&["bash /tmp/install.sh"], &["rm -f /tmp/secrets.env"]),
            )
            .expect("cleanup failure is not escalated");

        assert_eq!(results(&outputs, "results").len(), 1);
        let cleanup = results(&outputs, "cleanup_results");
        assert_eq!(cleanup.first().and_then(|r| r.exit_status), Some(1));
    }

    #[rstest]
    fn cleanup_dispatch_error_is_ignored(connector: ScriptedConnector) {
        connector.push_output(Some(0), "", "");
        connector.push_exec_failure("channel refused");

        let outputs = RemoteCommand
            .perform_effect(&context(&connector), &inputs(&["c1"], &["cleanup"]))
            .expect("cleanup dispatch error is not escalated");

        assert_eq!(results(&outputs, "results").len(), 1);
        assert!(!outputs.contains_key("cleanup_results"));
    }

    #[rstest]
    fn missing_commands_key_is_a_configuration_error(connector: ScriptedConnector) {
        let mut raw = inputs(&["c1"], &[]);
        raw.remove("commands");

        let err = RemoteCommand
            .perform_effect(&context(&connector), &raw)
            .expect_err("commands are required");

        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert_eq!(connector.connect_attempts(), 0);
    }
}
