//! Unit tests for preview and apply.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::connection::ConnectionSpec;
use crate::resource::{FileTransferInputs, Inputs, RemoteCommandInputs, TransferSource};
use crate::retry::{AttemptError, ConnectRetryPolicy};
use crate::test_support::{ScriptedConnector, ScriptedSession};

#[fixture]
fn connector() -> ScriptedConnector {
    ScriptedConnector::new()
}

fn engine(connector: &ScriptedConnector) -> Engine<ScriptedConnector> {
    Engine::new(
        ProvisionContext::new(connector.clone())
            .with_retry_policy(ConnectRetryPolicy::default().with_delay(Duration::ZERO)),
    )
}

fn connection() -> ConnectionSpec {
    ConnectionSpec::new("vm.example")
        .with_username("controller")
        .with_password("secret")
}

fn command_inputs(commands: &[&str]) -> Inputs {
    RemoteCommandInputs::new(
        connection(),
        commands.iter().map(|c| (*c).to_owned()).collect(),
    )
    .to_inputs()
    .unwrap_or_else(|err| panic!("render inputs: {err}"))
}

fn inline_copy(content: &str, destination: &str) -> Inputs {
    FileTransferInputs::new(
        connection(),
        TransferSource::Inline(content.to_owned()),
        destination,
    )
    .to_inputs()
    .unwrap_or_else(|err| panic!("render inputs: {err}"))
}

fn missing_local_copy(destination: &str) -> Inputs {
    FileTransferInputs::new(
        connection(),
        TransferSource::LocalFile("/definitely/not/here.tar.gz".into()),
        destination,
    )
    .to_inputs()
    .unwrap_or_else(|err| panic!("render inputs: {err}"))
}

fn build(nodes: Vec<Node>) -> Graph {
    let mut graph = Graph::new();
    for node in nodes {
        graph
            .add(node)
            .unwrap_or_else(|err| panic!("add node: {err}"));
    }
    graph
}

fn installer_like(archive: Inputs) -> Graph {
    build(vec![
        Node::new("copy-archive", ResourceKind::FileTransfer, archive),
        Node::new(
            "copy-script",
            ResourceKind::FileTransfer,
            inline_copy("#!/bin/bash\n", "/tmp/install.sh"),
        ),
        Node::new(
            "run-installer",
            ResourceKind::RemoteCommand,
            command_inputs(&["bash /tmp/install.sh"]),
        )
        .with_dependencies(["copy-archive", "copy-script"]),
    ])
}

#[rstest]
fn preview_on_empty_state_creates_everything() {
    let graph = installer_like(inline_copy("archive", "/tmp/a.tar.gz"));

    let plan = preview(&graph, &State::default()).unwrap_or_else(|err| panic!("plan: {err}"));

    let actions: Vec<(&str, &PlannedAction)> = plan
        .iter()
        .map(|entry| (entry.name.as_str(), &entry.action))
        .collect();
    assert_eq!(
        actions,
        vec![
            ("copy-archive", &PlannedAction::Create),
            ("copy-script", &PlannedAction::Create),
            ("run-installer", &PlannedAction::Create),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn apply_creates_nodes_and_records_state(connector: ScriptedConnector) {
    let graph = installer_like(inline_copy("archive", "/tmp/a.tar.gz"));
    let mut state = State::default();

    let report = engine(&connector)
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("apply: {err}"));

    assert!(!report.has_failures());
    assert_eq!(report.nodes.len(), 3);
    assert!(matches!(
        report.outcome("run-installer"),
        Some(NodeOutcome::Created { .. })
    ));
    assert_eq!(state.resources.len(), 3);
    assert_eq!(connector.remote_file("/tmp/a.tar.gz"), Some(b"archive".to_vec()));
    assert_eq!(
        connector.dispatched(),
        vec![String::from("bash /tmp/install.sh")]
    );
    let recorded = state
        .get("run-installer")
        .unwrap_or_else(|| panic!("run-installer recorded"));
    assert!(recorded.outputs.contains_key("results"));
}

#[rstest]
#[tokio::test]
async fn second_apply_with_same_inputs_runs_nothing(connector: ScriptedConnector) {
    let graph = installer_like(inline_copy("archive", "/tmp/a.tar.gz"));
    let mut state = State::default();
    let engine = engine(&connector);

    engine
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("first apply: {err}"));
    let attempts = connector.connect_attempts();
    let report = engine
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("second apply: {err}"));

    assert!(
        report
            .nodes
            .iter()
            .all(|node| node.outcome == NodeOutcome::Unchanged)
    );
    assert_eq!(connector.connect_attempts(), attempts);
}

#[rstest]
#[tokio::test]
async fn drifted_inputs_replace_the_record(connector: ScriptedConnector) {
    let engine = engine(&connector);
    let mut state = State::default();
    engine
        .apply(
            &installer_like(inline_copy("v1", "/tmp/a.tar.gz")),
            &mut state,
        )
        .await
        .unwrap_or_else(|err| panic!("first apply: {err}"));
    let first_id = state
        .get("copy-archive")
        .map(|record| record.id.clone())
        .unwrap_or_else(|| panic!("copy-archive recorded"));

    let updated = installer_like(inline_copy("v2", "/tmp/a.tar.gz"));
    let plan = preview(&updated, &state).unwrap_or_else(|err| panic!("plan: {err}"));
    assert_eq!(
        plan.first().map(|entry| &entry.action),
        Some(&PlannedAction::Replace {
            changed_keys: BTreeSet::from([String::from("inline_content")])
        })
    );

    let report = engine
        .apply(&updated, &mut state)
        .await
        .unwrap_or_else(|err| panic!("second apply: {err}"));

    match report.outcome("copy-archive") {
        Some(NodeOutcome::Replaced { id, previous_id }) => {
            assert_eq!(previous_id, &first_id);
            assert_ne!(id, &first_id);
        }
        other => panic!("expected replacement, got {other:?}"),
    }
    assert_eq!(report.outcome("copy-script"), Some(&NodeOutcome::Unchanged));
    assert_eq!(connector.remote_file("/tmp/a.tar.gz"), Some(b"v2".to_vec()));
}

#[rstest]
#[tokio::test]
async fn failed_dependency_skips_dependents_only(connector: ScriptedConnector) {
    let graph = installer_like(missing_local_copy("/tmp/a.tar.gz"));
    let mut state = State::default();

    let report = engine(&connector)
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("apply: {err}"));

    assert!(report.has_failures());
    assert!(matches!(
        report.outcome("copy-archive"),
        Some(NodeOutcome::Failed(ProvisionError::RemoteEffect(_)))
    ));
    assert!(matches!(
        report.outcome("copy-script"),
        Some(NodeOutcome::Created { .. })
    ));
    assert_eq!(
        report.outcome("run-installer"),
        Some(&NodeOutcome::Skipped {
            blocked_by: String::from("copy-archive")
        })
    );
    assert!(connector.dispatched().is_empty());
    assert!(state.get("copy-archive").is_none());
    assert!(state.get("run-installer").is_none());
    assert!(state.get("copy-script").is_some());
}

#[rstest]
#[tokio::test]
async fn skips_propagate_transitively(connector: ScriptedConnector) {
    let graph = build(vec![
        Node::new("a", ResourceKind::FileTransfer, missing_local_copy("/tmp/a")),
        Node::new("b", ResourceKind::RemoteCommand, command_inputs(&["b"])).with_dependencies(["a"]),
        Node::new("c", ResourceKind::RemoteCommand, command_inputs(&["c"])).with_dependencies(["b"]),
    ]);
    let mut state = State::default();

    let report = engine(&connector)
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("apply: {err}"));

    assert_eq!(
        report.outcome("c"),
        Some(&NodeOutcome::Skipped {
            blocked_by: String::from("b")
        })
    );
    assert_eq!(connector.connect_attempts(), 0);
}

#[rstest]
#[tokio::test]
async fn failures_are_not_retried(connector: ScriptedConnector) {
    connector.push_fatal_failure("permission denied");
    let graph = build(vec![Node::new(
        "only",
        ResourceKind::RemoteCommand,
        command_inputs(&["true"]),
    )]);
    let mut state = State::default();

    let report = engine(&connector)
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("apply: {err}"));

    assert_eq!(
        report.outcome("only"),
        Some(&NodeOutcome::Failed(ProvisionError::Transport(String::from(
            "permission denied"
        ))))
    );
    assert_eq!(connector.connect_attempts(), 1);
}

#[rstest]
#[tokio::test]
async fn graph_errors_stop_apply_before_any_effect(connector: ScriptedConnector) {
    let graph = build(vec![
        Node::new("run", ResourceKind::RemoteCommand, command_inputs(&["x"]))
            .with_dependencies(["missing"]),
    ]);
    let mut state = State::default();

    let err = engine(&connector)
        .apply(&graph, &mut state)
        .await
        .expect_err("unknown dependency");

    assert!(matches!(err, GraphError::UnknownDependency { .. }));
    assert_eq!(connector.connect_attempts(), 0);
}

#[rstest]
#[case(PlannedAction::Create, "create")]
#[case(PlannedAction::Unchanged, "unchanged")]
#[case(
    PlannedAction::Replace { changed_keys: BTreeSet::from([String::from("a"), String::from("b")]) },
    "replace (changed: a, b)"
)]
fn planned_actions_render_for_operators(#[case] action: PlannedAction, #[case] expected: &str) {
    assert_eq!(action.to_string(), expected);
}

/// Holds every connection until `expected` effects have arrived, so the
/// effects only complete promptly when they run at the same time.
#[derive(Clone, Debug)]
struct RendezvousConnector {
    inner: ScriptedConnector,
    expected: usize,
    arrivals: Arc<(Mutex<usize>, Condvar)>,
    timeouts: Arc<Mutex<usize>>,
}

impl RendezvousConnector {
    fn new(expected: usize) -> Self {
        Self {
            inner: ScriptedConnector::new(),
            expected,
            arrivals: Arc::new((Mutex::new(0), Condvar::new())),
            timeouts: Arc::new(Mutex::new(0)),
        }
    }

    fn timeouts(&self) -> usize {
        *self.timeouts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for RendezvousConnector {
    type Session = ScriptedSession;

    fn connect(&self, spec: &ConnectionSpec) -> Result<ScriptedSession, AttemptError> {
        let (lock, ready) = &*self.arrivals;
        let mut arrived = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *arrived += 1;
        ready.notify_all();
        let (arrived, wait) = ready
            .wait_timeout_while(arrived, Duration::from_secs(5), |count| {
                *count < self.expected
            })
            .unwrap_or_else(PoisonError::into_inner);
        drop(arrived);
        if wait.timed_out() {
            *self.timeouts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }
        self.inner.connect(spec)
    }
}

#[tokio::test]
async fn independent_nodes_in_a_wave_run_concurrently() {
    let connector = RendezvousConnector::new(3);
    let graph = build(vec![
        Node::new("copy-a", ResourceKind::FileTransfer, inline_copy("a", "/tmp/a")),
        Node::new("copy-b", ResourceKind::FileTransfer, inline_copy("b", "/tmp/b")),
        Node::new("copy-c", ResourceKind::FileTransfer, inline_copy("c", "/tmp/c")),
    ]);
    let engine = Engine::new(
        ProvisionContext::new(connector.clone())
            .with_retry_policy(ConnectRetryPolicy::default().with_delay(Duration::ZERO)),
    );
    let mut state = State::default();

    let report = engine
        .apply(&graph, &mut state)
        .await
        .unwrap_or_else(|err| panic!("apply: {err}"));

    assert!(!report.has_failures(), "{report:?}");
    assert_eq!(connector.timeouts(), 0, "effects ran one after another");
    assert_eq!(connector.inner.remote_file("/tmp/c"), Some(b"c".to_vec()));
}
