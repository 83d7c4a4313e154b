//! Drives a resource graph against recorded state.
//!
//! Nodes run wave by wave. Nodes in the same wave have no ordering between
//! them and run concurrently on the blocking pool, each with its own
//! session. A node whose dependency failed or was skipped is skipped in
//! turn. Failures are recorded in the report, never retried.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::task::{JoinHandle, spawn_blocking};
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::resource::{CreateResult, ProvisionContext, ResourceKind, diff};
use crate::session::Connector;
use crate::state_store::{ResourceRecord, State};

mod graph;

pub use graph::{Graph, GraphError, Node};

/// What apply would do for one node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlannedAction {
    /// No record exists; the effect will run.
    Create,
    /// Inputs drifted; the effect will run again and replace the record.
    Replace {
        /// Keys whose values differ from the recorded inputs.
        changed_keys: BTreeSet<String>,
    },
    /// Inputs match the record; nothing runs.
    Unchanged,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Replace { changed_keys } => {
                let keys: Vec<&str> = changed_keys.iter().map(String::as_str).collect();
                write!(f, "replace (changed: {})", keys.join(", "))
            }
            Self::Unchanged => f.write_str("unchanged"),
        }
    }
}

/// Planned action for a named node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlanEntry {
    /// Node name.
    pub name: String,
    /// Node kind.
    pub kind: ResourceKind,
    /// Action apply would take.
    pub action: PlannedAction,
}

/// Result of applying one node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeOutcome {
    /// The effect ran for the first time.
    Created {
        /// New tracking id.
        id: String,
    },
    /// The effect ran again because inputs drifted.
    Replaced {
        /// New tracking id.
        id: String,
        /// Id of the record that was overwritten.
        previous_id: String,
    },
    /// Inputs matched the record; the effect did not run.
    Unchanged,
    /// The effect failed.
    Failed(ProvisionError),
    /// A dependency failed or was skipped.
    Skipped {
        /// First blocked dependency.
        blocked_by: String,
    },
}

impl NodeOutcome {
    const fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Skipped { .. })
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { id } => write!(f, "created ({id})"),
            Self::Replaced { id, previous_id } => write!(f, "replaced ({previous_id} -> {id})"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Failed(err) => write!(f, "failed: {err}"),
            Self::Skipped { blocked_by } => write!(f, "skipped (blocked by {blocked_by})"),
        }
    }
}

/// Outcome of one node in an apply run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeReport {
    /// Node name.
    pub name: String,
    /// Node kind.
    pub kind: ResourceKind,
    /// What happened.
    pub outcome: NodeOutcome,
}

/// Per-node outcomes of an apply run, in wave order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplyReport {
    /// Outcomes in wave order, insertion order within a wave.
    pub nodes: Vec<NodeReport>,
}

impl ApplyReport {
    /// Returns the outcome recorded for `name`.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.nodes
            .iter()
            .find(|report| report.name == name)
            .map(|report| &report.outcome)
    }

    /// Whether any node failed or was skipped.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.nodes
            .iter()
            .any(|report| report.outcome.blocks_dependents())
    }
}

/// Applies graphs using a shared provisioning context.
#[derive(Debug)]
pub struct Engine<C> {
    context: Arc<ProvisionContext<C>>,
}

enum Slot<'graph> {
    Settled(NodeReport),
    Running {
        node: &'graph Node,
        action: PlannedAction,
        task: JoinHandle<Result<CreateResult, ProvisionError>>,
    },
}

impl<C: Connector + 'static> Engine<C> {
    /// Creates an engine around `context`.
    #[must_use]
    pub fn new(context: ProvisionContext<C>) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Applies the graph, updating `state` with every successful create.
    ///
    /// Unchanged nodes are not re-run. A replaced node's previous effect is
    /// not undone; its record is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] when the graph cannot be ordered. Node
    /// failures are reported in the [`ApplyReport`], not as errors.
    pub async fn apply(&self, graph: &Graph, state: &mut State) -> Result<ApplyReport, GraphError> {
        let waves = graph.waves()?;
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        let mut report = ApplyReport::default();

        for wave in waves {
            let slots: Vec<Slot<'_>> = wave
                .into_iter()
                .map(|node| self.start(node, state, &blocked))
                .collect();

            for slot in slots {
                let node_report = match slot {
                    Slot::Settled(node_report) => node_report,
                    Slot::Running { node, action, task } => {
                        let result = task.await.unwrap_or_else(|err| {
                            Err(ProvisionError::RemoteEffect(format!(
                                "effect task did not complete: {err}"
                            )))
                        });
                        settle(node, &action, result, state)
                    }
                };
                if node_report.outcome.blocks_dependents() {
                    blocked.insert(node_report.name.clone());
                }
                report.nodes.push(node_report);
            }
        }
        Ok(report)
    }

    fn start<'graph>(
        &self,
        node: &'graph Node,
        state: &State,
        blocked: &BTreeSet<String>,
    ) -> Slot<'graph> {
        if let Some(dependency) = node
            .depends_on
            .iter()
            .find(|dependency| blocked.contains(dependency.as_str()))
        {
            warn!(node = %node.name, blocked_by = %dependency, "skipping node");
            return Slot::Settled(NodeReport {
                name: node.name.clone(),
                kind: node.kind,
                outcome: NodeOutcome::Skipped {
                    blocked_by: dependency.clone(),
                },
            });
        }

        let action = plan_action(node, state);
        if action == PlannedAction::Unchanged {
            info!(node = %node.name, "unchanged");
            return Slot::Settled(NodeReport {
                name: node.name.clone(),
                kind: node.kind,
                outcome: NodeOutcome::Unchanged,
            });
        }

        info!(node = %node.name, kind = %node.kind, %action, "applying node");
        let context = Arc::clone(&self.context);
        let kind = node.kind;
        let inputs = node.inputs.clone();
        let task = spawn_blocking(move || kind.create(&context, &inputs));
        Slot::Running { node, action, task }
    }
}

/// Computes the planned action for every node without side effects.
///
/// # Errors
///
/// Returns [`GraphError`] when the graph cannot be ordered.
pub fn preview(graph: &Graph, state: &State) -> Result<Vec<PlanEntry>, GraphError> {
    let waves = graph.waves()?;
    Ok(waves
        .into_iter()
        .flatten()
        .map(|node| PlanEntry {
            name: node.name.clone(),
            kind: node.kind,
            action: plan_action(node, state),
        })
        .collect())
}

fn plan_action(node: &Node, state: &State) -> PlannedAction {
    match state.get(&node.name) {
        None => PlannedAction::Create,
        Some(record) if record.kind != node.kind => PlannedAction::Replace {
            changed_keys: BTreeSet::from([String::from("kind")]),
        },
        Some(record) => {
            let result = diff(&record.inputs, &node.inputs);
            if result.changed {
                PlannedAction::Replace {
                    changed_keys: result.changed_keys,
                }
            } else {
                PlannedAction::Unchanged
            }
        }
    }
}

fn settle(
    node: &Node,
    action: &PlannedAction,
    result: Result<CreateResult, ProvisionError>,
    state: &mut State,
) -> NodeReport {
    let outcome = match result {
        Ok(created) => {
            let previous_id = state.get(&node.name).map(|record| record.id.clone());
            info!(node = %node.name, id = %created.id, "node applied");
            state.record(
                node.name.clone(),
                ResourceRecord {
                    id: created.id.clone(),
                    kind: node.kind,
                    inputs: node.inputs.clone(),
                    outputs: created.outputs,
                },
            );
            match (action, previous_id) {
                (PlannedAction::Replace { .. }, Some(previous_id)) => NodeOutcome::Replaced {
                    id: created.id,
                    previous_id,
                },
                _ => NodeOutcome::Created { id: created.id },
            }
        }
        Err(err) => {
            warn!(node = %node.name, error = %err, "node failed");
            NodeOutcome::Failed(err)
        }
    };
    NodeReport {
        name: node.name.clone(),
        kind: node.kind,
        outcome,
    }
}

#[cfg(test)]
mod tests;
