//! Named resource nodes and their dependency ordering.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::resource::{Inputs, ResourceKind};

/// One resource declaration in a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Unique name within the graph; also the state key.
    pub name: String,
    /// Resource kind to create.
    pub kind: ResourceKind,
    /// Inputs handed to the effect.
    pub inputs: Inputs,
    /// Names of nodes that must succeed first.
    pub depends_on: Vec<String>,
}

impl Node {
    /// Declares a node with no dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ResourceKind, inputs: Inputs) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
            depends_on: Vec::new(),
        }
    }

    /// Adds dependencies; they may be declared before or after this node.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Errors raised while assembling or ordering a graph.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum GraphError {
    /// Raised when two nodes share a name.
    #[error("duplicate node name: {name}")]
    DuplicateNode {
        /// Repeated name.
        name: String,
    },
    /// Raised when a dependency names a node that is not in the graph.
    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency {
        /// Node declaring the dependency.
        node: String,
        /// Missing dependency name.
        dependency: String,
    },
    /// Raised when dependencies form a cycle.
    #[error("dependency cycle involving: {}", nodes.join(", "))]
    Cycle {
        /// Nodes that could not be ordered.
        nodes: Vec<String>,
    },
}

/// Resource declarations in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] when the name is already taken.
    pub fn add(&mut self, node: Node) -> Result<(), GraphError> {
        if self.get(&node.name).is_some() {
            return Err(GraphError::DuplicateNode { name: node.name });
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Looks a node up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Groups nodes into waves: every node's dependencies sit in earlier
    /// waves. Within a wave, insertion order is kept.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownDependency`] or [`GraphError::Cycle`]
    /// when the graph cannot be ordered.
    pub fn waves(&self) -> Result<Vec<Vec<&Node>>, GraphError> {
        for node in &self.nodes {
            if let Some(missing) = node
                .depends_on
                .iter()
                .find(|dependency| self.get(dependency).is_none())
            {
                return Err(GraphError::UnknownDependency {
                    node: node.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut pending: BTreeMap<&str, BTreeSet<&str>> = self
            .nodes
            .iter()
            .map(|node| {
                let deps = node.depends_on.iter().map(String::as_str).collect();
                (node.name.as_str(), deps)
            })
            .collect();

        let mut waves = Vec::new();
        while !pending.is_empty() {
            let wave: Vec<&Node> = self
                .nodes
                .iter()
                .filter(|node| {
                    pending
                        .get(node.name.as_str())
                        .is_some_and(BTreeSet::is_empty)
                })
                .collect();
            if wave.is_empty() {
                return Err(GraphError::Cycle {
                    nodes: pending.keys().map(|name| (*name).to_owned()).collect(),
                });
            }
            for node in &wave {
                pending.remove(node.name.as_str());
            }
            for deps in pending.values_mut() {
                for node in &wave {
                    deps.remove(node.name.as_str());
                }
            }
            waves.push(wave);
        }
        Ok(waves)
    }
}
