//! Validated build graph with index-based adjacency.

use std::collections::{BTreeSet, HashMap, VecDeque};

use thiserror::Error;

use crate::types::{BuildNode, NodeName, RepoId};

/// Errors from graph construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node {0}")]
    DuplicateNode(NodeName),

    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: NodeName, dependency: NodeName },

    #[error("node {0} depends on itself")]
    SelfDependency(NodeName),

    #[error("dependency cycle through {}", format_names(.0))]
    Cycle(Vec<NodeName>),
}

fn format_names(names: &[NodeName]) -> String {
    names
        .iter()
        .map(NodeName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A statically declared DAG of build nodes.
///
/// Nodes keep their declaration order; every index in this type refers to it.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    nodes: Vec<BuildNode>,
    /// `dependents[i]` lists the nodes that name node `i` as upstream.
    dependents: Vec<Vec<usize>>,
    /// Number of distinct upstream nodes per node.
    upstream_counts: Vec<usize>,
}

impl BuildGraph {
    /// Validates `nodes` and builds the adjacency.
    ///
    /// Duplicate dependency entries on one node count once.
    pub fn new(nodes: Vec<BuildNode>) -> Result<Self, GraphError> {
        let mut index: HashMap<&NodeName, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(&node.name, i).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut upstream_counts = vec![0; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dependency in &node.depends_on {
                if *dependency == node.name {
                    return Err(GraphError::SelfDependency(node.name.clone()));
                }
                let upstream = *index.get(dependency).ok_or_else(|| {
                    GraphError::UnknownDependency {
                        node: node.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                if seen.insert(upstream) {
                    dependents[upstream].push(i);
                    upstream_counts[i] += 1;
                }
            }
        }

        let graph = BuildGraph {
            nodes,
            dependents,
            upstream_counts,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm; whatever cannot be ordered lies on or behind a cycle.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let order = self.topological_order();
        if order.len() == self.nodes.len() {
            return Ok(());
        }

        let mut ordered = vec![false; self.nodes.len()];
        for i in order {
            ordered[i] = true;
        }
        Err(GraphError::Cycle(
            self.nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !ordered[*i])
                .map(|(_, node)| node.name.clone())
                .collect(),
        ))
    }

    pub fn nodes(&self) -> &[BuildNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &BuildNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fresh unresolved-dependency counters, one per node.
    pub fn unresolved_counts(&self) -> Vec<usize> {
        self.upstream_counts.clone()
    }

    /// Nodes with no upstream dependencies, in declaration order.
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.upstream_counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
    }

    /// Nodes that depend directly on `index`.
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Distinct repositories touched by the graph, sorted.
    pub fn repositories(&self) -> Vec<RepoId> {
        self.nodes
            .iter()
            .map(|node| node.repo.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// A topological order, ties broken by declaration order.
    ///
    /// Shorter than `len()` only while the graph is being validated.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut counts = self.unresolved_counts();
        let mut ready: VecDeque<usize> = self.roots().collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                counts[dependent] -= 1;
                if counts[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        order
    }
}
