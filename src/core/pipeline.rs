//! Pipeline graphs.
//!
//! A pipeline is a set of nodes connected by shared dataset names: a node
//! depends on another when it consumes a dataset the other produces.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Add;

use thiserror::Error;

use super::node::Node;

/// Errors raised while building or filtering a pipeline
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("dataset '{dataset}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        dataset: String,
        first: String,
        second: String,
    },

    #[error("pipeline contains a cycle through nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("unknown node(s): {}", .0.join(", "))]
    UnknownNodes(Vec<String>),

    #[error("filter selected no nodes")]
    Empty,
}

/// A validated, acyclic set of nodes
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl Pipeline {
    /// Build a pipeline, checking names, producers and acyclicity
    pub fn new(nodes: Vec<Node>) -> Result<Self, PipelineError> {
        let mut names = HashSet::new();
        let mut producers: HashMap<&str, &str> = HashMap::new();

        for node in &nodes {
            if !names.insert(node.name()) {
                return Err(PipelineError::DuplicateNode(node.name().to_string()));
            }
            for output in node.outputs() {
                if let Some(first) = producers.insert(output.as_str(), node.name()) {
                    return Err(PipelineError::DuplicateOutput {
                        dataset: output.clone(),
                        first: first.to_string(),
                        second: node.name().to_string(),
                    });
                }
            }
        }

        let order = toposort(&nodes)?;
        Ok(Self { nodes, order })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Nodes in dependency order; ties are broken by node name
    pub fn topological_order(&self) -> Vec<&Node> {
        self.order.iter().map(|&i| &self.nodes[i]).collect()
    }

    /// For each node, the names of the nodes producing its inputs
    pub fn node_dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        let producers = self.producers();
        self.nodes
            .iter()
            .map(|node| {
                let deps = node
                    .inputs()
                    .iter()
                    .filter_map(|i| producers.get(i.as_str()))
                    .map(|p| p.to_string())
                    .collect();
                (node.name().to_string(), deps)
            })
            .collect()
    }

    /// Datasets consumed but not produced inside the pipeline
    pub fn inputs(&self) -> BTreeSet<String> {
        let produced = self.all_outputs();
        self.nodes
            .iter()
            .flat_map(|n| n.inputs().iter())
            .filter(|i| !produced.contains(*i))
            .cloned()
            .collect()
    }

    /// Datasets produced but not consumed inside the pipeline
    pub fn outputs(&self) -> BTreeSet<String> {
        let consumed: BTreeSet<&String> = self.nodes.iter().flat_map(|n| n.inputs().iter()).collect();
        self.all_outputs()
            .into_iter()
            .filter(|o| !consumed.contains(o))
            .collect()
    }

    /// Every dataset produced by some node
    pub fn all_outputs(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.outputs().iter())
            .cloned()
            .collect()
    }

    /// Every dataset name mentioned by the pipeline
    pub fn datasets(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.inputs().iter().chain(n.outputs().iter()))
            .cloned()
            .collect()
    }

    /// Modular copy of this pipeline under `namespace`.
    ///
    /// `shared` names datasets that stay un-prefixed, so several namespaced
    /// copies can consume the same upstream data.
    pub fn namespace(&self, namespace: &str, shared: &[&str]) -> Pipeline {
        let shared: BTreeSet<String> = shared.iter().map(|s| s.to_string()).collect();
        let nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|n| n.namespaced(namespace, &shared))
            .collect();
        // Renaming is injective and keeps edges, so the order carries over.
        Self {
            nodes,
            order: self.order.clone(),
        }
    }

    /// Union of two pipelines; nodes with the same name must be identical
    /// in shape and are kept once.
    pub fn try_add(&self, other: &Pipeline) -> Result<Pipeline, PipelineError> {
        let mut nodes = self.nodes.clone();
        for node in &other.nodes {
            match self.node(node.name()) {
                Some(existing)
                    if existing.inputs() == node.inputs() && existing.outputs() == node.outputs() => {}
                _ => nodes.push(node.clone()),
            }
        }
        Pipeline::new(nodes)
    }

    /// Keep only the named nodes
    pub fn only_nodes(&self, names: &[String]) -> Result<Pipeline, PipelineError> {
        self.check_known(names)?;
        self.subset(|n| names.iter().any(|s| s == n.name()))
    }

    /// Keep the named nodes and everything downstream of them
    pub fn from_nodes(&self, names: &[String]) -> Result<Pipeline, PipelineError> {
        self.check_known(names)?;
        let mut reached: HashSet<String> = names.iter().cloned().collect();
        let deps = self.node_dependencies();
        for node in self.topological_order() {
            if deps[node.name()].iter().any(|d| reached.contains(d)) {
                reached.insert(node.name().to_string());
            }
        }
        self.subset(|n| reached.contains(n.name()))
    }

    /// Keep the named nodes and everything upstream of them
    pub fn to_nodes(&self, names: &[String]) -> Result<Pipeline, PipelineError> {
        self.check_known(names)?;
        let mut reached: HashSet<String> = names.iter().cloned().collect();
        let deps = self.node_dependencies();
        for node in self.topological_order().into_iter().rev() {
            if reached.contains(node.name()) {
                reached.extend(deps[node.name()].iter().cloned());
            }
        }
        self.subset(|n| reached.contains(n.name()))
    }

    /// Keep nodes carrying at least one of the tags
    pub fn only_nodes_with_tags(&self, tags: &[String]) -> Result<Pipeline, PipelineError> {
        self.subset(|n| tags.iter().any(|t| n.tags().contains(t)))
    }

    fn check_known(&self, names: &[String]) -> Result<(), PipelineError> {
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| self.node(n).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::UnknownNodes(unknown))
        }
    }

    fn subset<F>(&self, keep: F) -> Result<Pipeline, PipelineError>
    where
        F: Fn(&Node) -> bool,
    {
        let nodes: Vec<Node> = self.nodes.iter().filter(|n| keep(n)).cloned().collect();
        if nodes.is_empty() {
            return Err(PipelineError::Empty);
        }
        Pipeline::new(nodes)
    }

    fn producers(&self) -> HashMap<&str, &str> {
        self.nodes
            .iter()
            .flat_map(|n| n.outputs().iter().map(move |o| (o.as_str(), n.name())))
            .collect()
    }
}

impl Add for Pipeline {
    type Output = Result<Pipeline, PipelineError>;

    fn add(self, other: Pipeline) -> Self::Output {
        self.try_add(&other)
    }
}

/// Kahn's algorithm over node indices, ready set ordered by name
fn toposort(nodes: &[Node]) -> Result<Vec<usize>, PipelineError> {
    let producer: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .flat_map(|(i, n)| n.outputs().iter().map(move |o| (o.as_str(), i)))
        .collect();

    let mut indegree = vec![0usize; nodes.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let parents: BTreeSet<usize> = node
            .inputs()
            .iter()
            .filter_map(|input| producer.get(input.as_str()).copied())
            .collect();
        indegree[i] = parents.len();
        for p in parents {
            children[p].push(i);
        }
    }

    let mut ready: BTreeSet<(&str, usize)> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| (nodes[i].name(), i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        let i = next.1;
        order.push(i);
        for &child in &children[i] {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                ready.insert((nodes[child].name(), child));
            }
        }
    }

    if order.len() < nodes.len() {
        let mut stuck: Vec<String> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| nodes[i].name().to_string())
            .collect();
        stuck.sort();
        return Err(PipelineError::Cycle(stuck));
    }

    Ok(order)
}
