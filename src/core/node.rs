//! Pipeline nodes.
//!
//! A node is a named function with declared inputs and outputs. Inputs and
//! outputs are dataset names resolved through the catalog, so a node never
//! sees another node directly.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::Data;

use super::catalog::CatalogError;

/// Prefix of inputs that resolve to a single parameter
pub const PARAMS_PREFIX: &str = "params:";

/// Input name that resolves to the whole parameter tree
pub const PARAMETERS: &str = "parameters";

/// Node body: positional inputs in, positional outputs out
pub type NodeFn = Arc<dyn Fn(Vec<Data>) -> anyhow::Result<Vec<Data>> + Send + Sync>;

/// Whether a dataset name refers to parameters rather than data
pub fn is_parameter(name: &str) -> bool {
    name == PARAMETERS || name.starts_with(PARAMS_PREFIX)
}

/// Errors raised while executing a single node
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node body returned an error
    #[error("node '{node}' failed: {source:#}")]
    Body {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// The node body returned the wrong number of outputs
    #[error("node '{node}' returned {actual} outputs, expected {expected}")]
    OutputArity {
        node: String,
        expected: usize,
        actual: usize,
    },

    /// Loading an input or saving an output failed
    #[error("node '{node}': {source}")]
    Catalog {
        node: String,
        #[source]
        source: CatalogError,
    },

    /// The node body panicked or was aborted
    #[error("node '{node}' aborted: {message}")]
    Aborted { node: String, message: String },
}

impl NodeError {
    /// Name of the node that raised this error
    pub fn node(&self) -> &str {
        match self {
            NodeError::Body { node, .. }
            | NodeError::OutputArity { node, .. }
            | NodeError::Catalog { node, .. }
            | NodeError::Aborted { node, .. } => node,
        }
    }
}

/// A single unit of computation
#[derive(Clone)]
pub struct Node {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    tags: BTreeSet<String>,
    func: NodeFn,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a node from a function and its dataset names
    pub fn new<F>(name: impl Into<String>, func: F, inputs: &[&str], outputs: &[&str]) -> Self
    where
        F: Fn(Vec<Data>) -> anyhow::Result<Vec<Data>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            tags: BTreeSet::new(),
            func: Arc::new(func),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Inputs that are produced by other nodes or datasets, not parameters
    pub fn data_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .map(String::as_str)
            .filter(|i| !is_parameter(i))
    }

    /// Run the body on already-loaded inputs
    pub fn call(&self, inputs: Vec<Data>) -> Result<Vec<Data>, NodeError> {
        let outputs = (self.func)(inputs).map_err(|source| NodeError::Body {
            node: self.name.clone(),
            source,
        })?;

        if outputs.len() != self.outputs.len() {
            return Err(NodeError::OutputArity {
                node: self.name.clone(),
                expected: self.outputs.len(),
                actual: outputs.len(),
            });
        }

        Ok(outputs)
    }

    /// Copy of this node living under `namespace`.
    ///
    /// Dataset names listed in `shared` keep their name. `params:x` becomes
    /// `params:<namespace>.x`; `parameters` is never renamed.
    pub fn namespaced(&self, namespace: &str, shared: &BTreeSet<String>) -> Node {
        let rename = |name: &String| -> String {
            if shared.contains(name) || name == PARAMETERS {
                name.clone()
            } else if let Some(param) = name.strip_prefix(PARAMS_PREFIX) {
                format!("{}{}.{}", PARAMS_PREFIX, namespace, param)
            } else {
                format!("{}.{}", namespace, name)
            }
        };

        Node {
            name: format!("{}.{}", namespace, self.name),
            inputs: self.inputs.iter().map(rename).collect(),
            outputs: self.outputs.iter().map(rename).collect(),
            tags: self.tags.clone(),
            func: Arc::clone(&self.func),
        }
    }
}
