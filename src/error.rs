//! Error taxonomy
//!
//! Build errors are fatal and stop a walk before it starts. Node errors are
//! local to one graph node: they fail that node and its dependents, and are
//! collected alongside the resulting state.

use thiserror::Error;

/// The graph could not be built; nothing was executed
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cycle: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("{from}: unresolved reference {reference}")]
    UnresolvedReference { from: String, reference: String },

    #[error("{resource}: invalid count: {reason}")]
    InvalidCount { resource: String, reason: String },

    #[error("duplicate {0}")]
    DuplicateResource(String),

    #[error("failed to create thread pool: {0}")]
    ThreadPool(String),
}

/// Failure of a single node during a walk
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{address}: diff: {cause:#}")]
    Diff { address: String, cause: anyhow::Error },

    #[error("{address}: apply: {cause:#}")]
    Apply { address: String, cause: anyhow::Error },

    #[error("{address}: provisioner {provisioner}: {cause:#}")]
    Provisioner {
        address: String,
        provisioner: String,
        cause: anyhow::Error,
    },

    #[error("{address}: refresh: {cause:#}")]
    Refresh { address: String, cause: anyhow::Error },

    #[error("{provider}: {cause:#}")]
    Provider { provider: String, cause: anyhow::Error },

    #[error("{output}: {cause:#}")]
    Output { output: String, cause: anyhow::Error },

    /// Inputs of a module call could not be evaluated
    #[error("{module}: {cause:#}")]
    Module { module: String, cause: anyhow::Error },

    #[error("{node}: hook: {cause:#}")]
    Hook { node: String, cause: anyhow::Error },

    #[error("persisting state: {cause:#}")]
    StateStore { cause: anyhow::Error },

    #[error("{node}: panicked: {message}")]
    Panicked { node: String, message: String },

    /// Nodes that never ran because the walk was stopped
    #[error("walk cancelled before {} node(s) ran: {}", .nodes.len(), .nodes.join(", "))]
    Cancelled { nodes: Vec<String> },

    /// A hook asked the walk to stop before this node acted
    #[error("{node}: halted by hook")]
    Halted { node: String },
}

impl NodeError {
    /// The walk was stopped rather than something failing
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Halted { .. })
    }
}

/// Top-level error of a context operation
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("{} error(s) during walk: {}", .0.len(), join_errors(.0))]
    Walk(Vec<NodeError>),

    #[error("settings: {0:#}")]
    Settings(anyhow::Error),

    #[error("state store: {0:#}")]
    Store(anyhow::Error),
}

fn join_errors(errors: &[NodeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
