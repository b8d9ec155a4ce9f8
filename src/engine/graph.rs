//! Typed work graph
//!
//! Nodes live in a petgraph arena keyed by unique name. An edge `a -> b`
//! means `a` must complete before `b` starts.

use crate::addr::{ModulePath, ResourceAddress};
use crate::config::ResourceConfig;
use crate::error::BuildError;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// What a resource node does when visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Compute the diff of a configured instance
    Plan,
    /// Record a destroy diff for an instance with no configuration slot
    PlanDestroy,
    /// Create, update or destroy-then-create in one provider call
    Apply,
    /// Create the replacement of a create-before-destroy instance
    CreateReplacement,
    /// Destroy the primary instance
    Destroy,
    /// Destroy every deposed instance at the address
    DestroyDeposed,
    /// Re-read the primary instance
    Refresh,
}

impl Role {
    pub(crate) fn is_destroy(self) -> bool {
        matches!(self, Self::PlanDestroy | Self::Destroy | Self::DestroyDeposed)
    }
}

/// Provider instance a resource is served by: the module whose provider
/// node configured it, plus the provider key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ProviderSlot {
    pub module: ModulePath,
    pub key: String,
}

impl ProviderSlot {
    /// Factory name: the key without its alias
    pub(crate) fn name(&self) -> &str {
        self.key.split('.').next().unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResourceNode {
    /// Address of the record this node reads and writes
    pub address: ResourceAddress,
    pub role: Role,
    /// `None` for records whose configuration is gone
    pub config: Option<ResourceConfig>,
    pub count_index: Option<usize>,
    pub provider: ProviderSlot,
    /// Recorded dependencies of the existing record
    pub dependencies: Vec<String>,
}

/// Shape a counted resource's records take once its instances are done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountShape {
    Unindexed,
    Indexed,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Provider(ProviderSlot),
    Provisioner { kind: String },
    ModuleEntry { path: ModulePath },
    ModuleExit { path: ModulePath },
    Resource(Box<ResourceNode>),
    Output {
        module: ModulePath,
        name: String,
        /// Present in state but no longer configured
        orphan: bool,
    },
    /// Renames records between `foo` and `foo.0` after a count change
    CountBoundary {
        module: ModulePath,
        kind: String,
        name: String,
        shape: CountShape,
    },
    /// Drops a removed module's state once its records are destroyed
    MetaDestroy { path: ModulePath },
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    pub(crate) fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Part of tearing something down
    pub(crate) fn is_destroy(&self) -> bool {
        match &self.kind {
            NodeKind::Resource(r) => r.role.is_destroy(),
            NodeKind::MetaDestroy { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn resource(&self) -> Option<&ResourceNode> {
        match &self.kind {
            NodeKind::Resource(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Graph {
    inner: StableDiGraph<Node, ()>,
    by_name: HashMap<String, NodeIndex>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, node: Node) -> Result<NodeIndex, BuildError> {
        if self.by_name.contains_key(&node.name) {
            return Err(BuildError::DuplicateResource(node.name));
        }
        let name = node.name.clone();
        let idx = self.inner.add_node(node);
        self.by_name.insert(name, idx);
        Ok(idx)
    }

    #[cfg(test)]
    pub(crate) fn find(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn node(&self, idx: NodeIndex) -> &Node {
        &self.inner[idx]
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.node_count()
    }

    /// `before` must complete before `after` starts
    pub(crate) fn connect(&mut self, before: NodeIndex, after: NodeIndex) {
        if before != after {
            self.inner.update_edge(before, after, ());
        }
    }

    pub(crate) fn has_edge(&self, before: NodeIndex, after: NodeIndex) -> bool {
        self.inner.find_edge(before, after).is_some()
    }

    /// Every node index, ordered by node name
    pub(crate) fn indices(&self) -> Vec<NodeIndex> {
        let mut all: Vec<NodeIndex> = self.inner.node_indices().collect();
        all.sort_by(|a, b| self.inner[*a].name.cmp(&self.inner[*b].name));
        all
    }

    /// Nodes that must complete before `idx`
    pub(crate) fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.inner
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    /// Nodes waiting on `idx`
    pub(crate) fn dependents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.inner
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    /// Reject cycles, except among destroy nodes where they are broken
    ///
    /// Inside a destroy-only cycle only edges from a lexically smaller node
    /// name to a larger one are kept.
    pub(crate) fn check_cycles(&mut self) -> Result<(), BuildError> {
        for scc in tarjan_scc(&self.inner) {
            if scc.len() < 2 {
                continue;
            }
            let members: HashSet<NodeIndex> = scc.iter().copied().collect();

            if !scc.iter().all(|idx| self.inner[*idx].is_destroy()) {
                let names: BTreeSet<String> =
                    scc.iter().map(|idx| self.inner[*idx].name.clone()).collect();
                return Err(BuildError::Cycle(names.into_iter().collect()));
            }

            let backwards: Vec<EdgeIndex> = self
                .inner
                .edge_indices()
                .filter(|edge| {
                    self.inner.edge_endpoints(*edge).is_some_and(|(a, b)| {
                        members.contains(&a)
                            && members.contains(&b)
                            && self.inner[a].name > self.inner[b].name
                    })
                })
                .collect();
            log::warn!(
                "Breaking destroy cycle among {} nodes by dropping {} edge(s)",
                scc.len(),
                backwards.len()
            );
            for edge in backwards {
                self.inner.remove_edge(edge);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    /// One line per node in name order, with its dependencies indented below
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for idx in self.indices() {
            writeln!(f, "{}", self.inner[idx].name)?;
            let mut deps: Vec<&str> = self
                .dependencies(idx)
                .into_iter()
                .map(|d| self.inner[d].name.as_str())
                .collect();
            deps.sort_unstable();
            for dep in deps {
                writeln!(f, "  {dep}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destroy_node(name: &str) -> Node {
        Node::new(
            name,
            NodeKind::Resource(Box::new(ResourceNode {
                address: ResourceAddress::root(name.parse().unwrap()),
                role: Role::Destroy,
                config: None,
                count_index: None,
                provider: ProviderSlot {
                    module: ModulePath::root(),
                    key: "aws".into(),
                },
                dependencies: Vec::new(),
            })),
        )
    }

    fn plain(name: &str) -> Node {
        Node::new(name, NodeKind::Provisioner { kind: name.into() })
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut graph = Graph::new();
        graph.add(plain("a")).unwrap();
        assert!(matches!(
            graph.add(plain("a")),
            Err(BuildError::DuplicateResource(name)) if name == "a"
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = Graph::new();
        let a = graph.add(plain("a")).unwrap();
        let b = graph.add(plain("b")).unwrap();
        graph.connect(a, b);
        graph.connect(b, a);
        match graph.check_cycles() {
            Err(BuildError::Cycle(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_destroy_cycle_broken_lexically() {
        let mut graph = Graph::new();
        let a = graph.add(destroy_node("aws_instance.a")).unwrap();
        let b = graph.add(destroy_node("aws_instance.b")).unwrap();
        let c = graph.add(destroy_node("aws_instance.c")).unwrap();
        graph.connect(a, b);
        graph.connect(b, c);
        graph.connect(c, a);

        graph.check_cycles().unwrap();
        assert!(graph.has_edge(a, b));
        assert!(graph.has_edge(b, c));
        assert!(!graph.has_edge(c, a));
    }

    #[test]
    fn test_display_lists_dependencies() {
        let mut graph = Graph::new();
        let a = graph.add(plain("a")).unwrap();
        let b = graph.add(plain("b")).unwrap();
        graph.connect(a, b);
        graph.connect(a, a);
        assert_eq!(graph.to_string(), "a\nb\n  a\n");
        assert_eq!(graph.dependents(a), vec![b]);
    }
}
