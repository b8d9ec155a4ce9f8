//! Parallel graph walker
//!
//! Visits every node once all of its dependencies completed successfully,
//! with at most `parallelism` visits in flight on a rayon pool. A failed
//! node fails its transitive dependents without visiting them; unrelated
//! branches keep going. Cancellation stops dispatching new nodes and lets
//! running ones finish.

use super::graph::{Graph, Node};
use crate::error::{BuildError, NodeError};
use petgraph::stable_graph::NodeIndex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

/// Shared flag asking a walk to stop dispatching new work
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    /// A dependency failed
    Skipped,
    /// The walk stopped before the node ran
    Cancelled,
}

/// What a successful visit did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Bookkeeping node with nothing to report
    Done,
    NoChange,
    Created,
    Updated,
    Destroyed,
    Replaced,
}

/// Counts of node outcomes over a walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub created: usize,
    pub updated: usize,
    pub destroyed: usize,
    pub replaced: usize,
    pub no_change: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl WalkSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.destroyed + self.replaced
    }

    /// Nothing failed and nothing was left out
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }

    pub fn merge(&mut self, other: &WalkSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.destroyed += other.destroyed;
        self.replaced += other.replaced;
        self.no_change += other.no_change;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
    }

    pub fn add_outcome(&mut self, outcome: NodeOutcome) {
        match outcome {
            NodeOutcome::Done => {}
            NodeOutcome::NoChange => self.no_change += 1,
            NodeOutcome::Created => self.created += 1,
            NodeOutcome::Updated => self.updated += 1,
            NodeOutcome::Destroyed => self.destroyed += 1,
            NodeOutcome::Replaced => self.replaced += 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WalkOutcome {
    pub summary: WalkSummary,
    pub errors: Vec<NodeError>,
    pub statuses: BTreeMap<String, NodeStatus>,
}

type Completion = (NodeIndex, std::thread::Result<Result<NodeOutcome, NodeError>>);

/// Walk `graph` in dependency order, calling `visit` for each node
pub(crate) fn walk<F>(
    graph: &Graph,
    parallelism: usize,
    cancel: &CancelToken,
    visit: F,
) -> Result<WalkOutcome, BuildError>
where
    F: Fn(&Node) -> Result<NodeOutcome, NodeError> + Sync,
{
    let parallelism = parallelism.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .build()
        .map_err(|e| BuildError::ThreadPool(e.to_string()))?;

    let indices = graph.indices();
    let mut waiting: HashMap<NodeIndex, usize> = HashMap::with_capacity(indices.len());
    let mut status: HashMap<NodeIndex, NodeStatus> = HashMap::with_capacity(indices.len());
    let mut ready: BTreeMap<String, NodeIndex> = BTreeMap::new();
    for idx in &indices {
        let deps = graph.dependencies(*idx).len();
        waiting.insert(*idx, deps);
        if deps == 0 {
            status.insert(*idx, NodeStatus::Ready);
            ready.insert(graph.node(*idx).name.clone(), *idx);
        } else {
            status.insert(*idx, NodeStatus::Pending);
        }
    }

    let mut summary = WalkSummary::default();
    let mut errors = Vec::new();
    let (tx, rx) = mpsc::channel::<Completion>();
    let visit = &visit;

    pool.in_place_scope(|scope| {
        let mut running = 0usize;
        loop {
            while running < parallelism && !cancel.is_cancelled() {
                let Some((_, idx)) = ready.pop_first() else {
                    break;
                };
                if status.get(&idx) != Some(&NodeStatus::Ready) {
                    continue;
                }
                status.insert(idx, NodeStatus::Running);
                running += 1;

                let node = graph.node(idx);
                let tx = tx.clone();
                scope.spawn(move |_| {
                    log::trace!("Visiting {}", node.name);
                    let result = panic::catch_unwind(AssertUnwindSafe(|| visit(node)));
                    let _ = tx.send((idx, result));
                });
            }
            if running == 0 {
                break;
            }
            let Ok((idx, result)) = rx.recv() else {
                break;
            };
            running -= 1;

            let name = &graph.node(idx).name;
            let result = result.unwrap_or_else(|payload| {
                Err(NodeError::Panicked {
                    node: name.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });
            match result {
                Ok(outcome) => {
                    status.insert(idx, NodeStatus::Done);
                    summary.add_outcome(outcome);
                    for dependent in graph.dependents(idx) {
                        let Some(count) = waiting.get_mut(&dependent) else {
                            continue;
                        };
                        *count = count.saturating_sub(1);
                        if *count == 0 && status.get(&dependent) == Some(&NodeStatus::Pending) {
                            status.insert(dependent, NodeStatus::Ready);
                            ready.insert(graph.node(dependent).name.clone(), dependent);
                        }
                    }
                }
                Err(err @ NodeError::Halted { .. }) => {
                    log::info!("{name}: halted, stopping walk");
                    cancel.cancel();
                    status.insert(idx, NodeStatus::Cancelled);
                    summary.cancelled += 1;
                    errors.push(err);
                }
                Err(err) => {
                    log::error!("{err}");
                    status.insert(idx, NodeStatus::Failed);
                    summary.failed += 1;
                    summary.skipped += skip_dependents(graph, idx, &mut status);
                    errors.push(err);
                }
            }
        }
    });

    let mut cancelled: Vec<String> = Vec::new();
    for (idx, s) in &mut status {
        if matches!(s, NodeStatus::Pending | NodeStatus::Ready) {
            *s = NodeStatus::Cancelled;
            cancelled.push(graph.node(*idx).name.clone());
        }
    }
    if !cancelled.is_empty() {
        cancelled.sort();
        summary.cancelled += cancelled.len();
        errors.push(NodeError::Cancelled { nodes: cancelled });
    }

    let statuses = status
        .into_iter()
        .map(|(idx, s)| (graph.node(idx).name.clone(), s))
        .collect();
    Ok(WalkOutcome {
        summary,
        errors,
        statuses,
    })
}

/// Mark every node reachable from `failed` as skipped; returns how many
fn skip_dependents(graph: &Graph, failed: NodeIndex, status: &mut HashMap<NodeIndex, NodeStatus>) -> usize {
    let mut stack = graph.dependents(failed);
    let mut skipped = 0;
    while let Some(idx) = stack.pop() {
        if !matches!(status.get(&idx), Some(NodeStatus::Pending | NodeStatus::Ready)) {
            continue;
        }
        status.insert(idx, NodeStatus::Skipped);
        log::debug!("Skipping {}: a dependency failed", graph.node(idx).name);
        skipped += 1;
        stack.extend(graph.dependents(idx));
    }
    skipped
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::graph::NodeKind;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn node(name: &str) -> Node {
        Node::new(name, NodeKind::Provisioner { kind: name.into() })
    }

    /// a -> b -> d, a -> c -> d
    fn diamond() -> Graph {
        let mut graph = Graph::new();
        let a = graph.add(node("a")).unwrap();
        let b = graph.add(node("b")).unwrap();
        let c = graph.add(node("c")).unwrap();
        let d = graph.add(node("d")).unwrap();
        graph.connect(a, b);
        graph.connect(a, c);
        graph.connect(b, d);
        graph.connect(c, d);
        graph
    }

    #[test]
    fn test_dependencies_run_first() {
        let graph = diamond();
        let order = Mutex::new(Vec::new());
        let outcome = walk(&graph, 4, &CancelToken::new(), |n| {
            order.lock().unwrap().push(n.name.clone());
            Ok(NodeOutcome::Created)
        })
        .unwrap();

        let order = order.into_inner().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert_eq!(outcome.summary.created, 4);
        assert!(outcome.errors.is_empty());
        assert!(outcome.statuses.values().all(|s| *s == NodeStatus::Done));
    }

    #[test]
    fn test_failure_skips_dependents_only() {
        let graph = diamond();
        let outcome = walk(&graph, 2, &CancelToken::new(), |n| {
            if n.name == "b" {
                Err(NodeError::Output {
                    output: "b".into(),
                    cause: anyhow::anyhow!("boom"),
                })
            } else {
                Ok(NodeOutcome::Done)
            }
        })
        .unwrap();

        assert_eq!(outcome.statuses["b"], NodeStatus::Failed);
        assert_eq!(outcome.statuses["c"], NodeStatus::Done);
        assert_eq!(outcome.statuses["d"], NodeStatus::Skipped);
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.skipped, 1);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn test_panic_is_a_node_error() {
        let graph = diamond();
        let outcome = walk(&graph, 1, &CancelToken::new(), |n| {
            assert!(n.name != "c", "bad node");
            Ok(NodeOutcome::Done)
        })
        .unwrap();
        assert!(matches!(
            &outcome.errors[0],
            NodeError::Panicked { node, message } if node == "c" && message == "bad node"
        ));
        assert_eq!(outcome.statuses["d"], NodeStatus::Skipped);
    }

    #[test]
    fn test_halt_cancels_remaining() {
        let graph = diamond();
        let cancel = CancelToken::new();
        let outcome = walk(&graph, 1, &cancel, |n| {
            if n.name == "b" {
                Err(NodeError::Halted { node: "b".into() })
            } else {
                Ok(NodeOutcome::Done)
            }
        })
        .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(outcome.statuses["b"], NodeStatus::Cancelled);
        assert_eq!(outcome.statuses["c"], NodeStatus::Cancelled);
        assert_eq!(outcome.statuses["d"], NodeStatus::Cancelled);
        assert!(outcome.errors.iter().all(NodeError::is_cancellation));
        assert!(matches!(
            outcome.errors.last(),
            Some(NodeError::Cancelled { nodes }) if nodes == &vec!["c".to_string(), "d".to_string()]
        ));
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let mut graph = Graph::new();
        for i in 0..12 {
            graph.add(node(&format!("n{i:02}"))).unwrap();
        }
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        walk(&graph, 3, &CancelToken::new(), |_| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(NodeOutcome::Done)
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_summary_merge() {
        let mut a = WalkSummary::default();
        a.add_outcome(NodeOutcome::Created);
        a.add_outcome(NodeOutcome::Done);
        let mut b = WalkSummary::default();
        b.add_outcome(NodeOutcome::Destroyed);
        b.failed = 1;
        a.merge(&b);
        assert_eq!(a.total_changes(), 2);
        assert!(!a.is_success());
    }
}
