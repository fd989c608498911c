//! Per-repo commit DAG tracker.
//!
//! The tracker polls the underlying hosts (delegated to callers; this
//! module only holds and publishes the resulting graph) and publishes
//! immutable snapshots through a `tokio::sync::watch` channel -- the
//! idiomatic way to hand "the latest immutable value" to many concurrent
//! async readers without a lock on the read path (§5, §9).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

/// An immutable snapshot of one repo's commit DAG.
///
/// Only first-parent reachability is modeled; merge parents beyond the
/// first are not tracked since the scheduler only needs the first-parent
/// chain for blamelist computation (§4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitGraph {
    /// commit -> its first parent, if any.
    first_parent: HashMap<String, Option<String>>,
    /// The current head of the main branch tracked for this repo.
    pub head: Option<String>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commit and its first parent. Re-recording an existing
    /// commit with a different parent overwrites the edge (a host
    /// rewriting history, e.g. via a force-push, is not expected but is
    /// not actively rejected either -- the tracker is a cache, not a
    /// source of truth).
    pub fn add_commit(&mut self, commit: impl Into<String>, first_parent: Option<String>) {
        self.first_parent.insert(commit.into(), first_parent);
    }

    pub fn set_head(&mut self, head: impl Into<String>) {
        self.head = Some(head.into());
    }

    /// Walk the first-parent chain backwards from `rev`, in order,
    /// starting with `rev` itself, stopping at `stop_at` (exclusive, not
    /// included in the result) or after `max_window` commits, whichever
    /// comes first. `stop_at = None` and unlimited `max_window` walks to
    /// the root of the recorded history.
    pub fn first_parent_chain(
        &self,
        rev: &str,
        stop_at: Option<&str>,
        max_window: usize,
    ) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(rev.to_string());

        while let Some(commit) = current {
            if Some(commit.as_str()) == stop_at {
                break;
            }
            if chain.len() >= max_window {
                break;
            }
            chain.push(commit.clone());
            current = self.first_parent.get(&commit).cloned().flatten();
        }

        chain
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.first_parent.contains_key(commit)
    }
}

/// One publisher (the repo-graph tracker), many subscribers (the
/// scheduler tick and any read-side view). Each repo gets its own watch
/// channel so a graph update in one repo never wakes readers of another.
pub struct CommitGraphPublisher {
    tx: watch::Sender<Arc<CommitGraph>>,
}

impl CommitGraphPublisher {
    pub fn new() -> (Self, watch::Receiver<Arc<CommitGraph>>) {
        let (tx, rx) = watch::channel(Arc::new(CommitGraph::new()));
        (Self { tx }, rx)
    }

    /// Publish a new immutable snapshot, replacing the previous one.
    /// Matches Design Notes §9: "publish a new immutable snapshot rather
    /// than mutating in place".
    pub fn publish(&self, graph: CommitGraph) {
        let _ = self.tx.send(Arc::new(graph));
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CommitGraph>> {
        self.tx.subscribe()
    }
}
