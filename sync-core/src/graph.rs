//! The in-memory commit graph: ref index, heads, and merge-base search.
//!
//! The graph is exclusively owned by one engine and rebuilt from the
//! local store's replay on startup. Inserts are idempotent on ref and
//! enforce closure: every parent must already be present.

use std::collections::{BTreeSet, HashMap, VecDeque};

use deltasync_types::{Commit, CommitRef, CommitShapeError};
use thiserror::Error;

/// Errors produced by graph mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A parent referenced by the commit is not in the graph.
    #[error("commit {commit} references missing parent {parent}")]
    MissingParent {
        /// The commit being inserted.
        commit: CommitRef,
        /// The absent parent.
        parent: CommitRef,
    },

    /// The commit's parent fields are malformed.
    #[error("malformed commit: {0}")]
    Malformed(#[from] CommitShapeError),

    /// The requested commit is not in the graph.
    #[error("unknown commit {0}")]
    UnknownCommit(CommitRef),
}

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The commit was new.
    New,
    /// The ref was already present; nothing changed.
    Duplicate,
}

/// Index over all locally known commits.
///
/// Tracks the head set (commits with no observed children). Heads are
/// kept in a `BTreeSet`, so iteration yields them in lexicographic ref
/// order, which is the deterministic order the merge loop relies on.
#[derive(Debug, Default)]
pub struct CommitGraph {
    commits: HashMap<CommitRef, Commit>,
    heads: BTreeSet<CommitRef>,
    child_counts: HashMap<CommitRef, usize>,
    depths: HashMap<CommitRef, usize>,
}

impl CommitGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits in the graph.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Whether the graph holds no commits.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Whether the given ref is present.
    pub fn contains(&self, id: &CommitRef) -> bool {
        self.commits.contains_key(id)
    }

    /// Look up a commit by ref.
    pub fn get(&self, id: &CommitRef) -> Option<&Commit> {
        self.commits.get(id)
    }

    /// The current heads, in lexicographic ref order.
    pub fn heads(&self) -> &BTreeSet<CommitRef> {
        &self.heads
    }

    /// Insert a commit.
    ///
    /// Idempotent on ref: re-inserting a known ref returns
    /// [`Inserted::Duplicate`] and changes nothing. All parents must
    /// already be present, which also makes cycles unrepresentable.
    pub fn insert(&mut self, commit: Commit) -> Result<Inserted, GraphError> {
        if self.commits.contains_key(&commit.id) {
            return Ok(Inserted::Duplicate);
        }
        commit.validate()?;
        for parent in commit.parents() {
            if !self.commits.contains_key(parent) {
                return Err(GraphError::MissingParent {
                    commit: commit.id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let depth = commit
            .parents()
            .map(|p| self.depths[p] + 1)
            .max()
            .unwrap_or(0);
        for parent in commit.parents() {
            *self.child_counts.entry(parent.clone()).or_insert(0) += 1;
            self.heads.remove(parent);
        }
        self.depths.insert(commit.id.clone(), depth);
        self.heads.insert(commit.id.clone());
        self.commits.insert(commit.id.clone(), commit);
        Ok(Inserted::New)
    }

    /// Longest distance from a root to the given commit.
    pub fn depth(&self, id: &CommitRef) -> Option<usize> {
        self.depths.get(id).copied()
    }

    /// Find the merge base of two commits.
    ///
    /// The merge base is the common ancestor with the greatest depth;
    /// when several common ancestors share the maximum depth, the one
    /// with the lexicographically smallest ref wins, so every client
    /// picks the same base for the same head pair. Returns `None` when
    /// the commits share no ancestor (independent roots).
    pub fn merge_base(&self, a: &CommitRef, b: &CommitRef) -> Result<Option<CommitRef>, GraphError> {
        if !self.contains(a) {
            return Err(GraphError::UnknownCommit(a.clone()));
        }
        if !self.contains(b) {
            return Err(GraphError::UnknownCommit(b.clone()));
        }

        let ancestors_a = self.ancestors(a);
        let ancestors_b = self.ancestors(b);

        let mut best: Option<(usize, CommitRef)> = None;
        for id in ancestors_a.intersection(&ancestors_b) {
            let depth = self.depths[id];
            let better = match &best {
                None => true,
                Some((best_depth, best_ref)) => {
                    depth > *best_depth || (depth == *best_depth && id < best_ref)
                }
            };
            if better {
                best = Some((depth, id.clone()));
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    /// All ancestors of a commit, including the commit itself.
    fn ancestors(&self, start: &CommitRef) -> BTreeSet<CommitRef> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start.clone());
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                for parent in commit.parents() {
                    if !seen.contains(parent) {
                        queue.push_back(parent.clone());
                    }
                }
            }
        }
        seen
    }
}
