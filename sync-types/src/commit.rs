//! The commit record: an immutable node in the edit DAG.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{ClientId, CommitRef, UserId};

/// Parent-shape violations detected by [`Commit::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitShapeError {
    /// A merge parent without a base parent.
    #[error("commit {0} has a merge_ref but no base_ref")]
    MergeWithoutBase(CommitRef),

    /// A merge base without a merge parent.
    #[error("commit {0} has a merge_base_ref but no merge_ref")]
    MergeBaseWithoutMerge(CommitRef),

    /// A parent ref equal to the commit's own ref.
    #[error("commit {0} lists itself as a parent")]
    SelfParent(CommitRef),
}

/// The shape of a commit's ancestry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// No parents; the first commit of a document.
    Root,
    /// One parent; an ordinary edit.
    Edit,
    /// Two parents plus a merge base; reconciles divergent heads.
    Merge,
}

/// An immutable, content-addressed commit.
///
/// The identifier is a pure function of `(base_ref, merge_ref,
/// merge_base_ref, delta, edit_metadata)` via the differ's `compute_ref`.
/// `delta` and `edit_metadata` are opaque byte strings interpreted only
/// by the differ and the host application respectively.
///
/// Remote-sync bookkeeping deliberately does not live here: the local
/// store tracks each commit's remote cursor on its own row, so a
/// `Commit` never changes after construction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Content-addressed identifier.
    pub id: CommitRef,
    /// First parent; absent for a root commit.
    pub base_ref: Option<CommitRef>,
    /// Second parent; present only on merge commits.
    pub merge_ref: Option<CommitRef>,
    /// Common ancestor the merge was computed against; absent when the
    /// merged heads share no ancestor (two independent roots).
    pub merge_base_ref: Option<CommitRef>,
    /// Opaque diff payload; applying it to the base commit's document
    /// yields this commit's document.
    pub delta: Vec<u8>,
    /// Opaque caller data attached to the edit.
    pub edit_metadata: Vec<u8>,
    /// The user that produced the commit.
    pub user_id: UserId,
    /// The client that produced the commit.
    pub client_id: ClientId,
}

impl Commit {
    /// Create a root commit (no parents).
    pub fn root(
        id: CommitRef,
        delta: Vec<u8>,
        edit_metadata: Vec<u8>,
        user_id: UserId,
        client_id: ClientId,
    ) -> Self {
        Self {
            id,
            base_ref: None,
            merge_ref: None,
            merge_base_ref: None,
            delta,
            edit_metadata,
            user_id,
            client_id,
        }
    }

    /// Create a linear edit commit with a single parent.
    pub fn edit(
        id: CommitRef,
        base_ref: CommitRef,
        delta: Vec<u8>,
        edit_metadata: Vec<u8>,
        user_id: UserId,
        client_id: ClientId,
    ) -> Self {
        Self {
            id,
            base_ref: Some(base_ref),
            merge_ref: None,
            merge_base_ref: None,
            delta,
            edit_metadata,
            user_id,
            client_id,
        }
    }

    /// Create a merge commit.
    ///
    /// `merge_base_ref` is `None` only when the two heads share no
    /// common ancestor; the delta applies to `base_ref`'s document.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        id: CommitRef,
        base_ref: CommitRef,
        merge_ref: CommitRef,
        merge_base_ref: Option<CommitRef>,
        delta: Vec<u8>,
        edit_metadata: Vec<u8>,
        user_id: UserId,
        client_id: ClientId,
    ) -> Self {
        Self {
            id,
            base_ref: Some(base_ref),
            merge_ref: Some(merge_ref),
            merge_base_ref,
            delta,
            edit_metadata,
            user_id,
            client_id,
        }
    }

    /// The ancestry shape of this commit.
    pub fn kind(&self) -> CommitKind {
        match (&self.base_ref, &self.merge_ref) {
            (None, _) => CommitKind::Root,
            (Some(_), None) => CommitKind::Edit,
            (Some(_), Some(_)) => CommitKind::Merge,
        }
    }

    /// Whether this commit has two parents.
    pub fn is_merge(&self) -> bool {
        self.merge_ref.is_some()
    }

    /// Iterate over the parent refs (zero, one, or two).
    pub fn parents(&self) -> impl Iterator<Item = &CommitRef> {
        self.base_ref.iter().chain(self.merge_ref.iter())
    }

    /// Check structural invariants on the parent fields.
    pub fn validate(&self) -> Result<(), CommitShapeError> {
        if self.merge_ref.is_some() && self.base_ref.is_none() {
            return Err(CommitShapeError::MergeWithoutBase(self.id.clone()));
        }
        if self.merge_base_ref.is_some() && self.merge_ref.is_none() {
            return Err(CommitShapeError::MergeBaseWithoutMerge(self.id.clone()));
        }
        if self.parents().any(|p| *p == self.id) {
            return Err(CommitShapeError::SelfParent(self.id.clone()));
        }
        Ok(())
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("base_ref", &self.base_ref)
            .field("merge_ref", &self.merge_ref)
            .field("merge_base_ref", &self.merge_base_ref)
            .field("delta", &format!("[{} bytes]", self.delta.len()))
            .field("user_id", &self.user_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}
