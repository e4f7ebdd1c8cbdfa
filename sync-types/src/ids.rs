//! Identity and ordering types for deltasync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-addressed identifier of a commit.
///
/// Produced by the differ's `compute_ref`; a short opaque string. The
/// core never inspects the contents, it only compares and orders them.
/// Lexicographic order is the canonical order wherever the sync protocol
/// needs a deterministic tie-break.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitRef(String);

impl CommitRef {
    /// Create a CommitRef from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The string form of this ref.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitRef({})", self.0)
    }
}

impl From<&str> for CommitRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a synchronized document.
///
/// The local store keys its persisted state by DocId.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    /// Create a DocId from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

/// Identifier of the user editing a document.
///
/// Opaque to the sync layer; assigned by the host application.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a UserId from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// A unique identifier for one client (one engine instance).
///
/// UUID v4; several clients belonging to the same user may share a local
/// store. Total ordering is used by leader election to break ties.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    /// Create a new random ClientId.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a ClientId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this ClientId.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", &self.to_string()[..8])
    }
}

/// Stable identity of one local store.
///
/// Generated once when the store is created and persisted alongside the
/// remote sync metadata, so the remote can distinguish stores that share
/// a user.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(uuid::Uuid);

impl StoreId {
    /// Create a new random StoreId.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the raw bytes of this StoreId.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", &self.to_string()[..8])
    }
}

/// An opaque ordered cursor assigned by the remote.
///
/// The remote hands one out with every acknowledgment; "give me commits
/// since" requests carry the last cursor seen. Clients compare cursors
/// but never do arithmetic on them. Absence ("never synced") is
/// `Option<SyncCursor>::None`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Create a SyncCursor from its string form.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The string form of this cursor.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncCursor({})", self.0)
    }
}

/// A monotonically increasing sequence number assigned by the local store.
///
/// Strictly increasing in insertion order; "commits since" queries
/// against the local store use it. Purely local, never sent to the
/// remote.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct LocalSyncId(u64);

impl LocalSyncId {
    /// Create a LocalSyncId with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The next sequence number.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LocalSyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for LocalSyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalSyncId({})", self.0)
    }
}
