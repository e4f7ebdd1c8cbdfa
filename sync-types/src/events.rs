//! Typed event sums and transient records exchanged between components.
//!
//! Dynamic callbacks are replaced with these sums: the local store emits
//! [`StoreEvent`]s on a subscription stream, and presence travels as
//! [`PresenceUpdate`]s over the same-origin broadcast bus.

use serde::{Deserialize, Serialize};

use crate::{ClientId, Commit, CommitRef, LocalSyncId, RemoteStateUpdate, StoreId, SyncCursor, UserId};

/// A batch of commits made newly visible by the local store, with the
/// highest local sequence number they were assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitsEvent {
    /// The commits, in local insertion order.
    pub commits: Vec<Commit>,
    /// Highest `LocalSyncId` covered by this event.
    pub sync_id: LocalSyncId,
}

/// Acknowledgment returned by `LocalStore::add_commits`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAck {
    /// Refs that were written (duplicates excluded).
    pub refs: Vec<CommitRef>,
    /// Highest local sequence number assigned to the batch.
    pub sync_id: LocalSyncId,
}

/// The local store's remote-sync metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSyncInfo {
    /// Stable identity of this store.
    pub store_id: StoreId,
    /// Last cursor acknowledged by the remote, if any sync happened.
    pub last_sync_cursor: Option<SyncCursor>,
}

/// Events pushed by the local store to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Newly visible commits (own or peer).
    Commits(CommitsEvent),
    /// A local save was acknowledged.
    Ack {
        /// Refs covered by the save.
        refs: Vec<CommitRef>,
        /// Highest assigned local sequence number.
        sync_id: LocalSyncId,
    },
    /// Initial replay is complete.
    Ready,
    /// Remote-facing state, proxied from the current leader.
    RemoteState(RemoteStateUpdate),
    /// A store-side failure.
    Error {
        /// Human-readable description.
        message: String,
        /// Whether the store is unusable from now on.
        fatal: bool,
    },
}

/// Transient per-client annotation propagated outside the commit DAG.
///
/// Never persisted; carries whatever the host application wants other
/// clients to see (cursor position, selection, user status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// The user behind the client.
    pub user_id: UserId,
    /// The client the record describes.
    pub client_id: ClientId,
    /// The commit the client currently has checked out, if known.
    pub current_ref: Option<CommitRef>,
    /// Opaque host-defined payload.
    pub presence: Option<serde_json::Value>,
}

/// A presence change, clock-guarded so stale updates lose.
///
/// `record: None` means the client left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// The client the update is about.
    pub client_id: ClientId,
    /// New state, or `None` when the client disconnected.
    pub record: Option<PresenceRecord>,
    /// Monotonic per-client clock; updates with an older clock are
    /// discarded.
    pub clock: u64,
}
