//! Same-origin broadcast bus.
//!
//! All engines sharing one local store also share one bus per document.
//! It carries commit-arrival notifications (refs only — recipients pull
//! full data from the store), presence updates, election traffic, and
//! the leader's remote-state rebroadcasts.
//!
//! Delivery is best-effort: a receiver that lags far enough behind loses
//! messages. Receivers must stay correct under arbitrary loss, because
//! the store is the source of truth for commits.

use deltasync_types::{ClientId, CommitRef, LocalSyncId, PresenceUpdate, RemoteStateUpdate};
use deltasync_core::Proposal;
use tokio::sync::broadcast;

/// Buffered messages per receiver before the oldest are dropped.
const BUS_CAPACITY: usize = 256;

/// Election traffic between co-resident clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMessage {
    /// A candidacy announcement.
    Proposal(Proposal),
    /// Periodic liveness signal from the current leader.
    Heartbeat {
        /// The heartbeating leader.
        leader: ClientId,
    },
    /// Graceful leadership handoff on shutdown.
    Resign {
        /// The resigning leader.
        leader: ClientId,
    },
}

/// Messages carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    /// Commits became visible in the shared store.
    CommitRefs {
        /// Refs of the new commits; full data is in the store.
        refs: Vec<CommitRef>,
        /// Highest local sequence number covered.
        sync_id: LocalSyncId,
        /// The client that wrote them.
        from: ClientId,
    },
    /// A presence change.
    Presence {
        /// The update itself.
        update: PresenceUpdate,
        /// True when the update originated on this origin (as opposed
        /// to being relayed from the remote); only local updates are
        /// forwarded back out by the leader.
        local: bool,
    },
    /// Leader-election traffic.
    Election(ElectionMessage),
    /// Remote-facing state published by the current leader.
    RemoteState {
        /// The publishing leader.
        from: ClientId,
        /// The leader's remote axes.
        state: RemoteStateUpdate,
    },
}

/// Handle to a same-origin bus. Cheap to clone; all clones share the
/// underlying channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastBus {
    /// Create a new bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a message. A bus with no subscribers swallows it; that
    /// is not an error.
    pub fn publish(&self, msg: BroadcastMessage) {
        let _ = self.tx.send(msg);
    }

    /// Subscribe to all future messages.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}
