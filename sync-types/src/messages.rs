//! Wire messages between the leader client and the remote.
//!
//! Messages round-trip through MessagePack; the payloads inside commits
//! stay opaque byte strings end to end.

use serde::{Deserialize, Serialize};

use crate::{
    Commit, CommitRef, PresenceUpdate, RemoteStateUpdate, StoreId, SyncCursor, UserId, WireError,
};

/// A fixed-size batch of commits shipped to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// The commits, oldest first.
    pub commits: Vec<Commit>,
}

impl CommitBatch {
    /// The refs of the batched commits, in order.
    pub fn refs(&self) -> Vec<CommitRef> {
        self.commits.iter().map(|c| c.id.clone()).collect()
    }
}

/// Messages sent from the leader client to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteMessage {
    /// Opening handshake: identifies the store and where it left off.
    Hello {
        /// The connecting user.
        user_id: UserId,
        /// Stable identity of the local store behind this leader.
        store_id: StoreId,
        /// Last cursor this store saw acknowledged, for resumption.
        last_sync_cursor: Option<SyncCursor>,
    },
    /// A batch of commits not yet known to the remote.
    Commits(CommitBatch),
    /// A presence change to fan out to other stores.
    Presence(PresenceUpdate),
    /// Graceful disconnect.
    Bye,
}

/// Events sent from the remote to the leader client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteReply {
    /// The initial snapshot has been fully pushed; the stream is live.
    Ready,
    /// Commits from other stores (or the initial snapshot).
    Commits {
        /// The commits, oldest first.
        commits: Vec<Commit>,
        /// Cursor covering everything up to and including this batch.
        cursor: SyncCursor,
    },
    /// Acknowledgment of an outbound batch.
    Ack {
        /// Refs the remote accepted.
        refs: Vec<CommitRef>,
        /// New cursor for the acknowledged commits.
        cursor: SyncCursor,
    },
    /// A presence change from a client on another store.
    Presence(PresenceUpdate),
    /// Remote-side state, for clients that surface it directly.
    State(RemoteStateUpdate),
    /// A remote-side failure.
    Error {
        /// Human-readable description.
        message: String,
        /// When true the client must not reconnect.
        fatal: bool,
    },
}

impl RemoteMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Encode)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Decode)
    }
}

impl RemoteReply {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Encode)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientId;

    fn sample_commit() -> Commit {
        Commit::root(
            CommitRef::new("abc123"),
            vec![1, 2, 3],
            vec![4, 5],
            UserId::new("u"),
            ClientId::random(),
        )
    }

    #[test]
    fn hello_roundtrip() {
        let msg = RemoteMessage::Hello {
            user_id: UserId::new("alice"),
            store_id: StoreId::random(),
            last_sync_cursor: Some(SyncCursor::new("0000000042")),
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = RemoteMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn commit_batch_roundtrip() {
        let msg = RemoteMessage::Commits(CommitBatch {
            commits: vec![sample_commit()],
        });
        let bytes = msg.to_bytes().unwrap();
        let decoded = RemoteMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn ack_roundtrip() {
        let reply = RemoteReply::Ack {
            refs: vec![CommitRef::new("abc123")],
            cursor: SyncCursor::new("0000000007"),
        };
        let bytes = reply.to_bytes().unwrap();
        let decoded = RemoteReply::from_bytes(&bytes).unwrap();
        assert_eq!(reply, decoded);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(RemoteMessage::from_bytes(&[0xFF, 0x00, 0x13]).is_err());
    }

    #[test]
    fn batch_refs_preserve_order() {
        let a = sample_commit();
        let mut b = sample_commit();
        b.id = CommitRef::new("def456");
        let batch = CommitBatch {
            commits: vec![a.clone(), b.clone()],
        };
        assert_eq!(batch.refs(), vec![a.id, b.id]);
    }
}
