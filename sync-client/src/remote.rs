//! The remote transport seam and an in-memory reference remote.
//!
//! The leader client opens a [`Remote`] through a [`RemoteFactory`] and
//! exchanges MessagePack-encoded envelopes with it: outbound commit
//! batches, inbound snapshot/live batches, acks carrying cursors, and
//! presence fan-out.
//!
//! [`MemoryRemoteBackend`] plays the remote for tests and examples: it
//! assigns zero-padded decimal cursors (so the opaque lexicographic
//! cursor order coincides with assignment order), deduplicates by ref,
//! fans new commits out to other connections, and supports pause/resume
//! plus failure injection to model partitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deltasync_types::{
    Commit, CommitRef, RemoteMessage, RemoteReply, RemoteSyncInfo, SyncCursor, UserId,
};
use thiserror::Error;
use tokio::sync::mpsc;

/// Commits per snapshot chunk pushed to a freshly connected client.
const SNAPSHOT_CHUNK: usize = 5;

/// Remote transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Could not establish a connection; retried with backoff.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection dropped; retried with backoff.
    #[error("connection closed")]
    Closed,

    /// An envelope could not be delivered; retried with backoff.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A malformed envelope crossed the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unrecoverable; the client must stop reconnecting.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Whether reconnection must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// An open connection to the remote.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Ship an envelope to the remote.
    async fn send(&self, msg: RemoteMessage) -> Result<(), RemoteError>;

    /// Wait for the next event from the remote.
    async fn recv(&self) -> Result<RemoteReply, RemoteError>;

    /// Close the connection.
    async fn close(&self);
}

/// Opens connections to a remote on behalf of the current leader.
#[async_trait]
pub trait RemoteFactory: Send + Sync {
    /// Connect and perform the opening handshake. The returned handle
    /// will deliver the initial snapshot (commits after
    /// `info.last_sync_cursor`) followed by [`RemoteReply::Ready`].
    async fn connect(
        &self,
        user_id: &UserId,
        info: &RemoteSyncInfo,
    ) -> Result<Box<dyn Remote>, RemoteError>;
}

struct RemoteInner {
    log: Vec<(SyncCursor, Commit)>,
    by_ref: HashMap<CommitRef, SyncCursor>,
    next_cursor: u64,
    conns: HashMap<u64, mpsc::UnboundedSender<RemoteReply>>,
    next_conn: u64,
    paused: bool,
    fail_next_send: Option<String>,
    batches_received: u64,
}

impl RemoteInner {
    fn assign_cursor(&mut self) -> SyncCursor {
        let cursor = SyncCursor::new(format!("{:010}", self.next_cursor));
        self.next_cursor += 1;
        cursor
    }
}

/// In-memory remote shared by every connection a test hands out.
#[derive(Clone)]
pub struct MemoryRemoteBackend {
    inner: Arc<Mutex<RemoteInner>>,
}

impl MemoryRemoteBackend {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RemoteInner {
                log: Vec::new(),
                by_ref: HashMap::new(),
                next_cursor: 1,
                conns: HashMap::new(),
                next_conn: 1,
                paused: false,
                fail_next_send: None,
                batches_received: 0,
            })),
        }
    }

    /// Sever all current connections and refuse new ones, modeling a
    /// network partition. Stored commits are kept.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.paused = true;
        inner.conns.clear();
    }

    /// Accept connections again.
    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
    }

    /// Make the next `send` on any connection fail with the given
    /// reason.
    pub fn fail_next_send(&self, reason: &str) {
        self.inner.lock().unwrap().fail_next_send = Some(reason.to_string());
    }

    /// Number of commits the remote holds.
    pub fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().log.len()
    }

    /// All commits in cursor order.
    pub fn commits(&self) -> Vec<Commit> {
        let inner = self.inner.lock().unwrap();
        inner.log.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Number of commit batches received over all connections.
    pub fn batches_received(&self) -> u64 {
        self.inner.lock().unwrap().batches_received
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    fn process(&self, conn_id: u64, frame: Vec<u8>) -> Result<(), RemoteError> {
        let msg = RemoteMessage::from_bytes(&frame)
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        match msg {
            RemoteMessage::Hello {
                last_sync_cursor, ..
            } => {
                // Snapshot: everything after the client's cursor, in
                // fixed-size chunks, then Ready.
                let pending: Vec<(SyncCursor, Commit)> = inner
                    .log
                    .iter()
                    .filter(|(cursor, _)| match &last_sync_cursor {
                        Some(after) => cursor > after,
                        None => true,
                    })
                    .cloned()
                    .collect();
                let tx = match inner.conns.get(&conn_id) {
                    Some(tx) => tx.clone(),
                    None => return Err(RemoteError::Closed),
                };
                for chunk in pending.chunks(SNAPSHOT_CHUNK) {
                    let cursor = chunk.last().expect("chunks are non-empty").0.clone();
                    let _ = tx.send(RemoteReply::Commits {
                        commits: chunk.iter().map(|(_, c)| c.clone()).collect(),
                        cursor,
                    });
                }
                let _ = tx.send(RemoteReply::Ready);
            }
            RemoteMessage::Commits(batch) => {
                if batch.commits.is_empty() {
                    return Ok(());
                }
                inner.batches_received += 1;
                let mut new_commits = Vec::new();
                let mut max_cursor: Option<SyncCursor> = None;
                let refs = batch.refs();
                for commit in batch.commits {
                    let cursor = match inner.by_ref.get(&commit.id) {
                        Some(existing) => existing.clone(),
                        None => {
                            let cursor = inner.assign_cursor();
                            inner.by_ref.insert(commit.id.clone(), cursor.clone());
                            inner.log.push((cursor.clone(), commit.clone()));
                            new_commits.push(commit);
                            cursor
                        }
                    };
                    if max_cursor.as_ref().map_or(true, |m| cursor > *m) {
                        max_cursor = Some(cursor);
                    }
                }
                let ack_cursor = max_cursor.expect("ack for empty batch");
                if let Some(tx) = inner.conns.get(&conn_id) {
                    let _ = tx.send(RemoteReply::Ack {
                        refs,
                        cursor: ack_cursor.clone(),
                    });
                }
                if !new_commits.is_empty() {
                    for (&other, tx) in &inner.conns {
                        if other != conn_id {
                            let _ = tx.send(RemoteReply::Commits {
                                commits: new_commits.clone(),
                                cursor: ack_cursor.clone(),
                            });
                        }
                    }
                }
            }
            RemoteMessage::Presence(update) => {
                for (&other, tx) in &inner.conns {
                    if other != conn_id {
                        let _ = tx.send(RemoteReply::Presence(update.clone()));
                    }
                }
            }
            RemoteMessage::Bye => {
                inner.conns.remove(&conn_id);
            }
        }
        Ok(())
    }
}

impl Default for MemoryRemoteBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteFactory for MemoryRemoteBackend {
    async fn connect(
        &self,
        user_id: &UserId,
        info: &RemoteSyncInfo,
    ) -> Result<Box<dyn Remote>, RemoteError> {
        let (conn_id, rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.paused {
                return Err(RemoteError::ConnectionFailed("remote unreachable".into()));
            }
            let conn_id = inner.next_conn;
            inner.next_conn += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            inner.conns.insert(conn_id, tx);
            (conn_id, rx)
        };

        let handle = MemoryRemote {
            backend: self.clone(),
            conn_id,
            rx: tokio::sync::Mutex::new(rx),
        };
        // Opening handshake over the wire format.
        handle
            .send(RemoteMessage::Hello {
                user_id: user_id.clone(),
                store_id: info.store_id,
                last_sync_cursor: info.last_sync_cursor.clone(),
            })
            .await?;
        Ok(Box::new(handle))
    }
}

/// One connection to a [`MemoryRemoteBackend`].
pub struct MemoryRemote {
    backend: MemoryRemoteBackend,
    conn_id: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteReply>>,
}

#[async_trait]
impl Remote for MemoryRemote {
    async fn send(&self, msg: RemoteMessage) -> Result<(), RemoteError> {
        {
            let mut inner = self.backend.inner.lock().unwrap();
            if let Some(reason) = inner.fail_next_send.take() {
                return Err(RemoteError::SendFailed(reason));
            }
            if inner.paused || !inner.conns.contains_key(&self.conn_id) {
                return Err(RemoteError::SendFailed("remote unreachable".into()));
            }
        }
        let frame = msg
            .to_bytes()
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        self.backend.process(self.conn_id, frame)
    }

    async fn recv(&self) -> Result<RemoteReply, RemoteError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(RemoteError::Closed)
    }

    async fn close(&self) {
        let mut inner = self.backend.inner.lock().unwrap();
        inner.conns.remove(&self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltasync_types::{ClientId, CommitBatch, StoreId};

    fn info() -> RemoteSyncInfo {
        RemoteSyncInfo {
            store_id: StoreId::random(),
            last_sync_cursor: None,
        }
    }

    fn user() -> UserId {
        UserId::new("u")
    }

    fn root(id: &str) -> Commit {
        Commit::root(
            CommitRef::new(id),
            vec![1],
            vec![],
            UserId::new("u"),
            ClientId::random(),
        )
    }

    fn edit(id: &str, base: &str) -> Commit {
        Commit::edit(
            CommitRef::new(id),
            CommitRef::new(base),
            vec![1],
            vec![],
            UserId::new("u"),
            ClientId::random(),
        )
    }

    async fn drain_until_ready(remote: &dyn Remote) -> Vec<Commit> {
        let mut commits = Vec::new();
        loop {
            match remote.recv().await.unwrap() {
                RemoteReply::Ready => return commits,
                RemoteReply::Commits { commits: batch, .. } => commits.extend(batch),
                other => panic!("unexpected reply {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn fresh_remote_sends_ready_immediately() {
        let backend = MemoryRemoteBackend::new();
        let remote = backend.connect(&user(), &info()).await.unwrap();
        assert!(matches!(remote.recv().await.unwrap(), RemoteReply::Ready));
    }

    #[tokio::test]
    async fn push_gets_acked_with_increasing_cursor() {
        let backend = MemoryRemoteBackend::new();
        let remote = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(remote.as_ref()).await;

        remote
            .send(RemoteMessage::Commits(CommitBatch {
                commits: vec![root("r0"), edit("e1", "r0")],
            }))
            .await
            .unwrap();

        match remote.recv().await.unwrap() {
            RemoteReply::Ack { refs, cursor } => {
                assert_eq!(refs, vec![CommitRef::new("r0"), CommitRef::new("e1")]);
                assert_eq!(cursor, SyncCursor::new("0000000002"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(backend.commit_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_push_reuses_cursor() {
        let backend = MemoryRemoteBackend::new();
        let remote = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(remote.as_ref()).await;

        let batch = RemoteMessage::Commits(CommitBatch {
            commits: vec![root("r0")],
        });
        remote.send(batch.clone()).await.unwrap();
        let first = remote.recv().await.unwrap();
        remote.send(batch).await.unwrap();
        let second = remote.recv().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.commit_count(), 1);
        assert_eq!(backend.batches_received(), 2);
    }

    #[tokio::test]
    async fn snapshot_resumes_after_cursor() {
        let backend = MemoryRemoteBackend::new();
        let writer = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(writer.as_ref()).await;
        writer
            .send(RemoteMessage::Commits(CommitBatch {
                commits: vec![root("r0"), edit("e1", "r0"), edit("e2", "e1")],
            }))
            .await
            .unwrap();

        // A reader that already has the first commit gets only the rest.
        let resumed = RemoteSyncInfo {
            store_id: StoreId::random(),
            last_sync_cursor: Some(SyncCursor::new("0000000001")),
        };
        let reader = backend.connect(&user(), &resumed).await.unwrap();
        let snapshot = drain_until_ready(reader.as_ref()).await;
        let refs: Vec<_> = snapshot.iter().map(|c| c.id.clone()).collect();
        assert_eq!(refs, vec![CommitRef::new("e1"), CommitRef::new("e2")]);
    }

    #[tokio::test]
    async fn live_batches_fan_out_to_other_connections() {
        let backend = MemoryRemoteBackend::new();
        let a = backend.connect(&user(), &info()).await.unwrap();
        let b = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(a.as_ref()).await;
        drain_until_ready(b.as_ref()).await;

        a.send(RemoteMessage::Commits(CommitBatch {
            commits: vec![root("r0")],
        }))
        .await
        .unwrap();

        match b.recv().await.unwrap() {
            RemoteReply::Commits { commits, .. } => {
                assert_eq!(commits[0].id, CommitRef::new("r0"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn pause_refuses_connections_and_drops_existing() {
        let backend = MemoryRemoteBackend::new();
        let remote = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(remote.as_ref()).await;

        backend.pause();
        assert!(matches!(
            remote
                .send(RemoteMessage::Commits(CommitBatch {
                    commits: vec![root("r0")]
                }))
                .await,
            Err(RemoteError::SendFailed(_))
        ));
        assert!(matches!(
            backend.connect(&user(), &info()).await,
            Err(RemoteError::ConnectionFailed(_))
        ));

        backend.resume();
        let again = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(again.as_ref()).await;
    }

    #[tokio::test]
    async fn fail_next_send_injects_one_failure() {
        let backend = MemoryRemoteBackend::new();
        let remote = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(remote.as_ref()).await;

        backend.fail_next_send("flaky");
        let batch = RemoteMessage::Commits(CommitBatch {
            commits: vec![root("r0")],
        });
        assert!(matches!(
            remote.send(batch.clone()).await,
            Err(RemoteError::SendFailed(_))
        ));
        remote.send(batch).await.unwrap();
    }

    #[tokio::test]
    async fn presence_fans_out_but_not_back() {
        use deltasync_types::PresenceUpdate;

        let backend = MemoryRemoteBackend::new();
        let a = backend.connect(&user(), &info()).await.unwrap();
        let b = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(a.as_ref()).await;
        drain_until_ready(b.as_ref()).await;

        let update = PresenceUpdate {
            client_id: ClientId::random(),
            record: None,
            clock: 1,
        };
        a.send(RemoteMessage::Presence(update.clone())).await.unwrap();

        match b.recv().await.unwrap() {
            RemoteReply::Presence(got) => assert_eq!(got, update),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn bye_disconnects() {
        let backend = MemoryRemoteBackend::new();
        let remote = backend.connect(&user(), &info()).await.unwrap();
        drain_until_ready(remote.as_ref()).await;
        assert_eq!(backend.connection_count(), 1);

        remote.send(RemoteMessage::Bye).await.unwrap();
        assert_eq!(backend.connection_count(), 0);
    }

    #[tokio::test]
    async fn fatal_classification() {
        assert!(RemoteError::Fatal("auth".into()).is_fatal());
        assert!(!RemoteError::Closed.is_fatal());
        assert!(!RemoteError::ConnectionFailed("x".into()).is_fatal());
    }
}
