//! The local store: per-machine persistent sink for commits.
//!
//! [`LocalStore`] is the persistence seam. The reference implementation
//! here keeps everything in memory: one [`MemoryStoreBackend`] per
//! origin (machine), one command task per document, handles per client.
//! Every operation is serialized through the document's command task, so
//! concurrent callers observe a total order regardless of which handle
//! they hold — the FIFO is explicit, not inherited from an event loop.
//!
//! The log is append-only. Commits are assigned strictly increasing
//! [`LocalSyncId`]s; the only mutable per-row datum is the remote
//! cursor, which transitions from unset to set when the remote
//! acknowledges the commit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deltasync_types::{
    ClientId, Commit, CommitRef, CommitShapeError, CommitsEvent, DocId, LocalSyncId,
    RemoteSyncInfo, StoreAck, StoreEvent, StoreId, SyncCursor, SyncError, UserId,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastBus, BroadcastMessage};

/// Commits per outbound batch when streaming to the remote.
pub const REMOTE_BATCH_SIZE: usize = 5;

/// Buffered store events per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Local store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store (or its document) has been shut down or deleted.
    #[error("store is shut down")]
    Shutdown,

    /// A commit referenced a parent that is not in the store.
    #[error("commit {commit} references missing parent {parent}")]
    MissingParent {
        /// The rejected commit.
        commit: CommitRef,
        /// The absent parent.
        parent: CommitRef,
    },

    /// A commit's parent fields are malformed.
    #[error("malformed commit: {0}")]
    Malformed(#[from] CommitShapeError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Shutdown => SyncError::Shutdown,
            other => SyncError::Storage(other.to_string()),
        }
    }
}

/// Interface to a per-machine commit sink shared by co-resident clients.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Append commits. Idempotent on ref: duplicates are silently
    /// ignored, except that a duplicate carrying `remote_sync_id` is
    /// treated as an acknowledgment of the existing row.
    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        remote_sync_id: Option<SyncCursor>,
    ) -> Result<StoreAck, StoreError>;

    /// Mark pre-existing commits as remote-synced without re-inserting.
    async fn acknowledge_commits(
        &self,
        refs: Vec<CommitRef>,
        remote_sync_id: SyncCursor,
    ) -> Result<(), StoreError>;

    /// All commits with a local sequence number greater than `since`,
    /// in insertion order.
    async fn local_commits_since(
        &self,
        since: Option<LocalSyncId>,
    ) -> Result<CommitsEvent, StoreError>;

    /// The store's stable identity and last acknowledged remote cursor.
    async fn remote_sync_info(&self) -> Result<RemoteSyncInfo, StoreError>;

    /// The oldest commits not yet acknowledged by the remote, up to
    /// `limit`. Repeated calls yield the same commits until they are
    /// acknowledged, which is what re-ships them after a reconnect.
    async fn unsynced_commits(&self, limit: usize) -> Result<Vec<Commit>, StoreError>;

    /// Subscribe to store events (peer commits, acks, remote state).
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Release this handle. The shared backing state survives for other
    /// clients; only this handle's event stream stops.
    async fn shutdown(&self) -> Result<(), StoreError>;
}

/// One commit row in the append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCommit {
    /// The immutable commit.
    pub commit: Commit,
    /// Position in the log.
    pub local_sync_id: LocalSyncId,
    /// Remote cursor; `None` until the remote acknowledges the commit.
    pub remote_sync_id: Option<SyncCursor>,
}

enum StoreCommand {
    AddCommits {
        commits: Vec<Commit>,
        remote_sync_id: Option<SyncCursor>,
        from: ClientId,
        reply: oneshot::Sender<Result<StoreAck, StoreError>>,
    },
    Acknowledge {
        refs: Vec<CommitRef>,
        remote_sync_id: SyncCursor,
        reply: oneshot::Sender<()>,
    },
    CommitsSince {
        since: Option<LocalSyncId>,
        reply: oneshot::Sender<CommitsEvent>,
    },
    CommitsByRefs {
        refs: Vec<CommitRef>,
        reply: oneshot::Sender<Vec<Commit>>,
    },
    SyncInfo {
        reply: oneshot::Sender<RemoteSyncInfo>,
    },
    Unsynced {
        limit: usize,
        reply: oneshot::Sender<Vec<Commit>>,
    },
    Rows {
        reply: oneshot::Sender<Vec<StoredCommit>>,
    },
    Heads {
        reply: oneshot::Sender<Vec<CommitRef>>,
    },
    ResetRemoteSyncData {
        reply: oneshot::Sender<()>,
    },
    Close,
}

/// In-memory state of one document's log.
struct DocState {
    rows: Vec<StoredCommit>,
    by_ref: HashMap<CommitRef, usize>,
    heads: BTreeSet<CommitRef>,
    remotes: Option<RemoteSyncInfo>,
    next_sync_id: LocalSyncId,
}

impl DocState {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            by_ref: HashMap::new(),
            heads: BTreeSet::new(),
            remotes: None,
            next_sync_id: LocalSyncId::new(1),
        }
    }

    fn last_sync_id(&self) -> LocalSyncId {
        self.rows
            .last()
            .map(|r| r.local_sync_id)
            .unwrap_or_default()
    }

    fn bump_cursor(&mut self, cursor: &SyncCursor) {
        let info = self.remotes.get_or_insert_with(|| RemoteSyncInfo {
            store_id: StoreId::random(),
            last_sync_cursor: None,
        });
        match &info.last_sync_cursor {
            Some(existing) if existing >= cursor => {}
            _ => info.last_sync_cursor = Some(cursor.clone()),
        }
    }

    fn add_commits(
        &mut self,
        commits: Vec<Commit>,
        remote_sync_id: Option<SyncCursor>,
    ) -> Result<(StoreAck, Vec<CommitRef>), StoreError> {
        // Validate the whole batch before touching state; parents may
        // be satisfied by earlier commits in the same batch.
        let mut incoming: HashSet<&CommitRef> = HashSet::new();
        for commit in &commits {
            commit.validate()?;
            for parent in commit.parents() {
                if !self.by_ref.contains_key(parent) && !incoming.contains(parent) {
                    return Err(StoreError::MissingParent {
                        commit: commit.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
            incoming.insert(&commit.id);
        }

        let mut acked_refs = Vec::with_capacity(commits.len());
        let mut new_refs = Vec::new();
        for commit in commits {
            acked_refs.push(commit.id.clone());
            if let Some(&row) = self.by_ref.get(&commit.id) {
                // Re-inserting a known ref with a cursor is an ack, not
                // a duplicate error.
                if let Some(cursor) = &remote_sync_id {
                    self.rows[row].remote_sync_id = Some(cursor.clone());
                }
                continue;
            }
            let id = commit.id.clone();
            for parent in commit.parents() {
                self.heads.remove(parent);
            }
            self.heads.insert(id.clone());
            self.by_ref.insert(id.clone(), self.rows.len());
            self.rows.push(StoredCommit {
                commit,
                local_sync_id: self.next_sync_id,
                remote_sync_id: remote_sync_id.clone(),
            });
            self.next_sync_id = self.next_sync_id.next();
            new_refs.push(id);
        }
        if let Some(cursor) = &remote_sync_id {
            self.bump_cursor(cursor);
        }
        Ok((
            StoreAck {
                refs: acked_refs,
                sync_id: self.last_sync_id(),
            },
            new_refs,
        ))
    }

    fn acknowledge(&mut self, refs: &[CommitRef], cursor: &SyncCursor) {
        for r in refs {
            if let Some(&row) = self.by_ref.get(r) {
                self.rows[row].remote_sync_id = Some(cursor.clone());
            }
        }
        self.bump_cursor(cursor);
    }

    fn commits_since(&self, since: Option<LocalSyncId>) -> CommitsEvent {
        let commits = self
            .rows
            .iter()
            .filter(|r| since.map_or(true, |s| r.local_sync_id > s))
            .map(|r| r.commit.clone())
            .collect();
        CommitsEvent {
            commits,
            sync_id: self.last_sync_id(),
        }
    }

    fn sync_info(&mut self) -> RemoteSyncInfo {
        self.remotes
            .get_or_insert_with(|| RemoteSyncInfo {
                store_id: StoreId::random(),
                last_sync_cursor: None,
            })
            .clone()
    }
}

async fn run_doc_task(
    doc_id: DocId,
    bus: BroadcastBus,
    mut rx: mpsc::UnboundedReceiver<StoreCommand>,
) {
    let mut state = DocState::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::AddCommits {
                commits,
                remote_sync_id,
                from,
                reply,
            } => {
                let result = state.add_commits(commits, remote_sync_id);
                match result {
                    Ok((ack, new_refs)) => {
                        let sync_id = ack.sync_id;
                        let _ = reply.send(Ok(ack));
                        if !new_refs.is_empty() {
                            bus.publish(BroadcastMessage::CommitRefs {
                                refs: new_refs,
                                sync_id,
                                from,
                            });
                        }
                    }
                    Err(err) => {
                        tracing::warn!("store {}: rejected batch: {}", doc_id, err);
                        let _ = reply.send(Err(err));
                    }
                }
            }
            StoreCommand::Acknowledge {
                refs,
                remote_sync_id,
                reply,
            } => {
                state.acknowledge(&refs, &remote_sync_id);
                let _ = reply.send(());
            }
            StoreCommand::CommitsSince { since, reply } => {
                let _ = reply.send(state.commits_since(since));
            }
            StoreCommand::CommitsByRefs { refs, reply } => {
                let commits = refs
                    .iter()
                    .filter_map(|r| state.by_ref.get(r))
                    .map(|&row| state.rows[row].commit.clone())
                    .collect();
                let _ = reply.send(commits);
            }
            StoreCommand::SyncInfo { reply } => {
                let _ = reply.send(state.sync_info());
            }
            StoreCommand::Unsynced { limit, reply } => {
                let commits = state
                    .rows
                    .iter()
                    .filter(|r| r.remote_sync_id.is_none())
                    .take(limit)
                    .map(|r| r.commit.clone())
                    .collect();
                let _ = reply.send(commits);
            }
            StoreCommand::Rows { reply } => {
                let _ = reply.send(state.rows.clone());
            }
            StoreCommand::Heads { reply } => {
                let _ = reply.send(state.heads.iter().cloned().collect());
            }
            StoreCommand::ResetRemoteSyncData { reply } => {
                state.remotes = None;
                for row in &mut state.rows {
                    row.remote_sync_id = None;
                }
                let _ = reply.send(());
            }
            StoreCommand::Close => break,
        }
    }
}

struct DocEntry {
    cmd_tx: mpsc::UnboundedSender<StoreCommand>,
    bus: BroadcastBus,
    task: JoinHandle<()>,
}

/// One origin's store: spawns a command task per document and hands out
/// per-client [`MemoryLocalStore`] handles that share it.
#[derive(Clone)]
pub struct MemoryStoreBackend {
    docs: Arc<Mutex<HashMap<DocId, DocEntry>>>,
}

impl MemoryStoreBackend {
    /// Create an empty origin.
    pub fn new() -> Self {
        Self {
            docs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, doc_id: &DocId) -> (mpsc::UnboundedSender<StoreCommand>, BroadcastBus) {
        let mut docs = self.docs.lock().unwrap();
        let entry = docs.entry(doc_id.clone()).or_insert_with(|| {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let bus = BroadcastBus::new();
            let task = tokio::spawn(run_doc_task(doc_id.clone(), bus.clone(), cmd_rx));
            DocEntry { cmd_tx, bus, task }
        });
        (entry.cmd_tx.clone(), entry.bus.clone())
    }

    /// The broadcast bus shared by all clients of a document.
    pub fn bus(&self, doc_id: &DocId) -> BroadcastBus {
        self.entry(doc_id).1
    }

    /// Open a per-client handle onto a document's store.
    pub fn open(&self, doc_id: &DocId, user_id: &UserId, client_id: ClientId) -> MemoryLocalStore {
        let (cmd_tx, bus) = self.entry(doc_id);
        MemoryLocalStore::new(doc_id.clone(), user_id.clone(), client_id, cmd_tx, bus)
    }

    /// Raw rows of a document's log, for inspection and tests.
    pub async fn commit_rows(&self, doc_id: &DocId) -> Result<Vec<StoredCommit>, StoreError> {
        let (cmd_tx, _) = self.entry(doc_id);
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(StoreCommand::Rows { reply })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// The heads table: commits with no children in the log, in
    /// lexicographic ref order.
    pub async fn heads(&self, doc_id: &DocId) -> Result<Vec<CommitRef>, StoreError> {
        let (cmd_tx, _) = self.entry(doc_id);
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(StoreCommand::Heads { reply })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Close all handles to a document and discard its persisted state.
    pub async fn delete_doc_database(&self, doc_id: &DocId) -> Result<(), StoreError> {
        let entry = self.docs.lock().unwrap().remove(doc_id);
        if let Some(entry) = entry {
            let _ = entry.cmd_tx.send(StoreCommand::Close);
            let _ = entry.task.await;
        }
        Ok(())
    }

    /// Clear the `remotes` record and every commit's remote cursor,
    /// forcing a full re-push on the next leader connection.
    pub async fn reset_doc_remote_sync_data(&self, doc_id: &DocId) -> Result<(), StoreError> {
        let (cmd_tx, _) = self.entry(doc_id);
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(StoreCommand::ResetRemoteSyncData { reply })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }
}

impl Default for MemoryStoreBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client handle onto a shared in-memory document store.
pub struct MemoryLocalStore {
    doc_id: DocId,
    user_id: UserId,
    client_id: ClientId,
    cmd_tx: mpsc::UnboundedSender<StoreCommand>,
    events_tx: broadcast::Sender<StoreEvent>,
    listener: JoinHandle<()>,
    closed: AtomicBool,
}

impl MemoryLocalStore {
    fn new(
        doc_id: DocId,
        user_id: UserId,
        client_id: ClientId,
        cmd_tx: mpsc::UnboundedSender<StoreCommand>,
        bus: BroadcastBus,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let listener = tokio::spawn(run_event_listener(
            bus.subscribe(),
            cmd_tx.clone(),
            events_tx.clone(),
        ));
        let store = Self {
            doc_id,
            user_id,
            client_id,
            cmd_tx,
            events_tx,
            listener,
            closed: AtomicBool::new(false),
        };
        let _ = store.events_tx.send(StoreEvent::Ready);
        store
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }

    /// The document this handle is bound to.
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// The user this handle was opened for.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

/// Translates bus traffic into this handle's [`StoreEvent`] stream:
/// commit notifications are hydrated into full commits by asking the
/// command task, remote-state rebroadcasts pass through.
async fn run_event_listener(
    mut bus_rx: broadcast::Receiver<BroadcastMessage>,
    cmd_tx: mpsc::UnboundedSender<StoreCommand>,
    events_tx: broadcast::Sender<StoreEvent>,
) {
    loop {
        match bus_rx.recv().await {
            Ok(BroadcastMessage::CommitRefs { refs, sync_id, .. }) => {
                let (reply, rx) = oneshot::channel();
                if cmd_tx
                    .send(StoreCommand::CommitsByRefs { refs, reply })
                    .is_err()
                {
                    break;
                }
                match rx.await {
                    Ok(commits) if !commits.is_empty() => {
                        let _ = events_tx.send(StoreEvent::Commits(CommitsEvent {
                            commits,
                            sync_id,
                        }));
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            Ok(BroadcastMessage::RemoteState { state, .. }) => {
                let _ = events_tx.send(StoreEvent::RemoteState(state));
            }
            // Presence and election traffic is consumed straight off
            // the bus by the engine, not through the store.
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("store event listener lagged, skipped {}", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        remote_sync_id: Option<SyncCursor>,
    ) -> Result<StoreAck, StoreError> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::AddCommits {
                commits,
                remote_sync_id,
                from: self.client_id,
                reply,
            })
            .map_err(|_| StoreError::Shutdown)?;
        let ack = rx.await.map_err(|_| StoreError::Shutdown)??;
        let _ = self.events_tx.send(StoreEvent::Ack {
            refs: ack.refs.clone(),
            sync_id: ack.sync_id,
        });
        Ok(ack)
    }

    async fn acknowledge_commits(
        &self,
        refs: Vec<CommitRef>,
        remote_sync_id: SyncCursor,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::Acknowledge {
                refs,
                remote_sync_id,
                reply,
            })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    async fn local_commits_since(
        &self,
        since: Option<LocalSyncId>,
    ) -> Result<CommitsEvent, StoreError> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::CommitsSince { since, reply })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    async fn remote_sync_info(&self) -> Result<RemoteSyncInfo, StoreError> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::SyncInfo { reply })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    async fn unsynced_commits(&self, limit: usize) -> Result<Vec<Commit>, StoreError> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StoreCommand::Unsynced { limit, reply })
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        self.listener.abort();
        Ok(())
    }
}

impl Drop for MemoryLocalStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MemoryStoreBackend, DocId, UserId, ClientId) {
        (
            MemoryStoreBackend::new(),
            DocId::new("doc-1"),
            UserId::new("u"),
            ClientId::random(),
        )
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

    #[tokio::test]
    async fn add_commits_assigns_increasing_sync_ids() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store.add_commits(vec![root("r0")], None).await.unwrap();
        store
            .add_commits(vec![edit("e1", "r0"), edit("e2", "e1")], None)
            .await
            .unwrap();

        let rows = backend.commit_rows(&doc).await.unwrap();
        let ids: Vec<u64> = rows.iter().map(|r| r.local_sync_id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn duplicate_ingest_is_idempotent() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store
            .add_commits(vec![root("r0"), edit("e1", "r0")], None)
            .await
            .unwrap();
        store
            .add_commits(vec![root("r0"), edit("e1", "r0")], None)
            .await
            .unwrap();

        let rows = backend.commit_rows(&doc).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].local_sync_id.value(), 2);
    }

    #[tokio::test]
    async fn missing_parent_rejects_whole_batch() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        let err = store
            .add_commits(vec![edit("e1", "ghost")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { .. }));
        assert!(backend.commit_rows(&doc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parents_may_arrive_in_same_batch() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store
            .add_commits(vec![root("r0"), edit("e1", "r0")], None)
            .await
            .unwrap();
        assert_eq!(backend.commit_rows(&doc).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heads_collapse_as_children_arrive() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store.add_commits(vec![root("r0")], None).await.unwrap();
        assert_eq!(backend.heads(&doc).await.unwrap(), vec![CommitRef::new("r0")]);

        store
            .add_commits(vec![edit("a1", "r0"), edit("b1", "r0")], None)
            .await
            .unwrap();
        assert_eq!(
            backend.heads(&doc).await.unwrap(),
            vec![CommitRef::new("a1"), CommitRef::new("b1")]
        );
    }

    #[tokio::test]
    async fn commits_since_filters_by_sync_id() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store
            .add_commits(vec![root("r0"), edit("e1", "r0"), edit("e2", "e1")], None)
            .await
            .unwrap();

        let all = store.local_commits_since(None).await.unwrap();
        assert_eq!(all.commits.len(), 3);
        assert_eq!(all.sync_id.value(), 3);

        let tail = store
            .local_commits_since(Some(LocalSyncId::new(1)))
            .await
            .unwrap();
        assert_eq!(tail.commits.len(), 2);
        assert_eq!(tail.commits[0].id, CommitRef::new("e1"));
    }

    #[tokio::test]
    async fn remote_cursor_marks_commits_synced() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store
            .add_commits(vec![root("r0")], Some(SyncCursor::new("0000000005")))
            .await
            .unwrap();

        let rows = backend.commit_rows(&doc).await.unwrap();
        assert_eq!(rows[0].remote_sync_id, Some(SyncCursor::new("0000000005")));
        let info = store.remote_sync_info().await.unwrap();
        assert_eq!(info.last_sync_cursor, Some(SyncCursor::new("0000000005")));
    }

    #[tokio::test]
    async fn reinsert_with_cursor_acts_as_ack() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store.add_commits(vec![root("r0")], None).await.unwrap();
        store
            .add_commits(vec![root("r0")], Some(SyncCursor::new("0000000009")))
            .await
            .unwrap();

        let rows = backend.commit_rows(&doc).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].remote_sync_id, Some(SyncCursor::new("0000000009")));
    }

    #[tokio::test]
    async fn acknowledge_commits_sets_cursor_without_reinserting() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store
            .add_commits(vec![root("r0"), edit("e1", "r0")], None)
            .await
            .unwrap();
        store
            .acknowledge_commits(
                vec![CommitRef::new("r0"), CommitRef::new("e1")],
                SyncCursor::new("0000000002"),
            )
            .await
            .unwrap();

        let rows = backend.commit_rows(&doc).await.unwrap();
        assert!(rows.iter().all(|r| r.remote_sync_id.is_some()));
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store.add_commits(vec![root("r0")], None).await.unwrap();
        store
            .acknowledge_commits(vec![CommitRef::new("r0")], SyncCursor::new("0000000009"))
            .await
            .unwrap();
        store
            .acknowledge_commits(vec![CommitRef::new("r0")], SyncCursor::new("0000000004"))
            .await
            .unwrap();

        let info = store.remote_sync_info().await.unwrap();
        assert_eq!(info.last_sync_cursor, Some(SyncCursor::new("0000000009")));
    }

    #[tokio::test]
    async fn unsynced_commits_respects_limit_and_order() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        let mut batch = vec![root("r0")];
        let mut prev = "r0".to_string();
        for i in 1..8 {
            let id = format!("e{i}");
            batch.push(edit(&id, &prev));
            prev = id;
        }
        store.add_commits(batch, None).await.unwrap();

        let first = store.unsynced_commits(5).await.unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(first[0].id, CommitRef::new("r0"));

        // Acknowledge the first batch; the next query starts after it.
        store
            .acknowledge_commits(
                first.iter().map(|c| c.id.clone()).collect(),
                SyncCursor::new("0000000005"),
            )
            .await
            .unwrap();
        let second = store.unsynced_commits(5).await.unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].id, CommitRef::new("e5"));
    }

    #[tokio::test]
    async fn peer_handles_receive_commit_events() {
        let (backend, doc, user, _) = setup();
        let writer = backend.open(&doc, &user, ClientId::random());
        let reader = backend.open(&doc, &user, ClientId::random());
        let mut events = reader.subscribe();

        writer
            .add_commits(vec![root("r0")], None)
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                StoreEvent::Commits(ev) => {
                    assert_eq!(ev.commits.len(), 1);
                    assert_eq!(ev.commits[0].id, CommitRef::new("r0"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn reset_clears_remote_sync_data() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        store
            .add_commits(vec![root("r0")], Some(SyncCursor::new("0000000001")))
            .await
            .unwrap();
        backend.reset_doc_remote_sync_data(&doc).await.unwrap();

        let rows = backend.commit_rows(&doc).await.unwrap();
        assert!(rows.iter().all(|r| r.remote_sync_id.is_none()));
        let info = store.remote_sync_info().await.unwrap();
        assert_eq!(info.last_sync_cursor, None);

        // Everything is unsynced again.
        assert_eq!(store.unsynced_commits(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_doc_database_closes_handles() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);
        store.add_commits(vec![root("r0")], None).await.unwrap();

        backend.delete_doc_database(&doc).await.unwrap();

        let err = store.add_commits(vec![root("r1")], None).await.unwrap_err();
        assert_eq!(err, StoreError::Shutdown);
    }

    #[tokio::test]
    async fn shutdown_handle_fails_fast() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);
        store.shutdown().await.unwrap();

        let err = store.add_commits(vec![root("r0")], None).await.unwrap_err();
        assert_eq!(err, StoreError::Shutdown);
    }

    #[tokio::test]
    async fn store_id_is_stable_across_calls() {
        let (backend, doc, user, client) = setup();
        let store = backend.open(&doc, &user, client);

        let a = store.remote_sync_info().await.unwrap();
        let b = store.remote_sync_info().await.unwrap();
        assert_eq!(a.store_id, b.store_id);
    }
}
