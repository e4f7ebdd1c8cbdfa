//! The per-client sync engine.
//!
//! One engine per client: it owns the working document, turns edits into
//! content-addressed commits, reconciles divergent heads with the
//! differ's three-way merge, flushes to the local store, and reports
//! progress on the five sync-status axes.
//!
//! Concurrency model: all mutable state sits behind one `std` mutex and
//! critical sections never hold it across an await. Edits are applied
//! synchronously; everything asynchronous (flushing, draining store
//! events, presence, leadership) runs on background tasks that stop on
//! the shutdown signal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deltasync_core::{
    CommitDoc, CommitGraph, Differ, Inserted, MergeResult, NetworkSettings, StatusTracker,
};
use deltasync_types::{
    ClientId, Commit, CommitRef, DocId, LocalRead, LocalSave, PresenceRecord, PresenceUpdate,
    StoreEvent, SyncError, SyncStatus, UserId,
};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastBus, BroadcastMessage, ElectionMessage};
use crate::leader;
use crate::presence::PresenceTable;
use crate::remote::RemoteFactory;
use crate::store::LocalStore;

/// Everything an engine needs at construction time.
///
/// The store and the bus are injected — the engine owns neither — so
/// several engines can share one origin, and tests can substitute any
/// implementation of the seams.
pub struct EngineOptions<D: Differ> {
    /// Document-type-specific algorithms.
    pub differ: D,
    /// The document to sync.
    pub doc_id: DocId,
    /// The editing user.
    pub user_id: UserId,
    /// This client's identity.
    pub client_id: ClientId,
    /// Handle onto the shared local store.
    pub store: Arc<dyn LocalStore>,
    /// The same-origin broadcast bus for this document.
    pub bus: BroadcastBus,
    /// Remote factory; `None` disables remote sync and leader election.
    pub remote: Option<Arc<dyn RemoteFactory>>,
    /// Network tuning knobs.
    pub settings: NetworkSettings,
    /// Delay between the first buffered edit and its flush, in
    /// milliseconds. Zero flushes on the next task-scheduler turn.
    pub buffer_ms: u64,
}

pub(crate) struct EngineShared<D: Differ> {
    pub(crate) differ: D,
    pub(crate) doc_id: DocId,
    pub(crate) user_id: UserId,
    pub(crate) client_id: ClientId,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) bus: BroadcastBus,
    pub(crate) remote_factory: Option<Arc<dyn RemoteFactory>>,
    pub(crate) settings: NetworkSettings,
    buffer_ms: u64,
    state: Mutex<EngineState<D>>,
    doc_tx: watch::Sender<Option<D::Doc>>,
    status_tx: watch::Sender<SyncStatus>,
    clients_tx: watch::Sender<Vec<PresenceRecord>>,
    flush_notify: Notify,
    pub(crate) outbound_notify: Notify,
    pub(crate) shutdown_flag: AtomicBool,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) is_leader: AtomicBool,
}

struct EngineState<D: Differ> {
    graph: CommitGraph,
    head: Option<CommitRef>,
    saved_doc: Option<CommitDoc<D::Doc>>,
    pending: Vec<Commit>,
    retrying: bool,
    save_failed: bool,
    doc_cache: HashMap<CommitRef, CommitDoc<D::Doc>>,
    temp_merges: HashMap<(CommitRef, CommitRef), CommitDoc<D::Doc>>,
    merge_errors: HashSet<(CommitRef, CommitRef)>,
    presence: PresenceTable,
    presence_clock: u64,
    status: StatusTracker,
}

impl<D: Differ> EngineState<D> {
    fn new(client_id: ClientId) -> Self {
        Self {
            graph: CommitGraph::new(),
            head: None,
            saved_doc: None,
            pending: Vec::new(),
            retrying: false,
            save_failed: false,
            doc_cache: HashMap::new(),
            temp_merges: HashMap::new(),
            merge_errors: HashSet::new(),
            presence: PresenceTable::new(client_id),
            presence_clock: 0,
            status: StatusTracker::new(),
        }
    }
}

/// The per-client sync engine.
pub struct SyncEngine<D: Differ> {
    shared: Arc<EngineShared<D>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Differ> SyncEngine<D> {
    /// Construct an engine: replay the local store, rebuild the graph,
    /// reconcile silently, run `migrate` on the loaded document, then
    /// go live and start the background tasks.
    pub async fn load(opts: EngineOptions<D>) -> Result<Self, SyncError> {
        let shared = Arc::new(EngineShared {
            differ: opts.differ,
            doc_id: opts.doc_id,
            user_id: opts.user_id,
            client_id: opts.client_id,
            store: opts.store,
            bus: opts.bus,
            remote_factory: opts.remote,
            settings: opts.settings,
            buffer_ms: opts.buffer_ms,
            state: Mutex::new(EngineState::new(opts.client_id)),
            doc_tx: watch::channel(None).0,
            status_tx: watch::channel(SyncStatus::default()).0,
            clients_tx: watch::channel(Vec::new()).0,
            flush_notify: Notify::new(),
            outbound_notify: Notify::new(),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx: watch::channel(false).0,
            is_leader: AtomicBool::new(false),
        });

        // Subscribe to store events before the replay so commits that
        // land in between are not missed; replaying them twice is a
        // no-op.
        let store_events = shared.store.subscribe();

        // Initial replay. No subscriber can exist yet, so the merge
        // loop below runs silently.
        let replay = shared.store.local_commits_since(None).await?;
        {
            let mut state = shared.state.lock().unwrap();
            for commit in replay.commits {
                if let Err(err) = state.graph.insert(commit) {
                    tracing::warn!("store replay skipped commit: {}", err);
                }
            }
            reconcile(&shared, &mut state);
            publish_doc(&shared, &mut state);
            let snapshot = state.status.set_local_read(LocalRead::Ready);
            publish_status(&shared, snapshot);
        }

        let engine = Self {
            shared: Arc::clone(&shared),
            tasks: Mutex::new(Vec::new()),
        };

        // Migration hook: rewrite an older persisted doc as a fresh
        // commit if the differ changes it.
        let migration = {
            let state = shared.state.lock().unwrap();
            state.saved_doc.as_ref().map(|cd| {
                shared
                    .differ
                    .migrate(cd.doc.clone(), cd.metadata.clone())
            })
        };
        if let Some((migrated, metadata)) = migration {
            engine.update_doc(migrated, metadata)?;
        }

        let mut tasks = engine.tasks.lock().unwrap();
        tasks.push(tokio::spawn(run_flush_task(Arc::clone(&shared))));
        tasks.push(tokio::spawn(run_store_events_task(
            Arc::clone(&shared),
            store_events,
        )));
        tasks.push(tokio::spawn(run_bus_task(Arc::clone(&shared))));
        if shared.remote_factory.is_some() {
            tasks.push(tokio::spawn(leader::run_leader_task(Arc::clone(&shared))));
        }
        drop(tasks);
        Ok(engine)
    }

    fn check_open(&self) -> Result<(), SyncError> {
        if self.shared.shutdown_flag.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }

    /// Apply an edit synchronously.
    ///
    /// Diffs the new document against the last committed state; when the
    /// differ reports a change, appends a commit to the pending buffer,
    /// notifies document subscribers, and schedules a flush. Returns the
    /// new commit's ref, or `None` when nothing changed.
    pub fn update_doc(
        &self,
        new_doc: D::Doc,
        edit_metadata: Vec<u8>,
    ) -> Result<Option<CommitRef>, SyncError> {
        self.update_doc_with_presence(new_doc, edit_metadata, None)
    }

    /// [`update_doc`](Self::update_doc) plus a presence update in the
    /// same turn.
    pub fn update_doc_with_presence(
        &self,
        new_doc: D::Doc,
        edit_metadata: Vec<u8>,
        presence: Option<serde_json::Value>,
    ) -> Result<Option<CommitRef>, SyncError> {
        self.check_open()?;
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();

        let delta = shared
            .differ
            .diff(state.saved_doc.as_ref().map(|cd| &cd.doc), &new_doc);
        let created = match delta {
            None => None,
            Some(delta) => {
                let base = state.head.clone();
                let id = shared.differ.compute_ref(
                    base.as_ref(),
                    None,
                    None,
                    Some(&delta),
                    &edit_metadata,
                );
                let commit = match base {
                    Some(base) => Commit::edit(
                        id.clone(),
                        base,
                        delta,
                        edit_metadata.clone(),
                        shared.user_id.clone(),
                        shared.client_id,
                    ),
                    None => Commit::root(
                        id.clone(),
                        delta,
                        edit_metadata.clone(),
                        shared.user_id.clone(),
                        shared.client_id,
                    ),
                };
                state
                    .graph
                    .insert(commit.clone())
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                let commit_doc = CommitDoc {
                    doc: new_doc.clone(),
                    metadata: edit_metadata,
                };
                state.doc_cache.insert(id.clone(), commit_doc.clone());
                state.head = Some(id.clone());
                state.saved_doc = Some(commit_doc);
                state.pending.push(commit);
                Some(id)
            }
        };

        // Document subscribers fire before the status flips to pending.
        shared.doc_tx.send_if_modified(|current| {
            if current.as_ref() == Some(&new_doc) {
                false
            } else {
                *current = Some(new_doc.clone());
                true
            }
        });
        if created.is_some() {
            let snapshot = state.status.set_local_save(LocalSave::Pending);
            publish_status(shared, snapshot);
            shared.flush_notify.notify_one();
        }
        if presence.is_some() {
            publish_presence(shared, &mut state, presence);
        }
        Ok(created)
    }

    /// Broadcast a presence change without creating a commit.
    pub fn update_presence(&self, presence: Option<serde_json::Value>) -> Result<(), SyncError> {
        self.check_open()?;
        let mut state = self.shared.state.lock().unwrap();
        publish_presence(&self.shared, &mut state, presence);
        Ok(())
    }

    /// Watch the current document. The receiver's `borrow()` holds the
    /// latest value; dropping the receiver unsubscribes.
    pub fn subscribe_doc(&self) -> watch::Receiver<Option<D::Doc>> {
        self.shared.doc_tx.subscribe()
    }

    /// Watch the sync status. Each distinct snapshot is published once.
    pub fn subscribe_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Watch the other clients' presence.
    pub fn subscribe_clients(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.shared.clients_tx.subscribe()
    }

    /// The current document, if any commit exists.
    pub fn doc(&self) -> Option<D::Doc> {
        self.shared.doc_tx.borrow().clone()
    }

    /// The current status snapshot.
    pub fn sync_status(&self) -> SyncStatus {
        *self.shared.status_tx.borrow()
    }

    /// The currently selected head.
    pub fn head(&self) -> Option<CommitRef> {
        self.shared.state.lock().unwrap().head.clone()
    }

    /// The other clients' presence records.
    pub fn clients(&self) -> Vec<PresenceRecord> {
        self.shared.clients_tx.borrow().clone()
    }

    /// Whether this client currently proxies the remote.
    pub fn is_remote_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::SeqCst)
    }

    /// Recompute the document at an arbitrary commit by walking from
    /// the nearest cached ancestor.
    pub fn commit_doc(&self, id: &CommitRef) -> Result<CommitDoc<D::Doc>, SyncError> {
        self.check_open()?;
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        compute_commit_doc(&shared.differ, &mut state, id)
    }

    /// Drain pending work and stop: flushes the buffer, announces the
    /// presence departure, resigns leadership, stops every background
    /// task, and releases the store handle. All later calls fail with
    /// [`SyncError::Shutdown`].
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        if self.shared.shutdown_flag.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }

        // Final flush of anything still buffered.
        flush_once(&self.shared).await;

        // Stop the background tasks before announcing the departure, so
        // the dying leader cannot answer the survivors' new campaign.
        let was_leader = self.shared.is_leader.load(Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        // Presence departure.
        let clock = {
            let mut state = self.shared.state.lock().unwrap();
            state.presence_clock += 1;
            state.presence_clock
        };
        self.shared.bus.publish(BroadcastMessage::Presence {
            update: PresenceUpdate {
                client_id: self.shared.client_id,
                record: None,
                clock,
            },
            local: true,
        });

        // Hand off leadership explicitly so the survivors re-elect
        // without waiting for the heartbeat watchdog.
        if was_leader {
            self.shared
                .bus
                .publish(BroadcastMessage::Election(ElectionMessage::Resign {
                    leader: self.shared.client_id,
                }));
        }

        self.shared.store.shutdown().await?;
        Ok(())
    }
}

fn publish_status<D: Differ>(shared: &EngineShared<D>, snapshot: Option<SyncStatus>) {
    if let Some(snapshot) = snapshot {
        shared.status_tx.send_replace(snapshot);
    }
}

fn publish_presence<D: Differ>(
    shared: &EngineShared<D>,
    state: &mut EngineState<D>,
    presence: Option<serde_json::Value>,
) {
    state.presence_clock += 1;
    let record = PresenceRecord {
        user_id: shared.user_id.clone(),
        client_id: shared.client_id,
        current_ref: state.head.clone(),
        presence,
    };
    shared.bus.publish(BroadcastMessage::Presence {
        update: PresenceUpdate {
            client_id: shared.client_id,
            record: Some(record),
            clock: state.presence_clock,
        },
        local: true,
    });
}

/// Reconstruct the document at `target`, walking back along base
/// parents to the nearest cached ancestor and patching forward.
fn compute_commit_doc<D: Differ>(
    differ: &D,
    state: &mut EngineState<D>,
    target: &CommitRef,
) -> Result<CommitDoc<D::Doc>, SyncError> {
    let mut chain: Vec<Commit> = Vec::new();
    let mut base: Option<CommitDoc<D::Doc>> = None;
    let mut cursor = target.clone();
    loop {
        if let Some(found) = state.doc_cache.get(&cursor) {
            base = Some(found.clone());
            break;
        }
        let commit = state
            .graph
            .get(&cursor)
            .ok_or_else(|| SyncError::Storage(format!("unknown commit {cursor}")))?
            .clone();
        let next = commit.base_ref.clone();
        chain.push(commit);
        match next {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    if chain.is_empty() {
        return Ok(base.expect("cache hit on target"));
    }

    let mut doc = base;
    for commit in chain.iter().rev() {
        let patched = differ
            .patch(doc.as_ref().map(|cd| &cd.doc), &commit.delta)
            .map_err(|e| SyncError::Merge(e.to_string()))?;
        doc = Some(CommitDoc {
            doc: patched,
            metadata: commit.edit_metadata.clone(),
        });
    }
    let doc = doc.expect("non-empty chain produced a document");
    state.doc_cache.insert(target.clone(), doc.clone());
    Ok(doc)
}

/// Materialize both heads and their merge base, then run the differ's
/// three-way merge.
#[allow(clippy::type_complexity)]
fn try_merge<D: Differ>(
    shared: &EngineShared<D>,
    state: &mut EngineState<D>,
    left: &CommitRef,
    right: &CommitRef,
) -> Result<(Option<CommitRef>, CommitDoc<D::Doc>, MergeResult<D::Doc>), SyncError> {
    let base_ref = state
        .graph
        .merge_base(left, right)
        .map_err(|e| SyncError::Storage(e.to_string()))?;
    let base = match &base_ref {
        Some(b) => Some(compute_commit_doc(&shared.differ, state, b)?),
        None => None,
    };
    let left_doc = compute_commit_doc(&shared.differ, state, left)?;
    let right_doc = compute_commit_doc(&shared.differ, state, right)?;
    let result = shared
        .differ
        .merge(base.as_ref(), &left_doc, &right_doc)
        .map_err(|e| SyncError::Merge(e.to_string()))?;
    Ok((base_ref, left_doc, result))
}

/// Reduce the head set by pairwise three-way merges until one head (or
/// an advisory/temp merge, or a recorded merge failure) remains, then
/// refresh the head selection and `saved_doc`.
fn reconcile<D: Differ>(shared: &EngineShared<D>, state: &mut EngineState<D>) -> bool {
    let mut appended = false;
    loop {
        let heads: Vec<CommitRef> = state.graph.heads().iter().cloned().collect();
        if heads.len() <= 1 {
            break;
        }
        let left = heads[0].clone();
        let right = heads[1].clone();
        let pair = (left.clone(), right.clone());
        if state.merge_errors.contains(&pair) {
            break;
        }

        let (base_ref, left_doc, result) = match try_merge(shared, state, &left, &right) {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!("merge of {} + {} failed: {}", left, right, err);
                state.merge_errors.insert(pair);
                let snapshot = state.status.set_local_save(LocalSave::Error);
                publish_status(shared, snapshot);
                break;
            }
        };

        if result.temp {
            state.temp_merges.insert(
                pair,
                CommitDoc {
                    doc: result.doc,
                    metadata: result.metadata,
                },
            );
            break;
        }

        // The merge delta applies to the first parent's document.
        let delta = shared
            .differ
            .diff(Some(&left_doc.doc), &result.doc)
            .or_else(|| shared.differ.diff(None, &result.doc))
            .unwrap_or_default();
        let id = shared.differ.compute_ref(
            Some(&left),
            Some(&right),
            base_ref.as_ref(),
            Some(&delta),
            &result.metadata,
        );
        let commit = Commit::merge(
            id.clone(),
            left,
            right,
            base_ref,
            delta,
            result.metadata.clone(),
            shared.user_id.clone(),
            shared.client_id,
        );
        match state.graph.insert(commit.clone()) {
            Ok(Inserted::New) => {
                state.doc_cache.insert(
                    id,
                    CommitDoc {
                        doc: result.doc,
                        metadata: result.metadata,
                    },
                );
                state.pending.push(commit);
                appended = true;
            }
            Ok(Inserted::Duplicate) | Err(_) => break,
        }
    }

    // Head selection: the single survivor, or the lexicographically
    // first head while an advisory merge or merge failure leaves
    // several.
    state.head = state.graph.heads().iter().next().cloned();
    if let Some(head) = state.head.clone() {
        match compute_commit_doc(&shared.differ, state, &head) {
            Ok(doc) => state.saved_doc = Some(doc),
            Err(err) => {
                tracing::warn!("failed to materialize head {}: {}", head, err);
                let snapshot = state.status.set_local_save(LocalSave::Error);
                publish_status(shared, snapshot);
            }
        }
    }

    // Bound the cache: keep head-adjacent entries only.
    let heads = state.graph.heads().clone();
    state.doc_cache.retain(|id, _| heads.contains(id));
    state
        .temp_merges
        .retain(|(l, r), _| heads.contains(l) && heads.contains(r));

    appended
}

/// The document subscribers should see: the advisory merge of the first
/// head pair while disconnected heads remain, the head doc otherwise.
fn publish_doc<D: Differ>(shared: &EngineShared<D>, state: &mut EngineState<D>) {
    let heads: Vec<CommitRef> = state.graph.heads().iter().cloned().collect();
    let display = if heads.len() >= 2 {
        state
            .temp_merges
            .get(&(heads[0].clone(), heads[1].clone()))
            .map(|cd| cd.doc.clone())
            .or_else(|| state.saved_doc.as_ref().map(|cd| cd.doc.clone()))
    } else {
        state.saved_doc.as_ref().map(|cd| cd.doc.clone())
    };
    let Some(display) = display else { return };
    shared.doc_tx.send_if_modified(|current| {
        if current.as_ref() == Some(&display) {
            false
        } else {
            *current = Some(display.clone());
            true
        }
    });
}

/// Insert externally arrived commits (peer or remote), reconcile, and
/// publish the outcome.
fn ingest_commits<D: Differ>(shared: &Arc<EngineShared<D>>, commits: Vec<Commit>) {
    let mut state = shared.state.lock().unwrap();
    let mut inserted = false;
    for commit in commits {
        match state.graph.insert(commit) {
            Ok(Inserted::New) => inserted = true,
            Ok(Inserted::Duplicate) => {}
            Err(err) => tracing::warn!("dropped commit from store event: {}", err),
        }
    }
    if !inserted {
        return;
    }
    let appended = reconcile(shared, &mut state);
    publish_doc(shared, &mut state);
    if appended {
        let snapshot = state.status.set_local_save(LocalSave::Pending);
        publish_status(shared, snapshot);
        shared.flush_notify.notify_one();
    }
    drop(state);
    shared.outbound_notify.notify_one();
}

/// Write the pending buffer to the local store as one batch.
///
/// Commits stay in the buffer until the store acknowledges them; a
/// failed save is retried exactly once, after which the local-save axis
/// sticks at `error`.
async fn flush_once<D: Differ>(shared: &Arc<EngineShared<D>>) {
    let batch = {
        let mut state = shared.state.lock().unwrap();
        if state.save_failed || state.pending.is_empty() {
            return;
        }
        let snapshot = state.status.set_local_save(LocalSave::Saving);
        publish_status(shared, snapshot);
        state.pending.clone()
    };

    match shared.store.add_commits(batch.clone(), None).await {
        Ok(_ack) => {
            let mut state = shared.state.lock().unwrap();
            let flushed: HashSet<CommitRef> = batch.into_iter().map(|c| c.id).collect();
            state.pending.retain(|c| !flushed.contains(&c.id));
            state.retrying = false;
            let snapshot = if state.pending.is_empty() {
                state.status.set_local_save(LocalSave::Ready)
            } else {
                state.status.set_local_save(LocalSave::Pending)
            };
            publish_status(shared, snapshot);
            let more = !state.pending.is_empty();
            drop(state);
            shared.outbound_notify.notify_one();
            if more {
                shared.flush_notify.notify_one();
            }
        }
        Err(err) => {
            tracing::warn!("local save failed: {}", err);
            let mut state = shared.state.lock().unwrap();
            let snapshot = state.status.set_local_save(LocalSave::Error);
            publish_status(shared, snapshot);
            if state.retrying {
                state.save_failed = true;
            } else {
                state.retrying = true;
                drop(state);
                shared.flush_notify.notify_one();
            }
        }
    }
}

async fn run_flush_task<D: Differ>(shared: Arc<EngineShared<D>>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shared.flush_notify.notified() => {}
            _ = shutdown_rx.changed() => return,
        }
        if shared.buffer_ms > 0 {
            tokio::time::sleep(Duration::from_millis(shared.buffer_ms)).await;
        }
        flush_once(&shared).await;
    }
}

async fn run_store_events_task<D: Differ>(
    shared: Arc<EngineShared<D>>,
    mut events: broadcast::Receiver<StoreEvent>,
) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            event = events.recv() => match event {
                Ok(StoreEvent::Commits(ev)) => ingest_commits(&shared, ev.commits),
                Ok(StoreEvent::RemoteState(update)) => {
                    let mut state = shared.state.lock().unwrap();
                    let snapshot = state.status.adopt_remote_state(update);
                    publish_status(&shared, snapshot);
                }
                Ok(StoreEvent::Error { message, fatal }) => {
                    tracing::warn!("store error (fatal={}): {}", fatal, message);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The bus is lossy; the store is not. Refetch
                    // everything we may have missed.
                    tracing::debug!("store events lagged by {}, resyncing", skipped);
                    if let Ok(ev) = shared.store.local_commits_since(None).await {
                        ingest_commits(&shared, ev.commits);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

async fn run_bus_task<D: Differ>(shared: Arc<EngineShared<D>>) {
    let mut bus_rx = shared.bus.subscribe();
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            msg = bus_rx.recv() => match msg {
                Ok(BroadcastMessage::Presence { update, .. }) => {
                    let mut state = shared.state.lock().unwrap();
                    if state.presence.apply(update) {
                        shared.clients_tx.send_replace(state.presence.records());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
