//! End-to-end scenarios: real engines over the in-memory store, bus,
//! and remote, exercising convergence, leader election, reconnection,
//! and remote-sync bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use deltasync_client::{
    EngineOptions, MemoryRemoteBackend, MemoryStoreBackend, RemoteFactory, SyncEngine,
};
use deltasync_core::{JsonDiffer, NetworkSettings};
use deltasync_types::{
    ClientId, DocId, RemoteConnect, RemoteSave, UserId,
};
use serde_json::json;

fn fast_settings() -> NetworkSettings {
    NetworkSettings {
        initial_delay_ms: 10,
        reconnect_backoff_multiplier: 2,
        max_reconnect_delay_ms: 100,
        election_timeout_ms: 40,
        heartbeat_interval_ms: 25,
        heartbeat_timeout_ms: 250,
    }
}

async fn client(
    backend: &MemoryStoreBackend,
    remote: Option<Arc<MemoryRemoteBackend>>,
    doc_id: &DocId,
    user: &str,
) -> SyncEngine<JsonDiffer> {
    let user = UserId::new(user);
    let client_id = ClientId::random();
    SyncEngine::load(EngineOptions {
        differ: JsonDiffer::new(),
        doc_id: doc_id.clone(),
        user_id: user.clone(),
        client_id,
        store: Arc::new(backend.open(doc_id, &user, client_id)),
        bus: backend.bus(doc_id),
        remote: remote.map(|r| r as Arc<dyn RemoteFactory>),
        settings: fast_settings(),
        buffer_ms: 0,
    })
    .await
    .unwrap()
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Scenario: a single client makes two edits; the store ends up with a
/// two-commit chain and one head.
#[tokio::test]
async fn single_client_two_edits() {
    let backend = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");
    let engine = client(&backend, None, &doc_id, "alice").await;

    let r0 = engine
        .update_doc(json!({}), b"init".to_vec())
        .unwrap()
        .unwrap();
    let r1 = engine
        .update_doc(json!({"hello": "world"}), b"add".to_vec())
        .unwrap()
        .unwrap();

    assert_eq!(engine.doc(), Some(json!({"hello": "world"})));
    assert_eq!(engine.head(), Some(r1.clone()));

    loop {
        let rows = backend.commit_rows(&doc_id).await.unwrap();
        if rows.len() == 2 {
            assert_eq!(rows[0].commit.id, r0);
            assert_eq!(rows[1].commit.id, r1);
            assert_eq!(rows[1].commit.base_ref, Some(r0.clone()));
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.shutdown().await.unwrap();
}

/// Scenario: two clients share one local store; the second sees the
/// first's edit without creating any additional commit.
#[tokio::test]
async fn shared_store_clients_sync_without_new_commits() {
    let backend = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");
    let a = client(&backend, None, &doc_id, "alice").await;
    let b = client(&backend, None, &doc_id, "alice").await;

    a.update_doc(json!({"hello": "world"}), vec![]).unwrap();
    wait_until("b to adopt a's doc", || {
        b.doc() == Some(json!({"hello": "world"}))
    })
    .await;

    let rows = backend.commit_rows(&doc_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(a.head(), b.head());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

/// Scenario: two clients on separate stores fork while the network is
/// paused, then converge to the key-union merge with exactly one merge
/// commit.
#[tokio::test]
async fn concurrent_fork_converges_with_one_merge_commit() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let origin_a = MemoryStoreBackend::new();
    let origin_b = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");

    let a = client(&origin_a, Some(remote.clone()), &doc_id, "alice").await;
    let b = client(&origin_b, Some(remote.clone()), &doc_id, "bob").await;

    a.update_doc(json!({"hello": "world"}), vec![]).unwrap();
    wait_until("b to receive the base through the remote", || {
        b.doc() == Some(json!({"hello": "world"}))
    })
    .await;

    remote.pause();
    a.update_doc(json!({"hello": "world", "a": 1}), vec![]).unwrap();
    b.update_doc(json!({"hello": "world", "b": 2}), vec![]).unwrap();
    remote.resume();

    let merged = json!({"hello": "world", "a": 1, "b": 2});
    wait_until("both clients to converge", || {
        a.doc() == Some(merged.clone())
            && b.doc() == Some(merged.clone())
            && a.head() == b.head()
    })
    .await;

    let merge_commits = remote
        .commits()
        .iter()
        .filter(|c| c.is_merge())
        .count();
    assert_eq!(merge_commits, 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

/// Scenario: edits made while the remote is unreachable are shipped
/// after reconnection, and the remote-save axis traces
/// pending → saving → ready on the way.
#[tokio::test]
async fn offline_edits_ship_after_reconnect() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let backend = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");
    let engine = client(&backend, Some(remote.clone()), &doc_id, "alice").await;

    wait_until("initial connection", || {
        engine.sync_status().remote_connect == RemoteConnect::Online
    })
    .await;

    remote.pause();
    let mut state_log = backend.bus(&doc_id).subscribe();

    for i in 1..=8 {
        engine.update_doc(json!({"n": i}), vec![]).unwrap();
    }
    wait_until("local flush of offline edits", || {
        engine.sync_status().local_save == deltasync_types::LocalSave::Ready
    })
    .await;

    remote.resume();
    wait_until("remote to hold all commits", || remote.commit_count() == 8).await;
    wait_until("remote save to settle", || {
        engine.sync_status().remote_save == RemoteSave::Ready
    })
    .await;

    // Every stored commit carries its remote cursor.
    let rows = backend.commit_rows(&doc_id).await.unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.remote_sync_id.is_some()));

    // The leader's published save axis walked pending → saving → ready.
    let mut saves = Vec::new();
    while let Ok(msg) = state_log.try_recv() {
        if let deltasync_client::BroadcastMessage::RemoteState { state, .. } = msg {
            saves.push(state.save);
        }
    }
    let pending = saves
        .iter()
        .position(|s| *s == RemoteSave::Pending)
        .expect("pending observed");
    let saving = saves[pending..]
        .iter()
        .position(|s| *s == RemoteSave::Saving)
        .expect("saving observed after pending");
    assert!(
        saves[pending + saving..].contains(&RemoteSave::Ready),
        "ready observed after saving, got {:?}",
        saves
    );

    engine.shutdown().await.unwrap();
}

/// Scenario: killing the leader hands the remote connection to the
/// surviving client, whose edits then reach the remote.
#[tokio::test]
async fn leader_failover_keeps_remote_flowing() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let backend = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");

    let a = client(&backend, Some(remote.clone()), &doc_id, "alice").await;
    let b = client(&backend, Some(remote.clone()), &doc_id, "alice").await;

    wait_until("a leader to emerge", || {
        a.is_remote_leader() || b.is_remote_leader()
    })
    .await;
    let (leader, survivor) = if a.is_remote_leader() { (a, b) } else { (b, a) };

    leader.update_doc(json!({"v": 1}), vec![]).unwrap();
    wait_until("first edit to reach the remote", || {
        remote.commit_count() == 1
    })
    .await;

    leader.shutdown().await.unwrap();
    wait_until("survivor to take leadership", || {
        survivor.is_remote_leader()
    })
    .await;
    wait_until("survivor to be online", || {
        survivor.sync_status().remote_connect == RemoteConnect::Online
    })
    .await;

    survivor.update_doc(json!({"v": 1, "after": true}), vec![]).unwrap();
    wait_until("post-failover edit to reach the remote", || {
        remote.commit_count() == 2
    })
    .await;

    survivor.shutdown().await.unwrap();
}

/// At any sampled instant, at most one client per store is leader.
#[tokio::test]
async fn at_most_one_leader_per_store() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let backend = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");

    let a = client(&backend, Some(remote.clone()), &doc_id, "alice").await;
    let b = client(&backend, Some(remote.clone()), &doc_id, "alice").await;
    let c = client(&backend, Some(remote.clone()), &doc_id, "alice").await;

    wait_until("a leader to emerge", || {
        a.is_remote_leader() || b.is_remote_leader() || c.is_remote_leader()
    })
    .await;

    for _ in 0..50 {
        let leaders = [&a, &b, &c]
            .iter()
            .filter(|e| e.is_remote_leader())
            .count();
        assert!(leaders <= 1, "observed {leaders} simultaneous leaders");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

/// Scenario: resetting remote-sync data clears every cursor and the
/// store identity, and a later connection to a fresh remote re-ships
/// the full history.
#[tokio::test]
async fn reset_remote_sync_data_forces_full_repush() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let backend = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");

    {
        let engine = client(&backend, Some(remote.clone()), &doc_id, "alice").await;
        engine.update_doc(json!({"a": 1}), vec![]).unwrap();
        engine.update_doc(json!({"a": 1, "b": 2}), vec![]).unwrap();
        engine
            .update_doc(json!({"a": 1, "b": 2, "c": 3}), vec![])
            .unwrap();
        wait_until("initial sync", || remote.commit_count() == 3).await;
        loop {
            let rows = backend.commit_rows(&doc_id).await.unwrap();
            if rows.iter().all(|r| r.remote_sync_id.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.shutdown().await.unwrap();
    }

    backend.reset_doc_remote_sync_data(&doc_id).await.unwrap();
    let rows = backend.commit_rows(&doc_id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.remote_sync_id.is_none()));

    // A fresh remote, as if the upstream had never seen this store.
    let fresh_remote = Arc::new(MemoryRemoteBackend::new());
    let engine = client(&backend, Some(fresh_remote.clone()), &doc_id, "alice").await;

    wait_until("full history to be re-pushed", || {
        fresh_remote.commit_count() == 3
    })
    .await;
    loop {
        let rows = backend.commit_rows(&doc_id).await.unwrap();
        if rows.iter().all(|r| r.remote_sync_id.is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.shutdown().await.unwrap();
}

/// Presence crosses origins through the leader and the remote.
#[tokio::test]
async fn presence_reaches_clients_on_other_stores() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let origin_a = MemoryStoreBackend::new();
    let origin_b = MemoryStoreBackend::new();
    let doc_id = DocId::new("doc");

    let a = client(&origin_a, Some(remote.clone()), &doc_id, "alice").await;
    let b = client(&origin_b, Some(remote.clone()), &doc_id, "bob").await;

    wait_until("both online", || {
        a.sync_status().remote_connect == RemoteConnect::Online
            && b.sync_status().remote_connect == RemoteConnect::Online
    })
    .await;

    a.update_presence(Some(json!({"cursor": [3, 14]}))).unwrap();
    wait_until("b to see alice's presence", || {
        b.clients()
            .iter()
            .any(|r| r.user_id == UserId::new("alice")
                && r.presence == Some(json!({"cursor": [3, 14]})))
    })
    .await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

/// Documents converge across stores after quiescence (deep equality of
/// docs and identical heads everywhere).
#[tokio::test]
async fn three_origins_converge() {
    let remote = Arc::new(MemoryRemoteBackend::new());
    let origins: Vec<MemoryStoreBackend> =
        (0..3).map(|_| MemoryStoreBackend::new()).collect();
    let doc_id = DocId::new("doc");

    let mut engines = Vec::new();
    for (i, origin) in origins.iter().enumerate() {
        engines.push(client(origin, Some(remote.clone()), &doc_id, &format!("user-{i}")).await);
    }

    engines[0].update_doc(json!({"base": true}), vec![]).unwrap();
    wait_until("everyone has the base", || {
        engines.iter().all(|e| e.doc() == Some(json!({"base": true})))
    })
    .await;

    engines[1]
        .update_doc(json!({"base": true, "one": 1}), vec![])
        .unwrap();
    engines[2]
        .update_doc(json!({"base": true, "two": 2}), vec![])
        .unwrap();

    let merged = json!({"base": true, "one": 1, "two": 2});
    wait_until("full convergence", || {
        engines.iter().all(|e| e.doc() == Some(merged.clone()))
            && engines.windows(2).all(|w| w[0].head() == w[1].head())
    })
    .await;

    for engine in &engines {
        engine.shutdown().await.unwrap();
    }
}
