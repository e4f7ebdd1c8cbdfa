//! Leader election driver and remote proxy.
//!
//! Exactly one client per local store talks to the remote. This module
//! drives the pure election machine from `deltasync-core` over the
//! broadcast bus, and, while holding leadership, runs the remote proxy:
//! streaming unsynced batches out (one in flight at a time), feeding
//! inbound batches into the store with their cursors, forwarding
//! presence both ways, heartbeating, and publishing the remote-facing
//! status axes that every co-resident client adopts as its own.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use deltasync_core::{Differ, ElectionAction, ElectionEvent, ElectionState, Proposal};
use deltasync_types::{
    CommitBatch, RemoteConnect, RemoteMessage, RemoteRead, RemoteReply, RemoteSave,
    RemoteStateUpdate,
};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};

use crate::broadcast::{BroadcastMessage, ElectionMessage};
use crate::engine::EngineShared;
use crate::remote::{Remote, RemoteFactory};
use crate::store::REMOTE_BATCH_SIZE;

/// Why a leadership session ended.
enum SessionEnd {
    /// The engine is shutting down.
    Shutdown,
    /// A rival leader's heartbeat demoted us.
    Demoted,
    /// The connection dropped; reconnect with backoff.
    Reconnect,
    /// A fatal error; keep leadership but stop reconnecting.
    Fatal(String),
    /// The local store went away.
    StoreClosed,
}

type BusReceiver = broadcast::Receiver<BroadcastMessage>;

pub(crate) async fn run_leader_task<D: Differ>(shared: Arc<EngineShared<D>>) {
    let Some(factory) = shared.remote_factory.clone() else {
        return;
    };
    let mut bus_rx = shared.bus.subscribe();
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut machine = ElectionState::new();

    'lifecycle: loop {
        if *shutdown_rx.borrow() {
            return;
        }

        // Campaign: announce, collect rivals until the timeout, decide.
        let own = Proposal::random(shared.client_id);
        let (next, actions) = machine.on_event(ElectionEvent::CampaignStarted(own));
        machine = next;
        run_actions(&shared, &actions);

        let deadline = Instant::now()
            + Duration::from_millis(shared.settings.election_timeout_ms);
        while matches!(machine, ElectionState::Campaigning { .. }) {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = sleep_until(deadline) => {
                    let (next, actions) = machine.on_event(ElectionEvent::ElectionTimeout);
                    machine = next;
                    run_actions(&shared, &actions);
                }
                msg = bus_rx.recv() => match election_event(&shared, msg) {
                    BusOutcome::Event(event) => {
                        let (next, actions) = machine.on_event(event);
                        machine = next;
                        run_actions(&shared, &actions);
                    }
                    BusOutcome::Ignore => {}
                    BusOutcome::Closed => return,
                },
            }
        }

        if machine.is_leader() {
            shared.is_leader.store(true, Ordering::SeqCst);
            let end =
                run_leadership(&shared, factory.as_ref(), &mut bus_rx, &mut shutdown_rx).await;
            shared.is_leader.store(false, Ordering::SeqCst);
            publish_remote_state(&shared, RemoteStateUpdate::default());
            match end {
                SessionEnd::Shutdown | SessionEnd::StoreClosed => return,
                _ => {
                    machine = ElectionState::new();
                    continue 'lifecycle;
                }
            }
        }

        // Follower: watch for heartbeats; campaign again on silence or
        // an explicit resignation.
        let timeout_ms = shared.settings.heartbeat_timeout_ms;
        let mut watchdog = Instant::now() + Duration::from_millis(timeout_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = sleep_until(watchdog), if timeout_ms > 0 => {
                    let (next, actions) = machine.on_event(ElectionEvent::HeartbeatTimeout);
                    machine = next;
                    if actions.contains(&ElectionAction::StartCampaign) {
                        continue 'lifecycle;
                    }
                }
                msg = bus_rx.recv() => match election_event(&shared, msg) {
                    BusOutcome::Event(event) => {
                        if matches!(event, ElectionEvent::HeartbeatReceived(_)) {
                            watchdog = Instant::now() + Duration::from_millis(timeout_ms.max(1));
                        }
                        let (next, actions) = machine.on_event(event);
                        machine = next;
                        if actions.contains(&ElectionAction::StartCampaign) {
                            continue 'lifecycle;
                        }
                    }
                    BusOutcome::Ignore => {}
                    BusOutcome::Closed => return,
                },
            }
        }
    }
}

enum BusOutcome {
    Event(ElectionEvent),
    Ignore,
    Closed,
}

fn election_event<D: Differ>(
    shared: &EngineShared<D>,
    msg: Result<BroadcastMessage, broadcast::error::RecvError>,
) -> BusOutcome {
    match msg {
        Ok(BroadcastMessage::Election(ElectionMessage::Proposal(p)))
            if p.client_id != shared.client_id =>
        {
            BusOutcome::Event(ElectionEvent::ProposalReceived(p))
        }
        Ok(BroadcastMessage::Election(ElectionMessage::Heartbeat { leader }))
            if leader != shared.client_id =>
        {
            BusOutcome::Event(ElectionEvent::HeartbeatReceived(leader))
        }
        Ok(BroadcastMessage::Election(ElectionMessage::Resign { leader })) => {
            BusOutcome::Event(ElectionEvent::LeaderResigned(leader))
        }
        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => BusOutcome::Ignore,
        Err(broadcast::error::RecvError::Closed) => BusOutcome::Closed,
    }
}

fn run_actions<D: Differ>(shared: &EngineShared<D>, actions: &[ElectionAction]) {
    for action in actions {
        match action {
            ElectionAction::AnnounceCandidacy(proposal) => {
                shared
                    .bus
                    .publish(BroadcastMessage::Election(ElectionMessage::Proposal(
                        *proposal,
                    )));
            }
            ElectionAction::AssertLeadership => publish_heartbeat(shared),
            // The remaining actions shape the driver's control flow and
            // need no bus traffic here.
            _ => {}
        }
    }
}

fn publish_heartbeat<D: Differ>(shared: &EngineShared<D>) {
    shared
        .bus
        .publish(BroadcastMessage::Election(ElectionMessage::Heartbeat {
            leader: shared.client_id,
        }));
}

fn publish_remote_state<D: Differ>(shared: &EngineShared<D>, state: RemoteStateUpdate) {
    shared.bus.publish(BroadcastMessage::RemoteState {
        from: shared.client_id,
        state,
    });
}

fn heartbeats_enabled<D: Differ>(shared: &EngineShared<D>) -> bool {
    shared.settings.heartbeat_interval_ms > 0
}

fn next_heartbeat<D: Differ>(shared: &EngineShared<D>) -> Instant {
    Instant::now() + Duration::from_millis(shared.settings.heartbeat_interval_ms.max(1))
}

/// Hold leadership: connect to the remote with backoff, run the proxy
/// session, and keep heartbeating throughout.
async fn run_leadership<D: Differ>(
    shared: &Arc<EngineShared<D>>,
    factory: &dyn RemoteFactory,
    bus_rx: &mut BusReceiver,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    publish_heartbeat(shared);
    let mut hb_deadline = next_heartbeat(shared);
    let mut attempt: u32 = 0;
    let mut state = RemoteStateUpdate {
        connect: RemoteConnect::Connecting,
        read: RemoteRead::Offline,
        save: RemoteSave::Ready,
    };
    publish_remote_state(shared, state);

    loop {
        if *shutdown_rx.borrow() {
            return SessionEnd::Shutdown;
        }
        let info = match shared.store.remote_sync_info().await {
            Ok(info) => info,
            Err(_) => return SessionEnd::StoreClosed,
        };
        // While disconnected, the save axis still reflects whether
        // unsynced commits are waiting.
        let waiting = match shared.store.unsynced_commits(1).await {
            Ok(unsynced) => !unsynced.is_empty(),
            Err(_) => return SessionEnd::StoreClosed,
        };
        let save = if waiting {
            RemoteSave::Pending
        } else {
            RemoteSave::Ready
        };
        if state.save != save {
            state.save = save;
            publish_remote_state(shared, state);
        }
        match factory.connect(&shared.user_id, &info).await {
            Ok(remote) => {
                attempt = 0;
                state.connect = RemoteConnect::Online;
                state.read = RemoteRead::Loading;
                publish_remote_state(shared, state);

                let end = run_session(
                    shared,
                    remote.as_ref(),
                    bus_rx,
                    shutdown_rx,
                    &mut state,
                    &mut hb_deadline,
                )
                .await;
                match end {
                    SessionEnd::Reconnect => {
                        tracing::debug!("remote connection lost, reconnecting");
                        state.connect = RemoteConnect::Connecting;
                        state.read = RemoteRead::Offline;
                        publish_remote_state(shared, state);
                    }
                    SessionEnd::Fatal(message) => {
                        tracing::warn!("fatal remote error: {}", message);
                        state.connect = RemoteConnect::Error;
                        state.read = RemoteRead::Error;
                        publish_remote_state(shared, state);
                        return idle_leadership(shared, bus_rx, shutdown_rx, &mut hb_deadline)
                            .await;
                    }
                    other => return other,
                }
            }
            Err(err) if err.is_fatal() => {
                tracing::warn!("fatal connect error: {}", err);
                state.connect = RemoteConnect::Error;
                publish_remote_state(shared, state);
                return idle_leadership(shared, bus_rx, shutdown_rx, &mut hb_deadline).await;
            }
            Err(err) => {
                tracing::debug!("connect attempt failed: {}", err);
                if state.connect != RemoteConnect::Connecting {
                    state.connect = RemoteConnect::Connecting;
                    publish_remote_state(shared, state);
                }
            }
        }

        // Backoff between attempts, heartbeating and answering election
        // traffic the whole time.
        attempt = attempt.saturating_add(1);
        let wake = Instant::now() + shared.settings.reconnect_delay(attempt);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
                _ = sleep_until(wake) => break,
                _ = sleep_until(hb_deadline), if heartbeats_enabled(shared) => {
                    publish_heartbeat(shared);
                    hb_deadline = next_heartbeat(shared);
                }
                msg = bus_rx.recv() => match leadership_bus_event(shared, msg) {
                    Some(end) => return end,
                    None => {}
                },
            }
        }
    }
}

/// Bus handling common to every leadership phase: assert on rival
/// proposals, step down for a rival leader's heartbeat.
fn leadership_bus_event<D: Differ>(
    shared: &EngineShared<D>,
    msg: Result<BroadcastMessage, broadcast::error::RecvError>,
) -> Option<SessionEnd> {
    match msg {
        Ok(BroadcastMessage::Election(ElectionMessage::Proposal(p)))
            if p.client_id != shared.client_id =>
        {
            publish_heartbeat(shared);
            None
        }
        Ok(BroadcastMessage::Election(ElectionMessage::Heartbeat { leader }))
            if leader != shared.client_id =>
        {
            Some(SessionEnd::Demoted)
        }
        Err(broadcast::error::RecvError::Closed) => Some(SessionEnd::Shutdown),
        _ => None,
    }
}

/// Leadership after a fatal remote error: no reconnects, but the seat
/// is kept so the error state stays visible and stable.
async fn idle_leadership<D: Differ>(
    shared: &Arc<EngineShared<D>>,
    bus_rx: &mut BusReceiver,
    shutdown_rx: &mut watch::Receiver<bool>,
    hb_deadline: &mut Instant,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
            _ = sleep_until(*hb_deadline), if heartbeats_enabled(shared) => {
                publish_heartbeat(shared);
                *hb_deadline = next_heartbeat(shared);
            }
            msg = bus_rx.recv() => match leadership_bus_event(shared, msg) {
                Some(end) => return end,
                None => {}
            },
        }
    }
}

/// One connected proxy session.
async fn run_session<D: Differ>(
    shared: &Arc<EngineShared<D>>,
    remote: &dyn Remote,
    bus_rx: &mut BusReceiver,
    shutdown_rx: &mut watch::Receiver<bool>,
    state: &mut RemoteStateUpdate,
    hb_deadline: &mut Instant,
) -> SessionEnd {
    let mut ready = false;
    let mut in_flight = false;

    loop {
        // Ship the next unsynced batch once the snapshot has drained
        // and nothing is in flight; await each ack before the next
        // batch so the remote is never flooded.
        if ready && !in_flight {
            match shared.store.unsynced_commits(REMOTE_BATCH_SIZE).await {
                Ok(batch) if !batch.is_empty() => {
                    if state.save != RemoteSave::Saving {
                        state.save = RemoteSave::Saving;
                        publish_remote_state(shared, *state);
                    }
                    match remote
                        .send(RemoteMessage::Commits(CommitBatch { commits: batch }))
                        .await
                    {
                        Ok(()) => in_flight = true,
                        Err(err) if err.is_fatal() => return SessionEnd::Fatal(err.to_string()),
                        Err(err) => {
                            tracing::debug!("outbound batch failed: {}", err);
                            return SessionEnd::Reconnect;
                        }
                    }
                }
                Ok(_) => {
                    if state.save != RemoteSave::Ready {
                        state.save = RemoteSave::Ready;
                        publish_remote_state(shared, *state);
                    }
                }
                Err(_) => return SessionEnd::StoreClosed,
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = remote.send(RemoteMessage::Bye).await;
                remote.close().await;
                return SessionEnd::Shutdown;
            }
            _ = sleep_until(*hb_deadline), if heartbeats_enabled(shared) => {
                publish_heartbeat(shared);
                *hb_deadline = next_heartbeat(shared);
            }
            _ = shared.outbound_notify.notified(), if ready && !in_flight => {
                if state.save == RemoteSave::Ready {
                    state.save = RemoteSave::Pending;
                    publish_remote_state(shared, *state);
                }
            }
            reply = remote.recv() => match reply {
                Ok(RemoteReply::Ready) => {
                    ready = true;
                    state.read = RemoteRead::Ready;
                    publish_remote_state(shared, *state);
                }
                Ok(RemoteReply::Commits { commits, cursor }) => {
                    if shared
                        .store
                        .add_commits(commits, Some(cursor))
                        .await
                        .is_err()
                    {
                        return SessionEnd::StoreClosed;
                    }
                }
                Ok(RemoteReply::Ack { refs, cursor }) => {
                    if shared
                        .store
                        .acknowledge_commits(refs, cursor)
                        .await
                        .is_err()
                    {
                        return SessionEnd::StoreClosed;
                    }
                    in_flight = false;
                }
                Ok(RemoteReply::Presence(update)) => {
                    shared.bus.publish(BroadcastMessage::Presence {
                        update,
                        local: false,
                    });
                }
                Ok(RemoteReply::State(remote_state)) => {
                    *state = remote_state;
                    publish_remote_state(shared, *state);
                }
                Ok(RemoteReply::Error { message, fatal }) => {
                    if fatal {
                        return SessionEnd::Fatal(message);
                    }
                    tracing::warn!("remote error: {}", message);
                    return SessionEnd::Reconnect;
                }
                Err(err) if err.is_fatal() => return SessionEnd::Fatal(err.to_string()),
                Err(err) => {
                    tracing::debug!("remote receive failed: {}", err);
                    return SessionEnd::Reconnect;
                }
            },
            msg = bus_rx.recv() => match msg {
                Ok(BroadcastMessage::Presence { update, local: true }) => {
                    if let Err(err) = remote.send(RemoteMessage::Presence(update)).await {
                        if err.is_fatal() {
                            return SessionEnd::Fatal(err.to_string());
                        }
                        tracing::debug!("presence forward failed: {}", err);
                        return SessionEnd::Reconnect;
                    }
                }
                other => match leadership_bus_event(shared, other) {
                    Some(SessionEnd::Demoted) => {
                        let _ = remote.send(RemoteMessage::Bye).await;
                        remote.close().await;
                        return SessionEnd::Demoted;
                    }
                    Some(end) => return end,
                    None => {}
                },
            },
        }
    }
}
