//! Sync-status axes.
//!
//! The engine reports its health as a product of five orthogonal axes.
//! Each axis is a small enum; the combined snapshot is [`SyncStatus`].
//! The tracker that drives transitions lives in `deltasync-core`.

use serde::{Deserialize, Serialize};

/// Progress of the initial replay from the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocalRead {
    /// Replay in progress.
    #[default]
    Loading,
    /// Replay complete; the document is available.
    Ready,
    /// Replay failed.
    Error,
}

/// Progress of writing local edits to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocalSave {
    /// Nothing buffered, nothing in flight.
    #[default]
    Ready,
    /// Edits buffered, flush not yet started.
    Pending,
    /// A store write is in flight.
    Saving,
    /// A store write or merge failed.
    Error,
}

/// State of the connection to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteConnect {
    /// No remote configured, or not currently connected.
    #[default]
    Offline,
    /// Connection attempt (or backoff between attempts) in progress.
    Connecting,
    /// Connected.
    Online,
    /// A fatal transport error stopped reconnection.
    Error,
}

/// Progress of draining the remote's initial snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteRead {
    /// Not connected.
    #[default]
    Offline,
    /// Connected, snapshot still streaming.
    Loading,
    /// Snapshot drained; live.
    Ready,
    /// The remote reported an unrecoverable read error.
    Error,
}

/// Progress of shipping local commits to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteSave {
    /// Everything acknowledged.
    #[default]
    Ready,
    /// Unsynced commits exist, no batch in flight.
    Pending,
    /// A batch is in flight awaiting its ack.
    Saving,
    /// The remote rejected a batch.
    Error,
}

/// A snapshot of all five axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncStatus {
    /// Initial local replay.
    pub local_read: LocalRead,
    /// Local store writes.
    pub local_save: LocalSave,
    /// Remote connection.
    pub remote_connect: RemoteConnect,
    /// Remote snapshot drain.
    pub remote_read: RemoteRead,
    /// Remote commit shipping.
    pub remote_save: RemoteSave,
}

/// The remote-facing axes, as published by the current leader.
///
/// Non-leader clients adopt these as their own `remote_*` axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteStateUpdate {
    /// Remote connection state.
    pub connect: RemoteConnect,
    /// Remote snapshot drain state.
    pub read: RemoteRead,
    /// Remote shipping state.
    pub save: RemoteSave,
}
