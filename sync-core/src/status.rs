//! Transition tracking for the five sync-status axes.
//!
//! The tracker owns the current [`SyncStatus`] snapshot and reports
//! whether a setter actually changed it, so the publishing side emits
//! each distinct state exactly once.

use deltasync_types::{
    LocalRead, LocalSave, RemoteConnect, RemoteRead, RemoteSave, RemoteStateUpdate, SyncStatus,
};

/// Tracks the engine's status snapshot and deduplicates transitions.
#[derive(Debug, Default)]
pub struct StatusTracker {
    current: SyncStatus,
}

impl StatusTracker {
    /// Create a tracker in the initial state (`local_read: loading`,
    /// everything else idle/offline).
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn current(&self) -> SyncStatus {
        self.current
    }

    /// Set the local-read axis. Returns the new snapshot if it changed.
    pub fn set_local_read(&mut self, state: LocalRead) -> Option<SyncStatus> {
        if self.current.local_read == state {
            return None;
        }
        self.current.local_read = state;
        Some(self.current)
    }

    /// Set the local-save axis. Returns the new snapshot if it changed.
    pub fn set_local_save(&mut self, state: LocalSave) -> Option<SyncStatus> {
        if self.current.local_save == state {
            return None;
        }
        self.current.local_save = state;
        Some(self.current)
    }

    /// Set the remote-connect axis. Returns the new snapshot if changed.
    pub fn set_remote_connect(&mut self, state: RemoteConnect) -> Option<SyncStatus> {
        if self.current.remote_connect == state {
            return None;
        }
        self.current.remote_connect = state;
        Some(self.current)
    }

    /// Set the remote-read axis. Returns the new snapshot if changed.
    pub fn set_remote_read(&mut self, state: RemoteRead) -> Option<SyncStatus> {
        if self.current.remote_read == state {
            return None;
        }
        self.current.remote_read = state;
        Some(self.current)
    }

    /// Set the remote-save axis. Returns the new snapshot if changed.
    pub fn set_remote_save(&mut self, state: RemoteSave) -> Option<SyncStatus> {
        if self.current.remote_save == state {
            return None;
        }
        self.current.remote_save = state;
        Some(self.current)
    }

    /// Adopt all three remote axes from a leader-published update.
    /// Returns the new snapshot if anything changed.
    pub fn adopt_remote_state(&mut self, update: RemoteStateUpdate) -> Option<SyncStatus> {
        let next = SyncStatus {
            remote_connect: update.connect,
            remote_read: update.read,
            remote_save: update.save,
            ..self.current
        };
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(self.current)
    }
}
