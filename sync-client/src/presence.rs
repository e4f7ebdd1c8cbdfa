//! Presence tracking for co-editing clients.
//!
//! Presence is transient: cursors, selections, "who is here". It rides
//! the broadcast bus between co-resident clients and piggybacks on the
//! leader's remote connection to reach clients on other stores. Updates
//! carry a per-client monotonic clock so a stale update arriving late
//! never overwrites a fresher one.

use std::collections::HashMap;

use deltasync_types::{ClientId, PresenceRecord, PresenceUpdate};

/// Table of other clients' latest presence, clock-guarded.
#[derive(Debug)]
pub struct PresenceTable {
    own: ClientId,
    entries: HashMap<ClientId, (PresenceRecord, u64)>,
}

impl PresenceTable {
    /// Create a table for the given client. The client's own updates
    /// are ignored; `subscribe_clients` reports peers only.
    pub fn new(own: ClientId) -> Self {
        Self {
            own,
            entries: HashMap::new(),
        }
    }

    /// Apply an update. Returns true when the visible set changed.
    pub fn apply(&mut self, update: PresenceUpdate) -> bool {
        if update.client_id == self.own {
            return false;
        }
        match update.record {
            Some(record) => match self.entries.get(&update.client_id) {
                Some((existing, clock)) => {
                    if update.clock > *clock {
                        let changed = *existing != record;
                        self.entries
                            .insert(update.client_id, (record, update.clock));
                        changed
                    } else {
                        false
                    }
                }
                None => {
                    self.entries
                        .insert(update.client_id, (record, update.clock));
                    true
                }
            },
            None => self.entries.remove(&update.client_id).is_some(),
        }
    }

    /// Current peers, sorted by client id for stable output.
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut out: Vec<_> = self.entries.values().map(|(r, _)| r.clone()).collect();
        out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        out
    }

    /// Number of visible peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no peers are visible.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
