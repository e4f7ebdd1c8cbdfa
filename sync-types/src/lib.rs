//! # deltasync-types
//!
//! Shared types for deltasync: identities, the commit record, wire
//! messages, event sums, status axes, and errors.
//!
//! This crate is dependency-light and contains no logic beyond
//! construction, validation, and (de)serialization, so every other crate
//! in the workspace can depend on it without pulling in I/O machinery.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commit;
pub mod error;
pub mod events;
pub mod ids;
pub mod messages;
pub mod status;

pub use commit::{Commit, CommitKind, CommitShapeError};
pub use error::{SyncError, WireError};
pub use events::{
    CommitsEvent, PresenceRecord, PresenceUpdate, RemoteSyncInfo, StoreAck, StoreEvent,
};
pub use ids::{ClientId, CommitRef, DocId, LocalSyncId, StoreId, SyncCursor, UserId};
pub use messages::{CommitBatch, RemoteMessage, RemoteReply};
pub use status::{
    LocalRead, LocalSave, RemoteConnect, RemoteRead, RemoteSave, RemoteStateUpdate, SyncStatus,
};
