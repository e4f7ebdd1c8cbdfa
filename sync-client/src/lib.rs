//! # deltasync-client
//!
//! The client-side sync engine for deltasync.
//!
//! Each client holds a mutable in-memory document; edits are captured as
//! diff-based commits forming a content-addressed DAG. Commits flow
//! through a shared per-machine [`LocalStore`], are reconciled by
//! client-side three-way merges, and are replicated to an optional
//! remote by a single elected leader per store.
//!
//! ## Example
//!
//! ```ignore
//! use deltasync_client::{EngineOptions, MemoryStoreBackend, SyncEngine};
//! use deltasync_core::{JsonDiffer, NetworkSettings};
//!
//! let backend = MemoryStoreBackend::new();
//! let engine = SyncEngine::load(EngineOptions {
//!     differ: JsonDiffer::new(),
//!     doc_id,
//!     user_id,
//!     client_id,
//!     store: Arc::new(backend.open(&doc_id, &user_id, client_id)),
//!     bus: backend.bus(&doc_id),
//!     remote: None,
//!     settings: NetworkSettings::default(),
//!     buffer_ms: 0,
//! })
//! .await?;
//!
//! engine.update_doc(json!({"hello": "world"}), b"greeting".to_vec())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod engine;
mod leader;
pub mod presence;
pub mod remote;
pub mod store;

pub use broadcast::{BroadcastBus, BroadcastMessage, ElectionMessage};
pub use engine::{EngineOptions, SyncEngine};
pub use presence::PresenceTable;
pub use remote::{
    MemoryRemote, MemoryRemoteBackend, Remote, RemoteError, RemoteFactory,
};
pub use store::{
    LocalStore, MemoryLocalStore, MemoryStoreBackend, StoreError, StoredCommit, REMOTE_BATCH_SIZE,
};
