//! # deltasync-core
//!
//! Pure logic for deltasync (no I/O, instant tests).
//!
//! This crate implements the algorithms and state machines of the sync
//! engine without any network or disk I/O:
//!
//! - the commit graph with head tracking and merge-base search,
//! - the [`Differ`] contract plus the bundled [`JsonDiffer`],
//! - the sync-status tracker,
//! - the leader-election state machine,
//! - network settings and reconnect backoff.
//!
//! All modules are pure: same input, same output, no side effects. The
//! actual I/O lives in `deltasync-client`, which interprets the actions
//! these machines produce.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod differ;
pub mod election;
pub mod graph;
pub mod settings;
pub mod status;

pub use differ::{CommitDoc, Differ, DifferError, JsonDiffer, MergeResult, JSON_REF_LEN};
pub use election::{ElectionAction, ElectionEvent, ElectionState, Proposal};
pub use graph::{CommitGraph, GraphError, Inserted};
pub use settings::NetworkSettings;
pub use status::StatusTracker;
