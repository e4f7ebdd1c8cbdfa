//! Error types for deltasync.

use thiserror::Error;

/// Top-level error surfaced by the engine's public operations.
///
/// Component-local errors (store, remote, differ) are classified into
/// one of these kinds at the engine boundary; only `Fatal` stops the
/// engine's reconnection machinery.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient transport failure; reconnection continues.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed remote event; logged, then reconnect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The differ failed to merge or patch.
    #[error("merge error: {0}")]
    Merge(String),

    /// Operation attempted after shutdown.
    #[error("engine is shut down")]
    Shutdown,

    /// Unrecoverable failure; no reconnection.
    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Wire encoding failures for remote messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed.
    #[error("encode failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed.
    #[error("decode failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::Storage("disk full".into());
        assert_eq!(err.to_string(), "storage error: disk full");
    }

    #[test]
    fn shutdown_display() {
        assert_eq!(SyncError::Shutdown.to_string(), "engine is shut down");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
        assert_send_sync::<WireError>();
    }
}
