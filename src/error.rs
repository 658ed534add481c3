//! Domain error types, separated by the layer that produces them.
//!
//! The rule is transactional: any error that would leave the output log,
//! the cursor, or an aggregate partially updated aborts the whole
//! transaction by propagating out of the projection. Advisory paths
//! (fan-out delivery, logging) have no error type here at all; they log and
//! move on.

use crate::cursor::UpstreamCursor;

/// Failures while encoding, decoding, or persisting output log rows.
#[derive(Debug, thiserror::Error)]
pub enum StreamStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode event payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode stored event {stream_id}: {source}")]
    Decode {
        stream_id: i64,
        source: serde_json::Error,
    },
}

/// Failures inside the projection state machine. Fatal to the enclosing
/// transaction; a missing aggregate is deliberately NOT an error but a
/// state-machine branch (`like-failed`).
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StreamStoreError),
}

/// Failures talking to the upstream authority.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("no upstream authority is configured")]
    NotConfigured,
}

/// Failures in the synchronization path. An out-of-sequence batch is not an
/// error (see [`BatchOutcome`](crate::sync::BatchOutcome)); `Diverged` is
/// what remains when catch-up could not close the gap.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("projection failed: {0}")]
    Projection(#[from] ProjectionError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StreamStoreError),
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] UpstreamError),
    #[error(
        "batch at position {received} still out of sequence after {attempts} catch-up \
         attempts (cursor at {cursor:?})"
    )]
    Diverged {
        attempts: u32,
        received: i64,
        cursor: UpstreamCursor,
    },
}
