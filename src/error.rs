//! Typed errors at module boundaries
//!
//! Mutation handling uses explicit result values rather than panics:
//! [`MutationError`] is the nack reason sent back over the wire, and
//! [`PersistenceError`] covers the hot/cold storage tiers. Everywhere else
//! (CLI startup, one-off file I/O) keeps using `anyhow`'s `Context`-heavy
//! style.

use thiserror::Error;

/// Why a `mutate` request was rejected instead of applied.
///
/// Sent back to the originating connection as `nack { reason }`
/// (§4.3/§6.2). A nack never disconnects the client — only a protocol
/// violation at the framing level does that.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// `op` did not match any known discriminant.
    #[error("unknown mutation op: {0}")]
    UnknownOp(String),

    /// The payload didn't match the op's expected shape.
    #[error("malformed payload for {op}: {reason}")]
    MalformedPayload {
        /// The op whose payload failed to parse.
        op: String,
        /// Human-readable detail.
        reason: String,
    },

    /// A mutation referenced a `trackId` that doesn't exist in the session.
    #[error("unknown track id: {0}")]
    UnknownTrack(String),

    /// `add_track` was attempted when the session already holds
    /// [`crate::model::MAX_TRACKS`] tracks.
    #[error("session already has the maximum of {max} tracks")]
    TrackLimitReached {
        /// The configured maximum.
        max: usize,
    },

    /// The hot-tier write for this mutation failed; the mutation is rolled
    /// back in memory and never broadcast.
    #[error("failed to persist mutation: {0}")]
    PersistenceFailed(String),
}

/// Failures from the two-tier persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The underlying filesystem/KV operation failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes didn't deserialize into the expected shape (schema
    /// drift, truncated write, or corruption).
    #[error("failed to decode persisted state: {0}")]
    Decode(String),

    /// Failed to encode state for writing.
    #[error("failed to encode state for persistence: {0}")]
    Encode(String),
}
