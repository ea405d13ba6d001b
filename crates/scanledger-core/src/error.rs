//! Error types for the core library.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Patch algebra operation failed.
    #[error("Patch error: {0}")]
    Patch(#[from] scanledger_patch::Error),

    /// Store operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network call failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A reconciliation invariant did not hold.
    #[error("Reconciliation invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// A requested fetch size was non-positive or above the cap.
    #[error("Fetch size out of bounds: {0}")]
    SizeBound(usize),
}

/// Errors from the persistent key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A record could not be encoded or decoded.
    #[error("Record codec error in `{namespace}`: {source}")]
    Codec {
        /// Namespace of the offending record.
        namespace: String,
        /// Underlying serialization error.
        source: serde_json::Error,
    },
}

/// Errors from the abstract network transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be delivered or the call itself failed.
    #[error("Request failed: {0}")]
    Request(String),

    /// The response did not carry the expected report data.
    #[error("Response missing report data")]
    MissingReport,
}

/// A reconciliation invariant that did not hold.
///
/// Violations are logged loudly and counted; recovery substitutes the
/// server-declared or best-effort value and continues, so a violation never
/// takes down a whole batch on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// A forward patch was absent during an upward chain walk.
    #[error("missing forward patch at chain index {index}")]
    MissingForward {
        /// Index of the entry that should have carried the patch.
        index: usize,
    },

    /// A back patch was absent during a downward chain walk.
    #[error("missing back patch at chain index {index}")]
    MissingBack {
        /// Index of the entry that should have carried the patch.
        index: usize,
    },

    /// A chain position outside the arena was addressed.
    #[error("chain index {index} out of range (len {len})")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Chain length at the time of the access.
        len: usize,
    },

    /// No materialized home position was available to walk from.
    #[error("no materialized snapshot anywhere in the chain")]
    NoMaterializedHome,

    /// An entry expected to be materialized held no snapshot.
    #[error("chain entry {index} unexpectedly evicted")]
    Unmaterialized {
        /// Index of the evicted entry.
        index: usize,
    },

    /// An append was attempted before the chain was seeded.
    #[error("append on an empty chain")]
    EmptyChainAppend,

    /// A restored chain boundary held no materialized snapshot.
    #[error("restored chain boundary {index} not materialized")]
    UnmaterializedRestore {
        /// Index of the boundary entry.
        index: usize,
    },

    /// A missing timestamp sorted before the authoritative set under
    /// comparison — an ordering impossibility in the incoming block.
    #[error("missing timestamp {timestamp} precedes the authoritative set")]
    OrderingImpossibility {
        /// The impossible timestamp.
        timestamp: i64,
    },

    /// The replayed block did not match the declared anchor snapshot.
    #[error("replayed block mismatches declared initial scan")]
    InitialScanMismatch,

    /// The replayed block did not match the declared final snapshot.
    #[error("replayed block mismatches declared last scan")]
    LastScanMismatch,

    /// The declared tail timestamp differs from the replayed tail.
    #[error("declared tail timestamp {declared} but replayed {replayed}")]
    LastTimestampMismatch {
        /// Server-declared tail timestamp.
        declared: i64,
        /// Timestamp the replay actually ended on.
        replayed: i64,
    },

    /// A tombstone leaked out of a patch application.
    #[error("tombstone leaked at `{path}`")]
    TombstoneLeak {
        /// Dotted path of the leaked tombstone.
        path: String,
    },

    /// An incoming entry at or after the overlap boundary was not already
    /// cached.
    #[error("entry `{key}` past the overlap boundary is not a known key")]
    OverlapGap {
        /// Key of the unexpected entry.
        key: String,
    },

    /// An incoming entry before the overlap boundary was already cached.
    #[error("entry `{key}` before the overlap boundary is a known key")]
    BoundaryCollision {
        /// Key of the colliding entry.
        key: String,
    },
}
