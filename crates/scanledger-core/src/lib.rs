//! # scanledger-core
//!
//! Locally-cached, incrementally-updated view of a remote game.
//!
//! This crate provides:
//! - Snapshot diff chains with lazy materialization and bounded memory
//! - Scan-diff reconciliation against server-declared anchors
//! - Message-page reconciliation with overlap detection and adaptive
//!   re-fetch
//! - An inverted token index over merged message bodies
//! - Abstract store/transport seams with in-memory and `SQLite` backends
//!
//! Reconciliation is best-effort by design: invariant violations are typed,
//! logged, and counted, then repaired with the server-declared value — the
//! user sees stale-but-not-wrong data, never a crash.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod chain;
mod counters;
mod error;
pub mod message;
pub mod scan;
pub mod store;
pub mod transport;

pub use chain::{DiffChain, DiffEntry};
pub use counters::Counters;
pub use error::{Error, InvariantViolation, Result, StorageError, TransportError};
pub use message::{
    Message, MessageReconciler, MessageRef, MessageStream, ReadStatus, TokenIndex,
};
pub use scan::{ApiInfo, BlockOutcome, ScanBlock, ScanNotification, ScanReconciler};
pub use store::{MemoryStore, SourceId, SqliteStore, Store};
pub use transport::{FetchRequest, Transport, report_messages};
