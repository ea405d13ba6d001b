//! Snapshot diff chains with lazy materialization.
//!
//! A chain is the ordered history of one tracked source: each entry carries a
//! forward patch from its predecessor and a back patch to it, so any snapshot
//! can be rebuilt on demand by walking from a materialized neighbor. Only the
//! chain boundaries and the last-accessed position keep full snapshots in
//! memory.

mod arena;
mod model;

pub use arena::DiffChain;
pub use model::DiffEntry;
