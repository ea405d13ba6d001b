//! The chain arena: ordered entries, cursor, and lazy walks.

use scanledger_patch::{Document, Patch, diff};
use tracing::error;

use super::model::DiffEntry;
use crate::counters::Counters;
use crate::error::{Error, InvariantViolation, Result};

/// Ordered sequence of diff entries for one tracked source key.
///
/// Entries are addressed by index; neighbor references are index arithmetic,
/// never stored pointers. A single last-accessed cursor makes sequential
/// reads amortized O(1): walking to a neighboring position applies one patch.
#[derive(Debug, Default)]
pub struct DiffChain {
    entries: Vec<DiffEntry>,
    cursor: usize,
}

impl DiffChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a chain from persisted records ordered by timestamp.
    ///
    /// Index 0 and the tail are expected to be materialized; a violation is
    /// logged and counted but the chain is still returned, since interior
    /// walks may yet succeed from the other boundary.
    #[must_use]
    pub fn restore(entries: Vec<DiffEntry>, counters: &Counters) -> Self {
        let mut chain = Self { entries, cursor: 0 };
        if let Some(last) = chain.entries.len().checked_sub(1) {
            chain.cursor = last;
            let mut boundaries = vec![0];
            if last > 0 {
                boundaries.push(last);
            }
            for index in boundaries {
                if chain.entries[index].cached.is_none() {
                    counters.bump("error_restore_unmaterialized");
                    let violation = InvariantViolation::UnmaterializedRestore { index };
                    error!(%violation, "restored chain boundary not materialized");
                }
            }
        }
        chain
    }

    /// Number of entries in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the chain holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry at `index`, if in range.
    #[must_use]
    pub fn entry(&self, index: usize) -> Option<&DiffEntry> {
        self.entries.get(index)
    }

    /// The tail entry, if any.
    #[must_use]
    pub fn tail(&self) -> Option<&DiffEntry> {
        self.entries.last()
    }

    /// Entry timestamps in chain order.
    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.iter().map(|entry| entry.timestamp)
    }

    /// Returns true when an entry with `timestamp` is present.
    ///
    /// Timestamps are strictly increasing along the chain, so this is a
    /// binary search.
    #[must_use]
    pub fn contains_timestamp(&self, timestamp: i64) -> bool {
        self.entries
            .binary_search_by(|entry| entry.timestamp.cmp(&timestamp))
            .is_ok()
    }

    /// Installs the anchor snapshot as entry 0 of an empty chain.
    pub fn seed(&mut self, timestamp: i64, snapshot: Document) {
        debug_assert!(self.entries.is_empty());
        self.entries.push(DiffEntry::seed(timestamp, snapshot));
        self.cursor = 0;
    }

    /// Appends the snapshot produced by applying `forward` to the tail.
    ///
    /// The previous tail's snapshot is evicted once it is no longer the tail
    /// (unless it is entry 0); the back patch is derived from the two
    /// materialized snapshots before eviction.
    ///
    /// # Errors
    ///
    /// Fails on an unseeded chain, or when applying `forward` leaks a
    /// tombstone — in that case nothing is appended.
    pub fn append(&mut self, timestamp: i64, forward: Patch, counters: &Counters) -> Result<()> {
        if self.entries.is_empty() {
            return Err(InvariantViolation::EmptyChainAppend.into());
        }
        let tail = self.entries.len() - 1;
        let prior = self.materialize(tail, counters)?.clone();
        let snapshot = forward.apply(&prior)?;
        let back = diff(&snapshot, &prior).unwrap_or_else(Patch::empty);

        self.entries.push(DiffEntry {
            timestamp,
            cached: Some(snapshot),
            forward: Some(forward),
            back: Some(back),
        });
        if tail != 0 {
            self.entries[tail].cached = None;
        }
        self.cursor = self.entries.len() - 1;
        Ok(())
    }

    /// Returns the snapshot at `index`, reconstructing it if evicted.
    ///
    /// The walk starts from the nearest materialized home position (the
    /// cursor, entry 0, or the tail) and applies one patch per step, evicting
    /// every interior position it steps off to keep memory bounded. A missing
    /// forward/back patch along the way is logged and counted, and the walk
    /// continues with the empty patch.
    ///
    /// # Errors
    ///
    /// Fails when `index` is out of range, when no materialized position
    /// exists to walk from, or when a patch application leaks a tombstone.
    pub fn materialize(&mut self, index: usize, counters: &Counters) -> Result<&Document> {
        let len = self.entries.len();
        if index >= len {
            return Err(InvariantViolation::OutOfRange { index, len }.into());
        }
        if self.entries[index].cached.is_none() {
            self.walk_to(index, counters)?;
        }
        self.cursor = index;
        self.entries[index]
            .cached
            .as_ref()
            .ok_or(Error::Invariant(InvariantViolation::Unmaterialized {
                index,
            }))
    }

    /// Drops every entry past `index`.
    ///
    /// The surviving tail is re-materialized first — the downward walk may
    /// need the back patches of the entries about to be dropped.
    ///
    /// # Errors
    ///
    /// Fails when the re-materialization of the new tail fails.
    pub fn truncate_after(&mut self, index: usize, counters: &Counters) -> Result<()> {
        if index + 1 >= self.entries.len() {
            return Ok(());
        }
        self.materialize(index, counters)?;
        self.entries.truncate(index + 1);
        self.cursor = self.cursor.min(index);
        Ok(())
    }

    fn walk_to(&mut self, index: usize, counters: &Counters) -> Result<()> {
        let tail = self.entries.len() - 1;
        let Some(start) = [self.cursor, 0, tail]
            .into_iter()
            .filter(|&candidate| self.entries[candidate].cached.is_some())
            .min_by_key(|&candidate| index.abs_diff(candidate))
        else {
            counters.bump("error_no_materialized_home");
            error!(index, "no materialized snapshot anywhere in the chain");
            return Err(InvariantViolation::NoMaterializedHome.into());
        };

        let mut pos = start;
        while pos < index {
            let snapshot = self.leave(pos, tail)?;
            let next = pos + 1;
            let applied = if let Some(forward) = &self.entries[next].forward {
                forward.apply(&snapshot)?
            } else {
                counters.bump("error_undefined_forward");
                let violation = InvariantViolation::MissingForward { index: next };
                error!(%violation, "continuing walk with the empty patch");
                snapshot
            };
            self.entries[next].cached = Some(applied);
            pos = next;
        }
        while pos > index {
            let snapshot = self.leave(pos, tail)?;
            let applied = if let Some(back) = &self.entries[pos].back {
                back.apply(&snapshot)?
            } else {
                counters.bump("error_undefined_back");
                let violation = InvariantViolation::MissingBack { index: pos };
                error!(%violation, "continuing walk with the empty patch");
                snapshot
            };
            pos -= 1;
            self.entries[pos].cached = Some(applied);
        }
        Ok(())
    }

    /// Takes the snapshot at `pos` to step off it, cloning at the chain
    /// boundaries (which stay materialized) and evicting everywhere else.
    fn leave(&mut self, pos: usize, tail: usize) -> Result<Document> {
        let snapshot = if pos == 0 || pos == tail {
            self.entries[pos].cached.clone()
        } else {
            self.entries[pos].cached.take()
        };
        snapshot.ok_or(Error::Invariant(InvariantViolation::Unmaterialized {
            index: pos,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Chain of five snapshots built through appended forward diffs.
    fn build_chain() -> (DiffChain, Vec<Document>, Counters) {
        let snapshots: Vec<Document> = (0..5)
            .map(|tick| {
                json!({
                    "tick": tick,
                    "stars": {"0": {"st": 50 + tick}, "1": {"st": 10 * tick}},
                })
            })
            .collect();

        let counters = Counters::new();
        let mut chain = DiffChain::new();
        chain.seed(100, snapshots[0].clone());
        for (i, snapshot) in snapshots.iter().enumerate().skip(1) {
            let forward = diff(&snapshots[i - 1], snapshot).unwrap();
            let timestamp = 100 + i64::try_from(i).unwrap();
            chain.append(timestamp, forward, &counters).unwrap();
        }
        (chain, snapshots, counters)
    }

    #[test]
    fn appends_keep_only_home_positions_materialized() {
        let (chain, _, _) = build_chain();
        assert!(chain.entry(0).unwrap().cached.is_some());
        assert!(chain.entry(4).unwrap().cached.is_some());
        for index in 1..4 {
            assert!(chain.entry(index).unwrap().cached.is_none(), "{index}");
        }
    }

    #[test]
    fn materializes_any_position_in_any_order() {
        let (mut chain, snapshots, counters) = build_chain();
        for &index in &[2usize, 0, 3, 1, 4, 2, 3] {
            let snapshot = chain.materialize(index, &counters).unwrap();
            assert_eq!(snapshot, &snapshots[index], "index {index}");
        }
        assert_eq!(counters.get("error_undefined_forward"), 0);
        assert_eq!(counters.get("error_undefined_back"), 0);
    }

    #[test]
    fn interior_positions_are_evicted_after_a_walk() {
        let (mut chain, _, counters) = build_chain();
        chain.materialize(2, &counters).unwrap();
        // Destination and boundaries stay; the stepped-over position does not.
        assert!(chain.entry(2).unwrap().cached.is_some());
        assert!(chain.entry(0).unwrap().cached.is_some());
        assert!(chain.entry(4).unwrap().cached.is_some());
        assert!(chain.entry(1).unwrap().cached.is_none());
        assert!(chain.entry(3).unwrap().cached.is_none());
    }

    #[test]
    fn sequential_reads_reuse_the_cursor() {
        let (mut chain, snapshots, counters) = build_chain();
        chain.materialize(1, &counters).unwrap();
        // Walking 1 -> 2 applies a single forward patch from the cursor.
        let snapshot = chain.materialize(2, &counters).unwrap();
        assert_eq!(snapshot, &snapshots[2]);
        assert!(chain.entry(1).unwrap().cached.is_none());
    }

    #[test]
    fn missing_forward_patch_degrades_to_identity() {
        let (mut chain, snapshots, counters) = build_chain();
        chain.entries[2].forward = None;

        chain.materialize(0, &counters).unwrap();
        let snapshot = chain.materialize(2, &counters).unwrap().clone();
        assert_eq!(snapshot, snapshots[1]);
        assert_eq!(counters.get("error_undefined_forward"), 1);
    }

    #[test]
    fn truncate_after_rematerializes_the_new_tail() {
        let (mut chain, snapshots, counters) = build_chain();
        chain.truncate_after(1, &counters).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.tail().unwrap().timestamp, 101);
        assert_eq!(chain.entry(1).unwrap().cached, Some(snapshots[1].clone()));
    }

    #[test]
    fn truncate_past_the_tail_is_a_no_op() {
        let (mut chain, _, counters) = build_chain();
        chain.truncate_after(9, &counters).unwrap();
        assert_eq!(chain.len(), 5);
    }

    #[test]
    fn append_requires_a_seed() {
        let counters = Counters::new();
        let mut chain = DiffChain::new();
        let err = chain
            .append(1, Patch::empty(), &counters)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Invariant(InvariantViolation::EmptyChainAppend)
        ));
    }

    #[test]
    fn contains_timestamp_uses_chain_order() {
        let (chain, _, _) = build_chain();
        assert!(chain.contains_timestamp(100));
        assert!(chain.contains_timestamp(103));
        assert!(!chain.contains_timestamp(99));
        assert!(!chain.contains_timestamp(205));
    }

    #[test]
    fn restore_flags_unmaterialized_boundaries() {
        let counters = Counters::new();
        let entries = vec![
            DiffEntry {
                timestamp: 1,
                cached: None,
                forward: None,
                back: None,
            },
            DiffEntry {
                timestamp: 2,
                cached: Some(json!({"tick": 2})),
                forward: Some(Patch::empty()),
                back: Some(Patch::empty()),
            },
        ];
        let chain = DiffChain::restore(entries, &counters);
        assert_eq!(chain.len(), 2);
        assert_eq!(counters.get("error_restore_unmaterialized"), 1);
    }
}
