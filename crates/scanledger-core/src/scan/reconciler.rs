//! Per-key scan reconciliation over persisted diff chains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use scanledger_patch::{Document, Patch};
use serde_json::Map;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

use super::block::ScanBlock;
use crate::chain::{DiffChain, DiffEntry};
use crate::counters::Counters;
use crate::error::{Error, InvariantViolation, Result};
use crate::store::{SourceId, Store};

/// Summary of a loaded chain's coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiInfo {
    /// Tick of the first cached snapshot.
    pub first_tick: i64,
    /// Tick of the last cached snapshot.
    pub last_tick: i64,
    /// Player uid the scanning credential belongs to.
    pub puid: i64,
}

/// Summary of applying one scan block.
#[derive(Debug, Default)]
pub struct BlockOutcome {
    /// Entries appended to the chain.
    pub appended: usize,
    /// Gap-making entries discarded before appending.
    pub discarded: usize,
    /// Invariant violations detected; best-effort recovery was applied.
    pub violations: Vec<InvariantViolation>,
}

/// One batch from the change-notification stream.
#[derive(Debug)]
pub struct ScanNotification {
    /// Source key (scanning credential) the block belongs to.
    pub key: String,
    /// The block itself.
    pub block: ScanBlock,
}

/// Lifecycle of one key's chain.
#[derive(Debug)]
enum ChainState {
    Uninitialized,
    Restoring,
    Ready(DiffChain),
}

/// Per-key reconciliation state. The surrounding mutex serializes
/// reconciliations for the key; distinct keys proceed independently.
#[derive(Debug)]
struct ChainSlot {
    state: ChainState,
    /// Running validation replay across blocks, starting from the empty
    /// document.
    validation: Document,
}

impl ChainSlot {
    fn new() -> Self {
        Self {
            state: ChainState::Uninitialized,
            validation: Document::Object(Map::new()),
        }
    }
}

/// Merges incoming diff blocks into per-key snapshot chains.
///
/// Chains restore lazily from the store on first touch, reconcile only once
/// `Ready`, and persist exactly the entries each block changed. Faults stay
/// local to one key's chain.
pub struct ScanReconciler<S> {
    store: Arc<S>,
    source: SourceId,
    counters: Counters,
    chains: StdMutex<HashMap<String, Arc<Mutex<ChainSlot>>>>,
}

impl<S: Store> ScanReconciler<S> {
    /// Creates a reconciler over `store` for one game.
    #[must_use]
    pub fn new(store: Arc<S>, source: SourceId) -> Self {
        Self::with_counters(store, source, Counters::new())
    }

    /// Creates a reconciler sharing an existing counter sink.
    #[must_use]
    pub fn with_counters(store: Arc<S>, source: SourceId, counters: Counters) -> Self {
        Self {
            store,
            source,
            counters,
            chains: StdMutex::new(HashMap::new()),
        }
    }

    /// The diagnostic counter sink.
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Restores the chain for `key` so scans and summaries are available
    /// before the first block arrives.
    ///
    /// # Errors
    ///
    /// Returns a storage fault when the restore read fails; the chain stays
    /// `Uninitialized` and a later call may retry.
    pub async fn open(&self, key: &str) -> Result<()> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        self.ensure_ready(key, &mut slot).await
    }

    /// Applies one change-notification block to the chain for `key`.
    ///
    /// Notifications for the same key serialize through the per-key state;
    /// the whole batch is merged best-effort, collecting violations rather
    /// than aborting on the first.
    ///
    /// # Errors
    ///
    /// Returns storage faults from restore/persist and patch faults that
    /// abort an append. In-memory state is always left consistent.
    pub async fn apply_block(&self, key: &str, block: &ScanBlock) -> Result<BlockOutcome> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        self.ensure_ready(key, &mut slot).await?;
        let ChainSlot { state, validation } = &mut *slot;
        let ChainState::Ready(chain) = state else {
            unreachable!("chain is Ready after ensure_ready");
        };

        let mut outcome = BlockOutcome::default();

        // Partition the block against what the chain already holds.
        let all: Vec<i64> = block.patches.keys().copied().collect();
        let missing: Vec<i64> = all
            .iter()
            .copied()
            .filter(|&timestamp| !chain.contains_timestamp(timestamp))
            .collect();

        outcome
            .violations
            .extend(ordering_violations(&missing, &all, key, &self.counters));

        // Gap boundary: cached entries past the last block-attested timestamp
        // before the earliest missing one are provisional and must go.
        let mut removed: Vec<i64> = Vec::new();
        if !chain.is_empty() {
            if let Some(&first_missing) = missing.first() {
                let anchor = all
                    .iter()
                    .copied()
                    .filter(|&timestamp| {
                        timestamp < first_missing && chain.contains_timestamp(timestamp)
                    })
                    .max()
                    .unwrap_or(first_missing);
                let mut keep = chain.len() - 1;
                while keep > 0
                    && chain
                        .entry(keep)
                        .is_some_and(|entry| entry.timestamp > anchor)
                {
                    keep -= 1;
                }
                if keep + 1 < chain.len() {
                    removed = chain.timestamps().skip(keep + 1).collect();
                    for timestamp in &removed {
                        self.counters.bump("discard_gap_making_diff");
                        warn!(key, timestamp, "discarding gap-making diff");
                    }
                    chain.truncate_after(keep, &self.counters)?;
                    outcome.discarded = removed.len();
                }
            }
        }

        let pre_append_len = chain.len();
        if chain.is_empty() {
            let timestamp = block
                .initial_timestamp
                .or_else(|| block.initial_scan.get("start_time").and_then(Document::as_i64))
                .unwrap_or(0);
            chain.seed(timestamp, block.initial_scan.clone());
        }

        let tail_timestamp = chain.tail().map_or(0, |entry| entry.timestamp);
        for (&timestamp, patch) in block.patches.range(tail_timestamp + 1..) {
            if chain.len() == 1 && replays_seed(chain, patch) {
                self.counters.bump("skip_initial_state_patch");
                continue;
            }
            match chain.append(timestamp, patch.clone(), &self.counters) {
                Ok(()) => outcome.appended += 1,
                Err(Error::Patch(fault)) => {
                    self.counters.bump("error_append_tombstone");
                    error!(key, timestamp, error = %fault, "append aborted by patch fault");
                    outcome
                        .violations
                        .push(InvariantViolation::TombstoneLeak {
                            path: patch_fault_path(&fault),
                        });
                    // Later patches build on the snapshot this one failed to
                    // produce; stop the block here.
                    break;
                }
                Err(other) => return Err(other),
            }
        }

        outcome
            .violations
            .extend(block.validate(validation, &self.counters));

        self.persist(key, chain, pre_append_len, &removed).await?;
        Ok(outcome)
    }

    /// Number of scans currently cached in memory for `key`.
    pub async fn scan_count(&self, key: &str) -> usize {
        match self.existing_slot(key) {
            Some(slot) => {
                let slot = slot.lock().await;
                match &slot.state {
                    ChainState::Ready(chain) => chain.len(),
                    _ => 0,
                }
            }
            None => 0,
        }
    }

    /// Snapshot at chain position `index` for `key`.
    ///
    /// Unknown keys and out-of-range positions are logged and return `None`;
    /// an access never takes the process down.
    pub async fn get_scan(&self, key: &str, index: usize) -> Option<Document> {
        let Some(slot) = self.existing_slot(key) else {
            self.counters.bump("error_missing_diffcache");
            error!(key, index, "no diff chain loaded yet");
            return None;
        };
        let mut slot = slot.lock().await;
        let ChainState::Ready(chain) = &mut slot.state else {
            self.counters.bump("error_missing_diffcache");
            return None;
        };
        match chain.materialize(index, &self.counters) {
            Ok(snapshot) => Some(snapshot.clone()),
            Err(fault) => {
                self.counters.bump("error_scan_access");
                error!(key, index, error = %fault, "scan access failed");
                None
            }
        }
    }

    /// Coverage summary for a loaded chain.
    pub async fn api_info(&self, key: &str) -> Option<ApiInfo> {
        let slot = self.existing_slot(key)?;
        let slot = slot.lock().await;
        let ChainState::Ready(chain) = &slot.state else {
            return None;
        };
        let first = chain.entry(0)?.cached.as_ref()?;
        let last = chain.tail()?.cached.as_ref()?;
        Some(ApiInfo {
            first_tick: tick_of(first),
            last_tick: tick_of(last),
            puid: first.get("player_uid").and_then(Document::as_i64).unwrap_or(-1),
        })
    }

    /// Drops every in-memory chain. Persisted records are untouched; the
    /// next touch of a key restores it from the store.
    pub fn unload(&self) {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        chains.clear();
    }

    /// Drains change notifications into the reconciler in arrival order.
    ///
    /// Runs until the sending side closes the channel. Faults are logged and
    /// counted; the loop keeps consuming.
    pub async fn run(&self, mut notifications: mpsc::Receiver<ScanNotification>) {
        while let Some(notification) = notifications.recv().await {
            if let Err(fault) = self.apply_block(&notification.key, &notification.block).await {
                self.counters.bump("error_scan_block");
                error!(key = %notification.key, error = %fault, "scan block reconciliation failed");
            }
        }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<ChainSlot>> {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        chains
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChainSlot::new())))
            .clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Mutex<ChainSlot>>> {
        let chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        chains.get(key).cloned()
    }

    async fn ensure_ready(&self, key: &str, slot: &mut ChainSlot) -> Result<()> {
        if matches!(slot.state, ChainState::Ready(_)) {
            return Ok(());
        }
        slot.state = ChainState::Restoring;
        let namespace = self.source.namespace(key);
        let records = match self.store.get_all_ordered_by(&namespace, "timestamp").await {
            Ok(records) => records,
            Err(fault) => {
                slot.state = ChainState::Uninitialized;
                self.counters.bump("error_restore_chain");
                error!(key, error = %fault, "failed to restore diff chain");
                return Err(fault.into());
            }
        };

        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            match DiffEntry::from_document(record) {
                Ok(entry) => entries.push(entry),
                Err(fault) => {
                    self.counters.bump("error_restore_decode");
                    error!(key, error = %fault, "skipping corrupt chain record");
                }
            }
        }
        let chain = DiffChain::restore(entries, &self.counters);
        info!(key, len = chain.len(), "restored diff chain");
        slot.state = ChainState::Ready(chain);
        Ok(())
    }

    /// Persists exactly the entries this block changed: the re-evicted old
    /// tail plus everything appended after it, and deletes discarded records.
    async fn persist(
        &self,
        key: &str,
        chain: &DiffChain,
        pre_append_len: usize,
        removed: &[i64],
    ) -> Result<()> {
        let namespace = self.source.namespace(key);
        for timestamp in removed {
            if let Err(fault) = self.store.delete(&namespace, &timestamp.to_string()).await {
                self.counters.bump("error_persist_chain");
                error!(key, timestamp, error = %fault, "failed to delete discarded entry");
                return Err(fault.into());
            }
        }
        for index in pre_append_len.saturating_sub(1)..chain.len() {
            let Some(entry) = chain.entry(index) else {
                break;
            };
            let record = entry.to_document()?;
            if let Err(fault) = self
                .store
                .put(&namespace, &entry.timestamp.to_string(), &record)
                .await
            {
                self.counters.bump("error_persist_chain");
                error!(key, timestamp = entry.timestamp, error = %fault, "failed to persist entry");
                return Err(fault.into());
            }
        }
        Ok(())
    }
}

/// Two-pointer walk checking that every missing timestamp reappears in the
/// authoritative set at or after the current scan position.
///
/// A missing timestamp strictly less than the authoritative timestamp under
/// comparison cannot have come from this block; it signals corruption in the
/// partition inputs and is reported rather than merged around.
fn ordering_violations(
    missing: &[i64],
    all: &[i64],
    key: &str,
    counters: &Counters,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let (mut mi, mut ai) = (0, 0);
    while mi < missing.len() && ai < all.len() {
        if missing[mi] == all[ai] {
            mi += 1;
            ai += 1;
        } else if missing[mi] < all[ai] {
            counters.bump("error_ordering_impossibility");
            error!(
                key,
                timestamp = missing[mi],
                "missing timestamp precedes the authoritative set"
            );
            violations.push(InvariantViolation::OrderingImpossibility {
                timestamp: missing[mi],
            });
            mi += 1;
        } else {
            ai += 1;
        }
    }
    violations
}

/// True when `patch` rebuilds the seed snapshot from the empty document —
/// the block's initial empty-to-state patch, already represented by the seed.
fn replays_seed(chain: &DiffChain, patch: &Patch) -> bool {
    let Some(seed) = chain.entry(0).and_then(|entry| entry.cached.as_ref()) else {
        return false;
    };
    let empty = Document::Object(Map::new());
    patch
        .apply(&empty)
        .is_ok_and(|replayed| &replayed == seed)
}

fn patch_fault_path(fault: &scanledger_patch::Error) -> String {
    match fault {
        scanledger_patch::Error::TombstoneLeak { path }
        | scanledger_patch::Error::EmbeddedTombstone { path } => path.clone(),
        scanledger_patch::Error::TopLevelTombstone => "$".to_string(),
    }
}

fn tick_of(snapshot: &Document) -> i64 {
    snapshot.get("tick").and_then(Document::as_i64).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use scanledger_patch::diff;
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    const KEY: &str = "api-key-1";

    fn snapshot(tick: i64) -> Document {
        json!({
            "tick": tick,
            "player_uid": 3,
            "start_time": 900,
            "stars": {"0": {"st": 50 + tick}},
        })
    }

    fn block_for(snapshots: &[(i64, Document)], seed_timestamp: Option<i64>) -> ScanBlock {
        let mut patches = BTreeMap::new();
        let mut prior = Document::Object(Map::new());
        for (timestamp, snapshot) in snapshots {
            let forward = diff(&prior, snapshot).unwrap_or_else(Patch::empty);
            patches.insert(*timestamp, forward);
            prior = snapshot.clone();
        }
        ScanBlock {
            patches,
            initial_scan: snapshots[0].1.clone(),
            last_scan: snapshots[snapshots.len() - 1].1.clone(),
            initial_timestamp: seed_timestamp,
            last_timestamp: snapshots[snapshots.len() - 1].0,
        }
    }

    fn reconciler() -> ScanReconciler<MemoryStore> {
        ScanReconciler::new(Arc::new(MemoryStore::new()), SourceId(7))
    }

    #[tokio::test]
    async fn first_block_seeds_and_appends() {
        let reconciler = reconciler();
        let block = block_for(
            &[(1, snapshot(1)), (2, snapshot(2)), (3, snapshot(3))],
            Some(1),
        );

        let outcome = reconciler.apply_block(KEY, &block).await.unwrap();
        // The seed covers timestamp 1; only 2 and 3 append.
        assert_eq!(outcome.appended, 2);
        assert!(outcome.violations.is_empty());
        assert_eq!(reconciler.scan_count(KEY).await, 3);
        assert_eq!(reconciler.get_scan(KEY, 2).await, Some(snapshot(3)));
        assert_eq!(reconciler.get_scan(KEY, 0).await, Some(snapshot(1)));
    }

    #[tokio::test]
    async fn initial_empty_to_state_patch_is_skipped() {
        let reconciler = reconciler();
        // No declared seed timestamp: the seed falls back to start_time (900),
        // so the first patch (at 1000) is in append range but only replays
        // the seed from the empty document.
        let block = block_for(&[(1000, snapshot(1)), (2000, snapshot(2))], None);

        let outcome = reconciler.apply_block(KEY, &block).await.unwrap();
        assert_eq!(outcome.appended, 1);
        assert_eq!(reconciler.counters().get("skip_initial_state_patch"), 1);
        assert_eq!(reconciler.scan_count(KEY).await, 2);
        assert_eq!(reconciler.get_scan(KEY, 1).await, Some(snapshot(2)));
    }

    #[tokio::test]
    async fn gap_making_diffs_are_discarded() {
        let reconciler = reconciler();
        let block = block_for(
            &[(1, snapshot(1)), (2, snapshot(2)), (3, snapshot(3))],
            Some(1),
        );
        reconciler.apply_block(KEY, &block).await.unwrap();
        assert_eq!(reconciler.scan_count(KEY).await, 3);

        // The server no longer attests to timestamp 3: known {1, 2},
        // missing {4}. Entry 3 must go before 4 is appended.
        let mut patches = BTreeMap::new();
        patches.insert(1, diff(&Document::Object(Map::new()), &snapshot(1)).unwrap());
        patches.insert(2, diff(&snapshot(1), &snapshot(2)).unwrap());
        patches.insert(4, diff(&snapshot(2), &snapshot(4)).unwrap());
        let repair = ScanBlock {
            patches,
            initial_scan: snapshot(1),
            last_scan: snapshot(4),
            initial_timestamp: Some(1),
            last_timestamp: 4,
        };

        let outcome = reconciler.apply_block(KEY, &repair).await.unwrap();
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.appended, 1);
        assert_eq!(reconciler.scan_count(KEY).await, 3);
        assert_eq!(reconciler.get_scan(KEY, 2).await, Some(snapshot(4)));
        assert_eq!(reconciler.get_scan(KEY, 1).await, Some(snapshot(2)));
    }

    #[tokio::test]
    async fn chains_restore_from_the_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let reconciler = ScanReconciler::new(Arc::clone(&store), SourceId(7));
            let block = block_for(
                &[(1, snapshot(1)), (2, snapshot(2)), (3, snapshot(3))],
                Some(1),
            );
            reconciler.apply_block(KEY, &block).await.unwrap();
        }

        let fresh = ScanReconciler::new(store, SourceId(7));
        fresh.open(KEY).await.unwrap();
        assert_eq!(fresh.scan_count(KEY).await, 3);
        assert_eq!(fresh.get_scan(KEY, 1).await, Some(snapshot(2)));
        let info = fresh.api_info(KEY).await.unwrap();
        assert_eq!(info.first_tick, 1);
        assert_eq!(info.last_tick, 3);
        assert_eq!(info.puid, 3);
    }

    #[tokio::test]
    async fn discarded_entries_leave_the_store() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = ScanReconciler::new(Arc::clone(&store), SourceId(7));
        let block = block_for(
            &[(1, snapshot(1)), (2, snapshot(2)), (3, snapshot(3))],
            Some(1),
        );
        reconciler.apply_block(KEY, &block).await.unwrap();

        let mut patches = BTreeMap::new();
        patches.insert(2, diff(&snapshot(1), &snapshot(2)).unwrap());
        patches.insert(4, diff(&snapshot(2), &snapshot(4)).unwrap());
        let repair = ScanBlock {
            patches,
            initial_scan: snapshot(2),
            last_scan: snapshot(4),
            initial_timestamp: None,
            last_timestamp: 4,
        };
        reconciler.apply_block(KEY, &repair).await.unwrap();

        // Entry 3 was discarded; a fresh restore must not resurrect it.
        let fresh = ScanReconciler::new(store, SourceId(7));
        fresh.open(KEY).await.unwrap();
        assert_eq!(fresh.scan_count(KEY).await, 3);
        assert_eq!(fresh.get_scan(KEY, 2).await, Some(snapshot(4)));
    }

    #[test]
    fn ordering_impossibility_is_detected() {
        let counters = Counters::new();
        // 2 claims to be missing but never reappears at or after the scan
        // position in the authoritative set.
        let violations = ordering_violations(&[2, 6], &[5, 6], "k", &counters);
        assert_eq!(
            violations,
            vec![InvariantViolation::OrderingImpossibility { timestamp: 2 }]
        );
        assert_eq!(counters.get("error_ordering_impossibility"), 1);

        // The consistent partition reports nothing.
        assert!(ordering_violations(&[4], &[1, 2, 4], "k", &counters).is_empty());
    }

    #[tokio::test]
    async fn unattested_tail_is_rebuilt_from_the_attested_anchor() {
        let reconciler = reconciler();
        let block = block_for(&[(5, snapshot(5)), (6, snapshot(6))], Some(5));
        reconciler.apply_block(KEY, &block).await.unwrap();

        // A later block attests only {5, 7}: entry 6 is provisional and must
        // be replaced by the patch chained from 5.
        let mut patches = BTreeMap::new();
        patches.insert(5, diff(&Document::Object(Map::new()), &snapshot(5)).unwrap());
        patches.insert(7, diff(&snapshot(5), &snapshot(7)).unwrap());
        let repair = ScanBlock {
            patches,
            initial_scan: snapshot(5),
            last_scan: snapshot(7),
            initial_timestamp: Some(5),
            last_timestamp: 7,
        };

        let outcome = reconciler.apply_block(KEY, &repair).await.unwrap();
        assert_eq!(outcome.discarded, 1);
        assert_eq!(outcome.appended, 1);
        assert_eq!(reconciler.scan_count(KEY).await, 2);
        assert_eq!(reconciler.get_scan(KEY, 1).await, Some(snapshot(7)));
    }

    #[tokio::test]
    async fn unload_drops_memory_but_not_the_store() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = ScanReconciler::new(Arc::clone(&store), SourceId(7));
        let block = block_for(&[(1, snapshot(1)), (2, snapshot(2))], Some(1));
        reconciler.apply_block(KEY, &block).await.unwrap();

        reconciler.unload();
        assert_eq!(reconciler.scan_count(KEY).await, 0);

        reconciler.open(KEY).await.unwrap();
        assert_eq!(reconciler.scan_count(KEY).await, 2);
    }

    #[tokio::test]
    async fn notifications_drain_in_arrival_order() {
        let reconciler = Arc::new(reconciler());
        let (tx, rx) = mpsc::channel(4);

        let block = block_for(&[(1, snapshot(1)), (2, snapshot(2))], Some(1));
        tx.send(ScanNotification {
            key: KEY.to_string(),
            block,
        })
        .await
        .unwrap();
        drop(tx);

        reconciler.run(rx).await;
        assert_eq!(reconciler.scan_count(KEY).await, 2);
    }
}
