//! Scan diff blocks and their validation replay.

use std::collections::BTreeMap;

use scanledger_patch::{Document, Patch, diff};
use serde::Deserialize;
use tracing::error;

use crate::counters::Counters;
use crate::error::{InvariantViolation, Result};

/// One change-notification batch: timestamped forward patches plus the
/// server-declared anchors they must replay to.
#[derive(Debug, Clone)]
pub struct ScanBlock {
    /// Forward patches keyed by authoritative timestamp, ascending.
    pub patches: BTreeMap<i64, Patch>,
    /// Declared snapshot after the block's first patch; seeds a fresh chain.
    pub initial_scan: Document,
    /// Declared snapshot after the block's last patch.
    pub last_scan: Document,
    /// Timestamp for the seed snapshot when the block starts a chain.
    pub initial_timestamp: Option<i64>,
    /// Authoritative tail timestamp.
    pub last_timestamp: i64,
}

/// Wire shape: named anchor fields beside numeric-string patch keys.
#[derive(Deserialize)]
struct WireBlock {
    initial_scan: String,
    last_scan: String,
    #[serde(default)]
    initial_timestamp: Option<i64>,
    last_timestamp: i64,
    #[serde(flatten)]
    patches: BTreeMap<String, Document>,
}

impl ScanBlock {
    /// Parses a block from its wire document.
    ///
    /// Numeric-string keys map to JSON-serialized patch strings; the anchor
    /// scans are themselves JSON-serialized. Non-numeric extra keys and the
    /// zero timestamp are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error when a field fails to decode or a patch embeds a
    /// tombstone below a deletable position.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let wire: WireBlock = serde_json::from_value(doc.clone())?;

        let mut patches = BTreeMap::new();
        for (key, value) in &wire.patches {
            let Ok(timestamp) = key.parse::<i64>() else {
                continue;
            };
            if timestamp == 0 {
                continue;
            }
            let raw = match value.as_str() {
                Some(raw) => serde_json::from_str::<Document>(raw)?,
                None => value.clone(),
            };
            patches.insert(timestamp, Patch::from_value(&raw)?);
        }

        Ok(Self {
            patches,
            initial_scan: serde_json::from_str(&wire.initial_scan)?,
            last_scan: serde_json::from_str(&wire.last_scan)?,
            initial_timestamp: wire.initial_timestamp,
            last_timestamp: wire.last_timestamp,
        })
    }

    /// Replays the block's patches over the running validation snapshot,
    /// checking the declared anchors.
    ///
    /// After the first patch the replay must equal `initial_scan`; after the
    /// last, the timestamp must equal `last_timestamp` and the replay must
    /// equal `last_scan`. Each mismatch is logged, counted, and repaired by
    /// substituting the server-declared value as ground truth, so one bad
    /// block cannot poison the replay of the next.
    pub fn validate(&self, state: &mut Document, counters: &Counters) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let count = self.patches.len();
        for (i, (&timestamp, patch)) in self.patches.iter().enumerate() {
            match patch.apply(state) {
                Ok(next) => *state = next,
                Err(err) => {
                    counters.bump("error_validation_replay");
                    error!(timestamp, error = %err, "validation replay failed to apply patch");
                    continue;
                }
            }
            if i == 0 && diff(state, &self.initial_scan).is_some() {
                counters.bump("error_initial_scan_mismatch");
                error!(timestamp, "initial scan mismatch");
                violations.push(InvariantViolation::InitialScanMismatch);
                *state = self.initial_scan.clone();
            }
            if i + 1 == count {
                if timestamp != self.last_timestamp {
                    counters.bump("error_last_timestamp_mismatch");
                    error!(
                        declared = self.last_timestamp,
                        replayed = timestamp,
                        "last timestamp mismatch"
                    );
                    violations.push(InvariantViolation::LastTimestampMismatch {
                        declared: self.last_timestamp,
                        replayed: timestamp,
                    });
                }
                if diff(state, &self.last_scan).is_some() {
                    counters.bump("error_last_scan_mismatch");
                    error!(timestamp, "last scan mismatch");
                    violations.push(InvariantViolation::LastScanMismatch);
                    *state = self.last_scan.clone();
                }
            }
        }
        violations
    }
}
