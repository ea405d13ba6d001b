//! Fire-and-forget diagnostic counters.
//!
//! Reconciliation never crashes on a diagnostic; it bumps a named counter and
//! keeps going. The sink is cheap, cloneable, and shared — snapshots exist so
//! operators and tests can see what the reconcilers observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared fire-and-forget counter sink.
///
/// Clones share the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl Counters {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `name` by one.
    pub fn bump(&self, name: impl Into<String>) {
        let name = name.into();
        tracing::trace!(counter = %name, "bump");
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *map.entry(name).or_default() += 1;
    }

    /// Current value of `name`, zero if never bumped.
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(name).copied().unwrap_or(0)
    }

    /// Snapshot of every counter.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_accumulates() {
        let counters = Counters::new();
        counters.bump("overlaps_found");
        counters.bump("overlaps_found");
        assert_eq!(counters.get("overlaps_found"), 2);
        assert_eq!(counters.get("never_bumped"), 0);
    }

    #[test]
    fn clones_share_state() {
        let counters = Counters::new();
        let shared = counters.clone();
        shared.bump("force_restore");
        assert_eq!(counters.get("force_restore"), 1);
        assert_eq!(counters.snapshot().len(), 1);
    }
}
