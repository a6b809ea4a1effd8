#![forbid(unsafe_code)]

//! Propagation counters.

use std::cell::Cell;

/// Snapshot of a broker's counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BrokerStats {
    /// Top-level propagation passes run.
    pub passes: u64,
    /// Update methods that returned `Ok`, changed or not.
    pub updates_applied: u64,
    /// Update methods that reported a change.
    pub updates_changed: u64,
    /// Update methods that failed or panicked.
    pub updates_failed: u64,
    /// Cascades started from a changed target.
    pub cascades: u64,
    /// Cascade branches dropped at the depth limit.
    pub depth_limit_hits: u64,
    /// Holder change notifications published.
    pub notifications: u64,
    /// Change queues allocated by the reentrancy pool.
    pub queues_allocated: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    passes: Cell<u64>,
    updates_applied: Cell<u64>,
    updates_changed: Cell<u64>,
    updates_failed: Cell<u64>,
    cascades: Cell<u64>,
    depth_limit_hits: Cell<u64>,
    notifications: Cell<u64>,
}

fn bump(counter: &Cell<u64>) {
    counter.set(counter.get().saturating_add(1));
}

impl StatsCell {
    pub(crate) fn record_pass(&self) {
        bump(&self.passes);
    }

    pub(crate) fn record_applied(&self, changed: bool) {
        bump(&self.updates_applied);
        if changed {
            bump(&self.updates_changed);
        }
    }

    pub(crate) fn record_failed(&self) {
        bump(&self.updates_failed);
    }

    pub(crate) fn record_cascade(&self) {
        bump(&self.cascades);
    }

    pub(crate) fn record_depth_limit(&self) {
        bump(&self.depth_limit_hits);
    }

    pub(crate) fn record_notification(&self) {
        bump(&self.notifications);
    }

    pub(crate) fn snapshot(&self, queues_allocated: u64) -> BrokerStats {
        BrokerStats {
            passes: self.passes.get(),
            updates_applied: self.updates_applied.get(),
            updates_changed: self.updates_changed.get(),
            updates_failed: self.updates_failed.get(),
            cascades: self.cascades.get(),
            depth_limit_hits: self.depth_limit_hits.get(),
            notifications: self.notifications.get(),
            queues_allocated,
        }
    }
}
