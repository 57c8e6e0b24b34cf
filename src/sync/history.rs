//! Log of settled replays
//!
//! One entry per queue entry that left the queue, whatever the outcome.
//! Bounded to `limit` entries, oldest dropped first.

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};
use crate::queue::MutationKind;
use crate::storage::{BatchOp, DurableStore};

const HISTORY_PREFIX: &str = "h:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Completed,
    Rejected,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub queue_id: u64,
    pub kind: MutationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub status: HistoryStatus,
    /// Failed attempts before settling
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: u64,
}

#[derive(Clone)]
pub struct SyncHistory {
    store: DurableStore,
    clock: SharedClock,
    limit: usize,
}

impl SyncHistory {
    pub fn new(store: DurableStore, clock: SharedClock, limit: usize) -> Self {
        Self {
            store,
            clock,
            limit: limit.max(1),
        }
    }

    pub fn record(
        &self,
        queue_id: u64,
        kind: MutationKind,
        transaction_id: Option<String>,
        status: HistoryStatus,
        attempts: u32,
        error: Option<String>,
    ) -> SyncResult<HistoryEntry> {
        let entry = HistoryEntry {
            queue_id,
            kind,
            transaction_id,
            status,
            attempts,
            error,
            recorded_at: self.clock.now_millis(),
        };

        // Queue ids are never reused, so they order the log too
        let key = format!("{}{:020}", HISTORY_PREFIX, queue_id);
        self.store.save(&key, serde_json::to_value(&entry)?)?;
        self.prune()?;
        Ok(entry)
    }

    fn prune(&self) -> SyncResult<()> {
        let count = self.store.count_prefix(HISTORY_PREFIX)?;
        if count <= self.limit {
            return Ok(());
        }

        let excess = count - self.limit;
        let ops = self
            .store
            .scan_prefix(HISTORY_PREFIX, Some(excess))?
            .into_iter()
            .map(|r| BatchOp::Delete { key: r.key })
            .collect();
        self.store.write_batch(ops)
    }

    /// Oldest first
    pub fn entries(&self) -> SyncResult<Vec<HistoryEntry>> {
        self.store
            .scan_prefix(HISTORY_PREFIX, None)?
            .into_iter()
            .map(|r| serde_json::from_value(r.value).map_err(SyncError::from))
            .collect()
    }

    /// Newest first, at most `n`
    pub fn recent(&self, n: usize) -> SyncResult<Vec<HistoryEntry>> {
        let mut entries = self.entries()?;
        entries.reverse();
        entries.truncate(n);
        Ok(entries)
    }
}
