//! Durable FIFO log of mutations issued while the server was unreachable
//!
//! Entries live in the `queue` namespace under `entry:{id:020}`, so key order
//! is id order and `peek_oldest` is a single forward seek. The id counter is
//! written in the same batch as the entry it allocates; a crash can never
//! leave an entry without its counter or reuse an id.

pub mod types;

pub use types::{LedgerPayload, MutationKind, QueueEntry, RecordMutation, RecordOp};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};
use crate::storage::{BatchOp, DurableStore};

const ENTRY_PREFIX: &str = "entry:";
const SEQ_KEY: &str = "_sequence";

fn entry_key(id: u64) -> String {
    format!("{}{:020}", ENTRY_PREFIX, id)
}

pub struct MutationQueue {
    store: DurableStore,
    clock: SharedClock,
    /// Highest id ever allocated
    sequence: Arc<Mutex<u64>>,
}

impl Clone for MutationQueue {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            sequence: self.sequence.clone(),
        }
    }
}

impl MutationQueue {
    /// Open the queue, restoring the id counter from disk
    pub fn open(store: DurableStore, clock: SharedClock) -> SyncResult<Self> {
        let persisted = store
            .get(SEQ_KEY)?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        // The newest entry wins if the counter is somehow behind it
        let newest = store
            .scan_prefix(ENTRY_PREFIX, None)?
            .last()
            .and_then(|r| serde_json::from_value::<QueueEntry>(r.value.clone()).ok())
            .map(|e| e.id)
            .unwrap_or(0);

        let sequence = persisted.max(newest);
        let queue = Self {
            store,
            clock,
            sequence: Arc::new(Mutex::new(sequence)),
        };

        let pending = queue.len()?;
        if pending > 0 {
            tracing::info!("Mutation queue restored with {} pending entries", pending);
        }
        Ok(queue)
    }

    /// Append a new entry; durable before this returns
    pub fn enqueue(&self, kind: MutationKind, payload: JsonValue) -> SyncResult<u64> {
        let mut seq = self.sequence.lock();
        let id = *seq + 1;

        let entry = QueueEntry {
            id,
            kind,
            payload,
            enqueued_at: self.clock.now_millis(),
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        };

        self.store.write_batch(vec![
            BatchOp::Put {
                key: entry_key(id),
                value: serde_json::to_value(&entry)?,
            },
            BatchOp::Put {
                key: SEQ_KEY.to_string(),
                value: JsonValue::from(id),
            },
        ])?;

        // Only advance once the write landed, so a failed enqueue leaves no gap
        *seq = id;
        tracing::debug!("Enqueued {} mutation {}", kind, id);
        Ok(id)
    }

    pub fn enqueue_ledger(&self, kind: MutationKind, payload: &LedgerPayload) -> SyncResult<u64> {
        self.enqueue(kind, serde_json::to_value(payload)?)
    }

    pub fn enqueue_record(&self, mutation: &RecordMutation) -> SyncResult<u64> {
        self.enqueue(MutationKind::GenericMutation, serde_json::to_value(mutation)?)
    }

    /// Lowest-id entry still in the queue
    pub fn peek_oldest(&self) -> SyncResult<Option<QueueEntry>> {
        match self.store.first_with_prefix(ENTRY_PREFIX)? {
            Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: u64) -> SyncResult<Option<QueueEntry>> {
        match self.store.get(&entry_key(id))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Remove an entry permanently. Acking an unknown id is a no-op.
    pub fn ack(&self, id: u64) -> SyncResult<()> {
        self.store.remove(&entry_key(id))?;
        tracing::debug!("Acked queue entry {}", id);
        Ok(())
    }

    /// Count one more failed attempt, returning the new total
    pub fn mark_attempt(&self, id: u64, error: Option<String>) -> SyncResult<u32> {
        let mut entry = self.get(id)?.ok_or(SyncError::EntryNotFound(id))?;
        entry.attempts += 1;
        entry.last_attempt_at = Some(self.clock.now_millis());
        if error.is_some() {
            entry.last_error = error;
        }

        self.store
            .save(&entry_key(id), serde_json::to_value(&entry)?)?;
        Ok(entry.attempts)
    }

    /// Every pending entry in id order
    pub fn entries(&self) -> SyncResult<Vec<QueueEntry>> {
        self.store
            .scan_prefix(ENTRY_PREFIX, None)?
            .into_iter()
            .map(|r| serde_json::from_value(r.value).map_err(SyncError::from))
            .collect()
    }

    pub fn len(&self) -> SyncResult<usize> {
        self.store.count_prefix(ENTRY_PREFIX)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.store.first_with_prefix(ENTRY_PREFIX)?.is_none())
    }

    /// Highest id allocated so far
    pub fn current_sequence(&self) -> u64 {
        *self.sequence.lock()
    }
}
