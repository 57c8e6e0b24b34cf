use rocksdb::{ColumnFamily, Direction, IteratorMode, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};

/// Logical namespaces, one RocksDB column family each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Arbitrary caller records
    Records,
    /// Pending mutation log
    Queue,
    /// Ledger snapshot
    Ledger,
    /// Settled replay outcomes
    History,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Records,
        Namespace::Queue,
        Namespace::Ledger,
        Namespace::History,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Records => "records",
            Namespace::Queue => "queue",
            Namespace::Ledger => "ledger",
            Namespace::History => "history",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for every value written through a [`DurableStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Value,
    /// Unix timestamp in milliseconds
    pub stored_at: u64,
}

/// One write in an atomic [`DurableStore::write_batch`]
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// Crash-safe keyed record store scoped to one namespace.
///
/// Every write is synced to the RocksDB WAL before the call returns. Errors
/// are always returned to the caller; nothing here degrades silently.
#[derive(Clone)]
pub struct DurableStore {
    db: Arc<DB>,
    namespace: Namespace,
    clock: SharedClock,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl DurableStore {
    pub(crate) fn new(db: Arc<DB>, namespace: Namespace, clock: SharedClock) -> Self {
        Self {
            db,
            namespace,
            clock,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    fn cf(&self) -> SyncResult<&ColumnFamily> {
        self.db.cf_handle(self.namespace.as_str()).ok_or_else(|| {
            SyncError::Storage(format!("namespace '{}' is not available", self.namespace))
        })
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    fn encode(&self, key: &str, value: Value) -> SyncResult<Vec<u8>> {
        let record = Record {
            key: key.to_string(),
            value,
            stored_at: self.clock.now_millis(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    // ==================== Point Operations ====================

    /// Persist `value` under `key`, replacing any existing record
    pub fn save(&self, key: &str, value: Value) -> SyncResult<()> {
        let cf = self.cf()?;
        let bytes = self.encode(key, value)?;
        self.db
            .put_cf_opt(cf, key.as_bytes(), bytes, &Self::sync_writes())
            .map_err(|e| SyncError::Storage(format!("Failed to save '{}': {}", key, e)))
    }

    /// Most recently saved value, or `None` if absent
    pub fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.get_record(key)?.map(|r| r.value))
    }

    pub fn get_record(&self, key: &str) -> SyncResult<Option<Record>> {
        let cf = self.cf()?;
        let bytes = self
            .db
            .get_cf(cf, key.as_bytes())
            .map_err(|e| SyncError::Storage(format!("Failed to read '{}': {}", key, e)))?;

        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> SyncResult<bool> {
        let cf = self.cf()?;
        Ok(self.db.get_pinned_cf(cf, key.as_bytes())?.is_some())
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub fn remove(&self, key: &str) -> SyncResult<()> {
        let cf = self.cf()?;
        self.db
            .delete_cf_opt(cf, key.as_bytes(), &Self::sync_writes())
            .map_err(|e| SyncError::Storage(format!("Failed to remove '{}': {}", key, e)))
    }

    /// Wipe every key in this namespace. Other namespaces are untouched.
    pub fn clear(&self) -> SyncResult<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        let mut count = 0usize;

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, key);
            count += 1;
        }

        self.db.write_opt(batch, &Self::sync_writes())?;
        tracing::debug!("Cleared {} keys from namespace '{}'", count, self.namespace);
        Ok(())
    }

    // ==================== Batch & Scan Operations ====================

    /// Apply all ops atomically: either every op is durable or none is
    pub fn write_batch(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();

        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    let bytes = self.encode(&key, value)?;
                    batch.put_cf(cf, key.as_bytes(), bytes);
                }
                BatchOp::Delete { key } => batch.delete_cf(cf, key.as_bytes()),
            }
        }

        self.db
            .write_opt(batch, &Self::sync_writes())
            .map_err(|e| SyncError::Storage(format!("Failed to write batch: {}", e)))
    }

    /// Records whose key starts with `prefix`, in key order, at most `limit`
    pub fn scan_prefix(&self, prefix: &str, limit: Option<usize>) -> SyncResult<Vec<Record>> {
        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            records.push(serde_json::from_slice::<Record>(&value)?);
            if limit.is_some_and(|l| records.len() >= l) {
                break;
            }
        }
        Ok(records)
    }

    /// First record (lowest key) under `prefix`
    pub fn first_with_prefix(&self, prefix: &str) -> SyncResult<Option<Record>> {
        Ok(self.scan_prefix(prefix, Some(1))?.into_iter().next())
    }

    pub fn count_prefix(&self, prefix: &str) -> SyncResult<usize> {
        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut count = 0;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// All keys in this namespace
    pub fn keys(&self) -> SyncResult<Vec<String>> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}
