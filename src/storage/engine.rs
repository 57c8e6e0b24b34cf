use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::store::{DurableStore, Namespace};
use crate::clock::{system_clock, SharedClock};
use crate::error::{SyncError, SyncResult};

/// The on-device storage engine backed by RocksDB.
///
/// One column family per [`Namespace`]; every namespace handle shares the
/// same database instance, so one installation has exactly one engine.
pub struct StorageEngine {
    db: Arc<DB>,
    path: PathBuf,
    clock: SharedClock,
}

impl Clone for StorageEngine {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            path: self.path.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("path", &self.path)
            .finish()
    }
}

impl StorageEngine {
    /// Open (or create) the store at `data_dir` using the system clock
    pub fn open<P: AsRef<Path>>(data_dir: P) -> SyncResult<Self> {
        Self::open_with_clock(data_dir, system_clock())
    }

    pub fn open_with_clock<P: AsRef<Path>>(data_dir: P, clock: SharedClock) -> SyncResult<Self> {
        let path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Small footprint: this runs on phones, not servers
        opts.set_max_total_wal_size(8 * 1024 * 1024);
        opts.set_keep_log_file_num(2);
        opts.set_recycle_log_file_num(1);

        // Keep any column family a newer build may have created
        let mut cf_names = DB::list_cf(&opts, &path).unwrap_or_else(|_| vec!["default".to_string()]);
        for ns in Namespace::ALL {
            if !cf_names.iter().any(|n| n == ns.as_str()) {
                cf_names.push(ns.as_str().to_string());
            }
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)
            .map_err(|e| SyncError::Storage(format!("Failed to open RocksDB: {}", e)))?;

        tracing::info!("Opened durable store at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            path,
            clock,
        })
    }

    /// Handle to one namespace of this store
    pub fn store(&self, namespace: Namespace) -> DurableStore {
        DurableStore::new(self.db.clone(), namespace, self.clock.clone())
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush memtables to SST files
    pub fn flush(&self) -> SyncResult<()> {
        for ns in Namespace::ALL {
            if let Some(cf) = self.db.cf_handle(ns.as_str()) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_all_namespaces() {
        let tmp = TempDir::new().unwrap();
        let engine = StorageEngine::open(tmp.path()).unwrap();

        for ns in Namespace::ALL {
            let store = engine.store(ns);
            store.save("marker", json!(ns.as_str())).unwrap();
            assert_eq!(store.get("marker").unwrap(), Some(json!(ns.as_str())));
        }
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(tmp.path()).unwrap();
            engine
                .store(Namespace::Records)
                .save("field:1", json!({"crop": "maize"}))
                .unwrap();
            engine.flush().unwrap();
        }

        let engine = StorageEngine::open(tmp.path()).unwrap();
        assert_eq!(
            engine.store(Namespace::Records).get("field:1").unwrap(),
            Some(json!({"crop": "maize"}))
        );
    }
}
