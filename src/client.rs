//! Caller-facing facade
//!
//! [`OfflineClient`] owns one storage engine, the queue, the ledger and the
//! reconciler. Ledger requests made while online with an empty queue go
//! straight to the server under the reconciler's gate; everything else is
//! checked against the visible balance, applied locally, queued, and
//! replayed in order later.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::clock::{system_clock, SharedClock};
use crate::config::ClientConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::ledger::{BalanceChanged, LedgerSnapshot, OptimisticLedger};
use crate::network::NetworkMonitor;
use crate::queue::{
    LedgerPayload, MutationKind, MutationQueue, QueueEntry, RecordMutation, RecordOp,
};
use crate::remote::{
    BalanceQuery, BalanceSourceSelector, LedgerService, PullBalanceSource, PushBalanceSource,
    RecordService,
};
use crate::storage::{DurableStore, Namespace, StorageEngine};
use crate::sync::{
    HistoryEntry, PassReport, ReconcilerConfig, ReconcilerState, SyncFailure, SyncHistory,
    SyncReconciler, SyncServices,
};

const RECOVERED_REASON: &str = "recovered after restart";

/// Remote endpoints and host hooks handed to [`OfflineClient::open`]
pub struct ClientServices {
    ledger: Arc<dyn LedgerService>,
    records: Option<Arc<dyn RecordService>>,
    balance_query: Option<Arc<dyn BalanceQuery>>,
    push: Option<PushBalanceSource>,
    clock: SharedClock,
    initially_online: bool,
}

impl ClientServices {
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self {
            ledger,
            records: None,
            balance_query: None,
            push: None,
            clock: system_clock(),
            initially_online: true,
        }
    }

    /// Without a record service, record writes stay local
    pub fn with_records(mut self, records: Arc<dyn RecordService>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_balance_query(mut self, query: Arc<dyn BalanceQuery>) -> Self {
        self.balance_query = Some(query);
        self
    }

    pub fn with_push(mut self, push: PushBalanceSource) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Connectivity at startup, before the host reports any transition
    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub online: bool,
    pub pending_mutations: usize,
    pub reconciler: ReconcilerState,
    pub pass_running: bool,
    pub visible_balance: i64,
    pub confirmed_balance: i64,
    pub pending_transactions: usize,
    pub last_server_sync_at: Option<u64>,
    pub last_connected_at: Option<u64>,
}

pub struct OfflineClient {
    config: ClientConfig,
    engine: StorageEngine,
    records: DurableStore,
    queue: MutationQueue,
    ledger: Arc<OptimisticLedger>,
    history: SyncHistory,
    network: Arc<NetworkMonitor>,
    reconciler: Arc<SyncReconciler>,
    has_record_service: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineClient {
    /// Open the persisted state under `config.data_dir` and wire up the
    /// reconciler. Nothing runs in the background until [`Self::start`].
    pub fn open(config: ClientConfig, services: ClientServices) -> SyncResult<Self> {
        config.validate()?;

        let clock = services.clock.clone();
        let engine = StorageEngine::open_with_clock(&config.data_dir, clock.clone())?;
        let records = engine.store(Namespace::Records);
        let queue = MutationQueue::open(engine.store(Namespace::Queue), clock.clone())?;
        let ledger = Arc::new(OptimisticLedger::open(
            engine.store(Namespace::Ledger),
            config.event_buffer,
        )?);
        let history = SyncHistory::new(
            engine.store(Namespace::History),
            clock.clone(),
            config.history_limit,
        );

        let recovered = recover_orphaned_deltas(&queue, &ledger)?;
        if recovered > 0 {
            tracing::warn!(
                "Re-queued {} pending transactions that had no queue entry",
                recovered
            );
        }

        let network = Arc::new(NetworkMonitor::new(services.initially_online, clock));

        let mut selector = BalanceSourceSelector::new();
        if let Some(query) = services.balance_query {
            selector = selector.with_pull(PullBalanceSource::new(query, config.user_id.clone()));
        }
        if let Some(push) = services.push {
            selector = selector.with_push(push);
        }

        let has_record_service = services.records.is_some();
        let reconciler = Arc::new(SyncReconciler::new(
            queue.clone(),
            ledger.clone(),
            history.clone(),
            network.clone(),
            SyncServices {
                ledger: services.ledger,
                records: services.records,
                balance: Arc::new(selector),
            },
            ReconcilerConfig::from(&config),
            config.event_buffer,
        ));

        tracing::info!(
            "Offline client ready for user {} (balance {}, {} queued)",
            config.user_id,
            ledger.visible_balance(),
            queue.len()?
        );

        Ok(Self {
            config,
            engine,
            records,
            queue,
            ledger,
            history,
            network,
            reconciler,
            has_record_service,
            task: Mutex::new(None),
        })
    }

    /// Spawn the background reconciler. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(self.reconciler.clone().run()));
    }

    /// Stop the reconciler and flush the store
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.reconciler.shutdown();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Reconciler task ended abnormally: {}", e);
            }
        }
        self.engine.flush()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The monitor the host reports connectivity transitions to
    pub fn network(&self) -> Arc<NetworkMonitor> {
        self.network.clone()
    }

    pub fn reconciler(&self) -> Arc<SyncReconciler> {
        self.reconciler.clone()
    }

    // ==================== Balance ====================

    pub fn visible_balance(&self) -> i64 {
        self.ledger.visible_balance()
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Spend `amount` credits; returns the transaction id
    pub async fn request_debit(&self, amount: i64, reason: &str) -> SyncResult<String> {
        self.request_ledger(MutationKind::LedgerDebit, amount, reason)
            .await
    }

    /// Add `amount` credits; returns the transaction id
    pub async fn request_credit(&self, amount: i64, reason: &str) -> SyncResult<String> {
        self.request_ledger(MutationKind::LedgerCredit, amount, reason)
            .await
    }

    async fn request_ledger(
        &self,
        kind: MutationKind,
        amount: i64,
        reason: &str,
    ) -> SyncResult<String> {
        if amount <= 0 {
            return Err(SyncError::InvalidAmount(amount));
        }

        let payload = LedgerPayload {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            amount,
            reason: reason.to_string(),
            deferred: false,
        };

        if self.network.is_online() {
            // A running pass means the queue is busy; queue behind it
            if let Ok(_guard) = self.reconciler.gate().try_lock() {
                if self.queue.is_empty()? {
                    return self.send_direct(kind, payload).await;
                }
            }
        }

        // Queued debits reach the server only on replay, so check them here
        if kind == MutationKind::LedgerDebit {
            let available = self.ledger.visible_balance();
            if amount > available {
                return Err(SyncError::InsufficientCredits {
                    requested: amount,
                    available,
                });
            }
        }

        self.queue_ledger(kind, &payload)?;
        Ok(payload.transaction_id)
    }

    /// Must be called with the gate held
    async fn send_direct(&self, kind: MutationKind, payload: LedgerPayload) -> SyncResult<String> {
        let tx = payload.transaction_id.clone();

        // Don't show a balance the server is about to refuse
        let pessimistic =
            kind == MutationKind::LedgerDebit && payload.amount > self.ledger.visible_balance();
        if !pessimistic {
            self.ledger.apply_optimistic(&tx, payload.delta(kind))?;
        }

        match self.reconciler.send_ledger(kind, &payload).await {
            Ok(()) => {
                if !pessimistic {
                    self.ledger.confirm(&tx)?;
                } else if !self.reconciler.refresh_balance().await? {
                    // No fresh server value; account for the debit ourselves
                    self.ledger.fold_accepted(&tx, payload.delta(kind))?;
                }
                Ok(tx)
            }
            Err(RemoteError::Rejected(reason)) => {
                tracing::warn!("Server rejected {} {}: {}", kind, tx, reason);
                self.ledger.rollback(&tx)?;
                let error = SyncError::RejectedByServer(reason);
                self.reconciler.publish_failure(SyncFailure {
                    queue_id: None,
                    kind,
                    transaction_id: Some(tx),
                    error: error.clone(),
                });
                Err(error)
            }
            Err(RemoteError::Transient(reason)) => {
                tracing::debug!("Direct {} {} failed ({}), queueing", kind, tx, reason);
                let payload = LedgerPayload {
                    deferred: pessimistic,
                    ..payload
                };
                if let Err(e) = self.queue.enqueue_ledger(kind, &payload) {
                    self.ledger.rollback(&tx)?;
                    return Err(e);
                }
                self.reconciler.notify();
                Ok(tx)
            }
        }
    }

    /// Optimistic apply, then a durable queue entry; undone if the entry can't be written
    fn queue_ledger(&self, kind: MutationKind, payload: &LedgerPayload) -> SyncResult<u64> {
        let tx = &payload.transaction_id;
        self.ledger.apply_optimistic(tx, payload.delta(kind))?;

        let id = match self.queue.enqueue_ledger(kind, payload) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to queue {} {}: {}", kind, tx, e);
                if let Err(rollback) = self.ledger.rollback(tx) {
                    tracing::error!("Rollback of {} also failed: {}", tx, rollback);
                }
                return Err(e);
            }
        };

        self.reconciler.notify();
        Ok(id)
    }

    pub fn subscribe_balance(&self) -> broadcast::Receiver<BalanceChanged> {
        self.ledger.subscribe()
    }

    /// Call `f` for every balance change until the client is dropped
    pub fn on_balance_changed<F>(&self, f: F) -> JoinHandle<()>
    where
        F: Fn(BalanceChanged) + Send + 'static,
    {
        let mut rx = self.ledger.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => f(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Balance listener skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Definitive failures: rejections, exhausted retries, invariant violations
    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncFailure> {
        self.reconciler.subscribe_failures()
    }

    // ==================== Records ====================

    pub async fn save_record(&self, key: &str, value: Value) -> SyncResult<()> {
        self.records.save(key, value.clone())?;
        self.push_record(RecordMutation {
            key: key.to_string(),
            op: RecordOp::Upsert,
            value: Some(value),
        })
        .await
    }

    pub fn get_record(&self, key: &str) -> SyncResult<Option<Value>> {
        self.records.get(key)
    }

    pub async fn remove_record(&self, key: &str) -> SyncResult<()> {
        self.records.remove(key)?;
        self.push_record(RecordMutation {
            key: key.to_string(),
            op: RecordOp::Delete,
            value: None,
        })
        .await
    }

    pub fn record_keys(&self) -> SyncResult<Vec<String>> {
        self.records.keys()
    }

    /// Mirror a local record change to the server, now or later.
    /// The local write stands even if the server refuses it.
    async fn push_record(&self, mutation: RecordMutation) -> SyncResult<()> {
        if !self.has_record_service {
            return Ok(());
        }

        if self.network.is_online() {
            if let Ok(_guard) = self.reconciler.gate().try_lock() {
                if self.queue.is_empty()? {
                    match self.reconciler.send_record(&mutation).await {
                        Ok(()) => return Ok(()),
                        Err(RemoteError::Rejected(reason)) => {
                            tracing::warn!("Server rejected record {}: {}", mutation.key, reason);
                            return Err(SyncError::RejectedByServer(reason));
                        }
                        Err(RemoteError::Transient(reason)) => {
                            tracing::debug!("Record push failed ({}), queueing", reason);
                        }
                    }
                }
            }
        }

        self.queue.enqueue_record(&mutation)?;
        self.reconciler.notify();
        Ok(())
    }

    // ==================== Sync ====================

    /// Run one pass now instead of waiting for the background loop
    pub async fn sync_now(&self) -> SyncResult<PassReport> {
        self.reconciler.run_pass().await
    }

    pub fn pending_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        self.queue.entries()
    }

    /// Newest first
    pub fn history(&self, limit: usize) -> SyncResult<Vec<HistoryEntry>> {
        self.history.recent(limit)
    }

    pub fn status(&self) -> SyncResult<ClientStatus> {
        let connectivity = self.network.state();
        let snapshot = self.ledger.snapshot();
        Ok(ClientStatus {
            online: connectivity.online,
            pending_mutations: self.queue.len()?,
            reconciler: self.reconciler.state(),
            pass_running: self.reconciler.is_pass_running(),
            visible_balance: snapshot.visible_balance(),
            confirmed_balance: snapshot.confirmed_balance,
            pending_transactions: snapshot.pending_deltas.len(),
            last_server_sync_at: snapshot.last_server_sync_at,
            last_connected_at: connectivity.last_connected_at,
        })
    }
}

impl Drop for OfflineClient {
    fn drop(&mut self) {
        self.reconciler.shutdown();
    }
}

/// Queue a replay for every pending delta that lost its queue entry, e.g. a
/// crash between a direct send and its confirmation. The server dedupes by
/// transaction id, so a replay of something it already applied is harmless.
fn recover_orphaned_deltas(queue: &MutationQueue, ledger: &OptimisticLedger) -> SyncResult<usize> {
    let queued: HashSet<String> = queue
        .entries()?
        .iter()
        .filter_map(|e| e.transaction_id())
        .collect();

    let mut recovered = 0;
    for (tx, delta) in ledger.snapshot().pending_deltas {
        if queued.contains(&tx) {
            continue;
        }
        let kind = if delta < 0 {
            MutationKind::LedgerDebit
        } else {
            MutationKind::LedgerCredit
        };
        queue.enqueue_ledger(
            kind,
            &LedgerPayload {
                transaction_id: tx,
                amount: delta.abs(),
                reason: RECOVERED_REASON.to_string(),
                deferred: false,
            },
        )?;
        recovered += 1;
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::RemoteResult;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct AlwaysOk;

    #[async_trait]
    impl LedgerService for AlwaysOk {
        async fn debit(&self, _tx: &str, _amount: i64, _reason: &str) -> RemoteResult<()> {
            Ok(())
        }

        async fn credit(&self, _tx: &str, _amount: i64, _reason: &str) -> RemoteResult<()> {
            Ok(())
        }
    }

    fn open(dir: &TempDir, online: bool) -> OfflineClient {
        let config = ClientConfig::default().with_data_dir(dir.path());
        let services = ClientServices::new(Arc::new(AlwaysOk))
            .with_clock(Arc::new(ManualClock::new(1)))
            .initially_online(online);
        OfflineClient::open(config, services).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_amounts() {
        let tmp = TempDir::new().unwrap();
        let client = open(&tmp, true);
        assert_eq!(
            client.request_debit(0, "x").await,
            Err(SyncError::InvalidAmount(0))
        );
        assert_eq!(
            client.request_credit(-5, "x").await,
            Err(SyncError::InvalidAmount(-5))
        );
    }

    #[tokio::test]
    async fn test_offline_guard() {
        let tmp = TempDir::new().unwrap();
        let client = open(&tmp, false);
        client.request_credit(30, "top-up").await.unwrap();

        let err = client.request_debit(31, "too much").await.unwrap_err();
        assert_eq!(
            err,
            SyncError::InsufficientCredits {
                requested: 31,
                available: 30
            }
        );
        assert_eq!(client.pending_entries().unwrap().len(), 1);
        assert_eq!(client.visible_balance(), 30);
    }

    #[tokio::test]
    async fn test_guard_applies_while_gate_is_held() {
        let tmp = TempDir::new().unwrap();
        let client = open(&tmp, true);
        client.request_credit(10, "top-up").await.unwrap();
        assert_eq!(client.ledger_snapshot().confirmed_balance, 10);

        let _held = client.reconciler.gate().lock().await;
        let err = client.request_debit(11, "too much").await.unwrap_err();
        assert_eq!(
            err,
            SyncError::InsufficientCredits {
                requested: 11,
                available: 10
            }
        );
        assert!(client.pending_entries().unwrap().is_empty());

        client.request_debit(4, "fits").await.unwrap();
        assert_eq!(client.visible_balance(), 6);
        assert_eq!(client.pending_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_records_without_service_stay_local() {
        let tmp = TempDir::new().unwrap();
        let client = open(&tmp, false);
        client
            .save_record("plot:1", serde_json::json!({"area": 2}))
            .await
            .unwrap();
        assert_eq!(
            client.get_record("plot:1").unwrap(),
            Some(serde_json::json!({"area": 2}))
        );
        assert!(client.pending_entries().unwrap().is_empty());

        client.remove_record("plot:1").await.unwrap();
        assert_eq!(client.get_record("plot:1").unwrap(), None);
    }

    #[test]
    fn test_orphaned_delta_is_requeued() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(tmp.path()).unwrap();
            let ledger = OptimisticLedger::open(engine.store(Namespace::Ledger), 4).unwrap();
            ledger.apply_optimistic("lost", -7).unwrap();
        }

        let client = open(&tmp, false);
        let entries = client.pending_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, MutationKind::LedgerDebit);
        let payload = entries[0].ledger_payload().unwrap();
        assert_eq!(payload.transaction_id, "lost");
        assert_eq!(payload.amount, 7);
        assert_eq!(payload.reason, RECOVERED_REASON);
    }

    #[tokio::test]
    async fn test_status_reflects_queue() {
        let tmp = TempDir::new().unwrap();
        let client = open(&tmp, false);
        client.request_credit(10, "gift").await.unwrap();

        let status = client.status().unwrap();
        assert!(!status.online);
        assert_eq!(status.pending_mutations, 1);
        assert_eq!(status.visible_balance, 10);
        assert_eq!(status.confirmed_balance, 0);
        assert_eq!(status.reconciler, ReconcilerState::Idle);
        assert!(!status.pass_running);
    }
}
