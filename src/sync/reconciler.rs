//! Replays the mutation queue against the remote services
//!
//! One pass is `Draining` (oldest entry first, one remote call at a time),
//! optionally interleaved with `WaitingBackoff` after transient failures, then
//! `Reconciling` (one authoritative balance read), then back to `Idle`.
//!
//! Every queue and ledger write made while talking to the server happens
//! under `gate`. A pass takes it with `try_lock`, so a second trigger while a
//! pass is running is simply skipped.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{timeout, MissedTickBehavior};

use crate::config::ClientConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::ledger::OptimisticLedger;
use crate::network::{ConnectivityState, NetworkMonitor};
use crate::queue::{LedgerPayload, MutationKind, MutationQueue, QueueEntry, RecordMutation};
use crate::remote::{
    AuthoritativeBalance, AuthoritativeBalanceSource, BalanceSourceSelector, LedgerService,
    RecordService, RemoteResult,
};
use crate::sync::backoff::Backoff;
use crate::sync::history::{HistoryStatus, SyncHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconcilerState {
    Idle,
    Draining,
    WaitingBackoff { delay_ms: u64, attempts: u32 },
    Reconciling,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub sync_interval: Duration,
}

impl From<&ClientConfig> for ReconcilerConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            request_timeout: config.request_timeout(),
            max_attempts: config.max_attempts,
            sync_interval: config.sync_interval(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// Remote endpoints the reconciler replays against
#[derive(Clone)]
pub struct SyncServices {
    pub ledger: Arc<dyn LedgerService>,
    /// Without one, queued record mutations are rejected on replay
    pub records: Option<Arc<dyn RecordService>>,
    pub balance: Arc<BalanceSourceSelector>,
}

/// A queued mutation that will never reach the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub queue_id: Option<u64>,
    pub kind: MutationKind,
    pub transaction_id: Option<String>,
    pub error: SyncError,
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub completed: usize,
    pub rejected: usize,
    pub exhausted: usize,
    /// Transient failures that led to a backoff wait
    pub retries: usize,
    /// An authoritative balance was applied
    pub reconciled: bool,
    /// Stopped early because the network dropped or shutdown was requested
    pub interrupted: bool,
    /// Another pass held the gate; nothing was done
    pub skipped: bool,
}

#[derive(Clone, Copy)]
enum Settled {
    Completed,
    Rejected,
    Exhausted,
}

pub struct SyncReconciler {
    queue: MutationQueue,
    ledger: Arc<OptimisticLedger>,
    history: SyncHistory,
    network: Arc<NetworkMonitor>,
    services: SyncServices,
    config: ReconcilerConfig,
    gate: Arc<tokio::sync::Mutex<()>>,
    state: watch::Sender<ReconcilerState>,
    failures: broadcast::Sender<SyncFailure>,
    nudge: Notify,
    backoff: Mutex<Backoff>,
    shutdown: watch::Sender<bool>,
}

impl SyncReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: MutationQueue,
        ledger: Arc<OptimisticLedger>,
        history: SyncHistory,
        network: Arc<NetworkMonitor>,
        services: SyncServices,
        config: ReconcilerConfig,
        event_buffer: usize,
    ) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Idle);
        let (failures, _) = broadcast::channel(event_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);

        Self {
            queue,
            ledger,
            history,
            network,
            services,
            config,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            state,
            failures,
            nudge: Notify::new(),
            backoff: Mutex::new(backoff),
            shutdown,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<SyncFailure> {
        self.failures.subscribe()
    }

    pub fn is_pass_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Single-writer gate shared with the client's direct online path
    pub(crate) fn gate(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.gate
    }

    /// Ask the background loop to look at the queue
    pub fn notify(&self) {
        self.nudge.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: ReconcilerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Reconciler {:?} -> {:?}", previous, next);
        }
    }

    // ==================== Background Loop ====================

    /// Run until [`Self::shutdown`] is called
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "Sync reconciler started (balance source: {})",
            self.services.balance.name()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut network_rx = self.network.subscribe();
        let mut push_rx = self.services.balance.push_events();
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if self.network.is_online() {
            self.run_pass_logged().await;
        }
        // The first tick fires immediately; the startup pass already covered it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                changed = network_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = network_rx.borrow_and_update().online;
                    if online {
                        self.run_pass_logged().await;
                    }
                }
                _ = self.nudge.notified() => {
                    self.run_pass_if_pending().await;
                }
                _ = ticker.tick() => {
                    self.run_pass_if_pending().await;
                }
                Some(event) = next_push(&mut push_rx) => {
                    if let Err(e) = self.apply_push(event).await {
                        tracing::error!("Failed to apply balance push: {}", e);
                    }
                }
            }
        }

        self.set_state(ReconcilerState::Idle);
        tracing::info!("Sync reconciler stopped");
    }

    async fn run_pass_if_pending(&self) {
        if !self.network.is_online() {
            return;
        }
        match self.queue.is_empty() {
            Ok(true) => {}
            Ok(false) => self.run_pass_logged().await,
            Err(e) => tracing::error!("Cannot read mutation queue: {}", e),
        }
    }

    async fn run_pass_logged(&self) {
        match self.run_pass().await {
            Ok(report) if report.skipped => {}
            Ok(report) => {
                if report.completed + report.rejected + report.exhausted > 0 {
                    tracing::info!(
                        "Sync pass finished: {} completed, {} rejected, {} exhausted",
                        report.completed,
                        report.rejected,
                        report.exhausted
                    );
                }
            }
            Err(e) => tracing::error!("Sync pass aborted: {}", e),
        }
    }

    // ==================== Pass ====================

    /// Drain the queue, then read the authoritative balance.
    ///
    /// Returns immediately with `skipped` set when another pass holds the gate.
    /// Storage errors abort the pass; the entry being processed stays queued.
    pub async fn run_pass(&self) -> SyncResult<PassReport> {
        let _guard = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Sync pass already running, skipping");
                return Ok(PassReport {
                    skipped: true,
                    ..PassReport::default()
                });
            }
        };

        let mut report = PassReport::default();
        let result = self.drain_and_reconcile(&mut report).await;
        self.set_state(ReconcilerState::Idle);
        result.map(|_| report)
    }

    async fn drain_and_reconcile(&self, report: &mut PassReport) -> SyncResult<()> {
        loop {
            if !self.network.is_online() || self.is_shutting_down() {
                report.interrupted = true;
                return Ok(());
            }

            // An empty queue goes straight to the balance read
            let Some(entry) = self.queue.peek_oldest()? else {
                break;
            };
            self.set_state(ReconcilerState::Draining);

            match self.replay(&entry).await {
                Ok(()) => {
                    self.backoff.lock().reset();
                    self.settle(&entry, Settled::Completed, entry.attempts, None)?;
                    report.completed += 1;
                }
                Err(RemoteError::Rejected(reason)) => {
                    tracing::warn!("Server rejected {} entry {}: {}", entry.kind, entry.id, reason);
                    let error = SyncError::RejectedByServer(reason);
                    self.settle(&entry, Settled::Rejected, entry.attempts, Some(error))?;
                    report.rejected += 1;
                }
                Err(RemoteError::Transient(reason)) => {
                    let attempts = self.queue.mark_attempt(entry.id, Some(reason.clone()))?;
                    if attempts >= self.config.max_attempts {
                        tracing::warn!(
                            "Giving up on {} entry {} after {} attempts: {}",
                            entry.kind,
                            entry.id,
                            attempts,
                            reason
                        );
                        let error = SyncError::RetryBudgetExhausted { attempts, reason };
                        self.settle(&entry, Settled::Exhausted, attempts, Some(error))?;
                        report.exhausted += 1;
                        continue;
                    }

                    report.retries += 1;
                    let delay = self.backoff.lock().next_delay();
                    tracing::debug!(
                        "Transient failure on entry {} ({}), retrying in {:?}",
                        entry.id,
                        reason,
                        delay
                    );
                    self.set_state(ReconcilerState::WaitingBackoff {
                        delay_ms: delay.as_millis() as u64,
                        attempts,
                    });
                    if !self.wait_backoff(delay).await {
                        report.interrupted = true;
                        return Ok(());
                    }
                }
            }
        }

        self.set_state(ReconcilerState::Reconciling);
        report.reconciled = self.refresh_balance().await?;
        Ok(())
    }

    /// Sleep for `delay`; `false` if the network dropped or shutdown was requested first
    async fn wait_backoff(&self, delay: Duration) -> bool {
        let mut network_rx = self.network.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_offline(&mut network_rx) => false,
            _ = wait_for_shutdown(&mut shutdown_rx) => false,
        }
    }

    async fn replay(&self, entry: &QueueEntry) -> RemoteResult<()> {
        match entry.kind {
            MutationKind::LedgerDebit | MutationKind::LedgerCredit => {
                let payload = entry
                    .ledger_payload()
                    .map_err(|e| RemoteError::Rejected(format!("unreadable payload: {}", e)))?;
                self.send_ledger(entry.kind, &payload).await
            }
            MutationKind::GenericMutation => {
                let mutation = entry
                    .record_mutation()
                    .map_err(|e| RemoteError::Rejected(format!("unreadable payload: {}", e)))?;
                self.send_record(&mutation).await
            }
        }
    }

    /// One ledger call with the configured timeout
    pub(crate) async fn send_ledger(
        &self,
        kind: MutationKind,
        payload: &LedgerPayload,
    ) -> RemoteResult<()> {
        let service = &self.services.ledger;
        let call = async {
            match kind {
                MutationKind::LedgerDebit => {
                    service
                        .debit(&payload.transaction_id, payload.amount, &payload.reason)
                        .await
                }
                MutationKind::LedgerCredit => {
                    service
                        .credit(&payload.transaction_id, payload.amount, &payload.reason)
                        .await
                }
                MutationKind::GenericMutation => Err(RemoteError::Rejected(
                    "generic mutation sent to the ledger service".to_string(),
                )),
            }
        };
        timeout(self.config.request_timeout, call).await?
    }

    pub(crate) async fn send_record(&self, mutation: &RecordMutation) -> RemoteResult<()> {
        let Some(records) = &self.services.records else {
            return Err(RemoteError::Rejected(
                "no record service configured".to_string(),
            ));
        };
        timeout(self.config.request_timeout, records.push(mutation)).await?
    }

    /// Apply the outcome of a replay to the ledger, then drop the entry
    fn settle(
        &self,
        entry: &QueueEntry,
        outcome: Settled,
        attempts: u32,
        error: Option<SyncError>,
    ) -> SyncResult<()> {
        let payload = entry.ledger_payload().ok();
        let transaction_id = payload.as_ref().map(|p| p.transaction_id.clone());
        if entry.kind.is_ledger() && payload.is_none() {
            tracing::error!(
                "Entry {} has an unreadable ledger payload; its pending delta stays \
                 in the ledger until it is recovered on the next open",
                entry.id
            );
        }

        let (status, failure) = match outcome {
            Settled::Completed => {
                let mut failure = None;
                if let Some(payload) = &payload {
                    let tx = &payload.transaction_id;
                    // Deferred entries never had a pending delta to confirm
                    let folded = if payload.deferred {
                        self.ledger.fold_accepted(tx, payload.delta(entry.kind))
                    } else {
                        self.ledger.confirm(tx)
                    };
                    match folded {
                        Ok(()) => {}
                        // Already reset and logged by the ledger; the entry still settles
                        Err(e @ SyncError::InvariantViolation(_)) => failure = Some(e),
                        Err(e) => return Err(e),
                    }
                }
                (HistoryStatus::Completed, failure)
            }
            Settled::Rejected | Settled::Exhausted => {
                if let Some(tx) = &transaction_id {
                    self.ledger.rollback(tx)?;
                }
                let status = match outcome {
                    Settled::Exhausted => HistoryStatus::Exhausted,
                    _ => HistoryStatus::Rejected,
                };
                (status, error)
            }
        };

        self.queue.ack(entry.id)?;

        if let Err(e) = self.history.record(
            entry.id,
            entry.kind,
            transaction_id.clone(),
            status,
            attempts,
            failure.as_ref().map(|f| f.to_string()),
        ) {
            tracing::error!("Failed to record sync history for entry {}: {}", entry.id, e);
        }

        if let Some(error) = failure {
            self.publish_failure(SyncFailure {
                queue_id: Some(entry.id),
                kind: entry.kind,
                transaction_id,
                error,
            });
        }
        Ok(())
    }

    pub(crate) fn publish_failure(&self, failure: SyncFailure) {
        // No receivers is fine
        let _ = self.failures.send(failure);
    }

    // ==================== Authoritative Balance ====================

    /// Read the authoritative balance and apply it. Transient failures are
    /// logged and leave the ledger untouched.
    pub(crate) async fn refresh_balance(&self) -> SyncResult<bool> {
        let source = &self.services.balance;
        if source.is_empty() {
            return Ok(false);
        }

        let read = match timeout(self.config.request_timeout, source.current_balance()).await {
            Ok(result) => result,
            Err(elapsed) => Err(RemoteError::from(elapsed)),
        };

        match read {
            Ok(Some(balance)) => self.ledger.reconcile_with_applied(
                balance.balance,
                balance.as_of,
                &balance.applied_transactions,
            ),
            Ok(None) => Ok(false),
            Err(e) => {
                tracing::warn!("Authoritative balance unavailable: {}", e);
                Ok(false)
            }
        }
    }

    /// Apply a pushed balance outside of a pass, waiting for the gate
    pub async fn apply_push(&self, event: AuthoritativeBalance) -> SyncResult<bool> {
        let _guard = self.gate.lock().await;
        let applied = self.ledger.reconcile_with_applied(
            event.balance,
            event.as_of,
            &event.applied_transactions,
        )?;
        if applied {
            tracing::debug!("Applied pushed balance {} (as_of {})", event.balance, event.as_of);
        }
        Ok(applied)
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_offline(rx: &mut watch::Receiver<ConnectivityState>) {
    while rx.borrow_and_update().online {
        if rx.changed().await.is_err() {
            // Monitor gone; never resolve
            std::future::pending::<()>().await;
        }
    }
}

async fn next_push(
    rx: &mut Option<watch::Receiver<Option<AuthoritativeBalance>>>,
) -> Option<AuthoritativeBalance> {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        return std::future::pending().await;
    }
    let latest = rx.borrow_and_update().clone();
    latest
}
