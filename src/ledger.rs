//! Optimistic credit ledger
//!
//! The balance shown to the caller is `confirmed_balance + sum(pending_deltas)`.
//! `confirmed_balance` only moves on a server confirmation or an authoritative
//! balance read; pending deltas are added when a debit/credit is issued and
//! removed once its outcome is known. Every change is written to the `ledger`
//! namespace before it becomes visible, so a failed write leaves the previous
//! state in place.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::error::{SyncError, SyncResult};
use crate::storage::DurableStore;

const SNAPSHOT_KEY: &str = "snapshot";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub confirmed_balance: i64,
    /// transaction id -> signed delta
    #[serde(default)]
    pub pending_deltas: BTreeMap<String, i64>,
    /// Unix ms of the last authoritative value applied
    #[serde(default)]
    pub last_server_sync_at: Option<u64>,
    /// Last balance the server reported; the reset target after an invariant violation
    #[serde(default)]
    pub last_authoritative_balance: Option<i64>,
}

impl LedgerSnapshot {
    pub fn pending_total(&self) -> i64 {
        self.pending_deltas.values().sum()
    }

    pub fn visible_balance(&self) -> i64 {
        self.confirmed_balance + self.pending_total()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceChangeCause {
    Optimistic(String),
    Confirmed(String),
    RolledBack(String),
    Authoritative,
    /// Ledger reset after an invariant violation
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChanged {
    pub visible_balance: i64,
    pub confirmed_balance: i64,
    pub pending: usize,
    pub cause: BalanceChangeCause,
}

pub struct OptimisticLedger {
    store: DurableStore,
    state: Mutex<LedgerSnapshot>,
    events: broadcast::Sender<BalanceChanged>,
}

impl OptimisticLedger {
    /// Load the persisted snapshot, or start from an empty ledger
    pub fn open(store: DurableStore, event_buffer: usize) -> SyncResult<Self> {
        let snapshot = match store.get(SNAPSHOT_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => LedgerSnapshot::default(),
        };

        tracing::debug!(
            "Ledger loaded: confirmed={} pending={}",
            snapshot.confirmed_balance,
            snapshot.pending_deltas.len()
        );

        let (events, _) = broadcast::channel(event_buffer.max(1));
        Ok(Self {
            store,
            state: Mutex::new(snapshot),
            events,
        })
    }

    pub fn visible_balance(&self) -> i64 {
        self.state.lock().visible_balance()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.state.lock().clone()
    }

    pub fn pending_delta(&self, transaction_id: &str) -> Option<i64> {
        self.state.lock().pending_deltas.get(transaction_id).copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceChanged> {
        self.events.subscribe()
    }

    // ==================== Transaction Lifecycle ====================

    /// Record a pending delta; the visible balance reflects it immediately.
    /// Re-applying a known transaction id keeps the original delta.
    pub fn apply_optimistic(&self, transaction_id: &str, delta: i64) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.pending_deltas.contains_key(transaction_id) {
            tracing::debug!("Transaction {} already pending, ignoring", transaction_id);
            return Ok(());
        }

        let mut next = state.clone();
        next.pending_deltas.insert(transaction_id.to_string(), delta);
        self.commit(&mut state, next, BalanceChangeCause::Optimistic(transaction_id.to_string()))
    }

    /// Fold a pending delta into the confirmed balance. Unknown ids are a no-op.
    pub fn confirm(&self, transaction_id: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        let Some(delta) = state.pending_deltas.get(transaction_id).copied() else {
            return Ok(());
        };

        let mut next = state.clone();
        next.pending_deltas.remove(transaction_id);
        next.confirmed_balance += delta;

        if next.confirmed_balance < 0 {
            let message = format!(
                "confirmed balance {} is negative after confirming {} ({:+})",
                next.confirmed_balance, transaction_id, delta
            );
            tracing::error!("FATAL ledger invariant violated: {}", message);

            // Back to the last value the server vouched for; the offending delta is dropped
            next.confirmed_balance = state
                .last_authoritative_balance
                .unwrap_or(state.confirmed_balance);
            self.commit(&mut state, next, BalanceChangeCause::Reset)?;
            return Err(SyncError::InvariantViolation(message));
        }

        self.commit(&mut state, next, BalanceChangeCause::Confirmed(transaction_id.to_string()))
    }

    /// Fold a delta the server accepted that was never applied optimistically.
    ///
    /// The local baseline can lag the server, so a result below zero is
    /// clamped; the next authoritative read replaces it either way.
    pub fn fold_accepted(&self, transaction_id: &str, delta: i64) -> SyncResult<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        // A pending delta for the same id already stands for this transaction
        next.confirmed_balance += next.pending_deltas.remove(transaction_id).unwrap_or(delta);
        if next.confirmed_balance < 0 {
            tracing::warn!(
                "Local balance is behind the server: folding {} ({:+}) gives {}, clamping to 0",
                transaction_id,
                delta,
                next.confirmed_balance
            );
            next.confirmed_balance = 0;
        }

        self.commit(&mut state, next, BalanceChangeCause::Confirmed(transaction_id.to_string()))
    }

    /// Drop a pending delta without touching the confirmed balance.
    /// Rolling back twice is the same as rolling back once.
    pub fn rollback(&self, transaction_id: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.pending_deltas.contains_key(transaction_id) {
            return Ok(());
        }

        let mut next = state.clone();
        next.pending_deltas.remove(transaction_id);
        self.commit(&mut state, next, BalanceChangeCause::RolledBack(transaction_id.to_string()))
    }

    // ==================== Authoritative State ====================

    /// Replace the confirmed balance with a server value; pending deltas stay on top
    pub fn reconcile_from_authoritative(&self, balance: i64, as_of: u64) -> SyncResult<bool> {
        self.reconcile_with_applied(balance, as_of, &[])
    }

    /// Like [`Self::reconcile_from_authoritative`], dropping the pending deltas of
    /// any transaction the server says is already included in `balance`.
    ///
    /// Returns `false` when `as_of` is older than the last applied server value.
    pub fn reconcile_with_applied(
        &self,
        balance: i64,
        as_of: u64,
        applied_transactions: &[String],
    ) -> SyncResult<bool> {
        let mut state = self.state.lock();
        if state.last_server_sync_at.is_some_and(|last| as_of < last) {
            tracing::debug!(
                "Ignoring stale authoritative balance (as_of {} < {:?})",
                as_of,
                state.last_server_sync_at
            );
            return Ok(false);
        }

        let mut next = state.clone();
        next.confirmed_balance = balance;
        next.last_authoritative_balance = Some(balance);
        next.last_server_sync_at = Some(as_of);
        next.pending_deltas
            .retain(|tx, _| !applied_transactions.iter().any(|a| a == tx));

        if next.visible_balance() < 0 {
            tracing::warn!(
                "Authoritative balance {} leaves visible balance at {}",
                balance,
                next.visible_balance()
            );
        }

        self.commit(&mut state, next, BalanceChangeCause::Authoritative)?;
        Ok(true)
    }

    /// Unix ms of the last applied server value
    pub fn last_server_sync_at(&self) -> Option<u64> {
        self.state.lock().last_server_sync_at
    }

    /// Persist `next`, then make it the live state and notify subscribers
    fn commit(
        &self,
        state: &mut LedgerSnapshot,
        next: LedgerSnapshot,
        cause: BalanceChangeCause,
    ) -> SyncResult<()> {
        self.store.save(SNAPSHOT_KEY, serde_json::to_value(&next)?)?;
        *state = next;

        let _ = self.events.send(BalanceChanged {
            visible_balance: state.visible_balance(),
            confirmed_balance: state.confirmed_balance,
            pending: state.pending_deltas.len(),
            cause,
        });
        Ok(())
    }
}
