//! Common test utilities for client scenarios
//!
//! Provides:
//! - A scripted ledger service that records every call in order
//! - A scripted record service and a settable balance endpoint
//! - Helpers to open an `OfflineClient` on a temp directory

#![allow(dead_code)]

use async_trait::async_trait;
use creditsync::{
    AuthoritativeBalance, BalanceQuery, ClientConfig, ClientServices, LedgerService,
    ManualClock, OfflineClient, RecordMutation, RecordService, RemoteError, RemoteResult,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const USER: &str = "farmer-1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub transaction_id: String,
    /// Signed: debits negative
    pub delta: i64,
    pub reason: String,
}

/// Ledger service that applies calls to an in-memory balance, idempotent per
/// transaction id, with an optional script of forced outcomes.
pub struct FakeLedger {
    pub calls: Mutex<Vec<LedgerCall>>,
    script: Mutex<VecDeque<RemoteResult<()>>>,
    balance: Mutex<i64>,
    applied: Mutex<Vec<String>>,
    clock: ManualClock,
}

impl FakeLedger {
    pub fn new(balance: i64, clock: ManualClock) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            balance: Mutex::new(balance),
            applied: Mutex::new(Vec::new()),
            clock,
        })
    }

    /// Force the next outcomes, in order; afterwards calls behave normally
    pub fn script(&self, outcomes: Vec<RemoteResult<()>>) {
        self.script.lock().extend(outcomes);
    }

    pub fn balance(&self) -> i64 {
        *self.balance.lock()
    }

    pub fn deltas(&self) -> Vec<i64> {
        self.calls.lock().iter().map(|c| c.delta).collect()
    }

    fn handle(&self, transaction_id: &str, delta: i64, reason: &str) -> RemoteResult<()> {
        self.calls.lock().push(LedgerCall {
            transaction_id: transaction_id.to_string(),
            delta,
            reason: reason.to_string(),
        });

        if let Some(outcome) = self.script.lock().pop_front() {
            outcome?;
        }

        let mut applied = self.applied.lock();
        if applied.iter().any(|t| t == transaction_id) {
            return Ok(());
        }

        let mut balance = self.balance.lock();
        if *balance + delta < 0 {
            return Err(RemoteError::Rejected("insufficient credits".to_string()));
        }
        *balance += delta;
        applied.push(transaction_id.to_string());
        self.clock.advance(1);
        Ok(())
    }
}

#[async_trait]
impl LedgerService for FakeLedger {
    async fn debit(&self, transaction_id: &str, amount: i64, reason: &str) -> RemoteResult<()> {
        self.handle(transaction_id, -amount, reason)
    }

    async fn credit(&self, transaction_id: &str, amount: i64, reason: &str) -> RemoteResult<()> {
        self.handle(transaction_id, amount, reason)
    }
}

/// Balance endpoint reading the fake ledger's balance
pub struct FakeBalance {
    ledger: Arc<FakeLedger>,
    clock: ManualClock,
}

impl FakeBalance {
    pub fn new(ledger: Arc<FakeLedger>, clock: ManualClock) -> Arc<Self> {
        Arc::new(Self { ledger, clock })
    }
}

#[async_trait]
impl BalanceQuery for FakeBalance {
    async fn get_balance(&self, user_id: &str) -> RemoteResult<AuthoritativeBalance> {
        Ok(AuthoritativeBalance {
            user_id: user_id.to_string(),
            balance: self.ledger.balance(),
            as_of: creditsync::Clock::now_millis(&self.clock),
            applied_transactions: vec![],
        })
    }
}

#[derive(Default)]
pub struct FakeRecords {
    pub pushed: Mutex<Vec<RecordMutation>>,
    script: Mutex<VecDeque<RemoteResult<()>>>,
}

impl FakeRecords {
    pub fn script(&self, outcomes: Vec<RemoteResult<()>>) {
        self.script.lock().extend(outcomes);
    }
}

#[async_trait]
impl RecordService for FakeRecords {
    async fn push(&self, mutation: &RecordMutation) -> RemoteResult<()> {
        if let Some(outcome) = self.script.lock().pop_front() {
            outcome?;
        }
        self.pushed.lock().push(mutation.clone());
        Ok(())
    }
}

pub struct TestEnv {
    pub client: OfflineClient,
    pub server: Arc<FakeLedger>,
    pub records: Arc<FakeRecords>,
    pub clock: ManualClock,
}

pub fn test_config(dir: &Path) -> ClientConfig {
    ClientConfig::default()
        .with_data_dir(dir)
        .with_user_id(USER)
}

/// Open a client against a fresh fake server holding `server_balance`
pub fn create_test_env(dir: &TempDir, server_balance: i64, online: bool) -> TestEnv {
    let clock = ManualClock::new(1_000);
    let server = FakeLedger::new(server_balance, clock.clone());
    reopen(dir, server, online, clock)
}

/// Open a client on an existing directory against an existing fake server
pub fn reopen(dir: &TempDir, server: Arc<FakeLedger>, online: bool, clock: ManualClock) -> TestEnv {
    let records = Arc::new(FakeRecords::default());
    let services = ClientServices::new(server.clone())
        .with_records(records.clone())
        .with_balance_query(FakeBalance::new(server.clone(), clock.clone()))
        .with_clock(Arc::new(clock.clone()))
        .initially_online(online);

    let client = OfflineClient::open(test_config(dir.path()), services)
        .expect("Failed to open client");
    TestEnv {
        client,
        server,
        records,
        clock,
    }
}

/// Poll `check` until it holds, letting background tasks (and paused time) advance
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}
