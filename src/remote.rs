//! Boundaries to the remote ledger service
//!
//! The service implementations live outside this crate (HTTP functions, a
//! realtime channel). What this crate needs from them is captured here:
//! - [`LedgerService`]: idempotent debit/credit keyed by transaction id
//! - [`RecordService`]: replay target for generic record mutations
//! - [`AuthoritativeBalanceSource`]: the server's view of the balance, either
//!   pulled ([`PullBalanceSource`]) or pushed ([`PushBalanceSource`]), chosen
//!   at runtime by [`BalanceSourceSelector`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::RemoteError;
use crate::queue::RecordMutation;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn debit(&self, transaction_id: &str, amount: i64, reason: &str) -> RemoteResult<()>;

    async fn credit(&self, transaction_id: &str, amount: i64, reason: &str) -> RemoteResult<()>;
}

#[async_trait]
pub trait RecordService: Send + Sync {
    async fn push(&self, mutation: &RecordMutation) -> RemoteResult<()>;
}

/// Balance as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoritativeBalance {
    pub user_id: String,
    pub balance: i64,
    /// Unix ms at which the server computed `balance`
    pub as_of: u64,
    /// Transactions already folded into `balance`, when the server says so
    #[serde(default)]
    pub applied_transactions: Vec<String>,
}

/// Pull-style balance endpoint
#[async_trait]
pub trait BalanceQuery: Send + Sync {
    async fn get_balance(&self, user_id: &str) -> RemoteResult<AuthoritativeBalance>;
}

#[async_trait]
pub trait AuthoritativeBalanceSource: Send + Sync {
    /// Latest authoritative balance, or `None` if this source has nothing yet
    async fn current_balance(&self) -> RemoteResult<Option<AuthoritativeBalance>>;

    fn name(&self) -> &'static str;
}

// ==================== Pull ====================

pub struct PullBalanceSource {
    query: Arc<dyn BalanceQuery>,
    user_id: String,
}

impl PullBalanceSource {
    pub fn new(query: Arc<dyn BalanceQuery>, user_id: impl Into<String>) -> Self {
        Self {
            query,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl AuthoritativeBalanceSource for PullBalanceSource {
    async fn current_balance(&self) -> RemoteResult<Option<AuthoritativeBalance>> {
        self.query.get_balance(&self.user_id).await.map(Some)
    }

    fn name(&self) -> &'static str {
        "pull"
    }
}

// ==================== Push ====================

/// Sending half handed to whatever receives the server's realtime events
#[derive(Clone)]
pub struct PushPublisher {
    tx: Arc<watch::Sender<Option<AuthoritativeBalance>>>,
    user_id: String,
}

impl PushPublisher {
    /// Deliver an event. Events for other users and events older than the
    /// last delivered one are dropped; returns whether it was accepted.
    pub fn publish(&self, event: AuthoritativeBalance) -> bool {
        if event.user_id != self.user_id {
            tracing::warn!(
                "Dropping balance push for user {} (expected {})",
                event.user_id,
                self.user_id
            );
            return false;
        }

        self.tx.send_if_modified(|latest| {
            if latest.as_ref().is_some_and(|l| l.as_of > event.as_of) {
                return false;
            }
            *latest = Some(event);
            true
        })
    }
}

pub struct PushBalanceSource {
    rx: watch::Receiver<Option<AuthoritativeBalance>>,
}

impl PushBalanceSource {
    pub fn channel(user_id: impl Into<String>) -> (PushPublisher, PushBalanceSource) {
        let (tx, rx) = watch::channel(None);
        (
            PushPublisher {
                tx: Arc::new(tx),
                user_id: user_id.into(),
            },
            PushBalanceSource { rx },
        )
    }

    /// Receiver that wakes on every accepted push
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthoritativeBalance>> {
        self.rx.clone()
    }

    pub fn latest(&self) -> Option<AuthoritativeBalance> {
        self.rx.borrow().clone()
    }
}

#[async_trait]
impl AuthoritativeBalanceSource for PushBalanceSource {
    async fn current_balance(&self) -> RemoteResult<Option<AuthoritativeBalance>> {
        Ok(self.latest())
    }

    fn name(&self) -> &'static str {
        "push"
    }
}

// ==================== Selection ====================

/// Picks whichever source can answer: a fresh pull read when the pull
/// endpoint is configured and reachable, otherwise the latest push event.
#[derive(Default)]
pub struct BalanceSourceSelector {
    pull: Option<PullBalanceSource>,
    push: Option<PushBalanceSource>,
}

impl BalanceSourceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull(mut self, source: PullBalanceSource) -> Self {
        self.pull = Some(source);
        self
    }

    pub fn with_push(mut self, source: PushBalanceSource) -> Self {
        self.push = Some(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pull.is_none() && self.push.is_none()
    }

    /// Receiver over push events, if a push source is configured
    pub fn push_events(&self) -> Option<watch::Receiver<Option<AuthoritativeBalance>>> {
        self.push.as_ref().map(|p| p.subscribe())
    }
}

#[async_trait]
impl AuthoritativeBalanceSource for BalanceSourceSelector {
    async fn current_balance(&self) -> RemoteResult<Option<AuthoritativeBalance>> {
        let pulled = match &self.pull {
            Some(pull) => Some(pull.current_balance().await),
            None => None,
        };

        match (pulled, &self.push) {
            (Some(Ok(Some(balance))), _) => Ok(Some(balance)),
            (Some(Err(e)), Some(push)) => {
                tracing::debug!("Pull balance failed ({}), using push channel", e);
                push.current_balance().await
            }
            (Some(result), None) => result,
            (None, Some(push)) | (Some(Ok(None)), Some(push)) => push.current_balance().await,
            (None, None) => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        match (&self.pull, &self.push) {
            (Some(_), Some(_)) => "pull+push",
            (Some(_), None) => "pull",
            (None, Some(_)) => "push",
            (None, None) => "none",
        }
    }
}
