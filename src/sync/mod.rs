//! Offline queue replay and balance reconciliation
//!
//! - `reconciler`: the Idle / Draining / WaitingBackoff / Reconciling state machine
//! - `backoff`: retry delays between transient failures
//! - `history`: bounded log of settled replays

pub mod backoff;
pub mod history;
pub mod reconciler;

pub use backoff::Backoff;
pub use history::{HistoryEntry, HistoryStatus, SyncHistory};
pub use reconciler::{
    PassReport, ReconcilerConfig, ReconcilerState, SyncFailure, SyncReconciler, SyncServices,
};
