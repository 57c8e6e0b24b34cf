pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod network;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;

pub use client::{ClientServices, ClientStatus, OfflineClient};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::ClientConfig;
pub use error::{RemoteError, SyncError, SyncResult};
pub use ledger::{BalanceChangeCause, BalanceChanged, LedgerSnapshot, OptimisticLedger};
pub use network::{ConnectivityState, NetworkEvent, NetworkMonitor};
pub use queue::{LedgerPayload, MutationKind, MutationQueue, QueueEntry, RecordMutation, RecordOp};
pub use remote::{
    AuthoritativeBalance, AuthoritativeBalanceSource, BalanceQuery, BalanceSourceSelector,
    LedgerService, PullBalanceSource, PushBalanceSource, PushPublisher, RecordService,
    RemoteResult,
};
pub use storage::{DurableStore, Namespace, Record, StorageEngine};
pub use sync::{PassReport, ReconcilerState, SyncFailure, SyncReconciler};
