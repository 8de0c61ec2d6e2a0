pub mod conflict;
pub mod network;
pub mod remote;
pub mod repository;
pub mod types;
pub mod worker;

pub use conflict::{ConflictDisposition, ConflictResolver};
pub use network::ConnectivityMonitor;
pub use remote::{HttpRemoteSyncApi, RemoteSyncApi};
pub use repository::{
    ConflictLogRepository, SqliteConflictLogRepository, SqliteSyncQueueRepository,
    SyncQueueRepository,
};
pub use types::{
    ConflictReason, ConflictRecord, Connectivity, EntityKind, SyncOperation, SyncStatusReport,
    SyncTask, SyncTaskStatus, SyncWorkerConfig,
};
pub use worker::{SyncWorker, SyncWorkerHandle};
