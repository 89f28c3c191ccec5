//! Append-only operation-log synchronization engine for offline-capable,
//! multi-device applications.
//!
//! State changes become immutable [`Operation`]s carrying vector clocks.
//! The [`OpLogStore`] persists them with gapless sequence numbers and keeps
//! the authoritative local clock in the same transaction as each local
//! append. A [`SyncClient`] exchanges operations with a [`RemoteEndpoint`],
//! resolving concurrent edits with last-write-wins, and compaction folds the
//! synced prefix of the log into a recoverable snapshot.

mod clock;
mod compact;
mod conflict;
mod error;
mod frontier;
mod op;
mod recover;
mod storage;
mod store;
mod sync;

pub use clock::{ClockOrdering, VectorClock};
pub use compact::{
    compact, emergency_compact, maybe_compact, migrate_snapshot, CapturedState, CompactionPolicy,
    CompactionReport, StateProvider, EMERGENCY_RETENTION_MS,
};
pub use conflict::{check_remote_op, resolve_lww, ConflictCheck, LwwOutcome};
pub use error::{Error, Result};
pub use frontier::EntityFrontier;
pub use op::{
    decode_op, encode_op, ApplicationStatus, OpSource, OpType, Operation, OperationLogEntry,
    FULL_STATE_ENTITY, SINGLETON_ENTITY_ID,
};
pub use recover::{recover, RecoveryReport};
pub use storage::{
    now_millis, DefaultStorage, EntryRecord, MemoryStorage, SnapshotSlot, StateSnapshot, Storage,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use store::{FailureDisposition, OpLogStore, MAX_CONFLICT_RETRY_ATTEMPTS};
pub use sync::{
    DownloadResponse, MemoryRemote, OpUploadResult, OpUploadStatus, RejectCode, RemoteEndpoint,
    RemoteOp, SyncClient, SyncOutcome, UploadResponse, DEFAULT_DOWNLOAD_LIMIT,
    MAX_DOWNLOAD_ITERATIONS,
};
