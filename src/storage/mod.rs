mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// Backend assumed when [`OpLogStore`](crate::OpLogStore) is named without
/// an explicit parameter.
#[cfg(feature = "sqlite")]
pub type DefaultStorage = SqliteStorage;
#[cfg(not(feature = "sqlite"))]
pub type DefaultStorage = MemoryStorage;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::error::Result;
use crate::op::{ApplicationStatus, OpSource, Operation, OperationLogEntry};

/// Materialized state folded out of the log by compaction, plus everything
/// needed to resume from it: the last folded sequence, the clock at that
/// point, and the entity keys present (distinguishing "no tail ops for this
/// entity" from "entity was deleted").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: Value,
    pub last_applied_op_seq: u64,
    pub vector_clock: VectorClock,
    pub compacted_at: u64,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_keys: Option<BTreeSet<String>>,
}

/// Snapshot slots. Exactly one `Current`; `Backup` exists only transiently
/// around a snapshot migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSlot {
    Current,
    Backup,
}

impl SnapshotSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotSlot::Current => "current",
            SnapshotSlot::Backup => "backup",
        }
    }
}

/// Fields of a log entry known at append time. The backend assigns the
/// sequence number.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub op: Operation,
    pub applied_at: u64,
    pub source: OpSource,
    pub synced_at: Option<u64>,
    pub application_status: Option<ApplicationStatus>,
}

/// Persistence backend for the operation log.
///
/// Backends assign gapless sequence numbers in arrival order and never
/// mutate a stored op's payload or clock; only bookkeeping columns change.
/// Multi-step invariants are wrapped by the caller in
/// `begin_transaction`/`commit_transaction`.
pub trait Storage {
    fn append_entry(&mut self, rec: EntryRecord) -> Result<u64>;
    fn entry_by_op_id(&self, op_id: &str) -> Result<Option<OperationLogEntry>>;
    fn entries_after(&self, seq: u64) -> Result<Vec<OperationLogEntry>>;
    fn entries_by_source_status(
        &self,
        source: OpSource,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<OperationLogEntry>>;
    fn has_op(&self, op_id: &str) -> Result<bool>;
    fn last_seq(&self) -> Result<u64>;
    fn any_synced(&self) -> Result<bool>;

    fn set_synced(&mut self, seqs: &[u64], ts: u64) -> Result<usize>;
    fn set_rejected(&mut self, op_ids: &[String], ts: u64) -> Result<usize>;
    /// Pending or failed entries become applied; others are left alone.
    fn set_applied(&mut self, seqs: &[u64]) -> Result<usize>;
    /// Marks the entry failed and bumps its retry count, returning the new
    /// count.
    fn set_failed(&mut self, op_id: &str) -> Result<u32>;
    fn delete_entries(&mut self, seqs: &[u64]) -> Result<usize>;
    fn clear_entries(&mut self) -> Result<()>;

    fn save_snapshot(&mut self, slot: SnapshotSlot, snapshot: &StateSnapshot) -> Result<()>;
    fn load_snapshot(&self, slot: SnapshotSlot) -> Result<Option<StateSnapshot>>;
    fn has_snapshot(&self, slot: SnapshotSlot) -> Result<bool>;
    fn delete_snapshot(&mut self, slot: SnapshotSlot) -> Result<()>;

    /// Operations since the last compaction. Lives on the current snapshot
    /// row so it survives restarts and is shared across contexts.
    fn counter_get(&self) -> Result<u64>;
    /// Atomic increment. Creates a stub current row (no snapshot data) when
    /// none exists yet.
    fn counter_increment(&mut self) -> Result<u64>;
    fn counter_reset(&mut self) -> Result<()>;

    fn load_clock(&self) -> Result<Option<(VectorClock, u64)>>;
    fn save_clock(&mut self, clock: &VectorClock, ts: u64) -> Result<()>;

    fn save_import_backup(&mut self, snapshot: &StateSnapshot) -> Result<()>;
    fn load_import_backup(&self) -> Result<Option<StateSnapshot>>;
    fn clear_import_backup(&mut self) -> Result<()>;

    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
