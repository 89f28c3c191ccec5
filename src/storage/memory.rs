use std::collections::HashMap;

use super::{EntryRecord, SnapshotSlot, StateSnapshot, Storage};
use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::op::{ApplicationStatus, OpSource, OperationLogEntry};

/// In-memory backend with the same contract as the SQLite one. Transactions
/// are no-ops; tests that exercise rollback atomicity use SQLite.
pub struct MemoryStorage {
    entries: Vec<OperationLogEntry>,
    next_seq: u64,
    snapshots: HashMap<&'static str, Option<StateSnapshot>>,
    ops_since_compaction: u64,
    clock: Option<(VectorClock, u64)>,
    import_backup: Option<StateSnapshot>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 1,
            snapshots: HashMap::new(),
            ops_since_compaction: 0,
            clock: None,
            import_backup: None,
        }
    }

    fn entry_mut(&mut self, op_id: &str) -> Option<&mut OperationLogEntry> {
        self.entries.iter_mut().find(|e| e.op.id == op_id)
    }
}

impl Storage for MemoryStorage {
    fn append_entry(&mut self, rec: EntryRecord) -> Result<u64> {
        if self.entries.iter().any(|e| e.op.id == rec.op.id) {
            return Err(Error::DuplicateOp { op_id: rec.op.id });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(OperationLogEntry {
            seq,
            op: rec.op,
            applied_at: rec.applied_at,
            source: rec.source,
            synced_at: rec.synced_at,
            rejected_at: None,
            application_status: rec.application_status,
            retry_count: 0,
        });
        Ok(seq)
    }

    fn entry_by_op_id(&self, op_id: &str) -> Result<Option<OperationLogEntry>> {
        Ok(self.entries.iter().find(|e| e.op.id == op_id).cloned())
    }

    fn entries_after(&self, seq: u64) -> Result<Vec<OperationLogEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect())
    }

    fn entries_by_source_status(
        &self,
        source: OpSource,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<OperationLogEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| {
                e.source == source
                    && e.rejected_at.is_none()
                    && e.application_status
                        .map(|s| statuses.contains(&s))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn has_op(&self, op_id: &str) -> Result<bool> {
        Ok(self.entries.iter().any(|e| e.op.id == op_id))
    }

    fn last_seq(&self) -> Result<u64> {
        Ok(self.entries.last().map(|e| e.seq).unwrap_or(0))
    }

    fn any_synced(&self) -> Result<bool> {
        Ok(self.entries.iter().any(|e| e.synced_at.is_some()))
    }

    fn set_synced(&mut self, seqs: &[u64], ts: u64) -> Result<usize> {
        let mut changed = 0;
        for e in &mut self.entries {
            if seqs.contains(&e.seq) && e.synced_at.is_none() {
                e.synced_at = Some(ts);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn set_rejected(&mut self, op_ids: &[String], ts: u64) -> Result<usize> {
        let mut changed = 0;
        for e in &mut self.entries {
            if op_ids.iter().any(|id| *id == e.op.id) && e.rejected_at.is_none() {
                e.rejected_at = Some(ts);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn set_applied(&mut self, seqs: &[u64]) -> Result<usize> {
        let mut changed = 0;
        for e in &mut self.entries {
            if seqs.contains(&e.seq)
                && matches!(
                    e.application_status,
                    Some(ApplicationStatus::Pending) | Some(ApplicationStatus::Failed)
                )
            {
                e.application_status = Some(ApplicationStatus::Applied);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn set_failed(&mut self, op_id: &str) -> Result<u32> {
        match self.entry_mut(op_id) {
            Some(e) => {
                e.application_status = Some(ApplicationStatus::Failed);
                e.retry_count += 1;
                Ok(e.retry_count)
            }
            None => Err(Error::NotFound {
                what: format!("op {}", op_id),
            }),
        }
    }

    fn delete_entries(&mut self, seqs: &[u64]) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|e| !seqs.contains(&e.seq));
        Ok(before - self.entries.len())
    }

    fn clear_entries(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn save_snapshot(&mut self, slot: SnapshotSlot, snapshot: &StateSnapshot) -> Result<()> {
        self.snapshots.insert(slot.as_str(), Some(snapshot.clone()));
        Ok(())
    }

    fn load_snapshot(&self, slot: SnapshotSlot) -> Result<Option<StateSnapshot>> {
        Ok(self.snapshots.get(slot.as_str()).cloned().flatten())
    }

    fn has_snapshot(&self, slot: SnapshotSlot) -> Result<bool> {
        Ok(matches!(self.snapshots.get(slot.as_str()), Some(Some(_))))
    }

    fn delete_snapshot(&mut self, slot: SnapshotSlot) -> Result<()> {
        self.snapshots.remove(slot.as_str());
        Ok(())
    }

    fn counter_get(&self) -> Result<u64> {
        Ok(self.ops_since_compaction)
    }

    fn counter_increment(&mut self) -> Result<u64> {
        // Mirrors the SQLite stub-row behavior.
        self.snapshots.entry("current").or_insert(None);
        self.ops_since_compaction += 1;
        Ok(self.ops_since_compaction)
    }

    fn counter_reset(&mut self) -> Result<()> {
        self.ops_since_compaction = 0;
        Ok(())
    }

    fn load_clock(&self) -> Result<Option<(VectorClock, u64)>> {
        Ok(self.clock.clone())
    }

    fn save_clock(&mut self, clock: &VectorClock, ts: u64) -> Result<()> {
        self.clock = Some((clock.clone(), ts));
        Ok(())
    }

    fn save_import_backup(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        self.import_backup = Some(snapshot.clone());
        Ok(())
    }

    fn load_import_backup(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.import_backup.clone())
    }

    fn clear_import_backup(&mut self) -> Result<()> {
        self.import_backup = None;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        Ok(())
    }
}
