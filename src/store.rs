//! The durable operation log. Owns the storage backend, the authoritative
//! local vector clock, the snapshot slots, and the three per-process caches
//! (applied op ids, unsynced entries, clock).
//!
//! Cache discipline: each cache carries the last sequence number it has seen
//! and is extended by scanning only the suffix past it. Mutations that can
//! stale a cache (sync/reject transitions, deletions, clears) drop it
//! outright; it rebuilds lazily on next use.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::op::{ApplicationStatus, OpSource, Operation, OperationLogEntry};
use crate::storage::{
    now_millis, DefaultStorage, EntryRecord, SnapshotSlot, StateSnapshot, Storage,
};
#[cfg(feature = "sqlite")]
use crate::storage::SqliteStorage;

/// Remote entries that keep failing application are permanently rejected
/// after this many attempts.
pub const MAX_CONFLICT_RETRY_ATTEMPTS: u32 = 3;

/// Outcome of [`OpLogStore::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still below the retry bound; the entry stays failed and retryable.
    WillRetry(u32),
    /// Retry bound reached; the entry is now permanently rejected.
    Rejected,
}

pub struct OpLogStore<S: Storage = DefaultStorage> {
    storage: S,
    /// Ids of every stored op, valid through `.0`.
    applied_ids: Option<(u64, HashSet<String>)>,
    /// Unsynced local entries, valid through `.0`.
    unsynced: Option<(u64, Vec<OperationLogEntry>)>,
    clock: Option<(VectorClock, u64)>,
    txn_depth: u32,
}

#[cfg(feature = "sqlite")]
impl OpLogStore<SqliteStorage> {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::with_storage(SqliteStorage::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_storage(SqliteStorage::open_in_memory()?))
    }
}

impl<S: Storage> OpLogStore<S> {
    pub fn with_storage(storage: S) -> Self {
        Self {
            storage,
            applied_ids: None,
            unsynced: None,
            clock: None,
            txn_depth: 0,
        }
    }

    /// Runs `f` inside one storage transaction. Nested calls join the
    /// outermost transaction, so a multi-step invariant composed of smaller
    /// transactional operations still commits or aborts as a whole.
    pub(crate) fn with_txn<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.txn_depth == 0 {
            self.storage.begin_transaction()?;
        }
        self.txn_depth += 1;
        let result = f(self);
        self.txn_depth -= 1;
        if self.txn_depth == 0 {
            return match result {
                Ok(v) => {
                    self.storage.commit_transaction()?;
                    Ok(v)
                }
                Err(e) => {
                    let _ = self.storage.rollback_transaction();
                    Err(e)
                }
            };
        }
        result
    }

    fn drop_caches(&mut self) {
        self.applied_ids = None;
        self.unsynced = None;
    }

    fn record(op: Operation, source: OpSource, pending_apply: bool) -> EntryRecord {
        let now = now_millis();
        let (synced_at, application_status) = match source {
            OpSource::Local => (None, None),
            // Remote ops arrived via sync, so they count as synced on
            // arrival; their application status tracks the applier.
            OpSource::Remote => (
                Some(now),
                Some(if pending_apply {
                    ApplicationStatus::Pending
                } else {
                    ApplicationStatus::Applied
                }),
            ),
        };
        EntryRecord {
            op,
            applied_at: now,
            source,
            synced_at,
            application_status,
        }
    }

    /// Appends one operation, assigning the next gapless sequence number and
    /// bumping the compaction counter in the same transaction.
    pub fn append(&mut self, op: Operation, source: OpSource, pending_apply: bool) -> Result<u64> {
        if self.storage.has_op(&op.id)? {
            return Err(Error::DuplicateOp { op_id: op.id });
        }
        self.with_txn(|store| {
            let seq = store.storage.append_entry(Self::record(op, source, pending_apply))?;
            store.storage.counter_increment()?;
            Ok(seq)
        })
    }

    /// Appends a batch in one transaction, silently skipping ops already
    /// stored. Returns the sequences of the ops actually appended.
    pub fn append_batch(
        &mut self,
        ops: Vec<Operation>,
        source: OpSource,
        pending_apply: bool,
    ) -> Result<Vec<u64>> {
        self.with_txn(|store| {
            let mut seqs = Vec::new();
            for op in ops {
                if store.storage.has_op(&op.id)? {
                    continue;
                }
                seqs.push(
                    store
                        .storage
                        .append_entry(Self::record(op, source, pending_apply))?,
                );
                store.storage.counter_increment()?;
            }
            Ok(seqs)
        })
    }

    /// Appends a local op and sets the authoritative clock to the op's clock
    /// in the **same transaction**. A crash between the two writes must never
    /// be observable: a later local op would otherwise compute a too-low
    /// clock that falsely appears causally behind durable history.
    pub fn append_with_clock_update(&mut self, op: Operation, source: OpSource) -> Result<u64> {
        if self.storage.has_op(&op.id)? {
            return Err(Error::DuplicateOp { op_id: op.id });
        }
        let clock = op.vector_clock.clone();
        let seq = self.with_txn(|store| {
            let seq = store.storage.append_entry(Self::record(op, source, false))?;
            store.storage.counter_increment()?;
            store.storage.save_clock(&clock, now_millis())?;
            Ok(seq)
        })?;
        self.clock = Some((clock, now_millis()));
        Ok(seq)
    }

    pub fn ops_after_seq(&self, seq: u64) -> Result<Vec<OperationLogEntry>> {
        self.storage.entries_after(seq)
    }

    pub fn op_by_id(&self, op_id: &str) -> Result<Option<OperationLogEntry>> {
        self.storage.entry_by_op_id(op_id)
    }

    pub fn has_op(&self, op_id: &str) -> Result<bool> {
        self.storage.has_op(op_id)
    }

    pub fn last_seq(&self) -> Result<u64> {
        self.storage.last_seq()
    }

    pub fn has_synced_ops(&self) -> Result<bool> {
        self.storage.any_synced()
    }

    /// Ids of every op in the log, for deduping incoming batches.
    pub fn applied_op_ids(&mut self) -> Result<HashSet<String>> {
        let last = self.storage.last_seq()?;
        if let Some((high_water, ids)) = &mut self.applied_ids {
            if *high_water < last {
                for entry in self.storage.entries_after(*high_water)? {
                    ids.insert(entry.op.id);
                }
                debug!(from = *high_water, to = last, "extended applied-id cache");
                *high_water = last;
            }
            return Ok(ids.clone());
        }

        let mut ids = HashSet::new();
        for entry in self.storage.entries_after(0)? {
            ids.insert(entry.op.id);
        }
        debug!(count = ids.len(), "built applied-id cache");
        self.applied_ids = Some((last, ids.clone()));
        Ok(ids)
    }

    /// Drops ops already present in the log, preserving input order.
    pub fn filter_new_ops(&mut self, ops: Vec<Operation>) -> Result<Vec<Operation>> {
        let known = self.applied_op_ids()?;
        Ok(ops.into_iter().filter(|op| !known.contains(&op.id)).collect())
    }

    /// Local entries not yet uploaded and not rejected, in sequence order.
    pub fn unsynced(&mut self) -> Result<Vec<OperationLogEntry>> {
        let last = self.storage.last_seq()?;
        if let Some((high_water, entries)) = &mut self.unsynced {
            if *high_water < last {
                for entry in self.storage.entries_after(*high_water)? {
                    if entry.is_unsynced_local() {
                        entries.push(entry);
                    }
                }
                *high_water = last;
            }
            return Ok(entries.clone());
        }

        let entries: Vec<_> = self
            .storage
            .entries_after(0)?
            .into_iter()
            .filter(OperationLogEntry::is_unsynced_local)
            .collect();
        debug!(count = entries.len(), "built unsynced cache");
        self.unsynced = Some((last, entries.clone()));
        Ok(entries)
    }

    pub fn mark_synced(&mut self, seqs: &[u64]) -> Result<usize> {
        let changed = self.storage.set_synced(seqs, now_millis())?;
        self.unsynced = None;
        Ok(changed)
    }

    /// Permanent. Rejected entries stay in the log for audit but leave every
    /// future upload and cache.
    pub fn mark_rejected(&mut self, op_ids: &[String]) -> Result<usize> {
        let changed = self.storage.set_rejected(op_ids, now_millis())?;
        self.drop_caches();
        Ok(changed)
    }

    pub fn mark_applied(&mut self, seqs: &[u64]) -> Result<usize> {
        self.storage.set_applied(seqs)
    }

    /// Records one failed application attempt. At `max_retries` the entry is
    /// permanently rejected instead, in the same transaction.
    pub fn mark_failed(&mut self, op_id: &str, max_retries: u32) -> Result<FailureDisposition> {
        let disposition = self.with_txn(|store| {
            let retries = store.storage.set_failed(op_id)?;
            if retries >= max_retries {
                store
                    .storage
                    .set_rejected(&[op_id.to_string()], now_millis())?;
                Ok(FailureDisposition::Rejected)
            } else {
                Ok(FailureDisposition::WillRetry(retries))
            }
        })?;
        if disposition == FailureDisposition::Rejected {
            warn!(op_id, max_retries, "retry bound reached, op permanently rejected");
            self.drop_caches();
        }
        Ok(disposition)
    }

    pub fn pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>> {
        self.storage
            .entries_by_source_status(OpSource::Remote, &[ApplicationStatus::Pending])
    }

    pub fn failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>> {
        self.storage
            .entries_by_source_status(OpSource::Remote, &[ApplicationStatus::Failed])
    }

    /// The whole-state op with the greatest (time-sortable) id, if any. Every
    /// op whose id sorts before it is stale.
    pub fn latest_full_state_op(&self) -> Result<Option<OperationLogEntry>> {
        Ok(self
            .storage
            .entries_after(0)?
            .into_iter()
            .filter(|e| e.op.is_full_state() && e.rejected_at.is_none())
            .max_by(|a, b| a.op.id.cmp(&b.op.id)))
    }

    /// Deletes entries matching the predicate, in one transaction.
    pub fn delete_ops_where(
        &mut self,
        pred: impl Fn(&OperationLogEntry) -> bool,
    ) -> Result<usize> {
        let seqs: Vec<u64> = self
            .storage
            .entries_after(0)?
            .iter()
            .filter(|e| pred(e))
            .map(|e| e.seq)
            .collect();
        let deleted = self.with_txn(|store| store.storage.delete_entries(&seqs))?;
        if deleted > 0 {
            self.drop_caches();
        }
        Ok(deleted)
    }

    // ---- vector clock ----

    pub fn vector_clock(&mut self) -> Result<VectorClock> {
        Ok(self
            .vector_clock_entry()?
            .map(|(clock, _)| clock)
            .unwrap_or_default())
    }

    /// The stored clock plus the time it last changed, or `None` before the
    /// first local op.
    pub fn vector_clock_entry(&mut self) -> Result<Option<(VectorClock, u64)>> {
        if let Some(cached) = &self.clock {
            return Ok(Some(cached.clone()));
        }
        let loaded = self.storage.load_clock()?;
        if let Some(entry) = &loaded {
            self.clock = Some(entry.clone());
        }
        Ok(loaded)
    }

    pub fn set_vector_clock(&mut self, clock: VectorClock) -> Result<()> {
        let ts = now_millis();
        self.storage.save_clock(&clock, ts)?;
        self.clock = Some((clock, ts));
        Ok(())
    }

    /// Pointwise-max merges the given remote op clocks into the stored clock.
    /// Required after applying remote ops so that later local ops causally
    /// dominate everything already incorporated.
    pub fn merge_remote_op_clocks(&mut self, ops: &[Operation]) -> Result<VectorClock> {
        let mut clock = self.vector_clock()?;
        for op in ops {
            clock.merge_in_place(&op.vector_clock);
        }
        self.set_vector_clock(clock.clone())?;
        Ok(clock)
    }

    // ---- state cache / snapshot slots ----

    pub fn save_state_cache(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        self.storage.save_snapshot(SnapshotSlot::Current, snapshot)
    }

    /// `None` when no snapshot exists yet (including the stub row created by
    /// the compaction counter).
    pub fn load_state_cache(&self) -> Result<Option<StateSnapshot>> {
        match self.storage.load_snapshot(SnapshotSlot::Current)? {
            Some(snapshot) if snapshot.state.is_null() => Ok(None),
            other => Ok(other),
        }
    }

    /// Copies the current snapshot into the backup slot before a migration.
    pub fn save_state_cache_backup(&mut self) -> Result<()> {
        self.with_txn(|store| {
            let current = store
                .storage
                .load_snapshot(SnapshotSlot::Current)?
                .ok_or_else(|| Error::NotFound {
                    what: "current state cache".to_string(),
                })?;
            store.storage.save_snapshot(SnapshotSlot::Backup, &current)
        })
    }

    pub fn load_state_cache_backup(&self) -> Result<Option<StateSnapshot>> {
        self.storage.load_snapshot(SnapshotSlot::Backup)
    }

    pub fn has_state_cache_backup(&self) -> Result<bool> {
        self.storage.has_snapshot(SnapshotSlot::Backup)
    }

    /// Restores current from backup and clears the backup slot, atomically.
    pub fn restore_state_cache_from_backup(&mut self) -> Result<()> {
        self.with_txn(|store| {
            let backup = store
                .storage
                .load_snapshot(SnapshotSlot::Backup)?
                .ok_or_else(|| Error::NotFound {
                    what: "state cache backup".to_string(),
                })?;
            store.storage.save_snapshot(SnapshotSlot::Current, &backup)?;
            store.storage.delete_snapshot(SnapshotSlot::Backup)
        })
    }

    pub fn clear_state_cache_backup(&mut self) -> Result<()> {
        self.storage.delete_snapshot(SnapshotSlot::Backup)
    }

    // ---- compaction counter ----

    pub fn ops_since_compaction(&self) -> Result<u64> {
        self.storage.counter_get()
    }

    pub fn increment_op_counter(&mut self) -> Result<u64> {
        self.storage.counter_increment()
    }

    pub fn reset_op_counter(&mut self) -> Result<()> {
        self.storage.counter_reset()
    }

    // ---- import backup ----

    pub fn save_import_backup(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        self.storage.save_import_backup(snapshot)
    }

    pub fn load_import_backup(&self) -> Result<Option<StateSnapshot>> {
        self.storage.load_import_backup()
    }

    pub fn clear_import_backup(&mut self) -> Result<()> {
        self.storage.clear_import_backup()
    }

    /// Full reset, for teardown and tests.
    pub fn clear_all(&mut self) -> Result<()> {
        self.with_txn(|store| {
            store.storage.clear_entries()?;
            store.storage.delete_snapshot(SnapshotSlot::Current)?;
            store.storage.delete_snapshot(SnapshotSlot::Backup)?;
            store.storage.clear_import_backup()?;
            store.storage.save_clock(&VectorClock::new(), now_millis())
        })?;
        self.drop_caches();
        self.clock = None;
        Ok(())
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::op::OpType;
    use serde_json::json;

    fn op(client: &str, entity: &str, counter: u64) -> Operation {
        let mut clock = VectorClock::new();
        clock.0.insert(client.to_string(), counter);
        Operation {
            id: Operation::new_id(),
            action_type: "updateTask".to_string(),
            op_type: OpType::Update,
            entity_type: "TASK".to_string(),
            entity_id: Some(entity.to_string()),
            entity_ids: None,
            payload: json!({"title": entity}),
            client_id: client.to_string(),
            vector_clock: clock,
            timestamp: now_millis(),
            schema_version: 1,
        }
    }

    fn full_state_op(client: &str) -> Operation {
        let mut o = op(client, "ALL", 1);
        o.op_type = OpType::SyncImport;
        o.entity_type = "ALL".to_string();
        o.entity_id = Some("ALL".to_string());
        o
    }

    #[test]
    fn sequential_appends_are_gapless() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let mut seqs = Vec::new();
        for i in 0..10 {
            let o = op(if i % 2 == 0 { "a" } else { "b" }, &format!("t{}", i), i + 1);
            seqs.push(store.append(o, OpSource::Local, false).unwrap());
        }
        let expected: Vec<u64> = (1..=10).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn interleaved_appends_from_many_clients_stay_gapless() {
        use rand::seq::SliceRandom;

        let mut ops = Vec::new();
        for client in ["a", "b", "c"] {
            for i in 1..=5u64 {
                ops.push(op(client, &format!("{}-{}", client, i), i));
            }
        }
        ops.shuffle(&mut rand::thread_rng());

        let mut store = OpLogStore::open_in_memory().unwrap();
        let seqs: Vec<u64> = ops
            .into_iter()
            .map(|o| store.append(o, OpSource::Local, false).unwrap())
            .collect();
        assert_eq!(seqs, (1..=15).collect::<Vec<u64>>());
    }

    #[test]
    fn duplicate_append_is_reported() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let o = op("a", "t1", 1);
        store.append(o.clone(), OpSource::Local, false).unwrap();
        match store.append(o, OpSource::Local, false) {
            Err(Error::DuplicateOp { .. }) => {}
            other => panic!("expected DuplicateOp, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn append_batch_skips_known_ops() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let a = op("a", "t1", 1);
        let b = op("a", "t2", 2);
        store.append(a.clone(), OpSource::Local, false).unwrap();

        let seqs = store
            .append_batch(vec![a, b], OpSource::Remote, true)
            .unwrap();
        assert_eq!(seqs.len(), 1, "known op must be skipped");
        assert_eq!(store.last_seq().unwrap(), 2);
    }

    #[test]
    fn append_with_clock_update_sets_the_stored_clock() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let o = op("a", "t1", 3);
        let expected = o.vector_clock.clone();
        store.append_with_clock_update(o, OpSource::Local).unwrap();
        assert_eq!(store.vector_clock().unwrap(), expected);

        // Cold read sees the same clock.
        let (clock, _) = store.vector_clock_entry().unwrap().unwrap();
        assert_eq!(clock, expected);
    }

    #[test]
    fn unsynced_excludes_marked_entries_warm_and_cold() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let s1 = store.append(op("a", "t1", 1), OpSource::Local, false).unwrap();
        let o2 = op("a", "t2", 2);
        let rejected_id = o2.id.clone();
        store.append(o2, OpSource::Local, false).unwrap();
        let s3 = store.append(op("a", "t3", 3), OpSource::Local, false).unwrap();

        // Warm the cache.
        assert_eq!(store.unsynced().unwrap().len(), 3);

        store.mark_synced(&[s1]).unwrap();
        store.mark_rejected(&[rejected_id]).unwrap();

        let remaining = store.unsynced().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].seq, s3);

        // Cold: fresh store over the same semantics (memory backend shares
        // nothing, so replay the same transitions through a new cache).
        store.drop_caches();
        let cold = store.unsynced().unwrap();
        assert_eq!(cold.len(), 1);
        assert_eq!(cold[0].seq, s3);
    }

    #[test]
    fn remote_appends_are_synced_on_arrival() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        store.append(op("b", "t1", 1), OpSource::Remote, true).unwrap();

        assert!(store.unsynced().unwrap().is_empty());
        let pending = store.pending_remote_ops().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].application_status, Some(ApplicationStatus::Pending));
        assert!(pending[0].synced_at.is_some());
    }

    #[test]
    fn filter_new_ops_deduplicates_redelivery() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let known = op("b", "t1", 1);
        store.append(known.clone(), OpSource::Remote, true).unwrap();

        let fresh = op("b", "t2", 2);
        let fresh_id = fresh.id.clone();
        let out = store.filter_new_ops(vec![known, fresh]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, fresh_id);
    }

    #[test]
    fn mark_failed_escalates_to_rejection_at_the_bound() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let o = op("b", "t1", 1);
        let op_id = o.id.clone();
        store.append(o, OpSource::Remote, true).unwrap();

        assert_eq!(
            store.mark_failed(&op_id, 3).unwrap(),
            FailureDisposition::WillRetry(1)
        );
        assert_eq!(store.failed_remote_ops().unwrap().len(), 1);

        assert_eq!(
            store.mark_failed(&op_id, 3).unwrap(),
            FailureDisposition::WillRetry(2)
        );
        assert_eq!(store.mark_failed(&op_id, 3).unwrap(), FailureDisposition::Rejected);

        // Rejected entries leave the recovery queues but stay in the log.
        assert!(store.failed_remote_ops().unwrap().is_empty());
        let entry = store.op_by_id(&op_id).unwrap().unwrap();
        assert!(entry.rejected_at.is_some());
    }

    #[test]
    fn failed_entry_can_still_become_applied_on_retry() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let o = op("b", "t1", 1);
        let op_id = o.id.clone();
        let seq = store.append(o, OpSource::Remote, true).unwrap();

        store.mark_failed(&op_id, 3).unwrap();
        assert_eq!(store.mark_applied(&[seq]).unwrap(), 1);
        assert!(store.failed_remote_ops().unwrap().is_empty());
        assert!(store.pending_remote_ops().unwrap().is_empty());
    }

    #[test]
    fn latest_full_state_op_is_max_by_id() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let older = full_state_op("a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = full_state_op("b");
        let newer_id = newer.id.clone();

        // Arrival order deliberately reversed: id order must win.
        store.append(newer, OpSource::Remote, false).unwrap();
        store.append(older, OpSource::Remote, false).unwrap();
        store.append(op("a", "t1", 1), OpSource::Local, false).unwrap();

        let latest = store.latest_full_state_op().unwrap().unwrap();
        assert_eq!(latest.op.id, newer_id);
    }

    #[test]
    fn merge_remote_op_clocks_takes_pointwise_max() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        store.set_vector_clock(VectorClock::new().increment("a")).unwrap();

        let merged = store
            .merge_remote_op_clocks(&[op("b", "t1", 4), op("c", "t2", 2)])
            .unwrap();
        assert_eq!(merged.get("a"), 1);
        assert_eq!(merged.get("b"), 4);
        assert_eq!(merged.get("c"), 2);
        assert_eq!(store.vector_clock().unwrap(), merged);
    }

    #[test]
    fn state_cache_backup_round_trip() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let original = StateSnapshot {
            state: json!({"tasks": {"t1": {"title": "before"}}}),
            last_applied_op_seq: 7,
            vector_clock: VectorClock::new().increment("a"),
            compacted_at: now_millis(),
            schema_version: 1,
            entity_keys: None,
        };
        store.save_state_cache(&original).unwrap();
        store.save_state_cache_backup().unwrap();
        assert!(store.has_state_cache_backup().unwrap());

        // Mutate current, then restore.
        let mut mutated = original.clone();
        mutated.state = json!({"tasks": {}});
        mutated.last_applied_op_seq = 9;
        store.save_state_cache(&mutated).unwrap();

        store.restore_state_cache_from_backup().unwrap();
        assert_eq!(store.load_state_cache().unwrap().unwrap(), original);
        assert!(!store.has_state_cache_backup().unwrap());
    }

    #[test]
    fn import_backup_round_trip_and_clear() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        assert!(store.load_import_backup().unwrap().is_none());

        let before_import = StateSnapshot {
            state: json!({"tasks": {"t1": {"title": "pre-import"}}}),
            last_applied_op_seq: 4,
            vector_clock: VectorClock::new().increment("a"),
            compacted_at: now_millis(),
            schema_version: 1,
            entity_keys: None,
        };
        store.save_import_backup(&before_import).unwrap();
        assert_eq!(store.load_import_backup().unwrap().unwrap(), before_import);

        // One slot only; a later import overwrites it.
        let mut newer = before_import.clone();
        newer.last_applied_op_seq = 6;
        store.save_import_backup(&newer).unwrap();
        assert_eq!(store.load_import_backup().unwrap().unwrap(), newer);

        store.clear_import_backup().unwrap();
        assert!(store.load_import_backup().unwrap().is_none());
    }

    #[test]
    fn null_state_snapshot_reads_as_absent() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        // Counter bumps create the stub row.
        store.append(op("a", "t1", 1), OpSource::Local, false).unwrap();
        assert_eq!(store.ops_since_compaction().unwrap(), 1);
        assert!(store.load_state_cache().unwrap().is_none());
    }

    #[test]
    fn delete_ops_where_prunes_and_invalidates() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let s1 = store.append(op("a", "t1", 1), OpSource::Local, false).unwrap();
        store.append(op("a", "t2", 2), OpSource::Local, false).unwrap();
        store.mark_synced(&[s1]).unwrap();
        store.unsynced().unwrap();

        let deleted = store.delete_ops_where(|e| e.synced_at.is_some()).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.ops_after_seq(0).unwrap().len(), 1);
        assert_eq!(store.unsynced().unwrap().len(), 1);
    }

    #[test]
    fn clear_all_resets_everything() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        store.append_with_clock_update(op("a", "t1", 1), OpSource::Local).unwrap();
        store
            .save_state_cache(&StateSnapshot {
                state: json!({}),
                last_applied_op_seq: 1,
                vector_clock: VectorClock::new(),
                compacted_at: 0,
                schema_version: 1,
                entity_keys: None,
            })
            .unwrap();

        store.clear_all().unwrap();
        assert_eq!(store.last_seq().unwrap(), 0);
        assert!(store.load_state_cache().unwrap().is_none());
        assert!(store.vector_clock().unwrap().is_empty());
    }
}
