//! Compaction: folding the synced, aged prefix of the log into a state
//! snapshot, plus the backup discipline that keeps snapshot migrations
//! crash-safe.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::op::{ApplicationStatus, OpSource, OperationLogEntry};
use crate::storage::{now_millis, StateSnapshot, Storage};
use crate::store::OpLogStore;

/// Compaction that runs because storage is under pressure folds everything
/// synced, regardless of age.
pub const EMERGENCY_RETENTION_MS: u64 = 0;

#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    /// Entries younger than this never fold.
    pub retention_ms: u64,
    /// Operations since the last compaction before [`maybe_compact`] fires.
    pub trigger_threshold: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            retention_ms: 30 * 24 * 60 * 60 * 1000,
            trigger_threshold: 500,
        }
    }
}

/// Full materialized state at capture time, supplied by the application.
#[derive(Debug, Clone)]
pub struct CapturedState {
    pub state: Value,
    pub entity_keys: BTreeSet<String>,
    pub schema_version: u32,
}

pub trait StateProvider {
    fn capture(&mut self) -> Result<CapturedState>;
}

impl<F: FnMut() -> Result<CapturedState>> StateProvider for F {
    fn capture(&mut self) -> Result<CapturedState> {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub folded: usize,
    pub last_applied_op_seq: u64,
}

/// An entry may fold only when it is fully synced, old enough, within the
/// sequence range that existed when compaction started, and not a remote
/// entry still awaiting application.
fn foldable(entry: &OperationLogEntry, cutoff: u64, last_seq: u64) -> bool {
    if entry.seq > last_seq || entry.applied_at > cutoff || entry.synced_at.is_none() {
        return false;
    }
    if entry.source == OpSource::Remote {
        return !matches!(
            entry.application_status,
            Some(ApplicationStatus::Pending) | Some(ApplicationStatus::Failed)
        );
    }
    true
}

/// Runs compaction when the persistent op counter has reached the policy
/// threshold. The counter makes the trigger decision O(1), no log scan.
pub fn maybe_compact<S: Storage, P: StateProvider>(
    store: &mut OpLogStore<S>,
    policy: &CompactionPolicy,
    provider: &mut P,
) -> Result<Option<CompactionReport>> {
    let count = store.ops_since_compaction()?;
    if count < policy.trigger_threshold {
        debug!(count, threshold = policy.trigger_threshold, "compaction not due");
        return Ok(None);
    }
    Ok(Some(compact(store, provider, policy.retention_ms)?))
}

/// Folds every foldable entry into a fresh snapshot, deletes exactly those
/// entries, and resets the counter. Unsynced and recent entries survive.
pub fn compact<S: Storage, P: StateProvider>(
    store: &mut OpLogStore<S>,
    provider: &mut P,
    retention_ms: u64,
) -> Result<CompactionReport> {
    let last_seq = store.last_seq()?;
    let now = now_millis();
    let cutoff = now.saturating_sub(retention_ms);

    let fold_seqs: Vec<u64> = store
        .ops_after_seq(0)?
        .iter()
        .filter(|e| foldable(e, cutoff, last_seq))
        .map(|e| e.seq)
        .collect();

    if fold_seqs.is_empty() {
        store.reset_op_counter()?;
        return Ok(CompactionReport::default());
    }

    // Capture outside the transaction: provider code is application-owned
    // and may be slow or fallible.
    let captured = provider.capture()?;
    let vector_clock = store.current_vector_clock()?;
    let last_applied_op_seq = *fold_seqs.iter().max().unwrap_or(&0);

    let snapshot = StateSnapshot {
        state: captured.state,
        last_applied_op_seq,
        vector_clock,
        compacted_at: now,
        schema_version: captured.schema_version,
        entity_keys: Some(captured.entity_keys),
    };

    store.with_txn(|store| {
        store.save_state_cache(&snapshot)?;
        store.delete_ops_where(|e| fold_seqs.contains(&e.seq))?;
        store.reset_op_counter()
    })?;

    info!(
        folded = fold_seqs.len(),
        last_applied_op_seq, "compacted log prefix into snapshot"
    );
    Ok(CompactionReport { folded: fold_seqs.len(), last_applied_op_seq })
}

/// Storage-pressure variant: same fold, no age protection.
pub fn emergency_compact<S: Storage, P: StateProvider>(
    store: &mut OpLogStore<S>,
    provider: &mut P,
) -> Result<CompactionReport> {
    compact(store, provider, EMERGENCY_RETENTION_MS)
}

/// Rewrites the current snapshot through `f`, keeping a backup copy so a
/// crash mid-migration is recoverable. Startup code that finds the backup
/// slot occupied restores it before retrying (see the recovery module).
pub fn migrate_snapshot<S: Storage>(
    store: &mut OpLogStore<S>,
    f: impl FnOnce(StateSnapshot) -> Result<StateSnapshot>,
) -> Result<()> {
    let current = match store.load_state_cache()? {
        Some(snapshot) => snapshot,
        None => return Ok(()),
    };
    store.save_state_cache_backup()?;

    let migrated = f(current)?;
    store.with_txn(|store| {
        store.save_state_cache(&migrated)?;
        store.clear_state_cache_backup()
    })?;
    info!(schema_version = migrated.schema_version, "snapshot migrated");
    Ok(())
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::error::Error;
    use crate::op::{OpType, Operation};
    use crate::storage::SqliteStorage;
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

    fn provider(state: Value) -> impl FnMut() -> Result<CapturedState> {
        move || {
            Ok(CapturedState {
                state: state.clone(),
                entity_keys: ["TASK:t1".to_string()].into_iter().collect(),
                schema_version: 1,
            })
        }
    }

    fn store_with_synced_ops(n: u64) -> (OpLogStore<SqliteStorage>, Vec<u64>) {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let mut seqs = Vec::new();
        for i in 1..=n {
            let o = op("a", "t1", i);
            seqs.push(store.append_with_clock_update(o, OpSource::Local).unwrap());
        }
        store.mark_synced(&seqs).unwrap();
        (store, seqs)
    }

    #[test]
    fn compaction_snapshots_the_highest_synced_seq_and_clock() {
        let (mut store, seqs) = store_with_synced_ops(5);
        let clock_before = store.current_vector_clock().unwrap();

        let report = compact(&mut store, &mut provider(json!({"tasks": 5})), 0).unwrap();
        assert_eq!(report.folded, 5);
        assert_eq!(report.last_applied_op_seq, *seqs.last().unwrap());

        let snapshot = store.load_state_cache().unwrap().unwrap();
        assert_eq!(snapshot.last_applied_op_seq, *seqs.last().unwrap());
        assert_eq!(snapshot.vector_clock, clock_before);
        assert_eq!(snapshot.state, json!({"tasks": 5}));

        assert!(store.ops_after_seq(0).unwrap().is_empty());
        assert_eq!(store.ops_since_compaction().unwrap(), 0);
    }

    #[test]
    fn unsynced_entries_are_never_folded() {
        let (mut store, _) = store_with_synced_ops(3);
        store
            .append_with_clock_update(op("a", "t1", 4), OpSource::Local)
            .unwrap();

        let report = compact(&mut store, &mut provider(json!({})), 0).unwrap();
        assert_eq!(report.folded, 3);

        let survivors = store.ops_after_seq(0).unwrap();
        assert_eq!(survivors.len(), 1);
        assert!(survivors[0].synced_at.is_none());
    }

    #[test]
    fn pending_remote_entries_are_never_folded() {
        let (mut store, _) = store_with_synced_ops(2);
        store.append(op("b", "t2", 1), OpSource::Remote, true).unwrap();

        let report = compact(&mut store, &mut provider(json!({})), 0).unwrap();
        assert_eq!(report.folded, 2);
        assert_eq!(store.pending_remote_ops().unwrap().len(), 1);
    }

    #[test]
    fn recent_entries_are_protected_by_retention() {
        let (mut store, _) = store_with_synced_ops(4);

        // A day of retention: nothing just appended can fold.
        let report = compact(&mut store, &mut provider(json!({})), 24 * 60 * 60 * 1000).unwrap();
        assert_eq!(report.folded, 0);
        assert_eq!(store.ops_after_seq(0).unwrap().len(), 4);
        // The counter still resets so the trigger does not spin.
        assert_eq!(store.ops_since_compaction().unwrap(), 0);

        // Emergency compaction ignores age.
        let report = emergency_compact(&mut store, &mut provider(json!({}))).unwrap();
        assert_eq!(report.folded, 4);
    }

    #[test]
    fn maybe_compact_waits_for_the_threshold() {
        let (mut store, _) = store_with_synced_ops(3);
        let policy = CompactionPolicy { retention_ms: 0, trigger_threshold: 10 };

        assert_eq!(
            maybe_compact(&mut store, &policy, &mut provider(json!({}))).unwrap(),
            None
        );

        let policy = CompactionPolicy { retention_ms: 0, trigger_threshold: 3 };
        let report = maybe_compact(&mut store, &policy, &mut provider(json!({})))
            .unwrap()
            .unwrap();
        assert_eq!(report.folded, 3);
    }

    #[test]
    fn snapshot_keys_record_what_was_folded() {
        let (mut store, _) = store_with_synced_ops(2);
        compact(&mut store, &mut provider(json!({})), 0).unwrap();

        let snapshot = store.load_state_cache().unwrap().unwrap();
        let keys = snapshot.entity_keys.unwrap();
        assert!(keys.contains("TASK:t1"));
    }

    #[test]
    fn migration_clears_the_backup_on_success() {
        let (mut store, _) = store_with_synced_ops(2);
        compact(&mut store, &mut provider(json!({"v": 1})), 0).unwrap();

        migrate_snapshot(&mut store, |mut snapshot| {
            snapshot.state = json!({"v": 2});
            snapshot.schema_version = 2;
            Ok(snapshot)
        })
        .unwrap();

        let migrated = store.load_state_cache().unwrap().unwrap();
        assert_eq!(migrated.state, json!({"v": 2}));
        assert_eq!(migrated.schema_version, 2);
        assert!(!store.has_state_cache_backup().unwrap());
    }

    #[test]
    fn failed_migration_leaves_the_backup_for_recovery() {
        let (mut store, _) = store_with_synced_ops(2);
        compact(&mut store, &mut provider(json!({"v": 1})), 0).unwrap();
        let original = store.load_state_cache().unwrap().unwrap();

        let result = migrate_snapshot(&mut store, |_| {
            Err(Error::InvalidState("migration died midway".to_string()))
        });
        assert!(result.is_err());
        assert!(store.has_state_cache_backup().unwrap());

        // Startup recovery path: restore, then the snapshot is pristine.
        store.restore_state_cache_from_backup().unwrap();
        assert_eq!(store.load_state_cache().unwrap().unwrap(), original);
    }
}
