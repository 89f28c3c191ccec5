//! Last-write-wins resolution for concurrent edits.
//!
//! Causally ordered operations are never conflicts; this module is entered
//! only when vector clocks say two operations are concurrent. The rule is
//! uniform across op types, DELETE vs UPDATE included: the strictly greater
//! wall-clock timestamp wins, and an exact tie goes to the remote side
//! (server-authoritative convention).

use tracing::{debug, info};

use crate::clock::ClockOrdering;
use crate::error::Result;
use crate::op::{OpSource, Operation, OperationLogEntry};
use crate::storage::{now_millis, Storage};
use crate::store::OpLogStore;

/// Causality verdict for an incoming remote operation against the local
/// pending ops that touch the same entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    /// No pending local op is concurrent with it; apply in causal order.
    NoConflict,
    /// The remote op is causally behind local history; discard, never retry.
    RemoteStale,
    /// Genuine concurrency on these entity keys; resolve with LWW.
    Concurrent { entity_keys: Vec<String> },
}

/// What LWW decided and the bookkeeping it performed.
#[derive(Debug, Clone, PartialEq)]
pub enum LwwOutcome {
    /// Remote payload applied; the competing local ops were rejected.
    RemoteWins { rejected_local_ids: Vec<String> },
    /// Both sides rejected; one synthesized local op supersedes them.
    LocalWins {
        rejected_local_ids: Vec<String>,
        rejected_remote_id: String,
        merged_op: Operation,
        merged_seq: u64,
    },
}

/// Pending (unsynced, unrejected) local entries sharing an entity key with
/// `remote`. A Batch op contributes every entity it references, so the whole
/// batch is one conflict unit.
fn competing_local_entries<S: Storage>(
    store: &mut OpLogStore<S>,
    remote: &Operation,
) -> Result<Vec<OperationLogEntry>> {
    let keys = remote.entity_keys();
    Ok(store
        .unsynced()?
        .into_iter()
        .filter(|entry| entry.op.entity_keys().iter().any(|k| keys.contains(k)))
        .collect())
}

/// Classifies an incoming remote op. Duplicate filtering and full-state
/// staleness are handled upstream; this looks only at entity-level causality.
pub fn check_remote_op<S: Storage>(
    store: &mut OpLogStore<S>,
    remote: &Operation,
) -> Result<ConflictCheck> {
    let competing = competing_local_entries(store, remote)?;
    if competing.is_empty() {
        return Ok(ConflictCheck::NoConflict);
    }

    let mut concurrent_keys: Vec<String> = Vec::new();
    let mut dominated = false;
    for entry in &competing {
        match remote.vector_clock.compare(&entry.op.vector_clock) {
            ClockOrdering::Concurrent => {
                for key in entry.op.entity_keys() {
                    if remote.entity_keys().contains(&key) && !concurrent_keys.contains(&key) {
                        concurrent_keys.push(key);
                    }
                }
            }
            ClockOrdering::LessThan => dominated = true,
            ClockOrdering::GreaterThan | ClockOrdering::Equal => {}
        }
    }

    if !concurrent_keys.is_empty() {
        debug!(op_id = %remote.id, keys = ?concurrent_keys, "concurrent remote op");
        return Ok(ConflictCheck::Concurrent { entity_keys: concurrent_keys });
    }
    if dominated {
        return Ok(ConflictCheck::RemoteStale);
    }
    Ok(ConflictCheck::NoConflict)
}

/// Resolves a concurrent remote entry already appended as pending.
///
/// Local timestamp for the comparison is the max across the entity's pending
/// local ops. Strictly greater wins; tie goes to remote. A winning remote
/// entry keeps its pending status: resolution only decides which side
/// survives, and the applier confirms application afterwards by draining
/// [`OpLogStore::pending_remote_ops`].
pub fn resolve_lww<S: Storage>(
    store: &mut OpLogStore<S>,
    remote: &OperationLogEntry,
    local_client_id: &str,
) -> Result<LwwOutcome> {
    let competing = competing_local_entries(store, &remote.op)?;
    let local_ids: Vec<String> = competing.iter().map(|e| e.op.id.clone()).collect();

    // Latest local op decides the local side's timestamp and, on a local
    // win, supplies the surviving payload.
    let latest_local = competing
        .iter()
        .max_by_key(|e| (e.op.timestamp, e.seq))
        .cloned();

    let local_ts = latest_local.as_ref().map(|e| e.op.timestamp).unwrap_or(0);

    if remote.op.timestamp >= local_ts {
        store.mark_rejected(&local_ids)?;
        info!(
            op_id = %remote.op.id,
            rejected = local_ids.len(),
            "lww: remote wins"
        );
        return Ok(LwwOutcome::RemoteWins {
            rejected_local_ids: local_ids,
        });
    }

    // Local wins: both sides are superseded by one synthesized op whose
    // clock strictly dominates each of them.
    let winner = match latest_local {
        Some(entry) => entry,
        // Unreachable in practice: local_ts > remote timestamp implies at
        // least one competing entry.
        None => {
            return Ok(LwwOutcome::RemoteWins {
                rejected_local_ids: Vec::new(),
            })
        }
    };

    let merged_clock = winner
        .op
        .vector_clock
        .merge(&remote.op.vector_clock)
        .increment(local_client_id);

    let merged_op = Operation {
        id: Operation::new_id(),
        action_type: winner.op.action_type.clone(),
        op_type: winner.op.op_type,
        entity_type: winner.op.entity_type.clone(),
        entity_id: winner.op.entity_id.clone(),
        entity_ids: winner.op.entity_ids.clone(),
        payload: winner.op.payload.clone(),
        client_id: local_client_id.to_string(),
        vector_clock: merged_clock,
        timestamp: now_millis(),
        schema_version: winner.op.schema_version,
    };

    let remote_id = remote.op.id.clone();
    let merged_for_txn = merged_op.clone();
    let merged_seq = store.with_txn(|store| {
        store.mark_rejected(&local_ids)?;
        store.mark_rejected(&[remote_id.clone()])?;
        store.append_with_clock_update(merged_for_txn, OpSource::Local)
    })?;

    info!(
        op_id = %remote.op.id,
        merged_op_id = %merged_op.id,
        "lww: local wins, merge op synthesized"
    );
    Ok(LwwOutcome::LocalWins {
        rejected_local_ids: local_ids,
        rejected_remote_id: remote.op.id.clone(),
        merged_op,
        merged_seq,
    })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::op::OpType;
    use serde_json::json;

    fn op(client: &str, entity: &str, clock: VectorClock, ts: u64) -> Operation {
        Operation {
            id: Operation::new_id(),
            action_type: "updateTask".to_string(),
            op_type: OpType::Update,
            entity_type: "TASK".to_string(),
            entity_id: Some(entity.to_string()),
            entity_ids: None,
            payload: json!({"title": format!("{} by {}", entity, client)}),
            client_id: client.to_string(),
            vector_clock: clock,
            timestamp: ts,
            schema_version: 1,
        }
    }

    fn store_with_local_op(
        entity: &str,
        ts: u64,
    ) -> (OpLogStore<crate::storage::SqliteStorage>, Operation) {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let local = op("a", entity, VectorClock::new().increment("a"), ts);
        store
            .append_with_clock_update(local.clone(), OpSource::Local)
            .unwrap();
        (store, local)
    }

    #[test]
    fn causally_later_remote_op_is_not_a_conflict() {
        let (mut store, local) = store_with_local_op("t1", 1_000);
        // Remote saw our op before editing: its clock dominates ours.
        let remote = op("b", "t1", local.vector_clock.increment("b"), 2_000);
        assert_eq!(check_remote_op(&mut store, &remote).unwrap(), ConflictCheck::NoConflict);
    }

    #[test]
    fn dominated_remote_op_is_stale() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let clock = VectorClock::new().increment("a").increment("a");
        store
            .append_with_clock_update(op("a", "t1", clock, 1_000), OpSource::Local)
            .unwrap();

        let remote = op("b", "t1", VectorClock::new().increment("a"), 2_000);
        assert_eq!(check_remote_op(&mut store, &remote).unwrap(), ConflictCheck::RemoteStale);
    }

    #[test]
    fn concurrent_clocks_are_flagged_per_entity() {
        let (mut store, _) = store_with_local_op("t1", 1_000);
        let remote = op("b", "t1", VectorClock::new().increment("b"), 2_000);
        assert_eq!(
            check_remote_op(&mut store, &remote).unwrap(),
            ConflictCheck::Concurrent { entity_keys: vec!["TASK:t1".to_string()] }
        );
    }

    #[test]
    fn unrelated_entities_never_conflict() {
        let (mut store, _) = store_with_local_op("t1", 1_000);
        let remote = op("b", "t2", VectorClock::new().increment("b"), 2_000);
        assert_eq!(check_remote_op(&mut store, &remote).unwrap(), ConflictCheck::NoConflict);
    }

    #[test]
    fn newer_remote_timestamp_wins() {
        let (mut store, local) = store_with_local_op("t1", 1_000);
        let remote = op("b", "t1", VectorClock::new().increment("b"), 2_000);
        let seq = store.append(remote.clone(), OpSource::Remote, true).unwrap();
        let entry = store.op_by_id(&remote.id).unwrap().unwrap();
        assert_eq!(entry.seq, seq);

        match resolve_lww(&mut store, &entry, "a").unwrap() {
            LwwOutcome::RemoteWins { rejected_local_ids } => {
                assert_eq!(rejected_local_ids, vec![local.id.clone()]);
            }
            other => panic!("expected remote win, got {:?}", other),
        }

        let local_entry = store.op_by_id(&local.id).unwrap().unwrap();
        assert!(local_entry.rejected_at.is_some(), "loser must be rejected");
        // The winner is still awaiting application; only the applier may
        // move it to applied.
        let pending = store.pending_remote_ops().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op.id, remote.id);
        assert!(store.unsynced().unwrap().is_empty(), "rejected op must not upload");
    }

    #[test]
    fn newer_local_timestamp_synthesizes_a_merge_op() {
        let (mut store, local) = store_with_local_op("t1", 2_000);
        let remote = op("b", "t1", VectorClock::new().increment("b"), 1_000);
        store.append(remote.clone(), OpSource::Remote, true).unwrap();
        let entry = store.op_by_id(&remote.id).unwrap().unwrap();

        let outcome = resolve_lww(&mut store, &entry, "a").unwrap();
        let merged_op = match outcome {
            LwwOutcome::LocalWins { merged_op, rejected_remote_id, .. } => {
                assert_eq!(rejected_remote_id, remote.id);
                merged_op
            }
            other => panic!("expected local win, got {:?}", other),
        };

        // The synthesized clock strictly dominates both inputs.
        assert_eq!(
            merged_op.vector_clock.compare(&local.vector_clock),
            ClockOrdering::GreaterThan
        );
        assert_eq!(
            merged_op.vector_clock.compare(&remote.vector_clock),
            ClockOrdering::GreaterThan
        );
        // It carries the winning local payload and becomes the stored clock.
        assert_eq!(merged_op.payload, local.payload);
        assert_eq!(store.vector_clock().unwrap(), merged_op.vector_clock);

        // Both originals are rejected; only the merge op awaits upload.
        assert!(store.op_by_id(&local.id).unwrap().unwrap().rejected_at.is_some());
        assert!(store.op_by_id(&remote.id).unwrap().unwrap().rejected_at.is_some());
        let unsynced = store.unsynced().unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].op.id, merged_op.id);
    }

    #[test]
    fn exact_timestamp_tie_goes_to_remote() {
        let (mut store, local) = store_with_local_op("t1", 1_500);
        let mut remote = op("b", "t1", VectorClock::new().increment("b"), 1_500);
        remote.op_type = OpType::Delete;
        store.append(remote.clone(), OpSource::Remote, true).unwrap();
        let entry = store.op_by_id(&remote.id).unwrap().unwrap();

        // DELETE vs UPDATE at the same timestamp follows the same rule.
        match resolve_lww(&mut store, &entry, "a").unwrap() {
            LwwOutcome::RemoteWins { rejected_local_ids } => {
                assert_eq!(rejected_local_ids, vec![local.id]);
            }
            other => panic!("expected remote win on tie, got {:?}", other),
        }
    }

    #[test]
    fn batch_conflicts_resolve_atomically() {
        let mut store = OpLogStore::open_in_memory().unwrap();
        let l1 = op("a", "t1", VectorClock::new().increment("a"), 1_000);
        let l2 = op("a", "t2", VectorClock::new().increment("a").increment("a"), 1_000);
        store.append_with_clock_update(l1.clone(), OpSource::Local).unwrap();
        store.append_with_clock_update(l2.clone(), OpSource::Local).unwrap();

        let mut batch = op("b", "unused", VectorClock::new().increment("b"), 2_000);
        batch.op_type = OpType::Batch;
        batch.entity_id = None;
        batch.entity_ids = Some(vec!["t1".to_string(), "t2".to_string()]);
        store.append(batch.clone(), OpSource::Remote, true).unwrap();
        let entry = store.op_by_id(&batch.id).unwrap().unwrap();

        match resolve_lww(&mut store, &entry, "a").unwrap() {
            LwwOutcome::RemoteWins { rejected_local_ids } => {
                // Every competing local op goes, never a partial rejection.
                assert_eq!(rejected_local_ids.len(), 2);
                assert!(rejected_local_ids.contains(&l1.id));
                assert!(rejected_local_ids.contains(&l2.id));
            }
            other => panic!("expected remote win, got {:?}", other),
        }
    }
}
