//! Startup recovery: undo interrupted snapshot migrations, work out what to
//! replay on top of the snapshot, and queue remote entries whose application
//! was never confirmed.

use tracing::{info, warn};

use crate::error::Result;
use crate::op::{OpSource, OperationLogEntry};
use crate::storage::{StateSnapshot, Storage};
use crate::store::{OpLogStore, MAX_CONFLICT_RETRY_ATTEMPTS};

/// Everything the applier needs to rebuild in-memory state after a restart.
/// This crate performs the bookkeeping; applying payloads is the caller's
/// job and is idempotent thanks to the op-id dedupe in the store.
#[derive(Debug)]
pub struct RecoveryReport {
    /// An interrupted snapshot migration was rolled back from the backup
    /// slot before anything else ran.
    pub restored_backup: bool,
    pub snapshot: Option<StateSnapshot>,
    /// When set, load this whole-state op directly instead of replaying the
    /// log before it.
    pub full_state: Option<OperationLogEntry>,
    /// Tail entries to replay in sequence order, after the snapshot (or the
    /// full-state op when one is surfaced).
    pub replay: Vec<OperationLogEntry>,
    /// Remote entries whose application was never confirmed.
    pub pending_remote: Vec<OperationLogEntry>,
    /// Remote entries still under the retry bound; ones at the bound were
    /// permanently rejected during recovery.
    pub failed_remote: Vec<OperationLogEntry>,
}

pub fn recover<S: Storage>(store: &mut OpLogStore<S>) -> Result<RecoveryReport> {
    let restored_backup = store.has_state_cache_backup()?;
    if restored_backup {
        warn!("interrupted snapshot migration detected, restoring backup");
        store.restore_state_cache_from_backup()?;
    }

    let snapshot = store.load_state_cache()?;

    // Databases from before the clock row existed: seed it with the full
    // derivation (snapshot clock merged with every tail op clock, local ops
    // included), or a later local op could reuse one of its own counters.
    if store.vector_clock_entry()?.is_none() {
        let derived = store.current_vector_clock()?;
        if !derived.is_empty() {
            store.set_vector_clock(derived)?;
        }
    }

    let snapshot_seq = snapshot.as_ref().map(|s| s.last_applied_op_seq).unwrap_or(0);

    let full_state = store
        .latest_full_state_op()?
        .filter(|entry| entry.seq > snapshot_seq);

    let replay_from = full_state.as_ref().map(|e| e.seq).unwrap_or(snapshot_seq);
    let replay: Vec<OperationLogEntry> = store
        .ops_after_seq(replay_from)?
        .into_iter()
        .filter(|e| e.rejected_at.is_none())
        .collect();

    // Everything incorporated at startup must be causally covered by the
    // stored clock, or the next local op would not dominate it.
    let remote_ops: Vec<_> = replay
        .iter()
        .chain(full_state.iter())
        .filter(|e| e.source == OpSource::Remote)
        .map(|e| e.op.clone())
        .collect();
    if !remote_ops.is_empty() {
        store.merge_remote_op_clocks(&remote_ops)?;
    }

    let pending_remote = store.pending_remote_ops()?;

    let mut failed_remote = Vec::new();
    for entry in store.failed_remote_ops()? {
        if entry.retry_count >= MAX_CONFLICT_RETRY_ATTEMPTS {
            store.mark_failed(&entry.op.id, MAX_CONFLICT_RETRY_ATTEMPTS)?;
        } else {
            failed_remote.push(entry);
        }
    }

    info!(
        restored_backup,
        replay = replay.len(),
        pending = pending_remote.len(),
        failed = failed_remote.len(),
        "recovery plan assembled"
    );

    Ok(RecoveryReport {
        restored_backup,
        snapshot,
        full_state,
        replay,
        pending_remote,
        failed_remote,
    })
}
