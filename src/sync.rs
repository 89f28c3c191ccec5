//! The logical sync exchange: uploading unsynced local ops, downloading
//! others', and the gap/duplicate handling around both.
//!
//! Remote sequence numbers are arrival order at the remote, never dependency
//! order. The only contract here is "store every operation exactly once, in
//! arrival order, with correct causal metadata"; dependency-aware application
//! belongs to the applier.

use tracing::{debug, info, warn};

use crate::clock::ClockOrdering;
use crate::conflict::{check_remote_op, resolve_lww, ConflictCheck};
use crate::error::Result;
use crate::op::{OpSource, OpType, Operation, FULL_STATE_ENTITY};
use crate::storage::{now_millis, Storage};
use crate::store::OpLogStore;

/// Bound on the download pagination loop, so a misbehaving remote cannot
/// spin a client forever.
pub const MAX_DOWNLOAD_ITERATIONS: usize = 50;
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// Concurrent with the remote's latest op for the entity; the client
    /// resolves after downloading.
    ConflictConcurrent,
    /// Causally behind the remote's history; drop, never retry.
    ConflictStale,
    /// Already stored remotely; treat as synced.
    DuplicateOperation,
    /// Transient remote failure; the op stays unsynced for the next run.
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpUploadStatus {
    Accepted { server_seq: u64 },
    Rejected { code: RejectCode },
}

#[derive(Debug, Clone)]
pub struct OpUploadResult {
    pub op_id: String,
    pub status: OpUploadStatus,
}

#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub results: Vec<OpUploadResult>,
    /// Ops from other clients that became available since the client's last
    /// known sequence, piggybacked to save a download round trip.
    pub new_ops: Vec<Operation>,
    pub latest_seq: u64,
}

/// A downloaded op together with the remote sequence it was assigned.
#[derive(Debug, Clone)]
pub struct RemoteOp {
    pub server_seq: u64,
    pub op: Operation,
}

#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub ops: Vec<RemoteOp>,
    pub has_more: bool,
    pub latest_seq: u64,
    /// The client's sync position is invalid relative to remote history;
    /// the only safe continuation is a full resync from sequence zero.
    pub gap_detected: bool,
}

/// The logical remote contract. Transport, auth, and wire format live
/// elsewhere.
pub trait RemoteEndpoint {
    fn upload(
        &mut self,
        ops: &[Operation],
        client_id: &str,
        last_known_server_seq: u64,
    ) -> Result<UploadResponse>;

    fn download(
        &mut self,
        since_seq: u64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<DownloadResponse>;
}

/// In-memory reference remote. Assigns arrival-order sequences, dedupes by
/// op id, and runs entity-scoped causality checks on upload.
pub struct MemoryRemote {
    ops: Vec<RemoteOp>,
    next_seq: u64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self { ops: Vec::new(), next_seq: 1 }
    }

    pub fn latest_seq(&self) -> u64 {
        self.ops.last().map(|o| o.server_seq).unwrap_or(0)
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Wipes all history, as a migrated or rebuilt server would.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.next_seq = 1;
    }

    /// Drops ops up to and including `seq`, simulating server-side pruning.
    pub fn purge_through(&mut self, seq: u64) {
        self.ops.retain(|o| o.server_seq > seq);
    }

    fn min_seq(&self) -> u64 {
        self.ops.first().map(|o| o.server_seq).unwrap_or(0)
    }

    /// Latest stored op sharing an entity key with `op`, if any.
    fn latest_for_entity(&self, op: &Operation) -> Option<&RemoteOp> {
        let keys = op.entity_keys();
        self.ops
            .iter()
            .rev()
            .find(|stored| stored.op.entity_keys().iter().any(|k| keys.contains(k)))
    }

    fn check_upload(&self, op: &Operation) -> Option<RejectCode> {
        if self.ops.iter().any(|stored| stored.op.id == op.id) {
            return Some(RejectCode::DuplicateOperation);
        }
        // Full-state ops and ops without an entity id skip conflict checks.
        if op.is_full_state() || op.entity_type == FULL_STATE_ENTITY {
            return None;
        }
        let latest = match self.latest_for_entity(op) {
            Some(latest) => latest,
            None => return None,
        };
        match op.vector_clock.compare(&latest.op.vector_clock) {
            ClockOrdering::GreaterThan => None,
            // Same clock from the same client is an upload retry.
            ClockOrdering::Equal if op.client_id == latest.op.client_id => None,
            ClockOrdering::Equal | ClockOrdering::LessThan => Some(RejectCode::ConflictStale),
            ClockOrdering::Concurrent => Some(RejectCode::ConflictConcurrent),
        }
    }
}

impl RemoteEndpoint for MemoryRemote {
    fn upload(
        &mut self,
        ops: &[Operation],
        client_id: &str,
        last_known_server_seq: u64,
    ) -> Result<UploadResponse> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match self.check_upload(op) {
                Some(code) => results.push(OpUploadResult {
                    op_id: op.id.clone(),
                    status: OpUploadStatus::Rejected { code },
                }),
                None => {
                    let server_seq = self.next_seq;
                    self.next_seq += 1;
                    self.ops.push(RemoteOp { server_seq, op: op.clone() });
                    results.push(OpUploadResult {
                        op_id: op.id.clone(),
                        status: OpUploadStatus::Accepted { server_seq },
                    });
                }
            }
        }

        let new_ops = self
            .ops
            .iter()
            .filter(|stored| {
                stored.server_seq > last_known_server_seq && stored.op.client_id != client_id
            })
            .map(|stored| stored.op.clone())
            .collect();

        Ok(UploadResponse { results, new_ops, latest_seq: self.latest_seq() })
    }

    fn download(
        &mut self,
        since_seq: u64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<DownloadResponse> {
        let latest_seq = self.latest_seq();

        // Client has history but the remote reports none: the remote was
        // reset or migrated underneath the client.
        let reset_gap = since_seq > 0 && latest_seq == 0;
        // Client remembers a sequence the remote never reached.
        let ahead_gap = latest_seq > 0 && since_seq > latest_seq;
        // The requested range was pruned away.
        let purged_gap = latest_seq > 0 && since_seq + 1 < self.min_seq();

        if reset_gap || ahead_gap || purged_gap {
            warn!(since_seq, latest_seq, "download gap detected");
            return Ok(DownloadResponse {
                ops: Vec::new(),
                has_more: false,
                latest_seq,
                gap_detected: true,
            });
        }

        let matching: Vec<RemoteOp> = self
            .ops
            .iter()
            .filter(|stored| {
                stored.server_seq > since_seq
                    && exclude_client.map_or(true, |c| stored.op.client_id != c)
            })
            .cloned()
            .collect();

        let has_more = matching.len() > limit;
        let ops = matching.into_iter().take(limit).collect();
        Ok(DownloadResponse { ops, has_more, latest_seq, gap_detected: false })
    }
}

/// Counters describing one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub uploaded: usize,
    pub upload_rejected: usize,
    pub downloaded: usize,
    pub conflicts_resolved: usize,
    pub stale_discarded: usize,
    /// The remote lost its history; the caller must upload a full-state op
    /// (see [`SyncClient::upload_full_state`]).
    pub needs_full_state_upload: bool,
}

/// Drives one store against one remote. Owns the remembered remote sequence;
/// persisting it between process runs is the caller's concern.
pub struct SyncClient {
    pub client_id: String,
    pub last_server_seq: u64,
}

impl SyncClient {
    pub fn new(client_id: &str) -> Self {
        Self { client_id: client_id.to_string(), last_server_seq: 0 }
    }

    /// One full exchange: upload unsynced local ops, then download and store
    /// everything new, resolving concurrent edits as they land.
    pub fn sync<S: Storage, R: RemoteEndpoint>(
        &mut self,
        store: &mut OpLogStore<S>,
        remote: &mut R,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        let mut incoming: Vec<Operation> = Vec::new();

        let unsynced = store.unsynced()?;
        if !unsynced.is_empty() {
            let ops: Vec<Operation> = unsynced.iter().map(|e| e.op.clone()).collect();
            let response = remote.upload(&ops, &self.client_id, self.last_server_seq)?;

            let mut accepted_seqs = Vec::new();
            for result in &response.results {
                let entry = unsynced.iter().find(|e| e.op.id == result.op_id);
                let seq = match entry {
                    Some(e) => e.seq,
                    None => continue,
                };
                match &result.status {
                    OpUploadStatus::Accepted { .. } => {
                        accepted_seqs.push(seq);
                        outcome.uploaded += 1;
                    }
                    OpUploadStatus::Rejected { code } => match code {
                        // Already on the remote: synced as far as we care.
                        RejectCode::DuplicateOperation => accepted_seqs.push(seq),
                        RejectCode::ConflictStale => {
                            store.mark_rejected(&[result.op_id.clone()])?;
                            outcome.upload_rejected += 1;
                        }
                        // The winning remote op arrives in the download
                        // phase; LWW settles it there.
                        RejectCode::ConflictConcurrent => outcome.upload_rejected += 1,
                        // Stays unsynced; next run retries.
                        RejectCode::InternalError => {}
                    },
                }
            }
            store.mark_synced(&accepted_seqs)?;
            incoming.extend(response.new_ops);
        }

        // Piggybacked ops first, then the paged download.
        let mut since_seq = self.last_server_seq;
        let mut reset_for_gap = false;
        let mut iterations = 0;
        loop {
            if iterations >= MAX_DOWNLOAD_ITERATIONS {
                warn!(iterations, "download loop hit the iteration bound");
                break;
            }
            iterations += 1;

            let response =
                remote.download(since_seq, Some(&self.client_id), DEFAULT_DOWNLOAD_LIMIT)?;

            if response.gap_detected {
                if reset_for_gap {
                    // A gap at sequence zero against a non-empty remote
                    // should be impossible; stop rather than loop.
                    warn!("gap persisted after reset, aborting download");
                    break;
                }
                reset_for_gap = true;
                incoming.clear();
                since_seq = 0;
                if response.latest_seq == 0 {
                    // Remote was reset while we hold history: everything we
                    // have must go back up as one full-state import.
                    info!("remote has no history, full state upload required");
                    outcome.needs_full_state_upload = store.last_seq()? > 0;
                    self.last_server_seq = 0;
                    break;
                }
                continue;
            }

            let page_end = response.ops.last().map(|o| o.server_seq);
            incoming.extend(response.ops.into_iter().map(|o| o.op));
            if response.has_more {
                // Unwrap-free: has_more implies a non-empty page.
                since_seq = page_end.unwrap_or(response.latest_seq);
                debug!(since_seq, "downloading next page");
                continue;
            }
            self.last_server_seq = response.latest_seq;
            break;
        }

        self.store_incoming(store, incoming, &mut outcome)?;
        Ok(outcome)
    }

    fn store_incoming<S: Storage>(
        &self,
        store: &mut OpLogStore<S>,
        incoming: Vec<Operation>,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let mut fresh = store.filter_new_ops(incoming)?;
        // Piggyback and download can deliver the same op in one run.
        let mut seen = std::collections::HashSet::new();
        fresh.retain(|op| seen.insert(op.id.clone()));
        if fresh.is_empty() {
            return Ok(());
        }

        // Anything sorting before the newest whole-state op is history that
        // op already superseded.
        let full_state_floor = store.latest_full_state_op()?.map(|e| e.op.id);

        let mut applied_clocks: Vec<Operation> = Vec::new();
        for op in fresh {
            if let Some(floor) = &full_state_floor {
                if !op.is_full_state() && op.id < *floor {
                    outcome.stale_discarded += 1;
                    continue;
                }
            }

            match check_remote_op(store, &op)? {
                ConflictCheck::RemoteStale => {
                    outcome.stale_discarded += 1;
                    continue;
                }
                ConflictCheck::NoConflict => {
                    store.append(op.clone(), OpSource::Remote, true)?;
                    applied_clocks.push(op);
                    outcome.downloaded += 1;
                }
                ConflictCheck::Concurrent { .. } => {
                    let seq = store.append(op.clone(), OpSource::Remote, true)?;
                    outcome.downloaded += 1;
                    let entry = match store.op_by_id(&op.id)? {
                        Some(entry) => entry,
                        None => {
                            return Err(crate::error::Error::InvalidState(format!(
                                "op {} vanished after append at seq {}",
                                op.id, seq
                            )))
                        }
                    };
                    resolve_lww(store, &entry, &self.client_id)?;
                    outcome.conflicts_resolved += 1;
                    applied_clocks.push(op);
                }
            }
        }

        // Later local ops must causally dominate everything incorporated.
        if !applied_clocks.is_empty() {
            store.merge_remote_op_clocks(&applied_clocks)?;
        }
        Ok(())
    }

    /// Replaces the remote's (empty) history with one SyncImport carrying the
    /// full local state. Used after a remote reset was detected.
    pub fn upload_full_state<S: Storage, R: RemoteEndpoint>(
        &mut self,
        store: &mut OpLogStore<S>,
        remote: &mut R,
        state: serde_json::Value,
        schema_version: u32,
    ) -> Result<()> {
        let clock = store.vector_clock()?.increment(&self.client_id);
        let op = Operation {
            id: Operation::new_id(),
            action_type: "syncImport".to_string(),
            op_type: OpType::SyncImport,
            entity_type: FULL_STATE_ENTITY.to_string(),
            entity_id: Some(FULL_STATE_ENTITY.to_string()),
            entity_ids: None,
            payload: state,
            client_id: self.client_id.clone(),
            vector_clock: clock,
            timestamp: now_millis(),
            schema_version,
        };
        let seq = store.append_with_clock_update(op.clone(), OpSource::Local)?;

        let response = remote.upload(&[op], &self.client_id, self.last_server_seq)?;
        if let Some(OpUploadResult { status: OpUploadStatus::Accepted { .. }, .. }) =
            response.results.first()
        {
            store.mark_synced(&[seq])?;
            self.last_server_seq = response.latest_seq;
        }
        Ok(())
    }
}
