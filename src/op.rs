//! Operation model and the persisted encoding.
//!
//! Operations persist in a compact short-key JSON layout; older databases
//! hold the original long-key layout. Both decode through [`StoredOp`] into
//! the single canonical [`Operation`] at the read boundary, so nothing past
//! that point branches on format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::VectorClock;

/// Entity type used by whole-state operations.
pub const FULL_STATE_ENTITY: &str = "ALL";
/// Entity id used by singleton entities (e.g. global settings).
pub const SINGLETON_ENTITY_ID: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Create,
    Update,
    Delete,
    Move,
    Batch,
    SyncImport,
    BackupImport,
    Repair,
}

impl OpType {
    /// Whole-state ops replace the entire application state and make every
    /// earlier-sorting op stale.
    pub fn is_full_state(self) -> bool {
        matches!(self, OpType::SyncImport | OpType::BackupImport | OpType::Repair)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    Local,
    Remote,
}

/// Lifecycle of a remote entry between arrival and confirmed application.
/// Transitions only move forward: pending -> applied | failed,
/// failed -> applied on a successful retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Applied,
    Failed,
}

/// An immutable fact about a state change, as authored by one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// UUIDv7: lexicographic order is creation-time order.
    pub id: String,
    /// Audit label only, never consulted by sync logic.
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Batch ops reference several entities at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<Vec<String>>,
    /// Opaque to this crate except for entity routing.
    pub payload: Value,
    pub client_id: String,
    /// Clock value *after* the author incremented its own counter.
    pub vector_clock: VectorClock,
    /// Wall-clock ms. LWW tie-breaks only, never causal order.
    pub timestamp: u64,
    pub schema_version: u32,
}

impl Operation {
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    pub fn is_full_state(&self) -> bool {
        self.op_type.is_full_state()
    }

    /// `"entityType:entityId"` keys this op touches. Batch ops yield one key
    /// per referenced entity; whole-state ops yield the ALL key.
    pub fn entity_keys(&self) -> Vec<String> {
        if let Some(ids) = &self.entity_ids {
            return ids
                .iter()
                .map(|id| format!("{}:{}", self.entity_type, id))
                .collect();
        }
        match &self.entity_id {
            Some(id) => vec![format!("{}:{}", self.entity_type, id)],
            None => Vec::new(),
        }
    }
}

/// Compact persisted layout. Field keys are single letters to keep the log
/// small; the canonical form is always [`Operation`].
#[derive(Debug, Serialize, Deserialize)]
struct CompactOperation {
    #[serde(rename = "i")]
    id: String,
    #[serde(rename = "a")]
    action_type: String,
    #[serde(rename = "o")]
    op_type: OpType,
    #[serde(rename = "t")]
    entity_type: String,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<String>,
    #[serde(rename = "es", default, skip_serializing_if = "Option::is_none")]
    entity_ids: Option<Vec<String>>,
    #[serde(rename = "p")]
    payload: Value,
    #[serde(rename = "c")]
    client_id: String,
    #[serde(rename = "v")]
    vector_clock: VectorClock,
    #[serde(rename = "ts")]
    timestamp: u64,
    #[serde(rename = "s")]
    schema_version: u32,
}

/// Tagged union over the two on-disk layouts. Decoded exactly once when an
/// entry is read back; encode always writes the compact form.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredOp {
    Compact(CompactOperation),
    Legacy(Operation),
}

pub fn encode_op(op: &Operation) -> crate::error::Result<String> {
    let compact = CompactOperation {
        id: op.id.clone(),
        action_type: op.action_type.clone(),
        op_type: op.op_type,
        entity_type: op.entity_type.clone(),
        entity_id: op.entity_id.clone(),
        entity_ids: op.entity_ids.clone(),
        payload: op.payload.clone(),
        client_id: op.client_id.clone(),
        vector_clock: op.vector_clock.clone(),
        timestamp: op.timestamp,
        schema_version: op.schema_version,
    };
    Ok(serde_json::to_string(&compact)?)
}

pub fn decode_op(raw: &str) -> crate::error::Result<Operation> {
    match serde_json::from_str::<StoredOp>(raw)? {
        StoredOp::Compact(c) => Ok(Operation {
            id: c.id,
            action_type: c.action_type,
            op_type: c.op_type,
            entity_type: c.entity_type,
            entity_id: c.entity_id,
            entity_ids: c.entity_ids,
            payload: c.payload,
            client_id: c.client_id,
            vector_clock: c.vector_clock,
            timestamp: c.timestamp,
            schema_version: c.schema_version,
        }),
        StoredOp::Legacy(op) => Ok(op),
    }
}

/// An [`Operation`] plus local bookkeeping. The sequence number is a gapless
/// local arrival order, never a causal order.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationLogEntry {
    pub seq: u64,
    pub op: Operation,
    pub applied_at: u64,
    pub source: OpSource,
    pub synced_at: Option<u64>,
    /// Permanent. Rejected entries are retained for audit and excluded from
    /// every future upload.
    pub rejected_at: Option<u64>,
    /// Remote entries only.
    pub application_status: Option<ApplicationStatus>,
    pub retry_count: u32,
}

impl OperationLogEntry {
    pub fn is_unsynced_local(&self) -> bool {
        self.source == OpSource::Local && self.synced_at.is_none() && self.rejected_at.is_none()
    }
}
