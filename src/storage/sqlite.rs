use rusqlite::{params, Connection, OptionalExtension};

use super::{EntryRecord, SnapshotSlot, StateSnapshot, Storage};
use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::op::{decode_op, encode_op, ApplicationStatus, OpSource, OperationLogEntry};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS op_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    op_id TEXT NOT NULL UNIQUE,
    op TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    source TEXT NOT NULL,
    synced_at INTEGER,
    rejected_at INTEGER,
    application_status TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_op_log_source_status
    ON op_log(source, application_status);

CREATE TABLE IF NOT EXISTS snapshots (
    slot TEXT PRIMARY KEY,
    data TEXT,
    ops_since_compaction INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS vector_clock (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    clock TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS import_backup (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    data TEXT NOT NULL
);

PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

pub struct SqliteStorage {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(INIT_SQL)?;
        Ok(Self { conn, in_transaction: false })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

fn source_str(source: OpSource) -> &'static str {
    match source {
        OpSource::Local => "local",
        OpSource::Remote => "remote",
    }
}

fn parse_source(s: &str) -> Result<OpSource> {
    match s {
        "local" => Ok(OpSource::Local),
        "remote" => Ok(OpSource::Remote),
        other => Err(Error::InvalidState(format!("unknown source '{}'", other))),
    }
}

fn status_str(status: ApplicationStatus) -> &'static str {
    match status {
        ApplicationStatus::Pending => "pending",
        ApplicationStatus::Applied => "applied",
        ApplicationStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> Result<ApplicationStatus> {
    match s {
        "pending" => Ok(ApplicationStatus::Pending),
        "applied" => Ok(ApplicationStatus::Applied),
        "failed" => Ok(ApplicationStatus::Failed),
        other => Err(Error::InvalidState(format!("unknown status '{}'", other))),
    }
}

type RawRow = (u64, String, u64, String, Option<u64>, Option<u64>, Option<String>, u32);

const ENTRY_COLS: &str =
    "seq, op, applied_at, source, synced_at, rejected_at, application_status, retry_count";

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn entry_from_raw(raw: RawRow) -> Result<OperationLogEntry> {
    let (seq, op_raw, applied_at, source, synced_at, rejected_at, status, retry_count) = raw;
    Ok(OperationLogEntry {
        seq,
        op: decode_op(&op_raw)?,
        applied_at,
        source: parse_source(&source)?,
        synced_at,
        rejected_at,
        application_status: status.as_deref().map(parse_status).transpose()?,
        retry_count,
    })
}

impl Storage for SqliteStorage {
    fn append_entry(&mut self, rec: EntryRecord) -> Result<u64> {
        let encoded = encode_op(&rec.op)?;
        self.conn.execute(
            "INSERT INTO op_log (op_id, op, applied_at, source, synced_at, application_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.op.id,
                encoded,
                rec.applied_at,
                source_str(rec.source),
                rec.synced_at,
                rec.application_status.map(status_str),
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    fn entry_by_op_id(&self, op_id: &str) -> Result<Option<OperationLogEntry>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM op_log WHERE op_id = ?1", ENTRY_COLS),
                params![op_id],
                raw_row,
            )
            .optional()?;
        raw.map(entry_from_raw).transpose()
    }

    fn entries_after(&self, seq: u64) -> Result<Vec<OperationLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM op_log WHERE seq > ?1 ORDER BY seq",
            ENTRY_COLS
        ))?;
        let raws = stmt
            .query_map(params![seq], raw_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(entry_from_raw).collect()
    }

    fn entries_by_source_status(
        &self,
        source: OpSource,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<OperationLogEntry>> {
        let mut out = Vec::new();
        for status in statuses {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {} FROM op_log
                 WHERE source = ?1 AND application_status = ?2 AND rejected_at IS NULL
                 ORDER BY seq",
                ENTRY_COLS
            ))?;
            let raws = stmt
                .query_map(params![source_str(source), status_str(*status)], raw_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for raw in raws {
                out.push(entry_from_raw(raw)?);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    fn has_op(&self, op_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM op_log WHERE op_id = ?1",
                params![op_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn last_seq(&self) -> Result<u64> {
        let max: Option<u64> =
            self.conn
                .query_row("SELECT MAX(seq) FROM op_log", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    fn any_synced(&self) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM op_log WHERE synced_at IS NOT NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_synced(&mut self, seqs: &[u64], ts: u64) -> Result<usize> {
        let mut changed = 0;
        for seq in seqs {
            changed += self.conn.execute(
                "UPDATE op_log SET synced_at = ?1 WHERE seq = ?2 AND synced_at IS NULL",
                params![ts, seq],
            )?;
        }
        Ok(changed)
    }

    fn set_rejected(&mut self, op_ids: &[String], ts: u64) -> Result<usize> {
        let mut changed = 0;
        for op_id in op_ids {
            changed += self.conn.execute(
                "UPDATE op_log SET rejected_at = ?1 WHERE op_id = ?2 AND rejected_at IS NULL",
                params![ts, op_id],
            )?;
        }
        Ok(changed)
    }

    fn set_applied(&mut self, seqs: &[u64]) -> Result<usize> {
        let mut changed = 0;
        for seq in seqs {
            changed += self.conn.execute(
                "UPDATE op_log SET application_status = 'applied'
                 WHERE seq = ?1 AND application_status IN ('pending', 'failed')",
                params![seq],
            )?;
        }
        Ok(changed)
    }

    fn set_failed(&mut self, op_id: &str) -> Result<u32> {
        self.conn.execute(
            "UPDATE op_log SET application_status = 'failed', retry_count = retry_count + 1
             WHERE op_id = ?1",
            params![op_id],
        )?;
        let count: u32 = self.conn.query_row(
            "SELECT retry_count FROM op_log WHERE op_id = ?1",
            params![op_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn delete_entries(&mut self, seqs: &[u64]) -> Result<usize> {
        let mut deleted = 0;
        for seq in seqs {
            deleted += self
                .conn
                .execute("DELETE FROM op_log WHERE seq = ?1", params![seq])?;
        }
        Ok(deleted)
    }

    fn clear_entries(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM op_log", [])?;
        Ok(())
    }

    fn save_snapshot(&mut self, slot: SnapshotSlot, snapshot: &StateSnapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "INSERT INTO snapshots (slot, data) VALUES (?1, ?2)
             ON CONFLICT(slot) DO UPDATE SET data = excluded.data",
            params![slot.as_str(), data],
        )?;
        Ok(())
    }

    fn load_snapshot(&self, slot: SnapshotSlot) -> Result<Option<StateSnapshot>> {
        let data: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT data FROM snapshots WHERE slot = ?1",
                params![slot.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match data.flatten() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn has_snapshot(&self, slot: SnapshotSlot) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM snapshots WHERE slot = ?1 AND data IS NOT NULL",
                params![slot.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn delete_snapshot(&mut self, slot: SnapshotSlot) -> Result<()> {
        self.conn.execute(
            "DELETE FROM snapshots WHERE slot = ?1",
            params![slot.as_str()],
        )?;
        Ok(())
    }

    fn counter_get(&self) -> Result<u64> {
        let count: Option<u64> = self
            .conn
            .query_row(
                "SELECT ops_since_compaction FROM snapshots WHERE slot = 'current'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn counter_increment(&mut self) -> Result<u64> {
        // Upsert keeps the increment atomic and creates a stub row (no
        // snapshot data) when compaction has never run.
        self.conn.execute(
            "INSERT INTO snapshots (slot, data, ops_since_compaction)
             VALUES ('current', NULL, 1)
             ON CONFLICT(slot) DO UPDATE
             SET ops_since_compaction = ops_since_compaction + 1",
            [],
        )?;
        self.counter_get()
    }

    fn counter_reset(&mut self) -> Result<()> {
        self.conn.execute(
            "UPDATE snapshots SET ops_since_compaction = 0 WHERE slot = 'current'",
            [],
        )?;
        Ok(())
    }

    fn load_clock(&self) -> Result<Option<(VectorClock, u64)>> {
        let row: Option<(String, u64)> = self
            .conn
            .query_row(
                "SELECT clock, updated_at FROM vector_clock WHERE id = 0",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((raw, ts)) => Ok(Some((serde_json::from_str(&raw)?, ts))),
            None => Ok(None),
        }
    }

    fn save_clock(&mut self, clock: &VectorClock, ts: u64) -> Result<()> {
        let raw = serde_json::to_string(clock)?;
        self.conn.execute(
            "INSERT INTO vector_clock (id, clock, updated_at) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET clock = excluded.clock, updated_at = excluded.updated_at",
            params![raw, ts],
        )?;
        Ok(())
    }

    fn save_import_backup(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        let data = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "INSERT INTO import_backup (id, data) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![data],
        )?;
        Ok(())
    }

    fn load_import_backup(&self) -> Result<Option<StateSnapshot>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM import_backup WHERE id = 0", [], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn clear_import_backup(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM import_backup", [])?;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute("BEGIN IMMEDIATE", [])?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute("COMMIT", [])?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute("ROLLBACK", [])?;
            self.in_transaction = false;
        }
        Ok(())
    }
}
