//! Arbor persistence: a small SQLite journal of lifecycle operations.
//! One row per operation, updated in place as the operation advances.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How far an operation got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Started,
    TreeDeployed,
    EngineRegistered,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Started => "started",
            Stage::TreeDeployed => "tree-deployed",
            Stage::EngineRegistered => "engine-registered",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Stage {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Stage::Started),
            "tree-deployed" => Ok(Stage::TreeDeployed),
            "engine-registered" => Ok(Stage::EngineRegistered),
            "failed" => Ok(Stage::Failed),
            other => Err(anyhow!("unknown journal stage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op_id: [u8; 16],
    pub cluster: String,
    /// `create` or `update`.
    pub kind: String,
    pub stage: Stage,
    /// Milliseconds since epoch of the last stage change.
    pub ts: i64,
    /// Error text for failed operations.
    pub detail: Option<String>,
    /// Descriptor YAML, zstd-compressed when the feature is on.
    pub descriptor: Vec<u8>,
}

impl JournalEntry {
    pub fn descriptor_yaml(&self) -> String { maybe_decompress(&self.descriptor) }
}

pub trait Journal: Send + Sync {
    /// Insert or advance the operation identified by `entry.op_id`.
    fn record(&self, entry: JournalEntry) -> Result<()>;
    fn latest(&self, cluster: &str) -> Result<Option<JournalEntry>>;
    /// Newest first.
    fn history(&self, cluster: &str, limit: usize) -> Result<Vec<JournalEntry>>;
}

pub struct SqliteJournal {
    db: std::sync::Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteJournal {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("ARBOR_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS operations (
                op_id      BLOB PRIMARY KEY,
                cluster    TEXT NOT NULL,
                kind       TEXT NOT NULL,
                stage      TEXT NOT NULL,
                ts         INTEGER NOT NULL,
                detail     TEXT,
                descriptor BLOB NOT NULL
            )",
            [],
        )
        .context("creating operations table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_operations_cluster_ts ON operations(cluster, ts DESC)", []).ok();
        let keep = std::env::var("ARBOR_JOURNAL_KEEP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(16).max(1);
        histogram!("journal_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: std::sync::Mutex::new(db), keep })
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("journal connection poisoned"))
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<JournalEntry> {
    let op: Vec<u8> = row.get(0)?;
    let op_id: [u8; 16] = op.as_slice().try_into().map_err(|_| anyhow!("journal op_id has {} bytes", op.len()))?;
    let stage: String = row.get(3)?;
    Ok(JournalEntry {
        op_id,
        cluster: row.get(1)?,
        kind: row.get(2)?,
        stage: stage.parse()?,
        ts: row.get(4)?,
        detail: row.get(5)?,
        descriptor: row.get(6)?,
    })
}

const SELECT_COLUMNS: &str = "SELECT op_id, cluster, kind, stage, ts, detail, descriptor FROM operations";

impl Journal for SqliteJournal {
    fn record(&self, entry: JournalEntry) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO operations(op_id, cluster, kind, stage, ts, detail, descriptor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(op_id) DO UPDATE SET
                stage = excluded.stage, ts = excluded.ts, detail = excluded.detail, descriptor = excluded.descriptor",
            (
                &entry.op_id[..],
                &entry.cluster,
                &entry.kind,
                entry.stage.as_str(),
                entry.ts,
                &entry.detail,
                &entry.descriptor,
            ),
        )?;
        // Keep the latest `keep` operations per cluster.
        let pruned = tx.execute(
            "DELETE FROM operations
             WHERE cluster = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM operations WHERE cluster = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&entry.cluster, self.keep as i64),
        )?;
        tx.commit()?;
        if pruned > 0 {
            debug!(cluster = %entry.cluster, pruned, "journal: rotated old operations");
        }
        histogram!("journal_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("journal_put_total", 1u64);
        Ok(())
    }

    fn latest(&self, cluster: &str) -> Result<Option<JournalEntry>> {
        Ok(self.history(cluster, 1)?.into_iter().next())
    }

    fn history(&self, cluster: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!("{} WHERE cluster = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2", SELECT_COLUMNS))?;
        let mut rows = stmt.query((cluster, limit as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_entry(row)?);
        }
        histogram!("journal_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".arbor");
        let _ = std::fs::create_dir_all(&p);
        p.push("arbor.db");
        return p.to_string_lossy().to_string();
    }
    "arbor.db".to_string()
}

pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

pub fn maybe_compress(yaml: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("ARBOR_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(yaml.as_bytes(), lvl).unwrap_or_else(|_| yaml.as_bytes().to_vec());
    }
    #[allow(unreachable_code)]
    yaml.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(op: u8, cluster: &str, stage: Stage, ts: i64) -> JournalEntry {
        JournalEntry {
            op_id: [op; 16],
            cluster: cluster.into(),
            kind: "create".into(),
            stage,
            ts,
            detail: None,
            descriptor: maybe_compress(&format!("name: {}\n", cluster)),
        }
    }

    fn open_temp(dir: &tempfile::TempDir) -> SqliteJournal {
        SqliteJournal::open(&dir.path().join("arbor.db").to_string_lossy()).unwrap()
    }

    #[test]
    fn record_advances_an_operation_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_temp(&dir);
        j.record(entry(1, "prod", Stage::Started, 10)).unwrap();
        j.record(entry(1, "prod", Stage::TreeDeployed, 11)).unwrap();
        let latest = j.latest("prod").unwrap().unwrap();
        assert_eq!(latest.stage, Stage::TreeDeployed);
        assert_eq!(latest.descriptor_yaml(), "name: prod\n");
        assert_eq!(j.history("prod", 10).unwrap().len(), 1);
        assert!(j.latest("staging").unwrap().is_none());
    }

    #[test]
    fn history_rotates_per_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_temp(&dir).with_keep(3);
        for i in 0..5u8 {
            j.record(entry(i, "prod", Stage::EngineRegistered, i as i64)).unwrap();
        }
        j.record(entry(99, "dev", Stage::Failed, 0)).unwrap();
        let rows = j.history("prod", 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].op_id, [4u8; 16]);
        assert_eq!(rows[2].op_id, [2u8; 16]);
        assert_eq!(j.history("dev", 10).unwrap().len(), 1);
    }

    #[test]
    fn stage_text_round_trips() {
        for s in [Stage::Started, Stage::TreeDeployed, Stage::EngineRegistered, Stage::Failed] {
            assert_eq!(s.as_str().parse::<Stage>().unwrap(), s);
        }
        assert!("done".parse::<Stage>().is_err());
    }
}
