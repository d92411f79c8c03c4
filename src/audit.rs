//! Append-only audit trail of step executions.
//!
//! Every step attempt of every run lands here exactly once. Records are never
//! updated or removed. Stores are shared by all concurrent runs, so appends
//! are serialized behind a mutex and each append is atomic with respect to
//! the others.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::state_machine::{RunId, StepName};

/// What the engine knows about a step attempt when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub run_id: RunId,
    pub execution_id: Uuid,
    pub step: StepName,
    pub input_summary: Value,
    pub output_summary: Value,
    pub success: bool,
    pub error_message: Option<String>,
    pub retry_count_at_time: u32,
}

/// An entry once the store has sequenced and timestamped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    pub execution_id: Uuid,
    pub step: StepName,
    pub input_summary: Value,
    pub output_summary: Value,
    pub success: bool,
    pub error_message: Option<String>,
    pub retry_count_at_time: u32,
}

impl AuditRecord {
    fn seal(entry: AuditEntry, sequence_id: u64) -> Self {
        Self {
            sequence_id,
            timestamp: Utc::now(),
            run_id: entry.run_id,
            execution_id: entry.execution_id,
            step: entry.step,
            input_summary: entry.input_summary,
            output_summary: entry.output_summary,
            success: entry.success,
            error_message: entry.error_message,
            retry_count_at_time: entry.retry_count_at_time,
        }
    }
}

pub trait AuditStore: Send + Sync {
    /// Durably append one record. The store assigns the sequence id.
    fn append(&self, entry: AuditEntry) -> Result<AuditRecord, PersistenceError>;

    /// All records of a run, in sequence order.
    fn records_for_run(&self, run_id: &RunId) -> Result<Vec<AuditRecord>, PersistenceError>;
}

struct JsonlWriter {
    file: File,
    next_seq: u64,
}

/// One JSON record per line, fsynced on every append.
pub struct JsonlAuditStore {
    path: PathBuf,
    writer: Mutex<JsonlWriter>,
}

impl JsonlAuditStore {
    /// Open (or create) the log at `path`, continuing its sequence numbering.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let next_seq = if path.exists() {
            repair_torn_tail(&path)?;
            read_records(&path)?
                .iter()
                .map(|r| r.sequence_id)
                .max()
                .map_or(1, |max| max + 1)
        } else {
            1
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(JsonlWriter { file, next_seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, entry: AuditEntry) -> Result<AuditRecord, PersistenceError> {
        let mut writer = self.writer.lock();
        let record = AuditRecord::seal(entry, writer.next_seq);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        writer.file.write_all(line.as_bytes())?;
        writer.file.flush()?;
        writer.file.sync_data()?;
        writer.next_seq += 1;
        Ok(record)
    }

    fn records_for_run(&self, run_id: &RunId) -> Result<Vec<AuditRecord>, PersistenceError> {
        // Hold the writer lock so a half-written line is never read.
        let _writer = self.writer.lock();
        let mut records: Vec<AuditRecord> = read_records(&self.path)?
            .into_iter()
            .filter(|r| &r.run_id == run_id)
            .collect();
        records.sort_by_key(|r| r.sequence_id);
        Ok(records)
    }
}

/// A crash mid-append can leave the last line without its newline. Drop that
/// line if it does not parse; terminate it if it does. Anything else that
/// fails to parse is still reported as corruption by `read_records`.
fn repair_torn_tail(path: &Path) -> Result<(), PersistenceError> {
    let bytes = fs::read(path)?;
    if bytes.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }

    let start = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    let tail = &bytes[start..];
    let file = OpenOptions::new().append(true).open(path)?;
    if serde_json::from_slice::<AuditRecord>(tail).is_ok() {
        (&file).write_all(b"\n")?;
    } else {
        warn!(
            path = %path.display(),
            bytes = tail.len(),
            "dropping unterminated last audit line"
        );
        file.set_len(start as u64)?;
    }
    file.sync_data()?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<AuditRecord>, PersistenceError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|_| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            line: i + 1,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Process-local store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, entry: AuditEntry) -> Result<AuditRecord, PersistenceError> {
        let mut records = self.records.lock();
        let record = AuditRecord::seal(entry, records.len() as u64 + 1);
        records.push(record.clone());
        Ok(record)
    }

    fn records_for_run(&self, run_id: &RunId) -> Result<Vec<AuditRecord>, PersistenceError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| &r.run_id == run_id)
            .cloned()
            .collect())
    }
}
