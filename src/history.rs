//! Append-only execution history: one NDJSON record per finished task,
//! written with a line-buffered write-then-fsync so a record is either
//! fully present or entirely absent even if the process is killed mid-line.
//!
//! Grounded in the logging module's conventions for line-oriented file
//! output; the tail-scan reader and corrupt-tail recovery exist so a
//! process killed mid-write never corrupts records that came before it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ZrError;

/// Size of the trailing window the reader scans for corrupt bytes left by
/// a process killed mid-write.
const TAIL_SCAN_WINDOW: u64 = 64 * 1024;

/// One completed task's outcome, as persisted to the history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Identifier of the run this task executed in.
    pub run_id: String,
    /// Name of the task.
    pub task: String,
    /// RFC3339 timestamp the task finished at.
    pub ts: DateTime<Utc>,
    /// Outcome status.
    pub status: HistoryStatus,
    /// Wall-clock duration in nanoseconds.
    pub duration_ns: u64,
    /// Fingerprint the task ran with, if fingerprinting succeeded.
    pub fingerprint: Option<String>,
    /// Exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
}

/// Terminal status of one task execution, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// Completed successfully by running the command.
    Ok,
    /// Completed successfully by reusing a cached result.
    CacheHit,
    /// Command exited non-zero, or could not be spawned.
    Failed,
    /// Exceeded its configured timeout.
    TimedOut,
    /// Cancelled before or during execution.
    Cancelled,
}

/// Filter parameters for [`HistoryStore::query`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Only include records at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Only include records matching this status.
    pub status: Option<HistoryStatus>,
    /// Only include records for this task name.
    pub task: Option<String>,
    /// Cap on the number of records returned, most recent first.
    pub limit: Option<usize>,
}

/// Append-only store of task execution records, backed by one NDJSON file.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl HistoryStore {
    /// Open (without yet creating) a history store backed by `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, append_lock: Mutex::new(()) }
    }

    /// Append one record. Creates the file and any missing parent
    /// directories on first use.
    ///
    /// Before appending, checks whether the file's last line is a
    /// complete, valid JSON object; if not (the process was killed mid
    /// write last time), truncates the file back to the start of that
    /// incomplete line so the new record starts clean.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::HistoryIoError`] if the file cannot be opened,
    /// truncated, or written.
    pub fn append(&self, record: &HistoryRecord) -> Result<(), ZrError> {
        let _guard = self.append_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ZrError::HistoryIoError(format!("creating {}: {e}", parent.display())))?;
        }

        self.truncate_incomplete_tail()?;

        let line = serde_json::to_string(record)
            .map_err(|e| ZrError::HistoryIoError(format!("serializing record: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ZrError::HistoryIoError(format!("opening {}: {e}", self.path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| ZrError::HistoryIoError(format!("writing to {}: {e}", self.path.display())))?;
        file.sync_data()
            .map_err(|e| ZrError::HistoryIoError(format!("syncing {}: {e}", self.path.display())))?;
        Ok(())
    }

    fn truncate_incomplete_tail(&self) -> Result<(), ZrError> {
        let Ok(mut file) = File::options().read(true).write(true).open(&self.path) else {
            return Ok(());
        };
        let len = file
            .metadata()
            .map_err(|e| ZrError::HistoryIoError(format!("stat {}: {e}", self.path.display())))?
            .len();
        if len == 0 {
            return Ok(());
        }

        let mut buf = String::new();
        {
            let mut reader = BufReader::new(&file);
            if len > TAIL_SCAN_WINDOW {
                reader
                    .get_mut()
                    .seek(SeekFrom::End(-(i64::try_from(TAIL_SCAN_WINDOW).unwrap_or(i64::MAX))))
                    .map_err(|e| ZrError::HistoryIoError(format!("seeking: {e}")))?;
            } else {
                reader
                    .get_mut()
                    .seek(SeekFrom::Start(0))
                    .map_err(|e| ZrError::HistoryIoError(format!("seeking: {e}")))?;
            }
            reader
                .read_to_string(&mut buf)
                .map_err(|e| ZrError::HistoryIoError(format!("reading tail: {e}")))?;
        }

        let Some(last_line) = buf.lines().next_back() else {
            return Ok(());
        };
        if last_line.is_empty() || serde_json::from_str::<HistoryRecord>(last_line).is_ok() {
            return Ok(());
        }

        let bad_bytes = last_line.len();
        let keep = len.saturating_sub(bad_bytes as u64);
        file.set_len(keep)
            .map_err(|e| ZrError::HistoryIoError(format!("truncating {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Read matching records, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::HistoryIoError`] if the file exists but cannot
    /// be read.
    pub fn query(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, ZrError> {
        let Ok(file) = File::open(&self.path) else {
            return Ok(Vec::new());
        };
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line =
                line.map_err(|e| ZrError::HistoryIoError(format!("reading {}: {e}", self.path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<HistoryRecord>(&line) else {
                continue;
            };
            if let Some(since) = query.since {
                if record.ts < since {
                    continue;
                }
            }
            if let Some(status) = query.status {
                if record.status != status {
                    continue;
                }
            }
            if let Some(task) = &query.task {
                if &record.task != task {
                    continue;
                }
            }
            records.push(record);
        }
        records.reverse();
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Tally outcome counts across the whole history file, for `zr
    /// history --summary`-style reporting.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::HistoryIoError`] if the file exists but cannot
    /// be read.
    pub fn status_counts(&self) -> Result<HashMap<HistoryStatus, usize>, ZrError> {
        let all = self.query(&HistoryQuery::default())?;
        let mut counts = HashMap::new();
        for record in all {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn record(task: &str, status: HistoryStatus) -> HistoryRecord {
        HistoryRecord {
            run_id: "run-1".to_string(),
            task: task.to_string(),
            ts: Utc::now(),
            status,
            duration_ns: 10_000_000,
            fingerprint: Some("abc123".to_string()),
            exit_code: Some(0),
        }
    }

    #[test]
    fn append_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.ndjson"));
        store.append(&record("build", HistoryStatus::Ok)).unwrap();

        let records = store.query(&HistoryQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task, "build");
    }

    #[test]
    fn query_on_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("nope.ndjson"));
        assert!(store.query(&HistoryQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn query_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.ndjson"));
        store.append(&record("a", HistoryStatus::Ok)).unwrap();
        store.append(&record("b", HistoryStatus::Failed)).unwrap();

        let failed = store
            .query(&HistoryQuery { status: Some(HistoryStatus::Failed), ..HistoryQuery::default() })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task, "b");
    }

    #[test]
    fn query_filters_by_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.ndjson"));
        store.append(&record("a", HistoryStatus::Ok)).unwrap();
        store.append(&record("b", HistoryStatus::Ok)).unwrap();

        let only_a = store
            .query(&HistoryQuery { task: Some("a".to_string()), ..HistoryQuery::default() })
            .unwrap();
        assert_eq!(only_a.len(), 1);
    }

    #[test]
    fn query_respects_limit_and_returns_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.ndjson"));
        store.append(&record("a", HistoryStatus::Ok)).unwrap();
        store.append(&record("b", HistoryStatus::Ok)).unwrap();
        store.append(&record("c", HistoryStatus::Ok)).unwrap();

        let limited =
            store.query(&HistoryQuery { limit: Some(2), ..HistoryQuery::default() }).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].task, "c");
        assert_eq!(limited[1].task, "b");
    }

    #[test]
    fn corrupt_trailing_line_is_truncated_on_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.ndjson");
        let store = HistoryStore::new(path.clone());
        store.append(&record("a", HistoryStatus::Ok)).unwrap();

        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"task\": \"truncated-mid-wr").unwrap();
        }

        store.append(&record("b", HistoryStatus::Ok)).unwrap();
        let records = store.query(&HistoryQuery::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].task, "b");
        assert_eq!(records[1].task, "a");
    }

    #[test]
    fn status_counts_tallies_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.ndjson"));
        store.append(&record("a", HistoryStatus::Ok)).unwrap();
        store.append(&record("b", HistoryStatus::Failed)).unwrap();
        store.append(&record("c", HistoryStatus::Ok)).unwrap();

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.get(&HistoryStatus::Ok), Some(&2));
        assert_eq!(counts.get(&HistoryStatus::Failed), Some(&1));
    }
}
