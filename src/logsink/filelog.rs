//! File-based check log: one JSONL file per calendar day.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum FileLogError {
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single check log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLogEntry {
    pub timestamp: DateTime<Utc>,
    pub target_id: u32,
    pub target_name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub address: String,
    pub status: String,
    pub response_time: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

/// Producer handle for the file log sink.
#[derive(Clone)]
pub struct FileSink {
    tx: mpsc::Sender<CheckLogEntry>,
    dropped: Arc<AtomicU64>,
}

impl FileSink {
    /// Spawn the consumer task and return the producer handle.
    pub fn spawn(log_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let log_dir = log_dir.into();
        let (tx, rx) = mpsc::channel(capacity);

        tokio::spawn(run_writer(rx, log_dir));

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking enqueue; a full queue drops the entry.
    pub fn log(&self, entry: CheckLogEntry) {
        if let Err(mpsc::error::TrySendError::Full(entry)) = self.tx.try_send(entry) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                target_id = entry.target_id,
                dropped,
                "file log queue full, dropping entry"
            );
        }
    }

    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_writer(mut rx: mpsc::Receiver<CheckLogEntry>, log_dir: PathBuf) {
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        tracing::error!(dir = %log_dir.display(), error = %e, "failed to create log directory");
    }

    while let Some(entry) = rx.recv().await {
        if let Err(e) = write_check_log(&log_dir, &entry) {
            tracing::error!(target_id = entry.target_id, error = %e, "failed to write check log");
        }
    }
    tracing::debug!("file log writer exiting");
}

/// Append one entry to today's `check-YYYY-MM-DD.jsonl`.
pub fn write_check_log(log_dir: &Path, entry: &CheckLogEntry) -> Result<(), FileLogError> {
    let date = Local::now().format("%Y-%m-%d");
    let path = log_dir.join(format!("check-{}.jsonl", date));

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

/// Filters for reading back check logs.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub target_id: Option<u32>,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Default)]
pub struct LogQueryResult {
    pub total: usize,
    pub logs: Vec<CheckLogEntry>,
}

/// Scan daily log files for entries matching the query, newest first.
pub fn query_check_logs(log_dir: &Path, query: &LogQuery) -> Result<LogQueryResult, FileLogError> {
    let end = query.end_time.unwrap_or_else(Utc::now);
    let start = query.start_time.unwrap_or(end - Duration::days(7));

    // File names follow the writer's local-time rotation.
    let mut matched = Vec::new();
    let mut day = start.with_timezone(&Local).date_naive();
    let last = end.with_timezone(&Local).date_naive();
    loop {
        let path = log_dir.join(format!("check-{}.jsonl", day.format("%Y-%m-%d")));
        if path.exists() {
            for entry in read_log_file(&path)? {
                if matches_query(&entry, query) {
                    matched.push(entry);
                }
            }
        }
        if day >= last {
            break;
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let total = matched.len();
    let limit = if query.limit == 0 { 100 } else { query.limit };
    let logs = matched
        .into_iter()
        .skip(query.offset)
        .take(limit)
        .collect();

    Ok(LogQueryResult { total, logs })
}

fn read_log_file(path: &Path) -> Result<Vec<CheckLogEntry>, FileLogError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // Skip lines that fail to decode rather than aborting the scan.
        if let Ok(entry) = serde_json::from_str::<CheckLogEntry>(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn matches_query(entry: &CheckLogEntry, query: &LogQuery) -> bool {
    if let Some(target_id) = query.target_id {
        if entry.target_id != target_id {
            return false;
        }
    }
    if let Some(status) = &query.status {
        if &entry.status != status {
            return false;
        }
    }
    if let Some(start) = query.start_time {
        if entry.timestamp < start {
            return false;
        }
    }
    if let Some(end) = query.end_time {
        if entry.timestamp > end {
            return false;
        }
    }
    true
}
