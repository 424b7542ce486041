//! Per-user conversation history log
//!
//! Each user owns one JSON array file. Records are appended off the turn's
//! critical path by [`HistoryWriter`], a single consumer task fed through an
//! unbounded queue, so a slow disk never delays the ledger.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conversation::{Author, MessageLedger};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One finished (or failed) turn as written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub timestamp: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_worker_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_worker_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_energy: Option<f64>,
    pub username: String,
}

/// Timing and worker figures for a successful turn
#[derive(Debug, Clone, Copy)]
pub struct TurnStats {
    pub execution_time_ms: u64,
    pub initial_worker_count: usize,
    pub final_worker_count: usize,
    pub estimated_energy: f64,
}

impl HistoryRecord {
    pub fn response(username: &str, query: &str, response: &str, stats: TurnStats) -> Self {
        Self {
            timestamp: now_timestamp(),
            query: query.to_string(),
            response: Some(response.to_string()),
            error: None,
            execution_time: Some(stats.execution_time_ms),
            initial_worker_count: Some(stats.initial_worker_count),
            final_worker_count: Some(stats.final_worker_count),
            worker_delta: Some(stats.final_worker_count as i64 - stats.initial_worker_count as i64),
            estimated_energy: Some(stats.estimated_energy),
            username: username.to_string(),
        }
    }

    pub fn error(username: &str, query: &str, error: &str) -> Self {
        Self {
            timestamp: now_timestamp(),
            query: query.to_string(),
            response: None,
            error: Some(error.to_string()),
            execution_time: None,
            initial_worker_count: None,
            final_worker_count: None,
            worker_delta: None,
            estimated_energy: None,
            username: username.to_string(),
        }
    }

    /// Records with an empty response and no error are not worth keeping
    fn is_empty(&self) -> bool {
        self.error.is_none() && self.response.as_deref().map_or(true, str::is_empty)
    }
}

fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Map a username onto a safe file stem
pub fn sanitize(name: &str) -> String {
    if name.is_empty() {
        return "default".to_string();
    }
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON-file backed history, one file per user
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn user_file(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(username)))
    }

    /// Append `record` to its user's file, creating it if needed.
    ///
    /// Returns `false` when the record was skipped as empty.
    pub async fn append(&self, record: &HistoryRecord) -> Result<bool, HistoryError> {
        if record.is_empty() {
            tracing::warn!(username = %record.username, "skipping empty response entry");
            return Ok(false);
        }

        let path = self.user_file(&record.username);
        fs::create_dir_all(&self.dir).await?;

        let mut records: Vec<HistoryRecord> = match fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        records.push(record.clone());

        fs::write(&path, serde_json::to_string_pretty(&records)?).await?;
        tracing::debug!(path = %path.display(), entries = records.len(), "history record written");
        Ok(true)
    }

    /// All records for `username`; unreadable files yield an empty history
    pub async fn load_history(&self, username: &str) -> Vec<HistoryRecord> {
        let path = self.user_file(username);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "error reading user history");
                return Vec::new();
            }
        };
        if content.trim().is_empty() {
            return Vec::new();
        }

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::error!(path = %path.display(), error = %e, "error parsing user history");
            Vec::new()
        })
    }
}

/// Fire-and-forget front end for [`HistoryStore`].
///
/// Write failures are logged and reported as a System message in the
/// ledger; they never reach the turn that produced the record. Once
/// [`close`](Self::close) has started, failures are only logged.
pub struct HistoryWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<HistoryRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl HistoryWriter {
    pub fn spawn(store: HistoryStore, ledger: Arc<MessageLedger>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryRecord>();
        let closing = Arc::new(AtomicBool::new(false));
        let worker_closing = Arc::clone(&closing);
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.append(&record).await {
                    tracing::error!(username = %record.username, error = %e, "error writing to history log");
                    if !worker_closing.load(Ordering::Acquire) {
                        ledger.add_message(format!("Error writing to log: {}", e), Author::System);
                    }
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            closing,
        }
    }

    /// Queue `record`; never blocks
    pub fn record(&self, record: HistoryRecord) {
        let sent = match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        };
        if !sent {
            tracing::warn!("history writer closed, record dropped");
        }
    }

    /// Stop accepting records and wait until every queued one is written
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "history writer task failed");
            }
        }
    }
}
