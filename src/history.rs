//! Call history and reporting.
//!
//! Stores one JSONL file per day at `<dir>/{date}-calls.jsonl` holding
//! per-interaction delivery records and post-call summaries. Write failures
//! are logged and otherwise ignored; history never affects a call.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::summary::{CallSummary, Sentiment};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub timestamp: String,
    pub call_id: String,
    pub interaction_id: u64,
    pub released: u64,
    pub skipped: u64,
    pub llm_latency_ms: u64,
    pub total_latency_ms: u64,
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub timestamp: String,
    pub call_id: String,
    pub turns: usize,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
}

impl SummaryRecord {
    pub fn new(call_id: &str, turns: usize, summary: &CallSummary) -> Self {
        let timestamp = now_timestamp();
        match summary {
            CallSummary::Available(s) => Self {
                timestamp,
                call_id: call_id.to_string(),
                turns,
                available: true,
                sentiment: Some(s.sentiment.to_string()),
                summary: Some(s.summary.clone()),
                action_items: s.action_items.clone(),
            },
            CallSummary::Unavailable => Self {
                timestamp,
                call_id: call_id.to_string(),
                turns,
                available: false,
                sentiment: None,
                summary: None,
                action_items: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    Interaction(InteractionRecord),
    Summary(SummaryRecord),
}

pub fn now_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Handle for queueing records to a background writer. Records are written
/// in the order they are sent; file I/O runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct HistorySender {
    tx: mpsc::UnboundedSender<HistoryEntry>,
}

impl HistorySender {
    pub fn interaction(&self, record: InteractionRecord) {
        self.send(HistoryEntry::Interaction(record));
    }

    pub fn summary(&self, record: SummaryRecord) {
        self.send(HistoryEntry::Summary(record));
    }

    fn send(&self, entry: HistoryEntry) {
        if self.tx.send(entry).is_err() {
            warn!("History writer stopped, dropping record");
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move the log onto a writer task. The task ends once every sender is
    /// dropped and the queue is flushed.
    pub fn spawn_writer(self) -> (HistorySender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryEntry>();
        let log = Arc::new(self);
        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let log = log.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || log.append(&entry)).await {
                    warn!("History write panicked: {e}");
                }
            }
            debug!("History writer done");
        });
        (HistorySender { tx }, task)
    }

    fn history_file(&self, date: &str) -> PathBuf {
        let date_str = if date == "today" {
            Local::now().format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };
        self.dir.join(format!("{date_str}-calls.jsonl"))
    }

    pub fn append_interaction(&self, record: &InteractionRecord) {
        self.append(&HistoryEntry::Interaction(record.clone()));
    }

    pub fn append_summary(&self, record: &SummaryRecord) {
        self.append(&HistoryEntry::Summary(record.clone()));
    }

    fn append(&self, entry: &HistoryEntry) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create history dir: {e}");
            return;
        }

        let path = self.history_file("today");
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open history file: {e}");
                return;
            }
        };

        match serde_json::to_string(entry) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write history record: {e}");
                } else {
                    debug!("Saved history record to {}", path.display());
                }
            }
            Err(e) => warn!("Failed to serialize history record: {e}"),
        }
    }

    /// Load every record for a date (`YYYY-MM-DD` or `today`). Lines that
    /// fail to parse are skipped.
    pub fn load_records(&self, date: &str) -> Vec<HistoryEntry> {
        let contents = match fs::read_to_string(self.history_file(date)) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn list_dates(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix("-calls.jsonl").map(str::to_string)
            })
            .collect();
        dates.sort();
        dates
    }

    pub fn generate_report(&self, date: &str) -> String {
        let records = self.load_records(date);
        if records.is_empty() {
            return format!("No call records for {date}.");
        }

        let interactions: Vec<&InteractionRecord> = records
            .iter()
            .filter_map(|r| match r {
                HistoryEntry::Interaction(i) => Some(i),
                HistoryEntry::Summary(_) => None,
            })
            .collect();
        let summaries: Vec<&SummaryRecord> = records
            .iter()
            .filter_map(|r| match r {
                HistoryEntry::Summary(s) => Some(s),
                HistoryEntry::Interaction(_) => None,
            })
            .collect();

        let calls: HashSet<&str> = interactions
            .iter()
            .map(|r| r.call_id.as_str())
            .chain(summaries.iter().map(|s| s.call_id.as_str()))
            .collect();
        let total = interactions.len();
        let interrupted = interactions.iter().filter(|r| r.interrupted).count();
        let skipped: u64 = interactions.iter().map(|r| r.skipped).sum();
        let (avg_llm, avg_total) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                interactions.iter().map(|r| r.llm_latency_ms as f64).sum::<f64>() / total as f64,
                interactions.iter().map(|r| r.total_latency_ms as f64).sum::<f64>() / total as f64,
            )
        };

        let mut report = format!(
            "# Call Report for {date}\n\n\
            - Calls: {}\n\
            - Interactions: {total}\n\
            - Interrupted: {interrupted}\n\
            - Skipped units: {skipped}\n\
            - Avg LLM latency: {avg_llm:.0}ms\n\
            - Avg total latency: {avg_total:.0}ms\n\n\
            ## Sentiment\n",
            calls.len()
        );

        for sentiment in [
            Sentiment::Positive,
            Sentiment::Neutral,
            Sentiment::Negative,
            Sentiment::Unknown,
        ] {
            let label = sentiment.to_string();
            let count = summaries
                .iter()
                .filter(|s| s.sentiment.as_deref() == Some(label.as_str()))
                .count();
            if count > 0 {
                report.push_str(&format!("- {label}: {count}\n"));
            }
        }
        let unavailable = summaries.iter().filter(|s| !s.available).count();
        if unavailable > 0 {
            report.push_str(&format!("- unavailable: {unavailable}\n"));
        }

        report
    }
}
