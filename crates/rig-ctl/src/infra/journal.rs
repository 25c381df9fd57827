//! Run journal.
//!
//! One JSON object per line for every engine event plus process start and
//! shutdown, so a run can be reconstructed after the fact.

use chrono::{DateTime, Utc};
use rig_core::engine::{EngineEvent, EngineObserver};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    SystemStart,
    SystemShutdown,
    Engine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: JournalKind,
    pub details: serde_json::Value,
}

/// Thread-safe append-only JSONL writer.
pub struct RunJournal {
    writer: Mutex<BufWriter<File>>,
}

impl RunJournal {
    /// Open `path` in append mode, creating parent directories as needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn record(&self, kind: JournalKind, details: serde_json::Value) -> std::io::Result<()> {
        self.log(&JournalEntry {
            timestamp: Utc::now(),
            kind,
            details,
        })
    }
}

/// Engine observer that forwards every event into a shared journal.
pub struct JournalObserver(pub Arc<RunJournal>);

impl EngineObserver for JournalObserver {
    fn on_event(&mut self, event: &EngineEvent) {
        let details = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Journal entry encode failed");
                return;
            }
        };
        if let Err(e) = self.0.record(JournalKind::Engine, details) {
            warn!(error = %e, "Journal write failed");
        }
    }
}
