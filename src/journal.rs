//! Append-only JSON-lines log of queue mutations, so captured writes survive
//! a process restart. Replaying the log in order rebuilds the queue; the file
//! is compacted on open and whenever the queue drains empty.

use crate::errors::AppResult;
use crate::models::QueuedOperation;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEntry {
    Enqueued { operation: QueuedOperation },
    Updated { operation: QueuedOperation },
    Removed { id: String },
}

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens (or creates) the journal and returns the operations it still holds.
    pub fn open(path: &Path) -> AppResult<(Self, Vec<QueuedOperation>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let operations = if path.exists() { replay(path)? } else { Vec::new() };
        write_compacted(path, &operations)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            operations,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &JournalEntry) -> AppResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Rewrites the log so it holds exactly `operations`.
    pub fn compact(&mut self, operations: &[QueuedOperation]) -> AppResult<()> {
        write_compacted(&self.path, operations)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }
}

fn replay(path: &Path) -> AppResult<Vec<QueuedOperation>> {
    let reader = BufReader::new(File::open(path)?);
    let mut operations: Vec<QueuedOperation> = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(
                    path = %path.to_string_lossy(),
                    line = index + 1,
                    error = %error,
                    "skipping malformed journal line"
                );
                continue;
            }
        };
        match entry {
            JournalEntry::Enqueued { operation } => {
                if !operations.iter().any(|existing| existing.id == operation.id) {
                    operations.push(operation);
                }
            }
            JournalEntry::Updated { operation } => {
                if let Some(existing) = operations.iter_mut().find(|existing| existing.id == operation.id) {
                    *existing = operation;
                }
            }
            JournalEntry::Removed { id } => operations.retain(|existing| existing.id != id),
        }
    }
    Ok(operations)
}

fn write_compacted(path: &Path, operations: &[QueuedOperation]) -> AppResult<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for operation in operations {
            let entry = JournalEntry::Enqueued {
                operation: operation.clone(),
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
