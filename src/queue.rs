use crate::errors::AppResult;
use crate::journal::{Journal, JournalEntry};
use crate::models::{EntityKind, OperationStatus, QueuedOperation};
use std::collections::HashSet;
use std::future::Future;

/// What the drain handler made of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStep {
    /// Applied (cleanly, merged, or found already applied); drop it.
    Done,
    /// Could not be applied for a reason other than connectivity. Kept and
    /// marked failed; later operations for the same entity are held back.
    Failed(String),
    /// The store became unreachable; stop the pass and keep everything left.
    Abort(String),
}

pub trait DrainHandler {
    fn handle(&mut self, operation: QueuedOperation) -> impl Future<Output = DrainStep> + Send;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    pub failed: usize,
    pub held_back: usize,
    pub remaining: usize,
    pub aborted: bool,
}

/// Ordered capture of writes that could not reach the backing store. Entries
/// are only ever appended at the tail and removed once applied.
#[derive(Debug)]
pub struct OperationQueue {
    entries: Vec<QueuedOperation>,
    journal: Option<Journal>,
    warn_threshold: usize,
    warned: bool,
}

impl OperationQueue {
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            entries: Vec::new(),
            journal: None,
            warn_threshold,
            warned: false,
        }
    }

    /// Backs the queue with `journal`, restoring whatever it still holds.
    pub fn with_journal(journal: Journal, restored: Vec<QueuedOperation>, warn_threshold: usize) -> Self {
        if !restored.is_empty() {
            tracing::info!(
                count = restored.len(),
                path = %journal.path().to_string_lossy(),
                "restored queued operations from journal"
            );
        }
        Self {
            entries: restored,
            journal: Some(journal),
            warn_threshold,
            warned: false,
        }
    }

    pub fn enqueue(&mut self, operation: QueuedOperation) {
        self.record(JournalEntry::Enqueued {
            operation: operation.clone(),
        });
        tracing::info!(
            op_id = %operation.id,
            entity = %operation.entity,
            entity_id = %operation.entity_id,
            op_type = operation.op_type().as_str(),
            "queued operation while offline"
        );
        self.entries.push(operation);

        if self.entries.len() >= self.warn_threshold && !self.warned {
            self.warned = true;
            tracing::warn!(
                len = self.entries.len(),
                threshold = self.warn_threshold,
                "offline queue crossed its warning threshold"
            );
        } else if self.entries.len() < self.warn_threshold {
            self.warned = false;
        }
    }

    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == OperationStatus::Pending)
            .count()
    }

    /// Whether any operation, pending or failed, still targets this record.
    pub fn holds(&self, kind: EntityKind, id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.entity == kind && entry.entity_id == id)
    }

    pub fn failed(&self) -> Vec<QueuedOperation> {
        self.entries
            .iter()
            .filter(|entry| entry.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Puts every failed operation back up for the next drain.
    pub fn retry_failed(&mut self) -> usize {
        let mut reset = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.status == OperationStatus::Failed {
                entry.status = OperationStatus::Pending;
                reset.push(entry.clone());
            }
        }
        let count = reset.len();
        for operation in reset {
            self.record(JournalEntry::Updated { operation });
        }
        count
    }

    pub fn discard(&mut self, id: &str) -> Option<QueuedOperation> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        let removed = self.entries.remove(index);
        self.record(JournalEntry::Removed { id: removed.id.clone() });
        self.compact_if_empty();
        Some(removed)
    }

    /// Visits pending operations head to tail. Failed operations stay in
    /// place and block later operations for the same entity only.
    pub async fn drain_in_order<H: DrainHandler>(&mut self, handler: &mut H) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();
        let mut index = 0;

        while index < self.entries.len() {
            let operation = self.entries[index].clone();
            let key = operation.entity_key();
            if operation.status == OperationStatus::Failed {
                blocked.insert(key);
                index += 1;
                continue;
            }
            if blocked.contains(&key) {
                summary.held_back += 1;
                index += 1;
                continue;
            }

            match handler.handle(operation).await {
                DrainStep::Done => {
                    let removed = self.entries.remove(index);
                    self.record(JournalEntry::Removed { id: removed.id });
                    summary.processed += 1;
                }
                DrainStep::Failed(error) => {
                    let entry = &mut self.entries[index];
                    entry.status = OperationStatus::Failed;
                    entry.attempts += 1;
                    entry.last_error = Some(error);
                    let updated = entry.clone();
                    self.record(JournalEntry::Updated { operation: updated });
                    blocked.insert(key);
                    summary.failed += 1;
                    index += 1;
                }
                DrainStep::Abort(error) => {
                    let entry = &mut self.entries[index];
                    entry.attempts += 1;
                    entry.last_error = Some(error);
                    let updated = entry.clone();
                    self.record(JournalEntry::Updated { operation: updated });
                    summary.aborted = true;
                    break;
                }
            }
        }

        summary.remaining = self.entries.len();
        self.compact_if_empty();
        summary
    }

    fn record(&mut self, entry: JournalEntry) {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(error) = journal.append(&entry) {
                tracing::warn!(error = %error, "failed to append to queue journal");
            }
        }
    }

    fn compact_if_empty(&mut self) {
        if !self.entries.is_empty() {
            return;
        }
        if let Some(journal) = self.journal.as_mut() {
            if let Err(error) = journal.compact(&[]) {
                tracing::warn!(error = %error, "failed to compact queue journal");
            }
        }
    }
}

/// Opens the journal at `path` and wraps it in a queue.
pub fn open_journaled(path: &std::path::Path, warn_threshold: usize) -> AppResult<OperationQueue> {
    let (journal, restored) = Journal::open(path)?;
    Ok(OperationQueue::with_journal(journal, restored, warn_threshold))
}

#[cfg(test)]
mod tests {
    use super::{open_journaled, DrainHandler, DrainStep, OperationQueue};
    use crate::models::{
        EntityKind, Mutation, OperationStatus, Patch, ProblemPatch, ProblemStatus, QueuedOperation,
    };
    use chrono::Utc;
    use std::collections::HashMap;
    use std::future::Future;

    fn operation(id: &str, entity_id: &str) -> QueuedOperation {
        QueuedOperation {
            id: id.to_string(),
            entity: EntityKind::Problem,
            entity_id: entity_id.to_string(),
            mutation: Mutation::Update(Patch::Problem(ProblemPatch {
                status: Some(ProblemStatus::Acknowledged),
                ..ProblemPatch::default()
            })),
            base_timestamp: None,
            base_snapshot: None,
            local_version: None,
            enqueued_at: Utc::now(),
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    struct Scripted {
        steps: HashMap<String, DrainStep>,
        seen: Vec<String>,
    }

    impl DrainHandler for Scripted {
        fn handle(&mut self, operation: QueuedOperation) -> impl Future<Output = DrainStep> + Send {
            self.seen.push(operation.id.clone());
            let step = self.steps.get(&operation.id).cloned().unwrap_or(DrainStep::Done);
            async move { step }
        }
    }

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let mut queue = OperationQueue::new(100);
        queue.enqueue(operation("1", "a"));
        queue.enqueue(operation("2", "b"));
        queue.enqueue(operation("3", "a"));

        let mut handler = Scripted {
            steps: HashMap::new(),
            seen: Vec::new(),
        };
        let summary = queue.drain_in_order(&mut handler).await;
        assert_eq!(handler.seen, vec!["1", "2", "3"]);
        assert_eq!(summary.processed, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failure_holds_back_same_entity_only() {
        let mut queue = OperationQueue::new(100);
        queue.enqueue(operation("1", "a"));
        queue.enqueue(operation("2", "b"));
        queue.enqueue(operation("3", "a"));

        let mut handler = Scripted {
            steps: HashMap::from([("1".to_string(), DrainStep::Failed("gone".to_string()))]),
            seen: Vec::new(),
        };
        let summary = queue.drain_in_order(&mut handler).await;
        assert_eq!(handler.seen, vec!["1", "2"]);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.held_back, 1);
        assert_eq!(summary.remaining, 2);

        let failed = queue.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("gone"));

        // Failed entries are skipped until explicitly retried.
        let mut second = Scripted {
            steps: HashMap::new(),
            seen: Vec::new(),
        };
        queue.drain_in_order(&mut second).await;
        assert!(second.seen.is_empty());

        assert_eq!(queue.retry_failed(), 1);
        queue.drain_in_order(&mut second).await;
        assert_eq!(second.seen, vec!["1", "3"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn abort_keeps_remaining_operations() {
        let mut queue = OperationQueue::new(100);
        queue.enqueue(operation("1", "a"));
        queue.enqueue(operation("2", "b"));
        queue.enqueue(operation("3", "c"));

        let mut handler = Scripted {
            steps: HashMap::from([("2".to_string(), DrainStep::Abort("refused".to_string()))]),
            seen: Vec::new(),
        };
        let summary = queue.drain_in_order(&mut handler).await;
        assert!(summary.aborted);
        assert_eq!(summary.processed, 1);
        let remaining: Vec<String> = queue.snapshot().into_iter().map(|op| op.id).collect();
        assert_eq!(remaining, vec!["2", "3"]);
        assert_eq!(queue.snapshot()[0].status, OperationStatus::Pending);
    }

    #[test]
    fn holds_reports_records_with_queued_work() {
        let mut queue = OperationQueue::new(100);
        queue.enqueue(operation("1", "a"));
        assert!(queue.holds(EntityKind::Problem, "a"));
        assert!(!queue.holds(EntityKind::Problem, "b"));
        assert!(!queue.holds(EntityKind::Plugin, "a"));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut queue = OperationQueue::new(100);
        queue.enqueue(operation("1", "a"));
        let mut snapshot = queue.snapshot();
        snapshot.clear();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn journaled_queue_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.jsonl");
        {
            let mut queue = open_journaled(&path, 100).expect("open");
            queue.enqueue(operation("1", "a"));
            queue.enqueue(operation("2", "b"));
            queue.discard("1").expect("discard");
        }
        let queue = open_journaled(&path, 100).expect("reopen");
        let ids: Vec<String> = queue.snapshot().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec!["2"]);
    }
}
