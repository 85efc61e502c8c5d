use crate::models::{ConflictRecord, EntityKind, ReplayFailure};

/// Append-only record of every conflict the resync engine settled and every
/// operation it could not replay. Entries are never edited once appended.
#[derive(Debug, Default)]
pub struct AuditLog {
    conflicts: Vec<ConflictRecord>,
    failures: Vec<ReplayFailure>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_conflict(&mut self, record: ConflictRecord) {
        tracing::info!(
            conflict_id = %record.id,
            entity = %record.entity,
            entity_id = %record.entity_id,
            outcome = ?record.outcome,
            resolved_fields = ?record.resolved_fields,
            "recorded offline conflict"
        );
        self.conflicts.push(record);
    }

    pub fn record_failure(&mut self, failure: ReplayFailure) {
        tracing::warn!(
            op_id = %failure.operation_id,
            entity = %failure.entity,
            entity_id = %failure.entity_id,
            error = %failure.error,
            "queued operation could not be replayed"
        );
        self.failures.push(failure);
    }

    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    pub fn failures(&self) -> &[ReplayFailure] {
        &self.failures
    }

    pub fn conflicts_for(&self, entity: EntityKind, entity_id: &str) -> Vec<&ConflictRecord> {
        self.conflicts
            .iter()
            .filter(|record| record.entity == entity && record.entity_id == entity_id)
            .collect()
    }

    /// Drops all entries; returns how many conflicts were cleared.
    pub fn clear(&mut self) -> usize {
        let cleared = self.conflicts.len();
        self.conflicts.clear();
        self.failures.clear();
        cleared
    }
}
