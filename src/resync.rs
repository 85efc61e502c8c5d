use crate::audit::AuditLog;
use crate::db::{call_with_timeout, BackingStore};
use crate::errors::{AppError, AppResult};
use crate::models::{
    next_version, ConflictOutcome, ConflictRecord, EntityKind, Mutation, OperationType, Patch, QueuedOperation,
    Record, ReplayFailure,
};
use crate::queue::{DrainHandler, DrainStep};
use crate::resolver::ConflictResolver;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How one queued operation landed in the store.
#[derive(Debug)]
enum Replayed {
    /// Written as intended; carries the persisted record (None after a delete).
    Applied(Option<Record>),
    /// The store already reflected the operation.
    AlreadyApplied(Option<Record>),
    /// Divergence was detected and settled.
    Conflict(ConflictRecord, Option<Record>),
}

/// Store state the engine observed for a record, for refreshing read caches.
#[derive(Debug, Clone)]
pub struct Observed {
    pub entity: EntityKind,
    pub entity_id: String,
    pub record: Option<Record>,
}

/// Replays queued operations against the backing store. One engine serves
/// one drain pass.
pub struct ResyncEngine<'a> {
    store: Arc<dyn BackingStore>,
    resolver: ConflictResolver,
    audit: &'a mut AuditLog,
    timeout: Duration,
    /// Local echo version -> persisted version, per entity, for rebasing
    /// later operations that were captured on top of an earlier echo.
    chain: HashMap<(EntityKind, String), (DateTime<Utc>, DateTime<Utc>)>,
    applied: usize,
    conflicts: usize,
    observed: Vec<Observed>,
}

impl<'a> ResyncEngine<'a> {
    pub fn new(
        store: Arc<dyn BackingStore>,
        resolver: ConflictResolver,
        audit: &'a mut AuditLog,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            audit,
            timeout,
            chain: HashMap::new(),
            applied: 0,
            conflicts: 0,
            observed: Vec::new(),
        }
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }

    pub fn into_observed(self) -> Vec<Observed> {
        self.observed
    }

    async fn replay(&mut self, operation: QueuedOperation) -> DrainStep {
        let key = operation.entity_key();
        match self.apply(&operation).await {
            Ok(outcome) => {
                let persisted = match outcome {
                    Replayed::Applied(record) => {
                        self.applied += 1;
                        record
                    }
                    Replayed::AlreadyApplied(record) => {
                        tracing::debug!(op_id = %operation.id, "queued operation was already applied");
                        self.applied += 1;
                        record
                    }
                    Replayed::Conflict(conflict, record) => {
                        self.conflicts += 1;
                        self.audit.record_conflict(conflict);
                        record
                    }
                };
                match (&persisted, operation.local_version) {
                    (Some(record), Some(local)) => {
                        self.chain.insert(key.clone(), (local, record.version()));
                    }
                    (None, _) => {
                        self.chain.remove(&key);
                    }
                    _ => {}
                }
                self.observed.push(Observed {
                    entity: key.0,
                    entity_id: key.1,
                    record: persisted,
                });
                DrainStep::Done
            }
            Err(error) if error.is_connectivity() => {
                tracing::warn!(op_id = %operation.id, error = %error, "resync interrupted by connectivity failure");
                DrainStep::Abort(error.to_string())
            }
            Err(error) => {
                self.audit.record_failure(ReplayFailure {
                    operation_id: operation.id.clone(),
                    entity: operation.entity,
                    entity_id: operation.entity_id.clone(),
                    operation: operation.op_type(),
                    error: error.to_string(),
                    failed_at: Utc::now(),
                });
                DrainStep::Failed(error.to_string())
            }
        }
    }

    /// Base version after following the local-echo chain for this entity.
    fn effective_base(&self, operation: &QueuedOperation) -> Option<DateTime<Utc>> {
        let base = operation.base_timestamp?;
        match self.chain.get(&operation.entity_key()) {
            Some((local, persisted)) if *local == base => Some(*persisted),
            _ => Some(base),
        }
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> AppResult<Option<Record>> {
        let id = id.to_string();
        call_with_timeout(&self.store, self.timeout, move |store| store.fetch(kind, &id)).await
    }

    async fn save(&self, record: Record) -> AppResult<Record> {
        let written = record.clone();
        call_with_timeout(&self.store, self.timeout, move |store| store.save(&written)).await?;
        Ok(record)
    }

    async fn apply(&self, operation: &QueuedOperation) -> AppResult<Replayed> {
        let remote = self.fetch(operation.entity, &operation.entity_id).await?;
        match &operation.mutation {
            Mutation::Create(record) => self.apply_create(operation, record, remote).await,
            Mutation::Update(patch) => self.apply_update(operation, patch, remote).await,
            Mutation::Delete => self.apply_delete(operation, remote).await,
        }
    }

    async fn apply_create(
        &self,
        operation: &QueuedOperation,
        record: &Record,
        remote: Option<Record>,
    ) -> AppResult<Replayed> {
        let Some(remote) = remote else {
            let mut fresh = record.clone();
            fresh.set_version(next_version(operation.local_version));
            let inserted = fresh.clone();
            call_with_timeout(&self.store, self.timeout, move |store| store.insert(&inserted)).await?;
            return Ok(Replayed::Applied(Some(fresh)));
        };
        if remote.same_content(record) {
            return Ok(Replayed::AlreadyApplied(Some(remote)));
        }

        // The id is already taken remotely: merge as an update with no known base.
        let queued = without_identity(record.kind(), record.to_fields()?);
        self.merge(operation, None, &remote, &queued).await
    }

    async fn apply_update(
        &self,
        operation: &QueuedOperation,
        patch: &Patch,
        remote: Option<Record>,
    ) -> AppResult<Replayed> {
        let Some(remote) = remote else {
            return Err(AppError::Replay(format!(
                "{} {} no longer exists remotely",
                operation.entity, operation.entity_id
            )));
        };

        if self.effective_base(operation) == Some(remote.version()) {
            let mut next = remote.with_patch(patch)?;
            next.set_version(next_version(Some(remote.version())));
            let saved = self.save(next).await?;
            return Ok(Replayed::Applied(Some(saved)));
        }

        let queued = patch.to_fields()?;
        let remote_fields = remote.to_fields()?;
        if queued
            .iter()
            .all(|(field, value)| remote_fields.get(field) == Some(value))
        {
            return Ok(Replayed::AlreadyApplied(Some(remote)));
        }

        let base = operation
            .base_snapshot
            .as_ref()
            .map(Record::to_fields)
            .transpose()?;
        self.merge(operation, base.as_ref(), &remote, &queued).await
    }

    async fn apply_delete(&self, operation: &QueuedOperation, remote: Option<Record>) -> AppResult<Replayed> {
        let Some(remote) = remote else {
            return Ok(Replayed::AlreadyApplied(None));
        };

        if self.effective_base(operation) == Some(remote.version()) {
            let kind = operation.entity;
            let id = operation.entity_id.clone();
            call_with_timeout(&self.store, self.timeout, move |store| store.delete(kind, &id)).await?;
            return Ok(Replayed::Applied(None));
        }

        let conflict = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            entity: operation.entity,
            entity_id: operation.entity_id.clone(),
            operation_id: operation.id.clone(),
            operation: OperationType::Delete,
            base_timestamp: operation.base_timestamp,
            remote_timestamp: remote.version(),
            merged_timestamp: None,
            resolved_fields: Vec::new(),
            resolution_strategy: BTreeMap::new(),
            outcome: ConflictOutcome::DeleteSuppressed,
            detected_at: Utc::now(),
        };
        Ok(Replayed::Conflict(conflict, Some(remote)))
    }

    async fn merge(
        &self,
        operation: &QueuedOperation,
        base: Option<&Map<String, Value>>,
        remote: &Record,
        queued: &Map<String, Value>,
    ) -> AppResult<Replayed> {
        let kind = operation.entity;
        let remote_fields = remote.to_fields()?;
        let merge = self.resolver.resolve(kind, base, &remote_fields, queued);

        let mut fields = remote_fields;
        for (field, value) in merge.fields.iter() {
            fields.insert(field.clone(), value.clone());
        }
        let mut merged = Record::from_fields(kind, fields)?;
        merged.set_version(next_version(Some(remote.version())));
        let merged = self.save(merged).await?;

        let conflict = ConflictRecord {
            id: Uuid::new_v4().to_string(),
            entity: kind,
            entity_id: operation.entity_id.clone(),
            operation_id: operation.id.clone(),
            operation: operation.op_type(),
            base_timestamp: operation.base_timestamp,
            remote_timestamp: remote.version(),
            merged_timestamp: Some(merged.version()),
            resolved_fields: merge.resolved_fields(),
            resolution_strategy: merge.resolutions,
            outcome: ConflictOutcome::Merged,
            detected_at: Utc::now(),
        };
        Ok(Replayed::Conflict(conflict, Some(merged)))
    }
}

impl DrainHandler for ResyncEngine<'_> {
    fn handle(&mut self, operation: QueuedOperation) -> impl Future<Output = DrainStep> + Send {
        self.replay(operation)
    }
}

fn without_identity(kind: EntityKind, mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.remove(kind.primary_key_field());
    fields.remove(kind.version_field());
    fields
}
