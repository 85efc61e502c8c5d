use crate::audit::AuditLog;
use crate::config::StoreSettings;
use crate::connectivity::{Connectivity, ConnectivityState};
use crate::db::{call_with_timeout, BackingStore, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{
    next_version, ConflictRecord, EntityKind, LogEntry, LogEntryPatch, MetricSnapshot, MetricSnapshotPatch, Mutation,
    NewLogEntry, NewMetricSnapshot, NewPlugin, NewProblem, NewTestProfile, OperationStatus, Patch, Plugin,
    PluginPatch, Problem, ProblemPatch, QueuedOperation, Record, ReplayFailure, ResyncReport, TestProfile,
    TestProfilePatch,
};
use crate::queue::{open_journaled, OperationQueue};
use crate::resolver::ConflictResolver;
use crate::resync::{Observed, ResyncEngine};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything that must change together: the queue and the audit log.
struct OfflineCore {
    queue: OperationQueue,
    audit: AuditLog,
}

/// Last-known state per record. `None` marks a record known to be deleted.
type SnapshotCache = HashMap<(EntityKind, String), Option<Record>>;

/// The storage surface used by the rest of the dashboard.
///
/// Writes go straight to the backing store while it is reachable. When it is
/// not, they are captured in the operation queue and the caller gets a local
/// echo of the intended result; `trigger_resync` later replays them.
///
/// Reads while offline serve the last-known snapshot (including local
/// echoes) and fail with `AppError::Unavailable` when nothing is known.
#[derive(Clone)]
pub struct StorageFacade {
    store: Arc<dyn BackingStore>,
    core: Arc<Mutex<OfflineCore>>,
    connectivity: Arc<ConnectivityState>,
    cache: Arc<StdMutex<SnapshotCache>>,
    resolver: ConflictResolver,
    settings: Arc<StoreSettings>,
}

impl StorageFacade {
    /// Opens the sqlite store named by `settings.database_path`.
    pub async fn open_sqlite(settings: StoreSettings) -> AppResult<Self> {
        let db = Database::new(&settings.database_path, settings.busy_timeout());
        Self::open(Arc::new(db), settings).await
    }

    /// Probes the store, restores the journal if one is configured, and when
    /// restored operations exist and the store is reachable, replays them
    /// before returning.
    pub async fn open(store: Arc<dyn BackingStore>, settings: StoreSettings) -> AppResult<Self> {
        let queue = match &settings.journal_path {
            Some(path) => open_journaled(path, settings.queue_warn_threshold)?,
            None => OperationQueue::new(settings.queue_warn_threshold),
        };
        let restored = queue.len();

        let initial = match call_with_timeout(&store, settings.probe_timeout(), |store| store.probe()).await {
            Ok(()) => Connectivity::Online,
            Err(error) if error.is_connectivity() => {
                tracing::warn!(error = %error, "backing store unreachable at startup");
                Connectivity::Offline
            }
            Err(error) => return Err(error),
        };

        let facade = Self {
            store,
            core: Arc::new(Mutex::new(OfflineCore {
                queue,
                audit: AuditLog::new(),
            })),
            connectivity: Arc::new(ConnectivityState::new(initial)),
            cache: Arc::new(StdMutex::new(HashMap::new())),
            resolver: ConflictResolver::new(settings.scalar_policy),
            settings: Arc::new(settings),
        };

        if restored > 0 {
            facade.connectivity.go_offline("restored operations awaiting replay");
            if initial == Connectivity::Online {
                facade.trigger_resync().await?;
            }
        }
        Ok(facade)
    }

    pub fn is_offline(&self) -> bool {
        self.connectivity.is_offline()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub async fn get_offline_ops_snapshot(&self) -> Vec<QueuedOperation> {
        self.core.lock().await.queue.snapshot()
    }

    pub async fn get_offline_conflicts_snapshot(&self) -> Vec<ConflictRecord> {
        self.core.lock().await.audit.conflicts().to_vec()
    }

    /// Conflicts recorded against one record, oldest first.
    pub async fn get_entity_conflicts(&self, kind: EntityKind, id: &str) -> Vec<ConflictRecord> {
        self.core.lock().await.audit.conflicts_for(kind, id).into_iter().cloned().collect()
    }

    pub async fn get_replay_failures_snapshot(&self) -> Vec<ReplayFailure> {
        self.core.lock().await.audit.failures().to_vec()
    }

    /// Makes failed operations eligible for the next resync again.
    pub async fn retry_failed_operations(&self) -> usize {
        self.core.lock().await.queue.retry_failed()
    }

    pub async fn discard_operation(&self, operation_id: &str) -> Option<QueuedOperation> {
        let removed = self.core.lock().await.queue.discard(operation_id);
        if let Some(operation) = &removed {
            tracing::warn!(op_id = %operation.id, entity = %operation.entity, "discarded queued operation");
        }
        removed
    }

    pub async fn clear_conflicts(&self) -> usize {
        self.core.lock().await.audit.clear()
    }

    // -----------------------------------------------------------------------
    // Resync
    // -----------------------------------------------------------------------

    /// Replays queued operations. A no-op when online with nothing pending;
    /// concurrent calls wait for the pass in flight and then find nothing to do.
    pub async fn trigger_resync(&self) -> AppResult<ResyncReport> {
        let mut core = self.core.lock().await;
        if !self.connectivity.is_offline() && core.queue.pending_len() == 0 {
            return Ok(ResyncReport {
                remaining: core.queue.len(),
                ..ResyncReport::default()
            });
        }

        if let Err(error) =
            call_with_timeout(&self.store, self.settings.probe_timeout(), |store| store.probe()).await
        {
            if !error.is_connectivity() {
                return Err(error);
            }
            self.connectivity.go_offline(&error.to_string());
            return Ok(ResyncReport {
                remaining: core.queue.len(),
                aborted: true,
                ..ResyncReport::default()
            });
        }

        let OfflineCore { queue, audit } = &mut *core;
        let mut engine = ResyncEngine::new(
            Arc::clone(&self.store),
            self.resolver,
            audit,
            self.settings.operation_timeout(),
        );
        let summary = queue.drain_in_order(&mut engine).await;
        let report = ResyncReport {
            applied: engine.applied(),
            conflicts: engine.conflicts(),
            failed: summary.failed,
            held_back: summary.held_back,
            remaining: summary.remaining,
            aborted: summary.aborted,
        };
        self.remember_observed(engine.into_observed())?;

        if report.aborted {
            self.connectivity.go_offline("connectivity lost during resync");
        } else {
            self.connectivity.go_online();
        }
        tracing::info!(
            applied = report.applied,
            conflicts = report.conflicts,
            failed = report.failed,
            held_back = report.held_back,
            remaining = report.remaining,
            aborted = report.aborted,
            "resync pass finished"
        );
        Ok(report)
    }

    /// Retries `trigger_resync` every `resync_interval` while offline.
    pub fn start_background_resync(&self) -> JoinHandle<()> {
        let facade = self.clone();
        let period = self.settings.resync_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !facade.is_offline() {
                    continue;
                }
                if let Err(error) = facade.trigger_resync().await {
                    tracing::warn!(error = %error, "background resync failed");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Generic CRUD
    // -----------------------------------------------------------------------

    pub async fn create(&self, record: Record) -> AppResult<Record> {
        record.validate()?;
        let mut core = self.core.lock().await;
        let kind = record.kind();
        let id = record.id().to_string();

        if !self.connectivity.is_offline() && !core.queue.holds(kind, &id) {
            let mut fresh = record.clone();
            fresh.set_version(next_version(None));
            let inserted = fresh.clone();
            match self.call(move |store| store.insert(&inserted)).await {
                Ok(()) => {
                    self.remember(kind, &id, Some(fresh.clone()))?;
                    return Ok(fresh);
                }
                Err(error) if error.is_connectivity() => {
                    self.connectivity.go_offline(&error.to_string());
                }
                Err(error) => return Err(error),
            }
        }

        let local = next_version(None);
        let mut echo = record;
        echo.set_version(local);
        core.queue.enqueue(QueuedOperation {
            id: Uuid::new_v4().to_string(),
            entity: kind,
            entity_id: id.clone(),
            mutation: Mutation::Create(echo.clone()),
            base_timestamp: None,
            base_snapshot: None,
            local_version: Some(local),
            enqueued_at: Utc::now(),
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
        });
        self.remember(kind, &id, Some(echo.clone()))?;
        Ok(echo)
    }

    /// Updates using the last-known snapshot of the record as the writer's base.
    /// Returns `None` only when the write was queued and no snapshot of the
    /// record is known to echo it onto.
    pub async fn update(&self, id: &str, patch: Patch) -> AppResult<Option<Record>> {
        self.write_update(id, patch, None).await
    }

    /// Updates stating explicitly which version of the record the caller saw.
    pub async fn update_from(&self, id: &str, patch: Patch, observed: Record) -> AppResult<Option<Record>> {
        if observed.kind() != patch.kind() || observed.id() != id {
            return Err(AppError::Validation(format!(
                "observed record {} {} does not match the {} {} being updated",
                observed.kind(),
                observed.id(),
                patch.kind(),
                id
            )));
        }
        self.write_update(id, patch, Some(observed)).await
    }

    /// `observed` overrides the cached snapshot as the base of a queued write.
    async fn write_update(&self, id: &str, patch: Patch, observed: Option<Record>) -> AppResult<Option<Record>> {
        patch.validate()?;
        require_id(id)?;
        let kind = patch.kind();
        let mut core = self.core.lock().await;

        if !self.connectivity.is_offline() && !core.queue.holds(kind, id) {
            match self.update_direct(kind, id, &patch).await {
                Ok(record) => {
                    self.remember(kind, id, Some(record.clone()))?;
                    return Ok(Some(record));
                }
                Err(error) if error.is_connectivity() => {
                    self.connectivity.go_offline(&error.to_string());
                }
                Err(error) => return Err(error),
            }
        }

        // Read under the lock so an earlier queued write's echo is the base.
        let base = match observed {
            Some(record) => Some(record),
            None => self.snapshot(kind, id)?.flatten(),
        };
        let local = next_version(base.as_ref().map(Record::version));
        let echo = match &base {
            Some(snapshot) => {
                let mut echo = snapshot.with_patch(&patch)?;
                echo.set_version(local);
                Some(echo)
            }
            None => None,
        };
        core.queue.enqueue(QueuedOperation {
            id: Uuid::new_v4().to_string(),
            entity: kind,
            entity_id: id.to_string(),
            mutation: Mutation::Update(patch),
            base_timestamp: base.as_ref().map(Record::version),
            base_snapshot: base,
            local_version: Some(local),
            enqueued_at: Utc::now(),
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
        });
        if let Some(echo) = &echo {
            self.remember(kind, id, Some(echo.clone()))?;
        }
        Ok(echo)
    }

    async fn update_direct(&self, kind: EntityKind, id: &str, patch: &Patch) -> AppResult<Record> {
        let key = id.to_string();
        let remote = self
            .call(move |store| store.fetch(kind, &key))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{kind} {id}")))?;
        let mut next = remote.with_patch(patch)?;
        next.set_version(next_version(Some(remote.version())));
        let written = next.clone();
        self.call(move |store| store.save(&written)).await?;
        Ok(next)
    }

    /// Online: whether a row was removed. Offline: the delete was queued.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool> {
        require_id(id)?;
        let mut core = self.core.lock().await;

        if !self.connectivity.is_offline() && !core.queue.holds(kind, id) {
            let key = id.to_string();
            match self.call(move |store| store.delete(kind, &key)).await {
                Ok(removed) => {
                    self.remember(kind, id, None)?;
                    return Ok(removed);
                }
                Err(error) if error.is_connectivity() => {
                    self.connectivity.go_offline(&error.to_string());
                }
                Err(error) => return Err(error),
            }
        }

        let base = self.snapshot(kind, id)?.flatten();
        core.queue.enqueue(QueuedOperation {
            id: Uuid::new_v4().to_string(),
            entity: kind,
            entity_id: id.to_string(),
            mutation: Mutation::Delete,
            base_timestamp: base.as_ref().map(Record::version),
            base_snapshot: base,
            local_version: None,
            enqueued_at: Utc::now(),
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
        });
        self.remember(kind, id, None)?;
        Ok(true)
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> AppResult<Option<Record>> {
        if !self.connectivity.is_offline() {
            let key = id.to_string();
            match self.call(move |store| store.fetch(kind, &key)).await {
                Ok(record) => {
                    self.remember(kind, id, record.clone())?;
                    return Ok(record);
                }
                Err(error) if error.is_connectivity() => {
                    self.connectivity.go_offline(&error.to_string());
                }
                Err(error) => return Err(error),
            }
        }

        match self.snapshot(kind, id)? {
            Some(known) => Ok(known),
            None => Err(AppError::Unavailable(format!(
                "{kind} {id} is not cached and the backing store is unreachable"
            ))),
        }
    }

    /// Offline, this is the last-known subset of records of `kind`.
    pub async fn list(&self, kind: EntityKind) -> AppResult<Vec<Record>> {
        if !self.connectivity.is_offline() {
            match self.call(move |store| store.list(kind)).await {
                Ok(records) => {
                    for record in &records {
                        self.remember(kind, record.id(), Some(record.clone()))?;
                    }
                    return Ok(records);
                }
                Err(error) if error.is_connectivity() => {
                    self.connectivity.go_offline(&error.to_string());
                }
                Err(error) => return Err(error),
            }
        }

        let cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("snapshot cache mutex poisoned".to_string()))?;
        let mut records: Vec<Record> = cache
            .iter()
            .filter(|((entity, _), _)| *entity == kind)
            .filter_map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|left, right| right.version().cmp(&left.version()));
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Typed CRUD
    // -----------------------------------------------------------------------

    pub async fn create_test_profile(&self, draft: NewTestProfile) -> AppResult<TestProfile> {
        let id = draft.id.clone().unwrap_or_else(new_id);
        let record = draft.into_record(id, Utc::now());
        self.create(record).await?.into_test_profile()
    }

    pub async fn update_test_profile(&self, id: &str, patch: TestProfilePatch) -> AppResult<Option<TestProfile>> {
        self.update(id, Patch::TestProfile(patch))
            .await?
            .map(Record::into_test_profile)
            .transpose()
    }

    pub async fn delete_test_profile(&self, id: &str) -> AppResult<bool> {
        self.delete(EntityKind::TestProfile, id).await
    }

    pub async fn get_test_profile(&self, id: &str) -> AppResult<Option<TestProfile>> {
        self.get(EntityKind::TestProfile, id)
            .await?
            .map(Record::into_test_profile)
            .transpose()
    }

    pub async fn list_test_profiles(&self) -> AppResult<Vec<TestProfile>> {
        self.list(EntityKind::TestProfile)
            .await?
            .into_iter()
            .map(Record::into_test_profile)
            .collect()
    }

    pub async fn create_problem(&self, draft: NewProblem) -> AppResult<Problem> {
        let id = draft.id.clone().unwrap_or_else(new_id);
        let record = draft.into_record(id, Utc::now());
        self.create(record).await?.into_problem()
    }

    pub async fn update_problem(&self, id: &str, patch: ProblemPatch) -> AppResult<Option<Problem>> {
        self.update(id, Patch::Problem(patch))
            .await?
            .map(Record::into_problem)
            .transpose()
    }

    pub async fn delete_problem(&self, id: &str) -> AppResult<bool> {
        self.delete(EntityKind::Problem, id).await
    }

    pub async fn get_problem(&self, id: &str) -> AppResult<Option<Problem>> {
        self.get(EntityKind::Problem, id)
            .await?
            .map(Record::into_problem)
            .transpose()
    }

    pub async fn list_problems(&self) -> AppResult<Vec<Problem>> {
        self.list(EntityKind::Problem)
            .await?
            .into_iter()
            .map(Record::into_problem)
            .collect()
    }

    pub async fn create_log_entry(&self, draft: NewLogEntry) -> AppResult<LogEntry> {
        let id = draft.id.clone().unwrap_or_else(new_id);
        let record = draft.into_record(id, Utc::now());
        self.create(record).await?.into_log_entry()
    }

    pub async fn update_log_entry(&self, id: &str, patch: LogEntryPatch) -> AppResult<Option<LogEntry>> {
        self.update(id, Patch::LogEntry(patch))
            .await?
            .map(Record::into_log_entry)
            .transpose()
    }

    pub async fn delete_log_entry(&self, id: &str) -> AppResult<bool> {
        self.delete(EntityKind::LogEntry, id).await
    }

    pub async fn get_log_entry(&self, id: &str) -> AppResult<Option<LogEntry>> {
        self.get(EntityKind::LogEntry, id)
            .await?
            .map(Record::into_log_entry)
            .transpose()
    }

    pub async fn list_log_entries(&self) -> AppResult<Vec<LogEntry>> {
        self.list(EntityKind::LogEntry)
            .await?
            .into_iter()
            .map(Record::into_log_entry)
            .collect()
    }

    pub async fn create_plugin(&self, draft: NewPlugin) -> AppResult<Plugin> {
        let id = draft.id.clone().unwrap_or_else(new_id);
        let record = draft.into_record(id, Utc::now());
        self.create(record).await?.into_plugin()
    }

    pub async fn update_plugin(&self, id: &str, patch: PluginPatch) -> AppResult<Option<Plugin>> {
        self.update(id, Patch::Plugin(patch))
            .await?
            .map(Record::into_plugin)
            .transpose()
    }

    pub async fn delete_plugin(&self, id: &str) -> AppResult<bool> {
        self.delete(EntityKind::Plugin, id).await
    }

    pub async fn get_plugin(&self, id: &str) -> AppResult<Option<Plugin>> {
        self.get(EntityKind::Plugin, id)
            .await?
            .map(Record::into_plugin)
            .transpose()
    }

    pub async fn list_plugins(&self) -> AppResult<Vec<Plugin>> {
        self.list(EntityKind::Plugin)
            .await?
            .into_iter()
            .map(Record::into_plugin)
            .collect()
    }

    pub async fn create_metric_snapshot(&self, draft: NewMetricSnapshot) -> AppResult<MetricSnapshot> {
        let id = draft.id.clone().unwrap_or_else(new_id);
        let record = draft.into_record(id, Utc::now());
        self.create(record).await?.into_metric_snapshot()
    }

    pub async fn update_metric_snapshot(
        &self,
        id: &str,
        patch: MetricSnapshotPatch,
    ) -> AppResult<Option<MetricSnapshot>> {
        self.update(id, Patch::MetricSnapshot(patch))
            .await?
            .map(Record::into_metric_snapshot)
            .transpose()
    }

    pub async fn delete_metric_snapshot(&self, id: &str) -> AppResult<bool> {
        self.delete(EntityKind::MetricSnapshot, id).await
    }

    pub async fn get_metric_snapshot(&self, id: &str) -> AppResult<Option<MetricSnapshot>> {
        self.get(EntityKind::MetricSnapshot, id)
            .await?
            .map(Record::into_metric_snapshot)
            .transpose()
    }

    /// Newest first.
    pub async fn list_metric_snapshots(&self) -> AppResult<Vec<MetricSnapshot>> {
        self.list(EntityKind::MetricSnapshot)
            .await?
            .into_iter()
            .map(Record::into_metric_snapshot)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn call<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BackingStore) -> AppResult<T> + Send + 'static,
    {
        call_with_timeout(&self.store, self.settings.operation_timeout(), f).await
    }

    /// Outer `None`: nothing known. Inner `None`: known to be deleted.
    fn snapshot(&self, kind: EntityKind, id: &str) -> AppResult<Option<Option<Record>>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("snapshot cache mutex poisoned".to_string()))?;
        Ok(cache.get(&(kind, id.to_string())).cloned())
    }

    fn remember(&self, kind: EntityKind, id: &str, record: Option<Record>) -> AppResult<()> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("snapshot cache mutex poisoned".to_string()))?;
        cache.insert((kind, id.to_string()), record);
        Ok(())
    }

    fn remember_observed(&self, observed: Vec<Observed>) -> AppResult<()> {
        for entry in observed {
            self.remember(entry.entity, &entry.entity_id, entry.record)?;
        }
        Ok(())
    }

    /// Version of the last-known snapshot, if any.
    pub fn known_version(&self, kind: EntityKind, id: &str) -> AppResult<Option<DateTime<Utc>>> {
        Ok(self.snapshot(kind, id)?.flatten().map(|record| record.version()))
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn require_id(id: &str) -> AppResult<()> {
    if id.trim().is_empty() {
        return Err(AppError::Validation("entity id must not be empty".to_string()));
    }
    Ok(())
}
