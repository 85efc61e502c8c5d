use chrono::Utc;
use dashboard_store::models::next_version;
use dashboard_store::{
    AppError, AppResult, BackingStore, ConflictOutcome, Database, EntityKind, MergeStrategy, MetricSnapshotPatch,
    NewLogEntry, NewMetricSnapshot, NewPlugin, NewProblem, NewTestProfile, OperationStatus, Patch, PluginPatch,
    PluginType, ProblemPatch, ProblemSeverity, Record, StorageFacade, StoreSettings, TestProfilePatch,
};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A real database that can be made unreachable on demand.
struct Switchable {
    inner: Database,
    online: AtomicBool,
    /// Inserts hang past any reasonable deadline and then fail.
    stall_inserts: AtomicBool,
}

impl Switchable {
    fn new(path: &Path, online: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Database::new(path, Duration::from_millis(200)),
            online: AtomicBool::new(online),
            stall_inserts: AtomicBool::new(false),
        })
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn gate(&self) -> AppResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Connectivity("connection refused".to_string()))
        }
    }
}

impl BackingStore for Switchable {
    fn probe(&self) -> AppResult<()> {
        self.gate()?;
        self.inner.probe()
    }
    fn fetch(&self, kind: EntityKind, id: &str) -> AppResult<Option<Record>> {
        self.gate()?;
        self.inner.fetch(kind, id)
    }
    fn list(&self, kind: EntityKind) -> AppResult<Vec<Record>> {
        self.gate()?;
        self.inner.list(kind)
    }
    fn insert(&self, record: &Record) -> AppResult<()> {
        if self.stall_inserts.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(500));
            return Err(AppError::Connectivity("insert stalled".to_string()));
        }
        self.gate()?;
        self.inner.insert(record)
    }
    fn save(&self, record: &Record) -> AppResult<()> {
        self.gate()?;
        self.inner.save(record)
    }
    fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool> {
        self.gate()?;
        self.inner.delete(kind, id)
    }
}

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<Switchable>,
    facade: StorageFacade,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let store = Switchable::new(&settings.database_path, true);
        let facade = StorageFacade::open(store.clone(), settings).await.expect("open facade");
        Self { dir, store, facade }
    }

    /// Another writer on the same database, unaffected by the switch.
    fn other_actor(&self) -> Database {
        Database::open(&self.dir.path().join("store.db"), Duration::from_millis(200)).expect("second connection")
    }
}

fn settings(root: &Path) -> StoreSettings {
    StoreSettings {
        database_path: root.join("store.db"),
        operation_timeout_ms: 2_000,
        probe_timeout_ms: 1_000,
        ..StoreSettings::default()
    }
}

fn object(value: Value) -> Map<String, Value> {
    serde_json::from_value(value).expect("json object")
}

/// Applies `patch` through `db` the way an independent client would, bumping the version.
fn remote_update(db: &Database, id: &str, patch: Patch) -> Record {
    let current = db.fetch(patch.kind(), id).expect("fetch").expect("record exists");
    let mut next = current.with_patch(&patch).expect("patch applies");
    next.set_version(next_version(Some(current.version())));
    db.save(&next).expect("remote save");
    next
}

fn problem_draft(id: &str, description: &str) -> NewProblem {
    NewProblem {
        id: Some(id.to_string()),
        problem_type: "high_memory".to_string(),
        severity: ProblemSeverity::Medium,
        description: description.to_string(),
        tags: Vec::new(),
        metadata: Map::new(),
        detected_at: None,
    }
}

fn plugin_draft(id: &str, config: Value) -> NewPlugin {
    NewPlugin {
        id: Some(id.to_string()),
        name: "prometheus_collector".to_string(),
        version: "1.0.0".to_string(),
        plugin_type: PluginType::MetricsCollector,
        enabled: true,
        config: object(config),
        capabilities: Vec::new(),
    }
}

#[tokio::test]
async fn divergent_profile_update_unions_scenarios_and_merges_expectations() {
    let h = Harness::start().await;
    let profile = h
        .facade
        .create_test_profile(NewTestProfile {
            id: Some("P".to_string()),
            name: "checkout".to_string(),
            description: None,
            scenarios: vec![json!({ "s": 1 })],
            expectations: Map::new(),
        })
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_test_profile(
            "P",
            TestProfilePatch {
                scenarios: Some(vec![json!({ "s": 2 })]),
                expectations: Some(object(json!({ "y": 2 }))),
                ..TestProfilePatch::default()
            },
        )
        .await
        .expect("queued update");
    assert!(h.facade.is_offline());
    assert_eq!(h.facade.get_offline_ops_snapshot().await[0].base_timestamp, Some(profile.updated_at));

    remote_update(
        &h.other_actor(),
        "P",
        Patch::TestProfile(TestProfilePatch {
            scenarios: Some(vec![json!({ "s": 3 })]),
            expectations: Some(object(json!({ "z": 3 }))),
            ..TestProfilePatch::default()
        }),
    );

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.remaining, 0);
    assert!(!h.facade.is_offline());

    let merged = h.facade.get_test_profile("P").await.expect("get").expect("present");
    for expected in [json!({ "s": 1 }), json!({ "s": 2 }), json!({ "s": 3 })] {
        assert!(merged.scenarios.contains(&expected), "missing {expected}");
    }
    assert_eq!(merged.scenarios.len(), 3);
    assert!(merged.expectations.contains_key("y"));
    assert!(merged.expectations.contains_key("z"));

    let conflicts = h.facade.get_offline_conflicts_snapshot().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity, EntityKind::TestProfile);
    assert_eq!(conflicts[0].entity_id, "P");
    assert_eq!(conflicts[0].resolution_strategy.get("scenarios"), Some(&MergeStrategy::Union));
    assert_eq!(
        conflicts[0].resolution_strategy.get("expectations"),
        Some(&MergeStrategy::ObjectMerge)
    );
    assert_eq!(conflicts[0].merged_timestamp, Some(merged.updated_at));
    assert!(merged.updated_at > conflicts[0].remote_timestamp);
}

#[tokio::test]
async fn divergent_plugin_config_keeps_keys_from_all_three_versions() {
    let h = Harness::start().await;
    h.facade
        .create_plugin(plugin_draft("pl-1", json!({ "a": 1 })))
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_plugin(
            "pl-1",
            PluginPatch {
                config: Some(object(json!({ "b": 2 }))),
                ..PluginPatch::default()
            },
        )
        .await
        .expect("queued update");

    remote_update(
        &h.other_actor(),
        "pl-1",
        Patch::Plugin(PluginPatch {
            config: Some(object(json!({ "c": 3 }))),
            ..PluginPatch::default()
        }),
    );

    h.store.set_online(true);
    h.facade.trigger_resync().await.expect("resync");

    let merged = h.facade.get_plugin("pl-1").await.expect("get").expect("present");
    assert_eq!(Value::Object(merged.config), json!({ "a": 1, "b": 2, "c": 3 }));
    let conflicts = h.facade.get_offline_conflicts_snapshot().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].entity, EntityKind::Plugin);
}

#[tokio::test]
async fn unreachable_backend_queues_writes_across_kinds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = settings(dir.path());
    config.database_path = dir.path().join("not-mounted").join("store.db");
    let facade = StorageFacade::open_sqlite(config).await.expect("open while unreachable");
    assert!(facade.is_offline());

    facade
        .create_test_profile(NewTestProfile {
            id: Some("tp-1".to_string()),
            name: "smoke".to_string(),
            ..NewTestProfile::default()
        })
        .await
        .expect("queued profile");
    facade
        .create_problem(problem_draft("pr-1", "swap usage rising"))
        .await
        .expect("queued problem");
    facade
        .create_log_entry(NewLogEntry {
            id: Some("log-1".to_string()),
            timestamp: Utc::now(),
            level: "ERROR".to_string(),
            message: "OOM killer invoked".to_string(),
            source: "/var/log/syslog".to_string(),
            raw_line: "kernel: Out of memory".to_string(),
            metadata: Map::new(),
        })
        .await
        .expect("queued log entry");

    assert!(facade.is_offline());
    let ops = facade.get_offline_ops_snapshot().await;
    assert_eq!(ops.len(), 3);
    let kinds: HashSet<EntityKind> = ops.iter().map(|op| op.entity).collect();
    assert_eq!(kinds.len(), 3);

    std::fs::create_dir_all(dir.path().join("not-mounted")).expect("mount");
    let report = facade.trigger_resync().await.expect("resync");
    assert_eq!(report.applied, 3);
    assert_eq!(report.remaining, 0);
    assert!(!facade.is_offline());
    assert!(facade.get_log_entry("log-1").await.expect("get").is_some());
}

#[tokio::test]
async fn non_conflicting_resync_drains_queue_and_repeat_is_a_no_op() {
    let h = Harness::start().await;
    h.facade
        .create_problem(problem_draft("pr-1", "disk at 91%"))
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_problem(
            "pr-1",
            ProblemPatch {
                tags: Some(vec!["disk".to_string()]),
                ..ProblemPatch::default()
            },
        )
        .await
        .expect("queued update");
    h.facade
        .create_plugin(plugin_draft("pl-1", json!({})))
        .await
        .expect("queued create");

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.applied, 2);
    assert_eq!(report.conflicts, 0);
    assert!(h.facade.get_offline_ops_snapshot().await.is_empty());
    assert!(h.facade.get_offline_conflicts_snapshot().await.is_empty());

    let stored = h.facade.get_problem("pr-1").await.expect("get").expect("present");
    assert_eq!(stored.tags, vec!["disk"]);
    assert_eq!(stored.description, "disk at 91%");

    let again = h.facade.trigger_resync().await.expect("second resync");
    assert_eq!(again.applied, 0);
    assert!(h.facade.get_offline_conflicts_snapshot().await.is_empty());
}

#[tokio::test]
async fn operations_on_one_entity_replay_in_enqueue_order() {
    let h = Harness::start().await;
    h.store.set_online(false);
    h.facade
        .create_plugin(plugin_draft("pl-1", json!({ "interval": 15 })))
        .await
        .expect("queued create");
    h.facade
        .update_plugin(
            "pl-1",
            PluginPatch {
                version: Some("1.1.0".to_string()),
                ..PluginPatch::default()
            },
        )
        .await
        .expect("first update");
    h.facade
        .update_plugin(
            "pl-1",
            PluginPatch {
                version: Some("1.2.0".to_string()),
                enabled: Some(false),
                ..PluginPatch::default()
            },
        )
        .await
        .expect("second update");
    h.facade
        .create_problem(problem_draft("pr-1", "collector down"))
        .await
        .expect("queued problem");
    h.facade.delete_problem("pr-1").await.expect("queued delete");

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.applied, 5);
    assert_eq!(report.conflicts, 0);

    let plugin = h.facade.get_plugin("pl-1").await.expect("get").expect("present");
    assert_eq!(plugin.version, "1.2.0");
    assert!(!plugin.enabled);
    assert!(h.facade.get_problem("pr-1").await.expect("get").is_none());
}

#[tokio::test]
async fn stale_delete_leaves_newer_remote_record_intact() {
    let h = Harness::start().await;
    h.facade
        .create_problem(problem_draft("pr-1", "latency spike"))
        .await
        .expect("create online");

    h.store.set_online(false);
    assert!(h.facade.delete_problem("pr-1").await.expect("queued delete"));
    assert!(h.facade.get_problem("pr-1").await.expect("cached").is_none());

    remote_update(
        &h.other_actor(),
        "pr-1",
        Patch::Problem(ProblemPatch {
            severity: Some(ProblemSeverity::Critical),
            ..ProblemPatch::default()
        }),
    );

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.conflicts, 1);

    let survivor = h.facade.get_problem("pr-1").await.expect("get").expect("not deleted");
    assert_eq!(survivor.severity, ProblemSeverity::Critical);
    let conflicts = h.facade.get_offline_conflicts_snapshot().await;
    assert_eq!(conflicts[0].outcome, ConflictOutcome::DeleteSuppressed);
}

#[tokio::test]
async fn scalar_touched_by_both_writers_keeps_remote_value() {
    let h = Harness::start().await;
    h.facade
        .create_problem(problem_draft("pr-1", "original"))
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_problem(
            "pr-1",
            ProblemPatch {
                description: Some("offline edit".to_string()),
                ..ProblemPatch::default()
            },
        )
        .await
        .expect("queued update");
    remote_update(
        &h.other_actor(),
        "pr-1",
        Patch::Problem(ProblemPatch {
            description: Some("remote edit".to_string()),
            ..ProblemPatch::default()
        }),
    );

    h.store.set_online(true);
    h.facade.trigger_resync().await.expect("resync");

    let merged = h.facade.get_problem("pr-1").await.expect("get").expect("present");
    assert_eq!(merged.description, "remote edit");
    let conflicts = h.facade.get_offline_conflicts_snapshot().await;
    assert_eq!(conflicts[0].resolved_fields, vec!["description".to_string()]);
    assert_eq!(
        conflicts[0].resolution_strategy.get("description"),
        Some(&MergeStrategy::RemoteWins)
    );
}

#[tokio::test]
async fn update_of_remotely_deleted_record_is_quarantined() {
    let h = Harness::start().await;
    h.facade
        .create_plugin(plugin_draft("pl-1", json!({})))
        .await
        .expect("create online");
    h.facade
        .create_plugin(plugin_draft("pl-2", json!({})))
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_plugin(
            "pl-1",
            PluginPatch {
                enabled: Some(false),
                ..PluginPatch::default()
            },
        )
        .await
        .expect("queued update");
    h.facade
        .update_plugin(
            "pl-2",
            PluginPatch {
                enabled: Some(false),
                ..PluginPatch::default()
            },
        )
        .await
        .expect("queued update");
    assert!(h.other_actor().delete(EntityKind::Plugin, "pl-1").expect("remote delete"));

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert!(!report.aborted);
    assert!(!h.facade.is_offline());

    let ops = h.facade.get_offline_ops_snapshot().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(h.facade.get_replay_failures_snapshot().await.len(), 1);

    // Quarantined until someone intervenes.
    let idle = h.facade.trigger_resync().await.expect("idle resync");
    assert_eq!(idle.remaining, 1);
    assert_eq!(idle.failed, 0);

    let discarded = h.facade.discard_operation(&ops[0].id).await.expect("discard");
    assert_eq!(discarded.entity_id, "pl-1");
    assert!(h.facade.get_offline_ops_snapshot().await.is_empty());
}

#[tokio::test]
async fn concurrent_resync_and_writes_leave_a_consistent_store() {
    let h = Harness::start().await;
    h.store.set_online(false);
    for index in 0..3 {
        h.facade
            .create_problem(problem_draft(&format!("pr-{index}"), "queued while offline"))
            .await
            .expect("queued create");
    }

    h.store.set_online(true);
    let first = h.facade.clone();
    let second = h.facade.clone();
    let writer = h.facade.clone();
    let (a, b, created) = tokio::join!(
        first.trigger_resync(),
        second.trigger_resync(),
        writer.create_problem(problem_draft("pr-live", "written during resync")),
    );
    let a = a.expect("first resync");
    let b = b.expect("second resync");
    created.expect("concurrent create");

    assert_eq!(a.conflicts + b.conflicts, 0);
    assert!(h.facade.get_offline_ops_snapshot().await.is_empty());
    assert!(!h.facade.is_offline());
    assert_eq!(h.facade.list_problems().await.expect("list").len(), 4);
}

#[tokio::test]
async fn journaled_queue_is_replayed_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = settings(dir.path());
    config.journal_path = Some(dir.path().join("queue.jsonl"));

    {
        let store = Switchable::new(&config.database_path, false);
        let facade = StorageFacade::open(store, config.clone()).await.expect("open offline");
        assert!(facade.is_offline());
        facade
            .create_problem(problem_draft("pr-1", "captured before restart"))
            .await
            .expect("queued create");
        assert_eq!(facade.get_offline_ops_snapshot().await.len(), 1);
    }

    let store = Switchable::new(&config.database_path, true);
    let facade = StorageFacade::open(store, config).await.expect("reopen online");
    assert!(!facade.is_offline());
    assert!(facade.get_offline_ops_snapshot().await.is_empty());
    let restored = facade.get_problem("pr-1").await.expect("get").expect("replayed");
    assert_eq!(restored.description, "captured before restart");
}

#[tokio::test]
async fn offline_reads_serve_known_records_and_refuse_unknown_ones() {
    let h = Harness::start().await;
    h.facade
        .create_plugin(plugin_draft("pl-1", json!({})))
        .await
        .expect("create online");
    h.store.set_online(false);

    let cached = h.facade.get_plugin("pl-1").await.expect("served from cache");
    assert!(cached.is_some());
    assert_eq!(h.facade.list_plugins().await.expect("cached list").len(), 1);
    assert!(h.facade.is_offline());

    let err = h.facade.get_plugin("pl-unknown").await.expect_err("unknown while offline");
    assert!(matches!(err, AppError::Unavailable(_)));
}

#[tokio::test]
async fn store_call_past_its_deadline_is_queued_like_an_outage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreSettings {
        operation_timeout_ms: 100,
        ..settings(dir.path())
    };
    let store = Switchable::new(&config.database_path, true);
    let facade = StorageFacade::open(store.clone(), config).await.expect("open facade");

    store.stall_inserts.store(true, Ordering::SeqCst);
    let created = facade
        .create_problem(problem_draft("pr-1", "collector unresponsive"))
        .await
        .expect("create answered from the queue");
    assert_eq!(created.description, "collector unresponsive");
    assert!(facade.is_offline());
    assert_eq!(facade.get_offline_ops_snapshot().await.len(), 1);

    store.stall_inserts.store(false, Ordering::SeqCst);
    let report = facade.trigger_resync().await.expect("resync");
    assert_eq!(report.applied, 1);
    assert_eq!(report.conflicts, 0);
    assert!(!facade.is_offline());
    assert!(facade.get_problem("pr-1").await.expect("get").is_some());
}

#[tokio::test]
async fn retried_operation_replays_and_conflicts_can_be_cleared() {
    let h = Harness::start().await;
    h.facade
        .create_plugin(plugin_draft("pl-1", json!({})))
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_plugin(
            "pl-1",
            PluginPatch {
                enabled: Some(false),
                ..PluginPatch::default()
            },
        )
        .await
        .expect("queued update");
    let remote = h.other_actor();
    assert!(remote.delete(EntityKind::Plugin, "pl-1").expect("remote delete"));

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.failed, 1);
    assert_eq!(h.facade.get_replay_failures_snapshot().await.len(), 1);

    remote
        .insert(&plugin_draft("pl-1", json!({})).into_record("pl-1".to_string(), Utc::now()))
        .expect("remote re-create");
    assert_eq!(h.facade.retry_failed_operations().await, 1);
    assert_eq!(h.facade.get_offline_ops_snapshot().await[0].status, OperationStatus::Pending);

    let retried = h.facade.trigger_resync().await.expect("retried resync");
    assert_eq!(retried.remaining, 0);
    assert_eq!(retried.conflicts, 1);
    let plugin = h.facade.get_plugin("pl-1").await.expect("get").expect("present");
    assert!(!plugin.enabled);
    assert_eq!(h.facade.get_entity_conflicts(EntityKind::Plugin, "pl-1").await.len(), 1);
    assert!(h.facade.get_entity_conflicts(EntityKind::Plugin, "pl-2").await.is_empty());

    assert_eq!(h.facade.clear_conflicts().await, 1);
    assert!(h.facade.get_offline_conflicts_snapshot().await.is_empty());
    assert!(h.facade.get_replay_failures_snapshot().await.is_empty());
    assert_eq!(h.facade.clear_conflicts().await, 0);
}

#[tokio::test]
async fn divergent_metric_metadata_is_merged_key_by_key() {
    let h = Harness::start().await;
    h.facade
        .create_metric_snapshot(NewMetricSnapshot {
            id: Some("m-1".to_string()),
            timestamp: Utc::now(),
            cpu_usage: 42.5,
            memory_usage: 61.0,
            disk_usage: 77.25,
            load_average: 1.5,
            network_connections: 128,
            processes: 312,
            metadata: object(json!({ "host": "edge-1" })),
        })
        .await
        .expect("create online");

    h.store.set_online(false);
    h.facade
        .update_metric_snapshot(
            "m-1",
            MetricSnapshotPatch {
                metadata: Some(object(json!({ "host": "edge-1", "collector": "psutil" }))),
            },
        )
        .await
        .expect("queued update");
    remote_update(
        &h.other_actor(),
        "m-1",
        Patch::MetricSnapshot(MetricSnapshotPatch {
            metadata: Some(object(json!({ "host": "edge-1", "region": "eu-west" }))),
        }),
    );

    h.store.set_online(true);
    let report = h.facade.trigger_resync().await.expect("resync");
    assert_eq!(report.conflicts, 1);

    let merged = h.facade.get_metric_snapshot("m-1").await.expect("get").expect("present");
    assert_eq!(
        Value::Object(merged.metadata),
        json!({ "host": "edge-1", "collector": "psutil", "region": "eu-west" })
    );
    assert_eq!(merged.cpu_usage, 42.5);
    let conflicts = h.facade.get_entity_conflicts(EntityKind::MetricSnapshot, "m-1").await;
    assert_eq!(
        conflicts[0].resolution_strategy.get("metadata"),
        Some(&MergeStrategy::ObjectMerge)
    );
    assert_eq!(h.facade.list_metric_snapshots().await.expect("list").len(), 1);
}
