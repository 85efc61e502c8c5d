use crate::errors::{AppError, AppResult};
use crate::models::{
    EntityKind, LogEntry, MetricSnapshot, Plugin, PluginType, Problem, ProblemSeverity, ProblemStatus, Record,
    TestProfile,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The relational store behind the facade. Implementations report an
/// unreachable store as `AppError::Connectivity`; every other failure is a
/// failure of the request itself.
pub trait BackingStore: Send + Sync {
    fn probe(&self) -> AppResult<()>;
    fn fetch(&self, kind: EntityKind, id: &str) -> AppResult<Option<Record>>;
    fn list(&self, kind: EntityKind) -> AppResult<Vec<Record>>;
    /// Fails if a record with the same id already exists.
    fn insert(&self, record: &Record) -> AppResult<()>;
    /// Writes the full record, replacing any existing row.
    fn save(&self, record: &Record) -> AppResult<()>;
    /// Returns whether a row was removed.
    fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool>;
}

/// SQLite-backed store. The connection is opened lazily and dropped after a
/// connectivity failure, so a store whose directory disappears and comes
/// back is picked up again on the next call. The parent directory is never
/// created here: its absence means the store is unreachable.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Option<Connection>>,
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    pub fn new(path: &Path, busy_timeout: Duration) -> Self {
        Self {
            conn: Mutex::new(None),
            db_path: path.to_path_buf(),
            busy_timeout,
        }
    }

    /// Like `new`, but connects immediately and fails if the store is unreachable.
    pub fn open(path: &Path, busy_timeout: Duration) -> AppResult<Self> {
        let db = Self::new(path, busy_timeout);
        db.probe()?;
        Ok(db)
    }

    fn connect(&self) -> AppResult<Connection> {
        let conn = Connection::open(&self.db_path).map_err(AppError::from)?;
        conn.busy_timeout(self.busy_timeout).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        tracing::debug!(path = %self.db_path.to_string_lossy(), "opened backing store connection");
        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let result = match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(AppError::Internal("connection missing after connect".to_string())),
        };
        if let Err(error) = &result {
            if error.is_connectivity() {
                tracing::debug!(error = %error, "dropping backing store connection");
                *guard = None;
            }
        }
        result
    }
}

impl BackingStore for Database {
    fn probe(&self) -> AppResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn fetch(&self, kind: EntityKind, id: &str) -> AppResult<Option<Record>> {
        self.with_conn(|conn| {
            let record = match kind {
                EntityKind::TestProfile => conn
                    .query_row(
                        "SELECT id, name, description, scenarios_json, expectations_json, updated_at
                         FROM test_profiles WHERE id = ?1",
                        [id],
                        parse_test_profile_row,
                    )
                    .optional()?
                    .map(Record::TestProfile),
                EntityKind::Problem => conn
                    .query_row(
                        "SELECT id, problem_type, severity, description, status, tags_json, metadata_json,
                                detected_at, updated_at
                         FROM problems WHERE id = ?1",
                        [id],
                        parse_problem_row,
                    )
                    .optional()?
                    .map(Record::Problem),
                EntityKind::LogEntry => conn
                    .query_row(
                        "SELECT id, timestamp, level, message, source, raw_line, metadata_json, updated_at
                         FROM log_entries WHERE id = ?1",
                        [id],
                        parse_log_entry_row,
                    )
                    .optional()?
                    .map(Record::LogEntry),
                EntityKind::Plugin => conn
                    .query_row(
                        "SELECT id, name, version, plugin_type, enabled, config_json, capabilities_json, last_update
                         FROM plugins WHERE id = ?1",
                        [id],
                        parse_plugin_row,
                    )
                    .optional()?
                    .map(Record::Plugin),
                EntityKind::MetricSnapshot => conn
                    .query_row(
                        "SELECT id, timestamp, cpu_usage, memory_usage, disk_usage, load_average,
                                network_connections, processes, metadata_json, updated_at
                         FROM metric_snapshots WHERE id = ?1",
                        [id],
                        parse_metric_snapshot_row,
                    )
                    .optional()?
                    .map(Record::MetricSnapshot),
            };
            Ok(record)
        })
    }

    fn list(&self, kind: EntityKind) -> AppResult<Vec<Record>> {
        self.with_conn(|conn| {
            let records = match kind {
                EntityKind::TestProfile => {
                    let mut statement = conn.prepare(
                        "SELECT id, name, description, scenarios_json, expectations_json, updated_at
                         FROM test_profiles ORDER BY updated_at DESC",
                    )?;
                    let rows = statement
                        .query_map([], parse_test_profile_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(Record::TestProfile).collect()
                }
                EntityKind::Problem => {
                    let mut statement = conn.prepare(
                        "SELECT id, problem_type, severity, description, status, tags_json, metadata_json,
                                detected_at, updated_at
                         FROM problems ORDER BY detected_at DESC",
                    )?;
                    let rows = statement
                        .query_map([], parse_problem_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(Record::Problem).collect()
                }
                EntityKind::LogEntry => {
                    let mut statement = conn.prepare(
                        "SELECT id, timestamp, level, message, source, raw_line, metadata_json, updated_at
                         FROM log_entries ORDER BY timestamp DESC",
                    )?;
                    let rows = statement
                        .query_map([], parse_log_entry_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(Record::LogEntry).collect()
                }
                EntityKind::Plugin => {
                    let mut statement = conn.prepare(
                        "SELECT id, name, version, plugin_type, enabled, config_json, capabilities_json, last_update
                         FROM plugins ORDER BY name ASC",
                    )?;
                    let rows = statement
                        .query_map([], parse_plugin_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(Record::Plugin).collect()
                }
                EntityKind::MetricSnapshot => {
                    let mut statement = conn.prepare(
                        "SELECT id, timestamp, cpu_usage, memory_usage, disk_usage, load_average,
                                network_connections, processes, metadata_json, updated_at
                         FROM metric_snapshots ORDER BY timestamp DESC",
                    )?;
                    let rows = statement
                        .query_map([], parse_metric_snapshot_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(Record::MetricSnapshot).collect()
                }
            };
            Ok(records)
        })
    }

    fn insert(&self, record: &Record) -> AppResult<()> {
        self.with_conn(|conn| write_record(conn, record, false))
    }

    fn save(&self, record: &Record) -> AppResult<()> {
        self.with_conn(|conn| write_record(conn, record, true))
    }

    fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", table_name(kind));
        self.with_conn(|conn| {
            let changed = conn.execute(&sql, [id])?;
            Ok(changed > 0)
        })
    }
}

/// Runs `f` against the store on the blocking pool, bounded by `limit`.
/// Running out of time counts as the store being unreachable.
pub async fn call_with_timeout<T, F>(store: &Arc<dyn BackingStore>, limit: Duration, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn BackingStore) -> AppResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let task = tokio::task::spawn_blocking(move || f(store.as_ref()));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(AppError::Internal(format!("store task failed: {join_error}"))),
        Err(_) => Err(AppError::Connectivity(format!(
            "store call exceeded {} ms",
            limit.as_millis()
        ))),
    }
}

fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::TestProfile => "test_profiles",
        EntityKind::Problem => "problems",
        EntityKind::LogEntry => "log_entries",
        EntityKind::Plugin => "plugins",
        EntityKind::MetricSnapshot => "metric_snapshots",
    }
}

fn write_record(conn: &Connection, record: &Record, upsert: bool) -> AppResult<()> {
    match record {
        Record::TestProfile(profile) => {
            let mut sql = String::from(
                "INSERT INTO test_profiles (id, name, description, scenarios_json, expectations_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description,
                      scenarios_json = excluded.scenarios_json, expectations_json = excluded.expectations_json,
                      updated_at = excluded.updated_at",
                );
            }
            conn.execute(
                &sql,
                params![
                    profile.id,
                    profile.name,
                    profile.description,
                    serde_json::to_string(&profile.scenarios)?,
                    serde_json::to_string(&profile.expectations)?,
                    format_time(&profile.updated_at),
                ],
            )?;
        }
        Record::Problem(problem) => {
            let mut sql = String::from(
                "INSERT INTO problems (
                   id, problem_type, severity, description, status, tags_json, metadata_json, detected_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT(id) DO UPDATE SET problem_type = excluded.problem_type,
                      severity = excluded.severity, description = excluded.description, status = excluded.status,
                      tags_json = excluded.tags_json, metadata_json = excluded.metadata_json,
                      detected_at = excluded.detected_at, updated_at = excluded.updated_at",
                );
            }
            conn.execute(
                &sql,
                params![
                    problem.id,
                    problem.problem_type,
                    problem.severity.as_str(),
                    problem.description,
                    problem.status.as_str(),
                    serde_json::to_string(&problem.tags)?,
                    serde_json::to_string(&problem.metadata)?,
                    format_time(&problem.detected_at),
                    format_time(&problem.updated_at),
                ],
            )?;
        }
        Record::LogEntry(entry) => {
            let mut sql = String::from(
                "INSERT INTO log_entries (id, timestamp, level, message, source, raw_line, metadata_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT(id) DO UPDATE SET timestamp = excluded.timestamp, level = excluded.level,
                      message = excluded.message, source = excluded.source, raw_line = excluded.raw_line,
                      metadata_json = excluded.metadata_json, updated_at = excluded.updated_at",
                );
            }
            conn.execute(
                &sql,
                params![
                    entry.id,
                    format_time(&entry.timestamp),
                    entry.level,
                    entry.message,
                    entry.source,
                    entry.raw_line,
                    serde_json::to_string(&entry.metadata)?,
                    format_time(&entry.updated_at),
                ],
            )?;
        }
        Record::Plugin(plugin) => {
            let mut sql = String::from(
                "INSERT INTO plugins (id, name, version, plugin_type, enabled, config_json, capabilities_json, last_update)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT(id) DO UPDATE SET name = excluded.name, version = excluded.version,
                      plugin_type = excluded.plugin_type, enabled = excluded.enabled,
                      config_json = excluded.config_json, capabilities_json = excluded.capabilities_json,
                      last_update = excluded.last_update",
                );
            }
            conn.execute(
                &sql,
                params![
                    plugin.id,
                    plugin.name,
                    plugin.version,
                    plugin.plugin_type.as_str(),
                    if plugin.enabled { 1 } else { 0 },
                    serde_json::to_string(&plugin.config)?,
                    serde_json::to_string(&plugin.capabilities)?,
                    format_time(&plugin.last_update),
                ],
            )?;
        }
        Record::MetricSnapshot(snapshot) => {
            let mut sql = String::from(
                "INSERT INTO metric_snapshots (
                   id, timestamp, cpu_usage, memory_usage, disk_usage, load_average, network_connections,
                   processes, metadata_json, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            );
            if upsert {
                sql.push_str(
                    " ON CONFLICT(id) DO UPDATE SET timestamp = excluded.timestamp,
                      cpu_usage = excluded.cpu_usage, memory_usage = excluded.memory_usage,
                      disk_usage = excluded.disk_usage, load_average = excluded.load_average,
                      network_connections = excluded.network_connections, processes = excluded.processes,
                      metadata_json = excluded.metadata_json, updated_at = excluded.updated_at",
                );
            }
            conn.execute(
                &sql,
                params![
                    snapshot.id,
                    format_time(&snapshot.timestamp),
                    snapshot.cpu_usage,
                    snapshot.memory_usage,
                    snapshot.disk_usage,
                    snapshot.load_average,
                    snapshot.network_connections,
                    snapshot.processes,
                    serde_json::to_string(&snapshot.metadata)?,
                    format_time(&snapshot.updated_at),
                ],
            )?;
        }
    }
    Ok(())
}

fn parse_test_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestProfile> {
    Ok(TestProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        scenarios: parse_json(&row.get::<_, String>(3)?, 3)?,
        expectations: parse_json(&row.get::<_, String>(4)?, 4)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_problem_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Problem> {
    Ok(Problem {
        id: row.get(0)?,
        problem_type: row.get(1)?,
        severity: parse_severity(&row.get::<_, String>(2)?)?,
        description: row.get(3)?,
        status: parse_problem_status(&row.get::<_, String>(4)?),
        tags: parse_json(&row.get::<_, String>(5)?, 5)?,
        metadata: parse_json(&row.get::<_, String>(6)?, 6)?,
        detected_at: parse_time(&row.get::<_, String>(7)?)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_log_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: parse_time(&row.get::<_, String>(1)?)?,
        level: row.get(2)?,
        message: row.get(3)?,
        source: row.get(4)?,
        raw_line: row.get(5)?,
        metadata: parse_json(&row.get::<_, String>(6)?, 6)?,
        updated_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_plugin_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plugin> {
    Ok(Plugin {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        plugin_type: parse_plugin_type(&row.get::<_, String>(3)?)?,
        enabled: row.get::<_, i32>(4)? != 0,
        config: parse_json(&row.get::<_, String>(5)?, 5)?,
        capabilities: parse_json(&row.get::<_, String>(6)?, 6)?,
        last_update: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_metric_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSnapshot> {
    Ok(MetricSnapshot {
        id: row.get(0)?,
        timestamp: parse_time(&row.get::<_, String>(1)?)?,
        cpu_usage: row.get(2)?,
        memory_usage: row.get(3)?,
        disk_usage: row.get(4)?,
        load_average: row.get(5)?,
        network_connections: row.get(6)?,
        processes: row.get(7)?,
        metadata: parse_json(&row.get::<_, String>(8)?, 8)?,
        updated_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, column: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
    })
}

fn parse_severity(raw: &str) -> rusqlite::Result<ProblemSeverity> {
    match raw {
        "LOW" => Ok(ProblemSeverity::Low),
        "MEDIUM" => Ok(ProblemSeverity::Medium),
        "HIGH" => Ok(ProblemSeverity::High),
        "CRITICAL" => Ok(ProblemSeverity::Critical),
        other => Err(invalid_text(format!("Unknown severity '{}'", other))),
    }
}

fn parse_problem_status(raw: &str) -> ProblemStatus {
    match raw {
        "acknowledged" => ProblemStatus::Acknowledged,
        "resolved" => ProblemStatus::Resolved,
        _ => ProblemStatus::Open,
    }
}

fn parse_plugin_type(raw: &str) -> rusqlite::Result<PluginType> {
    match raw {
        "metrics_collector" => Ok(PluginType::MetricsCollector),
        "problem_detector" => Ok(PluginType::ProblemDetector),
        "remediator" => Ok(PluginType::Remediator),
        "notifier" => Ok(PluginType::Notifier),
        other => Err(invalid_text(format!("Unknown plugin type '{}'", other))),
    }
}

fn invalid_text(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Fixed-width RFC3339 so TEXT ordering matches time ordering.
fn format_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_text(error.to_string()))
}
