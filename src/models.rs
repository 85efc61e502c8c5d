use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    TestProfile,
    Problem,
    LogEntry,
    Plugin,
    MetricSnapshot,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestProfile => "test_profile",
            Self::Problem => "problem",
            Self::LogEntry => "log_entry",
            Self::Plugin => "plugin",
            Self::MetricSnapshot => "metric_snapshot",
        }
    }

    pub fn primary_key_field(self) -> &'static str {
        "id"
    }

    /// Name of the field that carries the record's version marker.
    pub fn version_field(self) -> &'static str {
        match self {
            Self::Plugin => "lastUpdate",
            Self::TestProfile | Self::Problem | Self::LogEntry | Self::MetricSnapshot => "updatedAt",
        }
    }

    /// How a field of this kind is reconciled when two writers touched it.
    pub fn field_rule(self, field: &str) -> FieldRule {
        match (self, field) {
            (Self::TestProfile, "scenarios") => FieldRule::Array { key: Some("id") },
            (Self::TestProfile, "expectations") => FieldRule::Object,
            (Self::Problem, "tags") => FieldRule::Array { key: None },
            (Self::Problem, "metadata") => FieldRule::Object,
            (Self::LogEntry, "metadata") => FieldRule::Object,
            (Self::Plugin, "config") => FieldRule::Object,
            (Self::Plugin, "capabilities") => FieldRule::Array { key: None },
            (Self::MetricSnapshot, "metadata") => FieldRule::Object,
            _ => FieldRule::Scalar,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Ordered collection; elements are matched by `key` when both carry it,
    /// structurally otherwise.
    Array { key: Option<&'static str> },
    Object,
    Scalar,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scenarios: Vec<Value>,
    #[serde(default)]
    pub expectations: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ProblemSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl ProblemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    #[serde(rename = "type")]
    pub problem_type: String,
    pub severity: ProblemSeverity,
    pub description: String,
    pub status: ProblemStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub source: String,
    #[serde(default)]
    pub raw_line: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    MetricsCollector,
    ProblemDetector,
    Remediator,
    Notifier,
}

impl PluginType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetricsCollector => "metrics_collector",
            Self::ProblemDetector => "problem_detector",
            Self::Remediator => "remediator",
            Self::Notifier => "notifier",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_update: DateTime<Utc>,
}

/// One collection cycle of host metrics. Collector errors and extra
/// collector output live in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub load_average: f64,
    pub network_connections: u32,
    pub processes: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted record of any supported kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "record", rename_all = "snake_case")]
pub enum Record {
    TestProfile(TestProfile),
    Problem(Problem),
    LogEntry(LogEntry),
    Plugin(Plugin),
    MetricSnapshot(MetricSnapshot),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::TestProfile(_) => EntityKind::TestProfile,
            Self::Problem(_) => EntityKind::Problem,
            Self::LogEntry(_) => EntityKind::LogEntry,
            Self::Plugin(_) => EntityKind::Plugin,
            Self::MetricSnapshot(_) => EntityKind::MetricSnapshot,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::TestProfile(record) => &record.id,
            Self::Problem(record) => &record.id,
            Self::LogEntry(record) => &record.id,
            Self::Plugin(record) => &record.id,
            Self::MetricSnapshot(record) => &record.id,
        }
    }

    pub fn version(&self) -> DateTime<Utc> {
        match self {
            Self::TestProfile(record) => record.updated_at,
            Self::Problem(record) => record.updated_at,
            Self::LogEntry(record) => record.updated_at,
            Self::Plugin(record) => record.last_update,
            Self::MetricSnapshot(record) => record.updated_at,
        }
    }

    pub fn set_version(&mut self, version: DateTime<Utc>) {
        match self {
            Self::TestProfile(record) => record.updated_at = version,
            Self::Problem(record) => record.updated_at = version,
            Self::LogEntry(record) => record.updated_at = version,
            Self::Plugin(record) => record.last_update = version,
            Self::MetricSnapshot(record) => record.updated_at = version,
        }
    }

    /// Field map in the record's wire shape (camelCase keys).
    pub fn to_fields(&self) -> AppResult<Map<String, Value>> {
        let value = match self {
            Self::TestProfile(record) => serde_json::to_value(record)?,
            Self::Problem(record) => serde_json::to_value(record)?,
            Self::LogEntry(record) => serde_json::to_value(record)?,
            Self::Plugin(record) => serde_json::to_value(record)?,
            Self::MetricSnapshot(record) => serde_json::to_value(record)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(AppError::Internal(format!("{} did not serialize to an object", self.kind()))),
        }
    }

    pub fn from_fields(kind: EntityKind, fields: Map<String, Value>) -> AppResult<Self> {
        let value = Value::Object(fields);
        let record = match kind {
            EntityKind::TestProfile => Self::TestProfile(serde_json::from_value(value)?),
            EntityKind::Problem => Self::Problem(serde_json::from_value(value)?),
            EntityKind::LogEntry => Self::LogEntry(serde_json::from_value(value)?),
            EntityKind::Plugin => Self::Plugin(serde_json::from_value(value)?),
            EntityKind::MetricSnapshot => Self::MetricSnapshot(serde_json::from_value(value)?),
        };
        Ok(record)
    }

    /// Equality ignoring the version marker.
    pub fn same_content(&self, other: &Record) -> bool {
        let mut left = self.clone();
        left.set_version(other.version());
        &left == other
    }

    /// Returns a copy with every field set by `patch` overwritten.
    pub fn with_patch(&self, patch: &Patch) -> AppResult<Record> {
        let mut next = self.clone();
        match (&mut next, patch) {
            (Self::TestProfile(record), Patch::TestProfile(patch)) => patch.apply_to(record),
            (Self::Problem(record), Patch::Problem(patch)) => patch.apply_to(record),
            (Self::LogEntry(record), Patch::LogEntry(patch)) => patch.apply_to(record),
            (Self::Plugin(record), Patch::Plugin(patch)) => patch.apply_to(record),
            (Self::MetricSnapshot(record), Patch::MetricSnapshot(patch)) => patch.apply_to(record),
            (record, patch) => {
                return Err(AppError::Validation(format!(
                    "{} patch cannot be applied to a {} record",
                    patch.kind(),
                    record.kind()
                )))
            }
        }
        Ok(next)
    }

    pub fn into_test_profile(self) -> AppResult<TestProfile> {
        match self {
            Self::TestProfile(record) => Ok(record),
            other => Err(kind_mismatch(EntityKind::TestProfile, other.kind())),
        }
    }

    pub fn into_problem(self) -> AppResult<Problem> {
        match self {
            Self::Problem(record) => Ok(record),
            other => Err(kind_mismatch(EntityKind::Problem, other.kind())),
        }
    }

    pub fn into_log_entry(self) -> AppResult<LogEntry> {
        match self {
            Self::LogEntry(record) => Ok(record),
            other => Err(kind_mismatch(EntityKind::LogEntry, other.kind())),
        }
    }

    pub fn into_plugin(self) -> AppResult<Plugin> {
        match self {
            Self::Plugin(record) => Ok(record),
            other => Err(kind_mismatch(EntityKind::Plugin, other.kind())),
        }
    }

    pub fn into_metric_snapshot(self) -> AppResult<MetricSnapshot> {
        match self {
            Self::MetricSnapshot(record) => Ok(record),
            other => Err(kind_mismatch(EntityKind::MetricSnapshot, other.kind())),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.id().trim().is_empty() {
            return Err(AppError::Validation(format!("{} id must not be empty", self.kind())));
        }
        match self {
            Self::TestProfile(record) => require_text("test_profile.name", &record.name),
            Self::Problem(record) => {
                require_text("problem.type", &record.problem_type)?;
                require_text("problem.description", &record.description)
            }
            Self::LogEntry(record) => {
                require_text("log_entry.level", &record.level)?;
                require_text("log_entry.source", &record.source)
            }
            Self::Plugin(record) => {
                require_text("plugin.name", &record.name)?;
                require_text("plugin.version", &record.version)
            }
            Self::MetricSnapshot(record) => {
                require_percent("metric_snapshot.cpuUsage", record.cpu_usage)?;
                require_percent("metric_snapshot.memoryUsage", record.memory_usage)?;
                require_percent("metric_snapshot.diskUsage", record.disk_usage)?;
                if !record.load_average.is_finite() || record.load_average < 0.0 {
                    return Err(AppError::Validation(
                        "metric_snapshot.loadAverage must be a non-negative number".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn kind_mismatch(expected: EntityKind, found: EntityKind) -> AppError {
    AppError::Internal(format!("expected a {expected} record, found {found}"))
}

fn require_percent(field: &str, value: f64) -> AppResult<()> {
    if !(0.0..=100.0).contains(&value) {
        return Err(AppError::Validation(format!("{field} must be between 0 and 100")));
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectations: Option<Map<String, Value>>,
}

impl TestProfilePatch {
    fn apply_to(&self, target: &mut TestProfile) {
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(description) = &self.description {
            target.description = Some(description.clone());
        }
        if let Some(scenarios) = &self.scenarios {
            target.scenarios = scenarios.clone();
        }
        if let Some(expectations) = &self.expectations {
            target.expectations = expectations.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ProblemSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProblemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ProblemPatch {
    fn apply_to(&self, target: &mut Problem) {
        if let Some(problem_type) = &self.problem_type {
            target.problem_type = problem_type.clone();
        }
        if let Some(severity) = self.severity {
            target.severity = severity;
        }
        if let Some(description) = &self.description {
            target.description = description.clone();
        }
        if let Some(status) = self.status {
            target.status = status;
        }
        if let Some(tags) = &self.tags {
            target.tags = tags.clone();
        }
        if let Some(metadata) = &self.metadata {
            target.metadata = metadata.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl LogEntryPatch {
    fn apply_to(&self, target: &mut LogEntry) {
        if let Some(level) = &self.level {
            target.level = level.clone();
        }
        if let Some(message) = &self.message {
            target.message = message.clone();
        }
        if let Some(source) = &self.source {
            target.source = source.clone();
        }
        if let Some(metadata) = &self.metadata {
            target.metadata = metadata.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

impl PluginPatch {
    fn apply_to(&self, target: &mut Plugin) {
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(version) = &self.version {
            target.version = version.clone();
        }
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(config) = &self.config {
            target.config = config.clone();
        }
        if let Some(capabilities) = &self.capabilities {
            target.capabilities = capabilities.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshotPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl MetricSnapshotPatch {
    fn apply_to(&self, target: &mut MetricSnapshot) {
        if let Some(metadata) = &self.metadata {
            target.metadata = metadata.clone();
        }
    }
}

/// A partial write against one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "fields", rename_all = "snake_case")]
pub enum Patch {
    TestProfile(TestProfilePatch),
    Problem(ProblemPatch),
    LogEntry(LogEntryPatch),
    Plugin(PluginPatch),
    MetricSnapshot(MetricSnapshotPatch),
}

impl Patch {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::TestProfile(_) => EntityKind::TestProfile,
            Self::Problem(_) => EntityKind::Problem,
            Self::LogEntry(_) => EntityKind::LogEntry,
            Self::Plugin(_) => EntityKind::Plugin,
            Self::MetricSnapshot(_) => EntityKind::MetricSnapshot,
        }
    }

    /// Only the fields this patch sets.
    pub fn to_fields(&self) -> AppResult<Map<String, Value>> {
        let value = match self {
            Self::TestProfile(patch) => serde_json::to_value(patch)?,
            Self::Problem(patch) => serde_json::to_value(patch)?,
            Self::LogEntry(patch) => serde_json::to_value(patch)?,
            Self::Plugin(patch) => serde_json::to_value(patch)?,
            Self::MetricSnapshot(patch) => serde_json::to_value(patch)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(AppError::Internal(format!("{} patch did not serialize to an object", self.kind()))),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let fields = self.to_fields()?;
        if fields.is_empty() {
            return Err(AppError::Validation(format!("{} patch sets no fields", self.kind())));
        }
        for (field, value) in &fields {
            if let Value::String(text) = value {
                if text.trim().is_empty() && field != "description" {
                    return Err(AppError::Validation(format!(
                        "{}.{} must not be empty",
                        self.kind(),
                        field
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Drafts accepted by create calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTestProfile {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub scenarios: Vec<Value>,
    #[serde(default)]
    pub expectations: Map<String, Value>,
}

impl NewTestProfile {
    pub fn into_record(self, id: String, version: DateTime<Utc>) -> Record {
        Record::TestProfile(TestProfile {
            id,
            name: self.name,
            description: self.description,
            scenarios: self.scenarios,
            expectations: self.expectations,
            updated_at: version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProblem {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub problem_type: String,
    pub severity: ProblemSeverity,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub detected_at: Option<DateTime<Utc>>,
}

impl NewProblem {
    pub fn into_record(self, id: String, version: DateTime<Utc>) -> Record {
        Record::Problem(Problem {
            id,
            problem_type: self.problem_type,
            severity: self.severity,
            description: self.description,
            status: ProblemStatus::Open,
            tags: self.tags,
            metadata: self.metadata,
            detected_at: self.detected_at.unwrap_or(version),
            updated_at: version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLogEntry {
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub source: String,
    #[serde(default)]
    pub raw_line: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewLogEntry {
    pub fn into_record(self, id: String, version: DateTime<Utc>) -> Record {
        Record::LogEntry(LogEntry {
            id,
            timestamp: self.timestamp,
            level: self.level,
            message: self.message,
            source: self.source,
            raw_line: self.raw_line,
            metadata: self.metadata,
            updated_at: version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlugin {
    pub id: Option<String>,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl NewPlugin {
    pub fn into_record(self, id: String, version: DateTime<Utc>) -> Record {
        Record::Plugin(Plugin {
            id,
            name: self.name,
            version: self.version,
            plugin_type: self.plugin_type,
            enabled: self.enabled,
            config: self.config,
            capabilities: self.capabilities,
            last_update: version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMetricSnapshot {
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub load_average: f64,
    #[serde(default)]
    pub network_connections: u32,
    #[serde(default)]
    pub processes: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewMetricSnapshot {
    pub fn into_record(self, id: String, version: DateTime<Utc>) -> Record {
        Record::MetricSnapshot(MetricSnapshot {
            id,
            timestamp: self.timestamp,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            disk_usage: self.disk_usage,
            load_average: self.load_average,
            network_connections: self.network_connections,
            processes: self.processes,
            metadata: self.metadata,
            updated_at: version,
        })
    }
}

// ---------------------------------------------------------------------------
// Queue and audit types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// What a queued operation intends to write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    Create(Record),
    Update(Patch),
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub mutation: Mutation,
    /// Version the writer observed before the write was captured.
    pub base_timestamp: Option<DateTime<Utc>>,
    /// Full record the writer started from, when known; the merge base.
    pub base_snapshot: Option<Record>,
    /// Version stamped on the local echo handed back to the caller.
    pub local_version: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn op_type(&self) -> OperationType {
        match self.mutation {
            Mutation::Create(_) => OperationType::Create,
            Mutation::Update(_) => OperationType::Update,
            Mutation::Delete => OperationType::Delete,
        }
    }

    pub fn entity_key(&self) -> (EntityKind, String) {
        (self.entity, self.entity_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    Union,
    ObjectMerge,
    RemoteWins,
    QueuedWins,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Union => "union",
            Self::ObjectMerge => "object-merge",
            Self::RemoteWins => "remote-wins",
            Self::QueuedWins => "queued-wins",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictOutcome {
    /// A merged record was persisted.
    Merged,
    /// A stale delete was not applied; the remote record was left intact.
    DeleteSuppressed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub operation_id: String,
    pub operation: OperationType,
    pub base_timestamp: Option<DateTime<Utc>>,
    pub remote_timestamp: DateTime<Utc>,
    pub merged_timestamp: Option<DateTime<Utc>>,
    pub resolved_fields: Vec<String>,
    pub resolution_strategy: BTreeMap<String, MergeStrategy>,
    pub outcome: ConflictOutcome,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFailure {
    pub operation_id: String,
    pub entity: EntityKind,
    pub entity_id: String,
    pub operation: OperationType,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub applied: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Pending operations held back behind a failed one for the same entity.
    pub held_back: usize,
    pub remaining: usize,
    /// Set when a connectivity failure cut the pass short.
    pub aborted: bool,
}

/// A version strictly newer than `previous`, normally the current time.
pub fn next_version(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if previous >= now => previous + Duration::microseconds(1),
        _ => now,
    }
}
