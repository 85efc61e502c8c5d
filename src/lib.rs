//! Offline-tolerant storage for the monitoring dashboard.
//!
//! [`StorageFacade`] is the only write path: while the backing store is
//! reachable it writes through, otherwise it captures each write in an
//! ordered queue and hands back a local echo. [`StorageFacade::trigger_resync`]
//! replays the queue and settles divergent records with a per-field
//! three-way merge, recording every conflict it resolves.

pub mod audit;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod errors;
pub mod facade;
pub mod journal;
pub mod models;
pub mod queue;
pub mod resolver;
pub mod resync;
pub mod telemetry;

pub use crate::config::{ScalarPolicy, StoreSettings};
pub use crate::connectivity::Connectivity;
pub use crate::db::{BackingStore, Database};
pub use crate::errors::{AppError, AppResult};
pub use crate::facade::StorageFacade;
pub use crate::models::{
    ConflictOutcome, ConflictRecord, EntityKind, LogEntry, LogEntryPatch, MergeStrategy, MetricSnapshot,
    MetricSnapshotPatch, Mutation, NewLogEntry, NewMetricSnapshot, NewPlugin, NewProblem, NewTestProfile,
    OperationStatus, OperationType, Patch, Plugin, PluginPatch, PluginType, Problem, ProblemPatch, ProblemSeverity,
    ProblemStatus, QueuedOperation, Record, ReplayFailure, ResyncReport, TestProfile, TestProfilePatch,
};
pub use crate::resolver::ConflictResolver;
pub use crate::telemetry::init_tracing;
