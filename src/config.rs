use crate::errors::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

/// Which side keeps a scalar field that both writers changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarPolicy {
    RemoteWins,
    QueuedWins,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    pub database_path: PathBuf,
    pub journal_path: Option<PathBuf>,
    pub operation_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub resync_interval_secs: u64,
    pub queue_warn_threshold: usize,
    pub scalar_policy: ScalarPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/dashboard.sqlite"),
            journal_path: None,
            operation_timeout_ms: 5_000,
            probe_timeout_ms: 2_000,
            busy_timeout_ms: 1_000,
            resync_interval_secs: 30,
            queue_warn_threshold: 10_000,
            scalar_policy: ScalarPolicy::RemoteWins,
        }
    }
}

impl StoreSettings {
    /// Overlays the JSON object at `path` onto the defaults. A missing file
    /// yields the defaults unchanged.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let update: serde_json::Value = serde_json::from_str(&raw)?;
        Self::default().merged_with(update)
    }

    pub fn merged_with(&self, update: serde_json::Value) -> AppResult<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, update);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
