//! Three-way, per-field reconciliation of a queued write against a record that
//! changed remotely while the writer was offline.
//!
//! Only fields the queued write sets are considered. A field is written
//! directly when the remote side still holds the base value or already holds
//! the queued value. Otherwise the kind's `FieldRule` decides:
//!
//! - arrays: union of remote, queued and base elements, in that order,
//!   matched by the element key when both elements carry it;
//! - objects: shallow merge of base, remote and queued, later layers winning;
//! - scalars: the configured `ScalarPolicy` (remote wins by default).

use crate::config::ScalarPolicy;
use crate::models::{EntityKind, FieldRule, MergeStrategy};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMerge {
    /// Final value for every field the queued write set.
    pub fields: Map<String, Value>,
    /// Fields that needed more than a direct write, and how they were settled.
    pub resolutions: BTreeMap<String, MergeStrategy>,
}

impl FieldMerge {
    pub fn resolved_fields(&self) -> Vec<String> {
        self.resolutions.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    scalar_policy: ScalarPolicy,
}

impl ConflictResolver {
    pub fn new(scalar_policy: ScalarPolicy) -> Self {
        Self { scalar_policy }
    }

    pub fn resolve(
        &self,
        kind: EntityKind,
        base: Option<&Map<String, Value>>,
        remote: &Map<String, Value>,
        queued: &Map<String, Value>,
    ) -> FieldMerge {
        let mut merge = FieldMerge::default();
        for (field, queued_value) in queued {
            if field == kind.primary_key_field() || field == kind.version_field() {
                continue;
            }
            let remote_value = remote.get(field).unwrap_or(&Value::Null);
            let base_value = base.and_then(|base| base.get(field));

            if remote_value == queued_value || base_value == Some(remote_value) {
                merge.fields.insert(field.clone(), queued_value.clone());
                continue;
            }

            let (value, strategy) = match kind.field_rule(field) {
                FieldRule::Array { key } => (
                    Value::Array(union_arrays(key, remote_value, queued_value, base_value)),
                    MergeStrategy::Union,
                ),
                FieldRule::Object => (
                    Value::Object(merge_objects(base_value, remote_value, queued_value)),
                    MergeStrategy::ObjectMerge,
                ),
                FieldRule::Scalar => match self.scalar_policy {
                    ScalarPolicy::RemoteWins => (remote_value.clone(), MergeStrategy::RemoteWins),
                    ScalarPolicy::QueuedWins => (queued_value.clone(), MergeStrategy::QueuedWins),
                },
            };

            // A union or merge that reproduces the queued value was not a conflict.
            let settled = strategy == MergeStrategy::QueuedWins || &value != queued_value;
            merge.fields.insert(field.clone(), value);
            if settled {
                merge.resolutions.insert(field.clone(), strategy);
            }
        }
        merge
    }
}

fn as_elements(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    }
}

fn same_element(key: Option<&str>, left: &Value, right: &Value) -> bool {
    if let Some(key) = key {
        if let (Some(left_key), Some(right_key)) = (left.get(key), right.get(key)) {
            return left_key == right_key;
        }
    }
    left == right
}

/// Base elements are kept as well, so an element that both writers removed
/// comes back. The result never drops anything either side still holds.
fn union_arrays(key: Option<&str>, remote: &Value, queued: &Value, base: Option<&Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::new();
    let layers = [
        as_elements(Some(remote)),
        as_elements(Some(queued)),
        as_elements(base),
    ];
    for layer in layers {
        for item in layer {
            if !merged.iter().any(|existing| same_element(key, existing, item)) {
                merged.push(item.clone());
            }
        }
    }
    merged
}

fn merge_objects(base: Option<&Value>, remote: &Value, queued: &Value) -> Map<String, Value> {
    let mut merged = Map::new();
    for layer in [base, Some(remote), Some(queued)] {
        if let Some(Value::Object(map)) = layer {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
