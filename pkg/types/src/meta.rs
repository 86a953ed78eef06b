use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Common metadata carried by every record in the substrate.
///
/// `resource_version` is the optimistic-concurrency token: the registry
/// rejects writes whose version does not match the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource_version: 0,
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
            finalizers: Vec::new(),
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

/// A record type the registry can persist.
pub trait Object {
    /// Registry key segment, e.g. "reservations".
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// One observation about a record's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(condition_type: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or update a condition in place. The transition time is only
/// refreshed when the boolean status actually flips.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                existing.reason = condition.reason;
                existing.message = condition.message;
            } else {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

/// True when the named condition is present with status true.
pub fn has_condition(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.condition_type == condition_type && c.status)
}
