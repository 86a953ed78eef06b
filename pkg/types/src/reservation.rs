use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{self, Condition, Object, ObjectMeta};
use crate::resources::ResourceQuantities;

/// Blocks deletion from the substrate until held capacity is returned.
/// The substrate identifies finalizers by this literal tag.
pub const RESERVATION_FINALIZER: &str = "reservation.broker.fluidos.eu/finalizer";

/// Requester signaled it started consuming the reserved capacity.
pub const RESERVATION_CONDITION_REQUESTER_ACTIVE: &str = "RequesterActive";
/// Requester signaled it is done with the reserved capacity.
pub const RESERVATION_CONDITION_REQUESTER_RELEASED: &str = "RequesterReleased";

/// A capacity request plus the broker's lifecycle state for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub metadata: ObjectMeta,
    pub spec: ReservationSpec,
    #[serde(default)]
    pub status: ReservationStatus,
}

impl Object for Reservation {
    const KIND: &'static str = "reservations";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Reservation {
    /// Key under which this reservation's hold is recorded in an
    /// advertisement's claim-check map.
    pub fn hold_key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn has_condition(&self, condition_type: &str) -> bool {
        meta::has_condition(&self.status.conditions, condition_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSpec {
    /// Who is asking. A requester never gets capacity from its own cluster.
    #[serde(default, rename = "requesterID")]
    pub requester_id: String,
    pub requested_resources: ResourceQuantities,
    /// Bound target. Empty until the broker selects one (or the caller
    /// pins it up front).
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        rename = "targetClusterID"
    )]
    pub target_cluster_id: String,
    /// How long the hold should last, e.g. "PT1H30M" or "90s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationPhase {
    Pending,
    Reserved,
    Active,
    Failed,
    Released,
}

impl ReservationPhase {
    /// Terminal phases admit no further transitions and hold no capacity.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationPhase::Failed | ReservationPhase::Released)
    }
}

impl std::fmt::Display for ReservationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationPhase::Pending => write!(f, "Pending"),
            ReservationPhase::Reserved => write!(f, "Reserved"),
            ReservationPhase::Active => write!(f, "Active"),
            ReservationPhase::Failed => write!(f, "Failed"),
            ReservationPhase::Released => write!(f, "Released"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReservationStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReservationPhase>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
