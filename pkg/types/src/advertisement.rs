use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{Condition, Object, ObjectMeta};
use crate::resources::ResourceMetrics;

/// Cluster is fresh and ready to accept reservations.
pub const ADVERTISEMENT_CONDITION_READY: &str = "Ready";
/// Advertisement has aged past the staleness threshold.
pub const ADVERTISEMENT_CONDITION_STALE: &str = "Stale";
/// Outstanding reservations exceed what is still available.
pub const ADVERTISEMENT_CONDITION_OVERCOMMITTED: &str = "Overcommitted";

/// Per-cluster capacity record, published by the cluster's agent and
/// annotated by the broker with reservation accounting and a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAdvertisement {
    pub metadata: ObjectMeta,
    pub spec: ClusterAdvertisementSpec,
    #[serde(default)]
    pub status: ClusterAdvertisementStatus,
}

impl Object for ClusterAdvertisement {
    const KIND: &'static str = "advertisements";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdvertisementSpec {
    /// Stable, unique identifier of the source cluster.
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Human-readable display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
    pub resources: ResourceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
    /// Wall-clock time of the agent's last publish. Freshness is derived
    /// from this, never from the broker's own write times.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "endpointURL")]
    pub endpoint_url: String,
}

/// Per-unit hourly rates. Kept as the agent's literal decimal strings;
/// parsed exactly on use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cost: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_cost: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// Parse a non-negative fixed-point decimal rate into exact
/// micro-currency-units per hour.
pub fn parse_hourly_rate(rate: &str) -> anyhow::Result<i64> {
    let rate = rate.trim();
    if rate.is_empty() || rate.starts_with('-') {
        bail!("cost rate '{}' must be a non-negative decimal", rate);
    }
    let (int_part, frac_part) = match rate.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rate, ""),
    };
    if frac_part.len() > 6 {
        bail!("cost rate '{}' is finer than micro precision", rate);
    }
    let mut micros: i64 = 0;
    for c in int_part.chars() {
        let d = c
            .to_digit(10)
            .ok_or_else(|| anyhow::anyhow!("cost rate '{}' is not a number", rate))?;
        micros = micros
            .checked_mul(10)
            .and_then(|m| m.checked_add(d as i64))
            .ok_or_else(|| anyhow::anyhow!("cost rate '{}' overflows", rate))?;
    }
    micros = micros
        .checked_mul(1_000_000)
        .ok_or_else(|| anyhow::anyhow!("cost rate '{}' overflows", rate))?;
    let mut frac_scale = 100_000;
    for c in frac_part.chars() {
        let d = c
            .to_digit(10)
            .ok_or_else(|| anyhow::anyhow!("cost rate '{}' is not a number", rate))?;
        micros += d as i64 * frac_scale;
        frac_scale /= 10;
    }
    Ok(micros)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisementPhase {
    Active,
    Stale,
}

impl std::fmt::Display for AdvertisementPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvertisementPhase::Active => write!(f, "Active"),
            AdvertisementPhase::Stale => write!(f, "Stale"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterAdvertisementStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<AdvertisementPhase>,
    pub active: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Base score in [0, 100] as a two-decimal string. Advisory only.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub score: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
