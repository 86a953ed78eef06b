//! Decision engine: given a capacity request, filter candidate clusters and
//! rank them under a pluggable placement policy.
//!
//! The default policy weighs post-reservation resource headroom against
//! hourly cost. Scores are advisory (`f64` is fine here); all capacity
//! checks behind `filter` use exact quantity comparisons.

use tracing::warn;

use pkg_types::advertisement::{ClusterAdvertisement, parse_hourly_rate};
use pkg_types::quantity::Quantity;
use pkg_types::resources::{ResourceMetrics, ResourceQuantities};

pub const DEFAULT_RESOURCE_WEIGHT: f64 = 0.70;
pub const DEFAULT_COST_WEIGHT: f64 = 0.30;

/// Linear bonus per priority point. Meant as a tiebreak, not preemption.
const PRIORITY_TIEBREAK: f64 = 0.01;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error(
        "no suitable cluster found for requested cpu={cpu}, memory={memory}; \
         ensure clusters are registered, active, and have sufficient available resources"
    )]
    NoSuitableCluster { cpu: Quantity, memory: Quantity },
}

/// Relative weight of resource headroom vs. cost in the default policy.
#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub resource: f64,
    pub cost: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            resource: DEFAULT_RESOURCE_WEIGHT,
            cost: DEFAULT_COST_WEIGHT,
        }
    }
}

impl ScoringWeights {
    /// Weights must sum to 1 within ±0.01; anything else falls back to the
    /// defaults so a typo in configuration cannot skew every placement.
    pub fn normalized(self) -> Self {
        let sum = self.resource + self.cost;
        if (sum - 1.0).abs() > 0.01 || self.resource < 0.0 || self.cost < 0.0 {
            warn!(
                "Scoring weights resource={} cost={} do not sum to 1; using defaults",
                self.resource, self.cost
            );
            return Self::default();
        }
        self
    }
}

/// A placement policy decides, per candidate, whether it can host the
/// request and how desirable it is. Alternate policies (cost-only,
/// latency-aware, data-local) plug in here without touching the
/// reservation state machine.
pub trait PlacementPolicy: Send + Sync {
    fn filter(&self, adv: &ClusterAdvertisement, request: &ResourceQuantities) -> bool;

    /// Request-specific desirability in [0, 1]. Higher is better.
    fn score(&self, adv: &ClusterAdvertisement, request: &ResourceQuantities) -> f64;
}

/// Default policy: weighted sum of post-reservation headroom and an
/// inverse-cost term.
pub struct WeightedPolicy {
    weights: ScoringWeights,
}

impl WeightedPolicy {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights: weights.normalized(),
        }
    }

    fn headroom(&self, resources: &ResourceMetrics, request: &ResourceQuantities) -> f64 {
        let cpu = headroom_term(
            resources.available.cpu,
            request.cpu,
            resources.allocatable.cpu,
        );
        let memory = headroom_term(
            resources.available.memory,
            request.memory,
            resources.allocatable.memory,
        );
        (0.5 * cpu + 0.5 * memory).max(0.0)
    }

    fn cost_score(&self, adv: &ClusterAdvertisement, request: &ResourceQuantities) -> f64 {
        let Some(cost) = &adv.spec.cost else {
            return 1.0;
        };
        let mut total_micros: i64 = 0;
        for (rate, amount) in [
            (cost.cpu_cost.as_deref(), request.cpu.as_f64()),
            (
                cost.memory_cost.as_deref(),
                request.memory.as_f64() / (1024.0 * 1024.0 * 1024.0),
            ),
        ] {
            let Some(rate) = rate else { continue };
            match parse_hourly_rate(rate) {
                Ok(micros) => total_micros += (micros as f64 * amount) as i64,
                Err(e) => {
                    warn!(
                        "Ignoring unparseable cost rate '{}' on cluster {}: {}",
                        rate, adv.spec.cluster_id, e
                    );
                }
            }
        }
        if total_micros == 0 {
            return 1.0;
        }
        let per_hour = total_micros as f64 / 1_000_000.0;
        1.0 / (1.0 + per_hour)
    }
}

impl PlacementPolicy for WeightedPolicy {
    fn filter(&self, adv: &ClusterAdvertisement, request: &ResourceQuantities) -> bool {
        adv.spec.resources.can_reserve(request)
    }

    fn score(&self, adv: &ClusterAdvertisement, request: &ResourceQuantities) -> f64 {
        self.weights.resource * self.headroom(&adv.spec.resources, request)
            + self.weights.cost * self.cost_score(adv, request)
    }
}

fn headroom_term(available: Quantity, requested: Quantity, allocatable: Quantity) -> f64 {
    if allocatable.is_zero() {
        return 0.0;
    }
    (available.as_f64() - requested.as_f64()) / allocatable.as_f64()
}

/// Ranks candidates for one request. Deterministic: given identical inputs
/// in identical order, the same cluster wins with the same score.
pub struct DecisionEngine {
    policy: Box<dyn PlacementPolicy>,
}

impl DecisionEngine {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            policy: Box::new(WeightedPolicy::new(weights)),
        }
    }

    pub fn with_policy(policy: Box<dyn PlacementPolicy>) -> Self {
        Self { policy }
    }

    /// Pick the best cluster for the request, or `NoSuitableCluster`.
    ///
    /// Filtering order: inactive advertisements, then the requester's own
    /// cluster, then the policy's capacity check. Strictly greater score
    /// wins; the first-seen candidate keeps a tie.
    pub fn select_cluster<'a>(
        &self,
        advertisements: &'a [ClusterAdvertisement],
        requester_id: &str,
        request: &ResourceQuantities,
        priority: i32,
    ) -> Result<&'a ClusterAdvertisement, DecisionError> {
        let mut best: Option<(&ClusterAdvertisement, f64)> = None;

        for adv in advertisements {
            if !adv.status.active {
                continue;
            }
            if adv.spec.cluster_id == requester_id {
                continue;
            }
            if !self.policy.filter(adv, request) {
                continue;
            }
            let score = self.policy.score(adv, request) + PRIORITY_TIEBREAK * priority as f64;
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((adv, score)),
            }
        }

        best.map(|(adv, _)| adv)
            .ok_or(DecisionError::NoSuitableCluster {
                cpu: request.cpu,
                memory: request.memory,
            })
    }
}

/// Request-independent cluster score in [0, 100], published on the
/// advertisement status for observability. Zero allocatable scores zero.
pub fn base_score(resources: &ResourceMetrics) -> f64 {
    if resources.allocatable.cpu.is_zero() || resources.allocatable.memory.is_zero() {
        return 0.0;
    }
    let cpu = resources.available.cpu.as_f64() / resources.allocatable.cpu.as_f64() * 50.0;
    let memory = resources.available.memory.as_f64() / resources.allocatable.memory.as_f64() * 50.0;
    (cpu + memory).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::advertisement::{
        ClusterAdvertisementSpec, ClusterAdvertisementStatus, CostInfo,
    };
    use pkg_types::meta::ObjectMeta;

    fn make_advertisement(
        cluster_id: &str,
        allocatable_cpu: i64,
        allocatable_mem_gi: i64,
        allocated_cpu: i64,
        allocated_mem_gi: i64,
    ) -> ClusterAdvertisement {
        let gi = 1024 * 1024 * 1024;
        let mut resources = ResourceMetrics {
            allocatable: ResourceQuantities::new(
                Quantity::from_units(allocatable_cpu),
                Quantity::from_units(allocatable_mem_gi * gi),
            ),
            allocated: ResourceQuantities::new(
                Quantity::from_units(allocated_cpu),
                Quantity::from_units(allocated_mem_gi * gi),
            ),
            ..Default::default()
        };
        resources.capacity = resources.allocatable.clone();
        resources.update_available();

        ClusterAdvertisement {
            metadata: ObjectMeta::new("default", cluster_id),
            spec: ClusterAdvertisementSpec {
                cluster_id: cluster_id.to_string(),
                cluster_name: String::new(),
                resources,
                cost: None,
                timestamp: Utc::now(),
                endpoint_url: String::new(),
            },
            status: ClusterAdvertisementStatus {
                active: true,
                ..Default::default()
            },
        }
    }

    fn request(cpu: i64, mem_gi: i64) -> ResourceQuantities {
        ResourceQuantities::new(
            Quantity::from_units(cpu),
            Quantity::from_units(mem_gi * 1024 * 1024 * 1024),
        )
    }

    #[test]
    fn picks_cluster_with_more_headroom() {
        let engine = DecisionEngine::new(ScoringWeights::default());
        let advertisements = vec![
            make_advertisement("cluster-a", 10, 20, 2, 4),
            make_advertisement("cluster-b", 10, 20, 6, 10),
        ];

        let chosen = engine
            .select_cluster(&advertisements, "cluster-x", &request(2, 4), 0)
            .unwrap();
        assert_eq!(chosen.spec.cluster_id, "cluster-a");
    }

    #[test]
    fn excludes_requesters_own_cluster() {
        let engine = DecisionEngine::new(ScoringWeights::default());
        let advertisements = vec![
            make_advertisement("cluster-a", 10, 20, 2, 4),
            make_advertisement("cluster-b", 10, 20, 6, 10),
            // Empty and would otherwise win outright.
            make_advertisement("cluster-x", 10, 20, 0, 0),
        ];

        let chosen = engine
            .select_cluster(&advertisements, "cluster-x", &request(2, 4), 0)
            .unwrap();
        assert_eq!(chosen.spec.cluster_id, "cluster-a");
    }

    #[test]
    fn skips_inactive_advertisements() {
        let engine = DecisionEngine::new(ScoringWeights::default());
        let mut stale = make_advertisement("cluster-a", 10, 20, 0, 0);
        stale.status.active = false;
        let advertisements = vec![stale, make_advertisement("cluster-b", 10, 20, 2, 4)];

        let chosen = engine
            .select_cluster(&advertisements, "cluster-x", &request(2, 4), 0)
            .unwrap();
        assert_eq!(chosen.spec.cluster_id, "cluster-b");
    }

    #[test]
    fn no_candidate_is_a_distinguished_error() {
        let engine = DecisionEngine::new(ScoringWeights::default());
        let advertisements = vec![make_advertisement("cluster-a", 2, 4, 1, 2)];

        let err = engine
            .select_cluster(&advertisements, "cluster-x", &request(8, 16), 0)
            .unwrap_err();
        let DecisionError::NoSuitableCluster { cpu, memory } = err;
        assert_eq!(cpu, Quantity::from_units(8));
        assert_eq!(memory.as_f64() as i64, 16 * 1024 * 1024 * 1024);
    }

    #[test]
    fn cheaper_cluster_wins_cost_tiebreak() {
        let engine = DecisionEngine::new(ScoringWeights::default());
        let mut cheap = make_advertisement("cluster-cheap", 10, 20, 2, 4);
        cheap.spec.cost = Some(CostInfo {
            cpu_cost: Some("0.10".to_string()),
            memory_cost: None,
            currency: Some("EUR".to_string()),
        });
        let mut expensive = make_advertisement("cluster-pricey", 10, 20, 2, 4);
        expensive.spec.cost = Some(CostInfo {
            cpu_cost: Some("1.00".to_string()),
            memory_cost: None,
            currency: Some("EUR".to_string()),
        });
        let advertisements = vec![expensive, cheap];

        let chosen = engine
            .select_cluster(&advertisements, "cluster-x", &request(2, 4), 0)
            .unwrap();
        assert_eq!(chosen.spec.cluster_id, "cluster-cheap");
    }

    #[test]
    fn selection_is_deterministic() {
        let engine = DecisionEngine::new(ScoringWeights::default());
        let advertisements = vec![
            make_advertisement("cluster-a", 10, 20, 2, 4),
            make_advertisement("cluster-b", 10, 20, 2, 4),
        ];

        for _ in 0..10 {
            let chosen = engine
                .select_cluster(&advertisements, "cluster-x", &request(2, 4), 0)
                .unwrap();
            // Equal scores: first-seen candidate keeps the tie.
            assert_eq!(chosen.spec.cluster_id, "cluster-a");
        }
    }

    #[test]
    fn bad_weights_fall_back_to_defaults() {
        let weights = ScoringWeights {
            resource: 0.9,
            cost: 0.3,
        }
        .normalized();
        assert_eq!(weights.resource, DEFAULT_RESOURCE_WEIGHT);
        assert_eq!(weights.cost, DEFAULT_COST_WEIGHT);

        let ok = ScoringWeights {
            resource: 0.5,
            cost: 0.5,
        }
        .normalized();
        assert_eq!(ok.resource, 0.5);
    }

    #[test]
    fn base_score_tracks_availability() {
        let adv = make_advertisement("cluster-a", 10, 20, 5, 10);
        // Half of everything free: 25 + 25.
        assert_eq!(base_score(&adv.spec.resources), 50.0);

        let empty = make_advertisement("cluster-b", 10, 20, 0, 0);
        assert_eq!(base_score(&empty.spec.resources), 100.0);

        let zero = make_advertisement("cluster-c", 0, 0, 0, 0);
        assert_eq!(base_score(&zero.spec.resources), 0.0);
    }
}
