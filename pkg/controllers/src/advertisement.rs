use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use pkg_decision::base_score;
use pkg_state::registry::{Registry, StoreError};
use pkg_types::advertisement::{
    ADVERTISEMENT_CONDITION_OVERCOMMITTED, ADVERTISEMENT_CONDITION_READY,
    ADVERTISEMENT_CONDITION_STALE, AdvertisementPhase, ClusterAdvertisement,
};
use pkg_types::config::BrokerSettings;
use pkg_types::meta::{Condition, set_condition};

/// Version-conflict retries per advertisement per pass. Conflicts here are
/// rare (the agent republished mid-reconcile) and the next pass catches up.
const UPDATE_RETRIES: u32 = 3;

/// Background controller that keeps advertisement status honest:
/// recomputes derived availability, ages advertisements into `Stale`,
/// refreshes the base score and conditions.
pub struct AdvertisementController {
    registry: Registry,
    staleness_threshold: chrono::Duration,
    check_interval: Duration,
}

impl AdvertisementController {
    pub fn new(registry: Registry, settings: &BrokerSettings) -> Self {
        // A staleness transition must be observed no later than the
        // threshold itself, so the scan interval is clamped to it.
        let check_interval = settings.refresh_interval.min(settings.staleness_threshold);
        Self {
            registry,
            staleness_threshold: chrono::Duration::from_std(settings.staleness_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            check_interval,
        }
    }

    /// Start the controller loop as a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "AdvertisementController started (interval={}s, staleness={}s)",
                self.check_interval.as_secs(),
                self.staleness_threshold.num_seconds()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile().await {
                    warn!("AdvertisementController reconcile error: {}", e);
                }
            }
        })
    }

    /// One pass over every advertisement.
    async fn reconcile(&self) -> anyhow::Result<()> {
        let advertisements: Vec<ClusterAdvertisement> = self.registry.list().await?;
        for adv in advertisements {
            if let Err(e) = self.reconcile_one(adv).await {
                warn!("Advertisement reconcile error: {}", e);
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, mut adv: ClusterAdvertisement) -> anyhow::Result<()> {
        for _attempt in 0..UPDATE_RETRIES {
            let before = adv.clone();

            adv.spec.resources.update_available();
            self.refresh_status(&mut adv);

            // Nothing changed: skip the write so idle passes don't churn
            // resource versions.
            if adv == before {
                return Ok(());
            }
            adv.status.last_update_time = Some(Utc::now());

            match self.registry.update(&mut adv).await {
                Ok(()) => {
                    info!(
                        "Updated advertisement {}: available cpu={} memory={} score={} active={}",
                        adv.spec.cluster_id,
                        adv.spec.resources.available.cpu,
                        adv.spec.resources.available.memory,
                        adv.status.score,
                        adv.status.active,
                    );
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    match self
                        .registry
                        .get(&adv.metadata.namespace, &adv.metadata.name)
                        .await?
                    {
                        Some(fresh) => adv = fresh,
                        // Deleted between passes: nothing left to do.
                        None => return Ok(()),
                    }
                }
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        warn!(
            "Giving up on advertisement {} after {} conflicts; next pass retries",
            adv.spec.cluster_id, UPDATE_RETRIES
        );
        Ok(())
    }

    /// Derive status fields from the spec. Idempotent.
    fn refresh_status(&self, adv: &mut ClusterAdvertisement) {
        let age = Utc::now().signed_duration_since(adv.spec.timestamp);
        let is_stale = age > self.staleness_threshold;

        adv.status.active = !is_stale;
        if is_stale {
            adv.status.phase = Some(AdvertisementPhase::Stale);
            adv.status.message = "Advertisement has not been updated recently".to_string();
        } else {
            adv.status.phase = Some(AdvertisementPhase::Active);
            adv.status.message = "Cluster is active and available".to_string();
        }
        adv.status.score = format!("{:.2}", base_score(&adv.spec.resources));

        let conditions = &mut adv.status.conditions;
        if is_stale {
            set_condition(
                conditions,
                Condition::new(
                    ADVERTISEMENT_CONDITION_READY,
                    false,
                    "ClusterStale",
                    "Cluster advertisement is stale and not accepting new reservations",
                ),
            );
        } else {
            set_condition(
                conditions,
                Condition::new(
                    ADVERTISEMENT_CONDITION_READY,
                    true,
                    "ClusterActive",
                    "Cluster is active and ready to accept reservations",
                ),
            );
        }
        set_condition(
            conditions,
            Condition::new(
                ADVERTISEMENT_CONDITION_STALE,
                is_stale,
                "AdvertisementAge",
                "Advertisement freshness check",
            ),
        );

        let overcommitted = adv.spec.resources.overcommitted();
        set_condition(
            conditions,
            Condition::new(
                ADVERTISEMENT_CONDITION_OVERCOMMITTED,
                overcommitted,
                "ResourceCheck",
                if overcommitted {
                    "Reserved resources exceed available capacity"
                } else {
                    "Resources are within acceptable limits"
                },
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::client::StateStore;
    use pkg_types::advertisement::{ClusterAdvertisementSpec, ClusterAdvertisementStatus};
    use pkg_types::meta::{ObjectMeta, has_condition};
    use pkg_types::quantity::Quantity;
    use pkg_types::resources::{ResourceMetrics, ResourceQuantities};

    async fn test_setup() -> (AdvertisementController, Registry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_str().unwrap()).await.unwrap();
        let registry = Registry::new(store);
        let controller =
            AdvertisementController::new(registry.clone(), &BrokerSettings::default());
        (controller, registry, dir)
    }

    fn make_advertisement(cluster_id: &str, age_secs: i64) -> ClusterAdvertisement {
        let mut resources = ResourceMetrics {
            allocatable: ResourceQuantities::new(
                Quantity::from_units(10),
                Quantity::from_units(20 * 1024 * 1024 * 1024),
            ),
            allocated: ResourceQuantities::new(
                Quantity::from_units(5),
                Quantity::from_units(10 * 1024 * 1024 * 1024),
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
                timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
                endpoint_url: String::new(),
            },
            status: ClusterAdvertisementStatus::default(),
        }
    }

    #[tokio::test]
    async fn fresh_advertisement_becomes_active_with_score() {
        let (controller, registry, _dir) = test_setup().await;
        let mut adv = make_advertisement("cluster-a", 0);
        registry.create(&mut adv).await.unwrap();

        controller.reconcile().await.unwrap();

        let adv: ClusterAdvertisement = registry.get("default", "cluster-a").await.unwrap().unwrap();
        assert!(adv.status.active);
        assert_eq!(adv.status.phase, Some(AdvertisementPhase::Active));
        assert_eq!(adv.status.score, "50.00");
        assert!(has_condition(
            &adv.status.conditions,
            ADVERTISEMENT_CONDITION_READY
        ));
        assert!(!has_condition(
            &adv.status.conditions,
            ADVERTISEMENT_CONDITION_STALE
        ));
    }

    #[tokio::test]
    async fn old_advertisement_goes_stale() {
        let (controller, registry, _dir) = test_setup().await;
        // One hour old, well past the 10 minute default threshold.
        let mut adv = make_advertisement("cluster-a", 3600);
        registry.create(&mut adv).await.unwrap();

        controller.reconcile().await.unwrap();

        let adv: ClusterAdvertisement = registry.get("default", "cluster-a").await.unwrap().unwrap();
        assert!(!adv.status.active);
        assert_eq!(adv.status.phase, Some(AdvertisementPhase::Stale));
        assert!(has_condition(
            &adv.status.conditions,
            ADVERTISEMENT_CONDITION_STALE
        ));
        assert!(!has_condition(
            &adv.status.conditions,
            ADVERTISEMENT_CONDITION_READY
        ));
    }

    #[tokio::test]
    async fn overcommit_is_surfaced_as_a_condition() {
        let (controller, registry, _dir) = test_setup().await;
        let mut adv = make_advertisement("cluster-a", 0);
        // 4 CPU reserved against 5 available leaves 1 available < 4 reserved.
        adv.spec.resources.add_reservation(
            "default/r1",
            &ResourceQuantities::new(Quantity::from_units(4), Quantity::from_units(4)),
        );
        registry.create(&mut adv).await.unwrap();

        controller.reconcile().await.unwrap();

        let adv: ClusterAdvertisement = registry.get("default", "cluster-a").await.unwrap().unwrap();
        assert!(has_condition(
            &adv.status.conditions,
            ADVERTISEMENT_CONDITION_OVERCOMMITTED
        ));
    }

    #[tokio::test]
    async fn idle_passes_do_not_bump_versions() {
        let (controller, registry, _dir) = test_setup().await;
        let mut adv = make_advertisement("cluster-a", 0);
        registry.create(&mut adv).await.unwrap();

        controller.reconcile().await.unwrap();
        let first: ClusterAdvertisement =
            registry.get("default", "cluster-a").await.unwrap().unwrap();

        controller.reconcile().await.unwrap();
        let second: ClusterAdvertisement =
            registry.get("default", "cluster-a").await.unwrap().unwrap();
        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
    }
}
