use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use pkg_decision::{DecisionEngine, DecisionError, ScoringWeights};
use pkg_state::registry::{Registry, StoreError};
use tokio::sync::broadcast::error::RecvError;
use pkg_types::advertisement::ClusterAdvertisement;
use pkg_types::config::BrokerSettings;
use pkg_types::duration::parse_duration;
use pkg_types::reservation::{
    RESERVATION_CONDITION_REQUESTER_ACTIVE, RESERVATION_CONDITION_REQUESTER_RELEASED,
    RESERVATION_FINALIZER, Reservation, ReservationPhase,
};
use pkg_types::validate::validate_reservation_spec;

/// Outcome of one capacity acquisition attempt against the target
/// advertisement. The first two are terminal for the reservation; the
/// rest are transient and retried on the next pass.
#[derive(Debug, thiserror::Error)]
enum AcquireError {
    #[error("target cluster '{cluster_id}' not found")]
    TargetClusterNotFound { cluster_id: String },
    #[error("insufficient resources in cluster '{cluster_id}'")]
    InsufficientResources { cluster_id: String },
    #[error("acquisition kept conflicting after {retries} attempts")]
    RetriesExhausted { retries: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Controller that drives each Reservation through
/// Pending → Reserved → Active → Released/Failed while keeping the
/// capacity accounting on advertisements consistent.
///
/// Capacity changes and phase changes are two successive writes, in that
/// order. The claim-check map on the advertisement makes the capacity
/// write idempotent per reservation, so a crash between the two writes is
/// healed by the next reconcile instead of double-counted.
pub struct ReservationController {
    registry: Registry,
    engine: DecisionEngine,
    check_interval: Duration,
    acquire_retries: u32,
}

impl ReservationController {
    pub fn new(registry: Registry, settings: &BrokerSettings) -> Self {
        let engine = DecisionEngine::new(ScoringWeights {
            resource: settings.resource_weight,
            cost: settings.cost_weight,
        });
        Self {
            registry,
            engine,
            // Expiry must be observed within a minute even with no events.
            check_interval: Duration::from_secs(30),
            acquire_retries: settings.acquire_retries.max(1),
        }
    }

    /// Start the controller loop as a background task. Reconciles on a
    /// fixed interval and immediately on reservation changes.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ReservationController started (interval={}s)",
                self.check_interval.as_secs()
            );
            let prefix = Registry::key_prefix::<Reservation>();
            let mut event_rx = self.registry.store().event_log.subscribe();
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.reconcile().await {
                            warn!("ReservationController reconcile error: {}", e);
                        }
                    }
                    result = event_rx.recv() => {
                        match result {
                            Ok(ref event) if event.key.starts_with(&prefix) => {
                                // Coalesce the burst, run once, drop what our
                                // own writes re-triggered.
                                while event_rx.try_recv().is_ok() {}
                                if let Err(e) = self.reconcile().await {
                                    warn!("ReservationController reconcile error: {}", e);
                                }
                                while event_rx.try_recv().is_ok() {}
                                interval.reset();
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(_)) => {
                                if let Err(e) = self.reconcile().await {
                                    warn!("ReservationController reconcile error: {}", e);
                                }
                                interval.reset();
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    /// One pass over every reservation. Per-object errors are logged and
    /// retried next pass rather than aborting the scan.
    async fn reconcile(&self) -> anyhow::Result<()> {
        let reservations: Vec<Reservation> = self.registry.list().await?;
        for res in reservations {
            let name = format!("{}/{}", res.metadata.namespace, res.metadata.name);
            if let Err(e) = self.reconcile_one(res).await {
                warn!("Reservation {} reconcile error: {}", name, e);
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, mut res: Reservation) -> anyhow::Result<()> {
        // Deletion: give back held capacity, then let go of the record.
        if res.metadata.deletion_timestamp.is_some() {
            if res.metadata.has_finalizer(RESERVATION_FINALIZER) {
                self.release_resources(&res).await?;
                res.metadata.remove_finalizer(RESERVATION_FINALIZER);
                self.registry.update(&mut res).await?;
                info!("Reservation {} finalized and removed", res.hold_key());
            }
            return Ok(());
        }

        // The finalizer must be in place before any capacity is acquired.
        if !res.metadata.has_finalizer(RESERVATION_FINALIZER) {
            res.metadata.add_finalizer(RESERVATION_FINALIZER);
            self.registry.update(&mut res).await?;
        }

        // Only pre-acquisition phases can fail validation; Failed is never
        // entered from Reserved or Active.
        if matches!(res.status.phase, None | Some(ReservationPhase::Pending))
            && let Err(e) = validate_reservation_spec(&res.spec)
        {
            warn!("Reservation {} has an invalid spec: {}", res.hold_key(), e);
            return self
                .fail(
                    res,
                    format!(
                        "Invalid reservation specification: {}. Check that requesterID is set \
                         and requested resources are positive values.",
                        e
                    ),
                )
                .await;
        }

        match res.status.phase {
            None | Some(ReservationPhase::Pending) => self.handle_pending(res).await,
            Some(ReservationPhase::Reserved) => self.handle_reserved(res).await,
            Some(ReservationPhase::Active) => self.handle_active(res).await,
            Some(ReservationPhase::Failed) | Some(ReservationPhase::Released) => Ok(()),
        }
    }

    /// Select a target if none is pinned, then run the locking protocol.
    async fn handle_pending(&self, mut res: Reservation) -> anyhow::Result<()> {
        if res.spec.target_cluster_id.is_empty() {
            let advertisements: Vec<ClusterAdvertisement> = self.registry.list().await?;
            match self.engine.select_cluster(
                &advertisements,
                &res.spec.requester_id,
                &res.spec.requested_resources,
                res.spec.priority,
            ) {
                Ok(best) => {
                    res.spec.target_cluster_id = best.spec.cluster_id.clone();
                    // The binding must be durable before capacity moves.
                    self.registry.update(&mut res).await?;
                    info!(
                        "Reservation {}: selected cluster {}",
                        res.hold_key(),
                        res.spec.target_cluster_id
                    );
                }
                Err(DecisionError::NoSuitableCluster { cpu, memory }) => {
                    return self
                        .fail(
                            res,
                            format!(
                                "No suitable cluster found. Requested: {} CPU, {} memory. \
                                 Ensure clusters are registered, active, and have sufficient \
                                 available resources.",
                                cpu, memory
                            ),
                        )
                        .await;
                }
            }
        }

        match self.acquire(&res).await {
            Ok(()) => {
                let now = Utc::now();
                res.status.phase = Some(ReservationPhase::Reserved);
                res.status.message =
                    format!("Resources locked in cluster {}", res.spec.target_cluster_id);
                res.status.reserved_at = Some(now);
                if let Some(duration) = &res.spec.duration {
                    res.status.expires_at = Some(now + parse_duration(duration)?);
                }
                res.status.last_update_time = Some(now);
                self.registry.update(&mut res).await?;
                info!(
                    "Reservation {}: locked cpu={} memory={} in cluster {}",
                    res.hold_key(),
                    res.spec.requested_resources.cpu,
                    res.spec.requested_resources.memory,
                    res.spec.target_cluster_id
                );
                Ok(())
            }
            Err(AcquireError::TargetClusterNotFound { cluster_id }) => {
                self.fail(
                    res,
                    format!(
                        "Target cluster '{}' not found. The cluster may have been removed \
                         or is not registered with the broker.",
                        cluster_id
                    ),
                )
                .await
            }
            Err(AcquireError::InsufficientResources { cluster_id }) => {
                let cpu = res.spec.requested_resources.cpu;
                let memory = res.spec.requested_resources.memory;
                self.fail(
                    res,
                    format!(
                        "Insufficient resources in cluster '{}'. Requested: {} CPU, {} memory. \
                         Capacity may have been taken by other reservations.",
                        cluster_id, cpu, memory
                    ),
                )
                .await
            }
            // Transient: surface to the retry machinery.
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_reserved(&self, mut res: Reservation) -> anyhow::Result<()> {
        if res.has_condition(RESERVATION_CONDITION_REQUESTER_ACTIVE) {
            info!(
                "Reservation {}: requester confirmed activation",
                res.hold_key()
            );
            res.status.phase = Some(ReservationPhase::Active);
            res.status.message = "Requester confirmed activation".to_string();
            res.status.last_update_time = Some(Utc::now());
            self.registry.update(&mut res).await?;
            return Ok(());
        }
        if self.expired(&res) {
            return self.release_and_finish(res).await;
        }
        Ok(())
    }

    async fn handle_active(&self, mut res: Reservation) -> anyhow::Result<()> {
        if res.has_condition(RESERVATION_CONDITION_REQUESTER_RELEASED) {
            info!("Reservation {}: requester released", res.hold_key());
            self.release_resources(&res).await?;
            res.status.phase = Some(ReservationPhase::Released);
            res.status.message = "Requester released reservation".to_string();
            res.status.last_update_time = Some(Utc::now());
            self.registry.update(&mut res).await?;
            return Ok(());
        }
        if self.expired(&res) {
            return self.release_and_finish(res).await;
        }
        Ok(())
    }

    fn expired(&self, res: &Reservation) -> bool {
        res.status
            .expires_at
            .is_some_and(|expires_at| expires_at < Utc::now())
    }

    async fn release_and_finish(&self, mut res: Reservation) -> anyhow::Result<()> {
        info!("Reservation {} expired, releasing resources", res.hold_key());
        self.release_resources(&res).await?;
        res.status.phase = Some(ReservationPhase::Released);
        res.status.message = "Reservation expired and resources released".to_string();
        res.status.last_update_time = Some(Utc::now());
        self.registry.update(&mut res).await?;
        Ok(())
    }

    /// Terminal failure. Idempotent so repeated passes over a failed
    /// reservation don't churn writes.
    async fn fail(&self, mut res: Reservation, message: String) -> anyhow::Result<()> {
        if res.status.phase == Some(ReservationPhase::Failed) && res.status.message == message {
            return Ok(());
        }
        res.status.phase = Some(ReservationPhase::Failed);
        res.status.message = message;
        res.status.last_update_time = Some(Utc::now());
        self.registry.update(&mut res).await?;
        Ok(())
    }

    /// The locking protocol: bounded compare-and-swap loop against the
    /// target advertisement. Concurrent acquisitions serialize through the
    /// version token; the loser observes the shrunken availability on
    /// retry and gets `InsufficientResources`.
    async fn acquire(&self, res: &Reservation) -> Result<(), AcquireError> {
        let cluster_id = res.spec.target_cluster_id.clone();
        for attempt in 0..self.acquire_retries {
            let Some(mut adv) = self.find_advertisement(&cluster_id).await? else {
                return Err(AcquireError::TargetClusterNotFound { cluster_id });
            };

            // Prior credit from an interrupted reconcile: the capacity is
            // already counted, only the phase write is missing.
            if adv.spec.resources.held_by.contains_key(&res.hold_key()) {
                return Ok(());
            }
            if !adv.spec.resources.can_reserve(&res.spec.requested_resources) {
                return Err(AcquireError::InsufficientResources { cluster_id });
            }
            adv.spec
                .resources
                .add_reservation(&res.hold_key(), &res.spec.requested_resources);

            match self.registry.update(&mut adv).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20 * (attempt as u64 + 1))).await;
                }
                Err(StoreError::NotFound { .. }) => {
                    return Err(AcquireError::TargetClusterNotFound { cluster_id });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AcquireError::RetriesExhausted {
            retries: self.acquire_retries,
        })
    }

    /// Return this reservation's hold to its target cluster.
    ///
    /// Idempotent: a reservation with no recorded hold is a no-op, and a
    /// missing target cluster counts as released (the capacity has no
    /// owner to return to). An accounting underflow is logged loudly but
    /// still clears the hold, so finalizers can never get stuck on it.
    async fn release_resources(&self, res: &Reservation) -> anyhow::Result<()> {
        if res.spec.target_cluster_id.is_empty() {
            return Ok(());
        }
        for _attempt in 0..self.acquire_retries {
            let Some(mut adv) = self.find_advertisement(&res.spec.target_cluster_id).await? else {
                info!(
                    "Target cluster {} not found, skipping resource release for {}",
                    res.spec.target_cluster_id,
                    res.hold_key()
                );
                return Ok(());
            };

            match adv.spec.resources.remove_reservation(&res.hold_key()) {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                Err(e) => {
                    error!(
                        "Reservation accounting underflow on cluster {} while releasing {}: {}",
                        res.spec.target_cluster_id,
                        res.hold_key(),
                        e
                    );
                }
            }

            match self.registry.update(&mut adv).await {
                Ok(()) => {
                    info!(
                        "Released cpu={} memory={} in cluster {} for reservation {}",
                        res.spec.requested_resources.cpu,
                        res.spec.requested_resources.memory,
                        res.spec.target_cluster_id,
                        res.hold_key()
                    );
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!(
            "release for {} kept conflicting on cluster {}",
            res.hold_key(),
            res.spec.target_cluster_id
        )
    }

    async fn find_advertisement(
        &self,
        cluster_id: &str,
    ) -> Result<Option<ClusterAdvertisement>, StoreError> {
        let advertisements: Vec<ClusterAdvertisement> = self.registry.list().await?;
        Ok(advertisements
            .into_iter()
            .find(|adv| adv.spec.cluster_id == cluster_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pkg_state::client::StateStore;
    use pkg_types::advertisement::{ClusterAdvertisementSpec, ClusterAdvertisementStatus};
    use pkg_types::meta::{Condition, ObjectMeta, set_condition};
    use pkg_types::quantity::Quantity;
    use pkg_types::reservation::{ReservationSpec, ReservationStatus};
    use pkg_types::resources::{ResourceMetrics, ResourceQuantities};

    const GI: i64 = 1024 * 1024 * 1024;

    async fn test_setup() -> (Arc<ReservationController>, Registry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().to_str().unwrap()).await.unwrap();
        let registry = Registry::new(store);
        let controller = Arc::new(ReservationController::new(
            registry.clone(),
            &BrokerSettings::default(),
        ));
        (controller, registry, dir)
    }

    fn make_advertisement(
        cluster_id: &str,
        allocatable_cpu: i64,
        allocatable_mem_gi: i64,
        allocated_cpu: i64,
        allocated_mem_gi: i64,
    ) -> ClusterAdvertisement {
        let mut resources = ResourceMetrics {
            allocatable: ResourceQuantities::new(
                Quantity::from_units(allocatable_cpu),
                Quantity::from_units(allocatable_mem_gi * GI),
            ),
            allocated: ResourceQuantities::new(
                Quantity::from_units(allocated_cpu),
                Quantity::from_units(allocated_mem_gi * GI),
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

    fn make_reservation(name: &str, cpu: i64, mem_gi: i64) -> Reservation {
        Reservation {
            metadata: ObjectMeta::new("default", name),
            spec: ReservationSpec {
                requester_id: "cluster-x".to_string(),
                requested_resources: ResourceQuantities::new(
                    Quantity::from_units(cpu),
                    Quantity::from_units(mem_gi * GI),
                ),
                target_cluster_id: String::new(),
                duration: None,
                priority: 0,
            },
            status: ReservationStatus::default(),
        }
    }

    async fn get_reservation(registry: &Registry, name: &str) -> Option<Reservation> {
        registry.get("default", name).await.unwrap()
    }

    async fn get_advertisement(registry: &Registry, name: &str) -> ClusterAdvertisement {
        registry.get("default", name).await.unwrap().unwrap()
    }

    /// Reconcile one reservation by name until its phase settles or the
    /// iteration budget runs out.
    async fn drive(controller: &ReservationController, registry: &Registry, name: &str) {
        for _ in 0..5 {
            let Some(res) = get_reservation(registry, name).await else {
                return;
            };
            if res
                .status
                .phase
                .is_some_and(|p| p != ReservationPhase::Pending)
            {
                return;
            }
            controller.reconcile_one(res).await.unwrap();
        }
    }

    #[tokio::test]
    async fn selects_best_cluster_and_locks_capacity() {
        let (controller, registry, _dir) = test_setup().await;
        let mut a = make_advertisement("cluster-a", 10, 20, 2, 4);
        let mut b = make_advertisement("cluster-b", 10, 20, 6, 10);
        registry.create(&mut a).await.unwrap();
        registry.create(&mut b).await.unwrap();

        let mut res = make_reservation("res-1", 2, 4);
        registry.create(&mut res).await.unwrap();

        drive(&controller, &registry, "res-1").await;

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Reserved));
        assert_eq!(res.spec.target_cluster_id, "cluster-a");
        assert!(res.status.reserved_at.is_some());
        assert!(res.metadata.has_finalizer(RESERVATION_FINALIZER));

        let a = get_advertisement(&registry, "cluster-a").await;
        assert_eq!(a.spec.resources.reserved.cpu, Quantity::from_units(2));
        assert_eq!(
            a.spec.resources.reserved.memory,
            Quantity::from_units(4 * GI)
        );
        assert_eq!(a.spec.resources.available.cpu, Quantity::from_units(6));

        // The losing candidate is untouched.
        let b = get_advertisement(&registry, "cluster-b").await;
        assert_eq!(b.spec.resources.reserved.cpu, Quantity::ZERO);
    }

    #[tokio::test]
    async fn no_capacity_anywhere_fails_with_dimensions() {
        let (controller, registry, _dir) = test_setup().await;
        // Sole candidate has 1 CPU available.
        let mut a = make_advertisement("cluster-a", 10, 20, 9, 4);
        registry.create(&mut a).await.unwrap();

        let mut res = make_reservation("res-1", 2, 4);
        registry.create(&mut res).await.unwrap();

        drive(&controller, &registry, "res-1").await;

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Failed));
        assert!(res.status.message.contains("2 CPU"));

        let a = get_advertisement(&registry, "cluster-a").await;
        assert_eq!(a.spec.resources.reserved.cpu, Quantity::ZERO);
    }

    #[tokio::test]
    async fn invalid_spec_is_terminal() {
        let (controller, registry, _dir) = test_setup().await;
        let mut res = make_reservation("res-1", 2, 4);
        res.spec.requester_id = String::new();
        registry.create(&mut res).await.unwrap();

        drive(&controller, &registry, "res-1").await;

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Failed));
        assert!(
            res.status
                .message
                .contains("Invalid reservation specification")
        );
    }

    #[tokio::test]
    async fn pinned_target_that_vanished_is_terminal() {
        let (controller, registry, _dir) = test_setup().await;
        let mut res = make_reservation("res-1", 2, 4);
        res.spec.target_cluster_id = "cluster-gone".to_string();
        registry.create(&mut res).await.unwrap();

        drive(&controller, &registry, "res-1").await;

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Failed));
        assert!(res.status.message.contains("cluster-gone"));
    }

    #[tokio::test]
    async fn expiry_releases_capacity() {
        let (controller, registry, _dir) = test_setup().await;
        let mut a = make_advertisement("cluster-a", 10, 20, 0, 0);
        registry.create(&mut a).await.unwrap();

        let mut res = make_reservation("res-1", 2, 4);
        res.spec.duration = Some("1s".to_string());
        registry.create(&mut res).await.unwrap();

        drive(&controller, &registry, "res-1").await;
        let reserved = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(reserved.status.phase, Some(ReservationPhase::Reserved));
        assert!(reserved.status.expires_at.is_some());
        assert_eq!(
            get_advertisement(&registry, "cluster-a")
                .await
                .spec
                .resources
                .reserved
                .cpu,
            Quantity::from_units(2)
        );

        tokio::time::sleep(Duration::from_millis(1200)).await;
        controller.reconcile_one(reserved).await.unwrap();

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Released));

        let a = get_advertisement(&registry, "cluster-a").await;
        assert_eq!(a.spec.resources.reserved.cpu, Quantity::ZERO);
        assert_eq!(a.spec.resources.reserved.memory, Quantity::ZERO);
        assert_eq!(a.spec.resources.available.cpu, Quantity::from_units(10));
    }

    #[tokio::test]
    async fn concurrent_acquisitions_cannot_double_book() {
        let (controller, registry, _dir) = test_setup().await;
        let mut a = make_advertisement("cluster-a", 10, 20, 0, 0);
        registry.create(&mut a).await.unwrap();

        let mut first = make_reservation("res-1", 6, 4);
        let mut second = make_reservation("res-2", 6, 4);
        registry.create(&mut first).await.unwrap();
        registry.create(&mut second).await.unwrap();

        let c1 = Arc::clone(&controller);
        let r1 = registry.clone();
        let c2 = Arc::clone(&controller);
        let r2 = registry.clone();
        let (one, two) = tokio::join!(
            tokio::spawn(async move { drive(&c1, &r1, "res-1").await }),
            tokio::spawn(async move { drive(&c2, &r2, "res-2").await }),
        );
        one.unwrap();
        two.unwrap();

        let first = get_reservation(&registry, "res-1").await.unwrap();
        let second = get_reservation(&registry, "res-2").await.unwrap();
        let phases = [first.status.phase.unwrap(), second.status.phase.unwrap()];
        assert!(phases.contains(&ReservationPhase::Reserved));
        assert!(phases.contains(&ReservationPhase::Failed));

        let a = get_advertisement(&registry, "cluster-a").await;
        assert_eq!(a.spec.resources.reserved.cpu, Quantity::from_units(6));
        assert_eq!(a.spec.resources.held_by.len(), 1);

        let failed = if first.status.phase == Some(ReservationPhase::Failed) {
            &first
        } else {
            &second
        };
        assert!(failed.status.message.contains("Insufficient resources"));
    }

    #[tokio::test]
    async fn reacquisition_after_lost_phase_write_does_not_double_count() {
        let (controller, registry, _dir) = test_setup().await;
        let mut a = make_advertisement("cluster-a", 10, 20, 0, 0);
        registry.create(&mut a).await.unwrap();

        let mut res = make_reservation("res-1", 2, 4);
        registry.create(&mut res).await.unwrap();
        drive(&controller, &registry, "res-1").await;

        // Simulate a crash after the capacity write but before the phase
        // write: the hold exists while the reservation still looks new.
        let mut res = get_reservation(&registry, "res-1").await.unwrap();
        res.status = ReservationStatus::default();
        registry.update(&mut res).await.unwrap();

        drive(&controller, &registry, "res-1").await;

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Reserved));

        let a = get_advertisement(&registry, "cluster-a").await;
        assert_eq!(a.spec.resources.reserved.cpu, Quantity::from_units(2));
        assert_eq!(a.spec.resources.held_by.len(), 1);
    }

    #[tokio::test]
    async fn requester_conditions_drive_activation_and_release() {
        let (controller, registry, _dir) = test_setup().await;
        let mut a = make_advertisement("cluster-a", 10, 20, 0, 0);
        registry.create(&mut a).await.unwrap();

        let mut res = make_reservation("res-1", 2, 4);
        registry.create(&mut res).await.unwrap();
        drive(&controller, &registry, "res-1").await;

        // Requester signals activation.
        let mut res = get_reservation(&registry, "res-1").await.unwrap();
        set_condition(
            &mut res.status.conditions,
            Condition::new(
                RESERVATION_CONDITION_REQUESTER_ACTIVE,
                true,
                "RequesterSignal",
                "consumer is up",
            ),
        );
        registry.update(&mut res).await.unwrap();
        controller.reconcile_one(res).await.unwrap();

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Active));
        // Capacity stays locked while active.
        assert_eq!(
            get_advertisement(&registry, "cluster-a")
                .await
                .spec
                .resources
                .reserved
                .cpu,
            Quantity::from_units(2)
        );

        // Requester signals it is done.
        let mut res = get_reservation(&registry, "res-1").await.unwrap();
        set_condition(
            &mut res.status.conditions,
            Condition::new(
                RESERVATION_CONDITION_REQUESTER_RELEASED,
                true,
                "RequesterSignal",
                "consumer is done",
            ),
        );
        registry.update(&mut res).await.unwrap();
        controller.reconcile_one(res).await.unwrap();

        let res = get_reservation(&registry, "res-1").await.unwrap();
        assert_eq!(res.status.phase, Some(ReservationPhase::Released));
        assert_eq!(
            get_advertisement(&registry, "cluster-a")
                .await
                .spec
                .resources
                .reserved
                .cpu,
            Quantity::ZERO
        );
    }

    #[tokio::test]
    async fn deleting_a_reserved_reservation_returns_exactly_its_capacity() {
        let (controller, registry, _dir) = test_setup().await;
        let mut a = make_advertisement("cluster-a", 10, 20, 0, 0);
        registry.create(&mut a).await.unwrap();

        let mut res = make_reservation("res-1", 2, 4);
        registry.create(&mut res).await.unwrap();
        drive(&controller, &registry, "res-1").await;

        registry
            .delete::<Reservation>("default", "res-1")
            .await
            .unwrap();

        // Still present: the finalizer holds it until capacity is back.
        let marked = get_reservation(&registry, "res-1").await.unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        controller.reconcile_one(marked).await.unwrap();

        assert!(get_reservation(&registry, "res-1").await.is_none());
        let a = get_advertisement(&registry, "cluster-a").await;
        assert_eq!(a.spec.resources.reserved.cpu, Quantity::ZERO);
        assert_eq!(a.spec.resources.available.cpu, Quantity::from_units(10));
        assert!(a.spec.resources.held_by.is_empty());
    }
}
