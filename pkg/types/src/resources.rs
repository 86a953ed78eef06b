use std::collections::BTreeMap;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::quantity::Quantity;

/// One amount per tracked resource dimension. GPU and storage are optional
/// and only participate in accounting when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantities {
    pub cpu: Quantity,
    pub memory: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Quantity>,
}

impl ResourceQuantities {
    pub fn new(cpu: Quantity, memory: Quantity) -> Self {
        Self {
            cpu,
            memory,
            gpu: None,
            storage: None,
        }
    }
}

/// Capacity breakdown of one member cluster, plus the broker's own
/// reservation accounting.
///
/// `capacity`, `allocatable`, and `allocated` are written by the cluster's
/// agent. `reserved`, `available`, and `held_by` are owned by the broker:
/// `held_by` maps a reservation key (`namespace/name`) to the exact amounts
/// that reservation holds, so acquisition and release are idempotent per
/// reservation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub capacity: ResourceQuantities,
    pub allocatable: ResourceQuantities,
    pub allocated: ResourceQuantities,
    #[serde(default)]
    pub reserved: ResourceQuantities,
    #[serde(default)]
    pub available: ResourceQuantities,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub held_by: BTreeMap<String, ResourceQuantities>,
}

impl ResourceMetrics {
    /// Recompute `available = max(0, allocatable − allocated − reserved)`
    /// on every dimension. The single source of truth; `available` is never
    /// trusted as stored.
    pub fn update_available(&mut self) {
        self.available.cpu = self
            .allocatable
            .cpu
            .saturating_sub(self.allocated.cpu)
            .saturating_sub(self.reserved.cpu);
        self.available.memory = self
            .allocatable
            .memory
            .saturating_sub(self.allocated.memory)
            .saturating_sub(self.reserved.memory);
        self.available.gpu = self.allocatable.gpu.map(|allocatable| {
            allocatable
                .saturating_sub(self.allocated.gpu.unwrap_or(Quantity::ZERO))
                .saturating_sub(self.reserved.gpu.unwrap_or(Quantity::ZERO))
        });
        self.available.storage = self.allocatable.storage.map(|allocatable| {
            allocatable
                .saturating_sub(self.allocated.storage.unwrap_or(Quantity::ZERO))
                .saturating_sub(self.reserved.storage.unwrap_or(Quantity::ZERO))
        });
    }

    /// Exact headroom check on every dimension the request names.
    pub fn can_reserve(&self, request: &ResourceQuantities) -> bool {
        if self.available.cpu < request.cpu || self.available.memory < request.memory {
            return false;
        }
        if let Some(gpu) = request.gpu
            && self.available.gpu.unwrap_or(Quantity::ZERO) < gpu
        {
            return false;
        }
        if let Some(storage) = request.storage
            && self.available.storage.unwrap_or(Quantity::ZERO) < storage
        {
            return false;
        }
        true
    }

    /// Record a reservation's hold and count it in `reserved`.
    ///
    /// Returns false without changing anything when this reservation already
    /// holds capacity here, so a reconcile retrying after a crash between the
    /// capacity write and the phase write cannot double-count.
    pub fn add_reservation(&mut self, key: &str, request: &ResourceQuantities) -> bool {
        if self.held_by.contains_key(key) {
            return false;
        }
        self.held_by.insert(key.to_string(), request.clone());
        self.reserved.cpu = saturating_add(self.reserved.cpu, request.cpu);
        self.reserved.memory = saturating_add(self.reserved.memory, request.memory);
        if let Some(gpu) = request.gpu {
            self.reserved.gpu = Some(saturating_add(
                self.reserved.gpu.unwrap_or(Quantity::ZERO),
                gpu,
            ));
        }
        if let Some(storage) = request.storage {
            self.reserved.storage = Some(saturating_add(
                self.reserved.storage.unwrap_or(Quantity::ZERO),
                storage,
            ));
        }
        self.update_available();
        true
    }

    /// Return a reservation's hold to the pool.
    ///
    /// `Ok(None)` when nothing was held under `key` (already released).
    /// The subtraction is clamped at zero so release always makes progress;
    /// an `Err` reports that `reserved` was smaller than the recorded hold,
    /// which indicates a prior accounting bug and deserves a loud log.
    pub fn remove_reservation(&mut self, key: &str) -> anyhow::Result<Option<ResourceQuantities>> {
        let Some(hold) = self.held_by.remove(key) else {
            return Ok(None);
        };
        let mut underflow = false;

        let (cpu, under) = sub_reporting(self.reserved.cpu, hold.cpu);
        self.reserved.cpu = cpu;
        underflow |= under;

        let (memory, under) = sub_reporting(self.reserved.memory, hold.memory);
        self.reserved.memory = memory;
        underflow |= under;

        if let Some(gpu) = hold.gpu {
            let (rest, under) = sub_reporting(self.reserved.gpu.unwrap_or(Quantity::ZERO), gpu);
            self.reserved.gpu = Some(rest);
            underflow |= under;
        }
        if let Some(storage) = hold.storage {
            let (rest, under) =
                sub_reporting(self.reserved.storage.unwrap_or(Quantity::ZERO), storage);
            self.reserved.storage = Some(rest);
            underflow |= under;
        }
        self.update_available();

        if underflow {
            bail!(
                "reserved total was smaller than the hold for '{}'; clamped at zero",
                key
            );
        }
        Ok(Some(hold))
    }

    /// True when outstanding reservations exceed what is still available on
    /// any tracked dimension.
    pub fn overcommitted(&self) -> bool {
        if self.reserved.cpu > self.available.cpu || self.reserved.memory > self.available.memory {
            return true;
        }
        if let (Some(reserved), Some(available)) = (self.reserved.gpu, self.available.gpu)
            && reserved > available
        {
            return true;
        }
        if let (Some(reserved), Some(available)) = (self.reserved.storage, self.available.storage)
            && reserved > available
        {
            return true;
        }
        false
    }
}

fn saturating_add(a: Quantity, b: Quantity) -> Quantity {
    a.checked_add(b)
        .unwrap_or(Quantity::from_millis(i64::MAX))
}

fn sub_reporting(current: Quantity, amount: Quantity) -> (Quantity, bool) {
    match current.checked_sub(amount) {
        Some(rest) => (rest, false),
        None => (Quantity::ZERO, true),
    }
}
