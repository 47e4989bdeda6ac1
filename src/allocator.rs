//! Allocator — periodic balancing loop (§4.9)
//!
//! Each tick: snapshot state, compute available capacity, order stations by
//! priority, two-pass distribute, apply zone/shedding/fail-safe overrides,
//! and dispatch only changed setpoints through the controllers.

use crate::capability::CapabilityRegistry;
use crate::config::{AllocatorConfig, GridConfig};
use crate::logging::get_logger;
use crate::shedding::{ShedAction, SheddingController};
use crate::state::{Command, StateStore};
use crate::types::{
    AllocationTickResult, Capability, MeterRole, OfflineAction, Station, StationAllocation,
    StationStatus,
};
use std::collections::HashMap;

const DISPATCH_EPSILON_KW: f64 = 0.1;

pub struct Allocator {
    store: StateStore,
    capabilities: std::sync::Arc<CapabilityRegistry>,
    constraints: std::sync::Arc<crate::constraints::ConstraintsEvaluator>,
    shedding: std::sync::Arc<SheddingController>,
    grid: GridConfig,
    config: AllocatorConfig,
    last_dispatched: std::sync::Mutex<HashMap<String, f64>>,
    logger: crate::logging::StructuredLogger,
}

impl Allocator {
    pub fn new(
        store: StateStore,
        capabilities: std::sync::Arc<CapabilityRegistry>,
        constraints: std::sync::Arc<crate::constraints::ConstraintsEvaluator>,
        shedding: std::sync::Arc<SheddingController>,
        grid: GridConfig,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            store,
            capabilities,
            constraints,
            shedding,
            grid,
            config,
            last_dispatched: std::sync::Mutex::new(HashMap::new()),
            logger: get_logger("allocator"),
        }
    }

    /// Order stations per §4.9 step 3: priority desc, user-priority-class
    /// asc, scheduled-first, then earliest `charging_started_at`.
    fn order_stations(mut stations: Vec<Station>) -> Vec<Station> {
        stations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    a.user_priority_class
                        .unwrap_or(u8::MAX)
                        .cmp(&b.user_priority_class.unwrap_or(u8::MAX))
                })
                .then_with(|| b.scheduled_charging.cmp(&a.scheduled_charging))
                .then_with(|| {
                    a.charging_started_at
                        .unwrap_or(a.created_at)
                        .cmp(&b.charging_started_at.unwrap_or(b.created_at))
                })
        });
        stations
    }

    /// Run a single tick; returns the result that gets recorded into history.
    pub async fn tick(&self) -> AllocationTickResult {
        let snapshot = self.store.snapshot().await;
        let tick_id = self.store.next_tick_id();

        let mut active: Vec<Station> = snapshot
            .stations
            .values()
            .filter(|s| matches!(s.status, StationStatus::Charging | StationStatus::Ready))
            .cloned()
            .collect();

        if active.is_empty() {
            let result = AllocationTickResult {
                tick_id,
                timestamp: chrono::Utc::now(),
                available_capacity_kw: 0.0,
                allocations: Vec::new(),
                total_allocated_kw: 0.0,
            };
            self.store.record_tick(result.clone()).await;
            return result;
        }

        // Step 2: available capacity.
        let grid_capacity = self.grid.max_grid_capacity_kw;
        let pv_production: f64 = if self.grid.pv_system_enabled {
            snapshot
                .meters
                .values()
                .filter(|m| m.role == MeterRole::Solar)
                .map(|m| m.power_kw)
                .sum()
        } else {
            0.0
        };
        let building_load: f64 = snapshot
            .meters
            .values()
            .filter(|m| m.role == MeterRole::Building)
            .map(|m| m.power_kw)
            .sum();
        let mut available = (grid_capacity + pv_production - building_load).max(0.0);
        let constraints_capacity = self.constraints.available_capacity(&snapshot.constraints);
        available = available.min(constraints_capacity);

        active = Self::order_stations(active);

        let mut allocations: HashMap<String, (f64, String)> = HashMap::new();

        // Pass A: minimum guarantee.
        let mut remaining = available;
        for station in &active {
            let capability = snapshot_capability(&self.capabilities, &station.id).await;
            let p_min = capability
                .as_ref()
                .map(|c| c.p_min_kw)
                .unwrap_or(self.grid.min_charging_power_kw);
            let minimum = p_min.min(station.requested_power_kw);
            if remaining >= minimum && minimum > 0.0 {
                allocations.insert(station.id.clone(), (minimum, "minimum_guarantee".to_string()));
                remaining -= minimum;
            } else {
                allocations.insert(station.id.clone(), (0.0, "insufficient_capacity".to_string()));
            }
        }

        // Pass B: surplus top-up.
        for station in &active {
            let Some((current, reason)) = allocations.get(&station.id).cloned() else {
                continue;
            };
            if current <= 0.0 {
                continue;
            }
            let capability = snapshot_capability(&self.capabilities, &station.id).await;
            let p_max = capability
                .as_ref()
                .map(|c| c.p_max_kw)
                .unwrap_or(self.grid.max_charging_power_per_station_kw)
                .min(self.grid.max_charging_power_per_station_kw);
            let desired = station.requested_power_kw.min(p_max);
            let topup = (desired - current).max(0.0).min(remaining);
            if topup > 0.0 {
                allocations.insert(station.id.clone(), (current + topup, reason));
                remaining -= topup;
            }
        }

        // Step 5: zone proportional scaling.
        let mut zone_totals: HashMap<String, f64> = HashMap::new();
        for station in &active {
            if let Some((power, _)) = allocations.get(&station.id) {
                *zone_totals.entry(station.zone.clone()).or_insert(0.0) += power;
            }
        }
        for zone in &snapshot.zones {
            let Some(cap_kw) = zone.cap_kw else { continue };
            let total = zone_totals.get(&zone.zone).copied().unwrap_or(0.0);
            if total > cap_kw && total > 0.0 {
                let scale = cap_kw / total;
                for station in active.iter().filter(|s| s.zone == zone.zone) {
                    if let Some((power, reason)) = allocations.get_mut(&station.id) {
                        let capability_p_min = self.grid.min_charging_power_kw;
                        let scaled = *power * scale;
                        if scaled < capability_p_min {
                            *power = 0.0;
                            *reason = "zone_cap".to_string();
                        } else {
                            *power = scaled;
                            *reason = "zone_cap".to_string();
                        }
                    }
                }
            }
        }

        // Step 6: shedding override.
        if snapshot.shedding.level > 0 {
            if let Some(strategy) = self.shedding.strategy_for_level(snapshot.shedding.level) {
                for station in &active {
                    if station.priority > strategy.priority_at_or_below {
                        continue;
                    }
                    if let Some((power, reason)) = allocations.get_mut(&station.id) {
                        let capped = match strategy.action {
                            ShedAction::Stop => 0.0,
                            ShedAction::Reduce => *power * (1.0 - strategy.reduction_fraction),
                        };
                        if capped < *power {
                            *power = capped;
                            *reason = "load_shedding".to_string();
                        }
                    }
                }
            }
        }

        // Step 7: fail-safe override.
        for station in &active {
            if let Some(fs) = snapshot.failsafe.get(&station.id) {
                if fs.failsafe_active {
                    let target = match fs.offline_action {
                        OfflineAction::Maintain => fs.last_known_good_kw,
                        OfflineAction::Reduce => fs.safe_power_kw,
                        OfflineAction::Stop => 0.0,
                    };
                    allocations.insert(station.id.clone(), (target, "fail_safe".to_string()));
                }
            }
        }

        // Step 8: dispatch only changes above threshold.
        let mut last_dispatched = self.last_dispatched.lock().unwrap();
        let mut station_outcomes = Vec::with_capacity(active.len());
        let mut total_allocated = 0.0;
        for station in &active {
            let (power, reason) = allocations
                .get(&station.id)
                .cloned()
                .unwrap_or((0.0, "insufficient_capacity".to_string()));
            total_allocated += power;
            let previous = last_dispatched.get(&station.id).copied().unwrap_or(f64::NAN);
            if (power - previous).abs() > self.config.dispatch_threshold_kw || previous.is_nan() {
                last_dispatched.insert(station.id.clone(), power);
                let _ = self
                    .store
                    .apply(Command::RecordAllocation {
                        station_id: station.id.clone(),
                        decided_power_kw: power,
                    })
                    .await;
            }
            station_outcomes.push(StationAllocation {
                station_id: station.id.clone(),
                decided_power_kw: power,
                reason,
            });
        }
        drop(last_dispatched);

        let result = AllocationTickResult {
            tick_id,
            timestamp: chrono::Utc::now(),
            available_capacity_kw: available,
            allocations: station_outcomes,
            total_allocated_kw: total_allocated,
        };
        self.store.record_tick(result.clone()).await;
        result
    }

    /// Run ticks on `tick_period_ms` cadence until `shutdown` fires (§5 T2).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.config.tick_period_ms,
        ));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.logger.info("allocator shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn snapshot_capability(
    registry: &CapabilityRegistry,
    station_id: &str,
) -> Option<Capability> {
    registry.get(station_id).await
}
