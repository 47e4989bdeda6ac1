//! Core data model shared by the State Store, Allocator, Constraints,
//! Shedding, Fail-Safe, and Capability Registry (§3).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Electrical class of a charging station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StationClass {
    Ac1Phase,
    Ac3Phase,
    Dc,
}

/// Operational status of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StationStatus {
    Offline,
    Ready,
    Charging,
    Error,
    Unavailable,
}

/// Per-phase AC current setpoint/measurement, amps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PhaseCurrents {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl PhaseCurrents {
    pub fn mean_nonzero(&self) -> f64 {
        let values: Vec<f64> = [self.a, self.b, self.c]
            .into_iter()
            .filter(|v| *v > 0.0)
            .collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    /// Maximum fractional deviation from the mean across non-zero phases.
    pub fn imbalance(&self) -> f64 {
        let mean = self.mean_nonzero();
        if mean <= 0.0 {
            return 0.0;
        }
        [self.a, self.b, self.c]
            .into_iter()
            .filter(|v| *v > 0.0)
            .map(|v| (v - mean).abs() / mean)
            .fold(0.0, f64::max)
    }
}

/// Per-station electrical envelope and feature set, produced by
/// `CapabilityRegistry::discover` (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capability {
    pub i_min: f64,
    pub i_max: f64,
    pub i_step: f64,
    pub p_min_kw: f64,
    pub p_max_kw: f64,
    /// A/s for AC stations, kW/s for DC.
    pub ramp_rate: f64,
    pub min_update_interval_ms: u64,
    pub typical_update_interval_ms: u64,
    pub phases: u8,
    pub features: CapabilityFeatures,
    /// True if `discover` failed and this is the conservative fallback.
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityFeatures {
    pub bidirectional: bool,
    pub vehicle_taper: bool,
    pub thermal_management: bool,
    pub iso15118: bool,
    pub phase_balancing: bool,
}

impl Capability {
    /// Conservative fallback envelope used when `discover` fails (§4.2).
    pub fn fallback_ac() -> Self {
        Self {
            i_min: 6.0,
            i_max: 16.0,
            i_step: 1.0,
            p_min_kw: 1.4,
            p_max_kw: 3.7,
            ramp_rate: 2.0,
            min_update_interval_ms: 1_000,
            typical_update_interval_ms: 5_000,
            phases: 1,
            features: CapabilityFeatures::default(),
            is_fallback: true,
        }
    }
}

/// A charging station (§3 Station).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub class: StationClass,
    pub connector_type: String,
    pub nominal_voltage: f64,

    pub priority: u8,
    pub user_priority_class: Option<u8>,

    pub status: StationStatus,
    pub online: bool,

    pub requested_power_kw: f64,
    pub current_power_kw: f64,
    pub phase_currents: PhaseCurrents,
    pub temperature_c: Option<f64>,
    pub soc_percent: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub charging_started_at: Option<DateTime<Utc>>,
    pub last_command_at: Option<DateTime<Utc>>,

    pub session_energy_kwh: f64,
    pub total_delivered_kwh: f64,

    pub scheduled_charging: bool,

    #[serde(default)]
    pub capability: Option<Capability>,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>, class: StationClass) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            zone: "default".to_string(),
            class,
            connector_type: "type2".to_string(),
            nominal_voltage: 230.0,
            priority: 5,
            user_priority_class: None,
            status: StationStatus::Offline,
            online: false,
            requested_power_kw: 0.0,
            current_power_kw: 0.0,
            phase_currents: PhaseCurrents::default(),
            temperature_c: None,
            soc_percent: None,
            created_at: now,
            last_seen: now,
            charging_started_at: None,
            last_command_at: None,
            session_energy_kwh: 0.0,
            total_delivered_kwh: 0.0,
            scheduled_charging: false,
            capability: None,
        }
    }
}

/// Meter role (§3 Meter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MeterRole {
    Grid,
    Building,
    Solar,
    Zone,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meter {
    pub id: String,
    pub role: MeterRole,
    pub power_kw: f64,
    pub total_energy_kwh: f64,
    pub voltage: f64,
    pub current: f64,
    pub power_factor: f64,
    pub frequency: f64,
    pub last_seen: DateTime<Utc>,
}

impl Meter {
    pub fn new(id: impl Into<String>, role: MeterRole) -> Self {
        Self {
            id: id.into(),
            role,
            power_kw: 0.0,
            total_energy_kwh: 0.0,
            voltage: 230.0,
            current: 0.0,
            power_factor: 1.0,
            frequency: 50.0,
            last_seen: Utc::now(),
        }
    }
}

/// Per-station outcome recorded in a tick result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StationAllocation {
    pub station_id: String,
    pub decided_power_kw: f64,
    pub reason: String,
}

/// Result of one Allocator tick (§3 Allocation Tick Result).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AllocationTickResult {
    pub tick_id: u64,
    pub timestamp: DateTime<Utc>,
    pub available_capacity_kw: f64,
    pub allocations: Vec<StationAllocation>,
    pub total_allocated_kw: f64,
}

/// Violation severity (§3 Violation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Violation {
    pub component: String,
    pub kind: String,
    pub severity: ViolationSeverity,
    pub measured: f64,
    pub limit: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Site constraints topology (§3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    pub phase_count: u8,
    pub i_max_per_phase: f64,
    pub p_max_kw: f64,
    pub voltage_nominal: f64,
    pub voltage_tolerance: f64,
    pub frequency_nominal: f64,
    pub frequency_tolerance: f64,
    pub min_power_factor: f64,
    pub continuous_load_factor: f64,
    pub max_phase_imbalance: f64,
    pub measured_power_kw: f64,
    pub measured_current_per_phase: PhaseCurrents,
    pub measured_power_factor: f64,
    pub measured_voltage: f64,
    pub measured_frequency: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            phase_count: 3,
            i_max_per_phase: 800.0,
            p_max_kw: 500.0,
            voltage_nominal: 230.0,
            voltage_tolerance: 0.05,
            frequency_nominal: 50.0,
            frequency_tolerance: 0.02,
            min_power_factor: 0.95,
            continuous_load_factor: 0.80,
            max_phase_imbalance: 0.20,
            measured_power_kw: 0.0,
            measured_current_per_phase: PhaseCurrents::default(),
            measured_power_factor: 1.0,
            measured_voltage: 230.0,
            measured_frequency: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FeederConfig {
    pub id: String,
    pub i_max: f64,
    pub p_max_kw: f64,
    pub breaker_rating: f64,
    pub cable_ampacity: f64,
    pub stations: Vec<String>,
    pub measured_current: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThermalCurvePoint {
    pub load_factor: f64,
    pub max_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransformerConfig {
    pub id: String,
    pub rated_kva: f64,
    pub continuous_factor: f64,
    pub thermal_curve: Vec<ThermalCurvePoint>,
    pub max_temperature_c: f64,
    pub feeders: Vec<String>,
    pub measured_load_kw: f64,
    pub measured_temperature_c: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SiteConstraintsTopology {
    pub service: ServiceConfig,
    pub feeders: Vec<FeederConfig>,
    pub transformers: Vec<TransformerConfig>,
}

/// Zone configuration: optional proportional cap (§4.9 step 5, §9 Open Questions).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ZoneConfig {
    pub zone: String,
    pub cap_kw: Option<f64>,
}

/// Per-station fail-safe configuration and runtime state (§3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub enum OfflineAction {
    Maintain,
    Reduce,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FailSafeStationState {
    pub station_id: String,
    pub safe_power_kw: f64,
    pub offline_action: OfflineAction,
    pub comm_timeout_ms: u64,
    pub last_comm: DateTime<Utc>,
    pub failsafe_active: bool,
    pub consecutive_timeouts: u32,
    pub last_known_good_kw: f64,
}

impl FailSafeStationState {
    pub fn new(station_id: impl Into<String>, comm_timeout_ms: u64) -> Self {
        Self {
            station_id: station_id.into(),
            safe_power_kw: 0.0,
            offline_action: OfflineAction::Reduce,
            comm_timeout_ms,
            last_comm: Utc::now(),
            failsafe_active: false,
            consecutive_timeouts: 0,
            last_known_good_kw: 0.0,
        }
    }
}

/// Shedding state (§3).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SheddingEvent {
    pub timestamp: DateTime<Utc>,
    pub from_level: u8,
    pub to_level: u8,
    pub smoothed_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SheddingState {
    pub level: u8,
    pub smoothed_ratio: f64,
    pub last_shed_at: Option<DateTime<Utc>>,
    pub last_restore_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub history: Vec<SheddingEvent>,
}

impl Default for SheddingState {
    fn default() -> Self {
        Self {
            level: 0,
            smoothed_ratio: 0.0,
            last_shed_at: None,
            last_restore_at: None,
            history: Vec::new(),
        }
    }
}

/// Persisted document (§3 "Persisted document (expansion)", §4.11).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub stations: HashMap<String, Station>,
    pub meters: HashMap<String, Meter>,
    pub constraints: SiteConstraintsTopology,
    pub zones: Vec<ZoneConfig>,
    pub shedding: SheddingState,
    pub failsafe: HashMap<String, FailSafeStationState>,
    pub last_known_good: HashMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_imbalance() {
        let p = PhaseCurrents {
            a: 16.0,
            b: 16.0,
            c: 10.0,
        };
        assert!(p.imbalance() > 0.1);
        let balanced = PhaseCurrents {
            a: 10.0,
            b: 10.0,
            c: 10.0,
        };
        assert_eq!(balanced.imbalance(), 0.0);
    }

    #[test]
    fn test_station_new_defaults_offline() {
        let s = Station::new("s1", "Station 1", StationClass::Ac3Phase);
        assert_eq!(s.status, StationStatus::Offline);
        assert!(!s.online);
    }
}
