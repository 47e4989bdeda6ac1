//! DC Fast-Charge Controller (§4.6)
//!
//! Per-station setpoint pipeline: validate → ramp → thermal derate →
//! vehicle taper, applied on every `set_power_limit`.

use crate::capability::CapabilityRegistry;
use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use crate::types::Capability;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default)]
pub struct DcTaperConfig {
    pub enabled: bool,
    pub start_soc_percent: f64,
    pub taper_rate: f64,
}

#[derive(Debug, Clone)]
pub struct DcSetpointRecord {
    pub applied_power_kw: f64,
    pub target_power_kw: f64,
    pub ramped: bool,
    pub derated: bool,
    pub tapered: bool,
}

struct StationDcState {
    applied_power_kw: f64,
    last_updated_ms: u64,
    last_thermal_bucket: ThermalBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThermalBucket {
    Cool,
    Warm,
    Hot,
    VeryHot,
    Critical,
}

fn thermal_bucket(temperature_c: f64) -> (ThermalBucket, f64) {
    if temperature_c < 60.0 {
        (ThermalBucket::Cool, 0.0)
    } else if temperature_c < 70.0 {
        (ThermalBucket::Warm, 0.0)
    } else if temperature_c < 80.0 {
        (ThermalBucket::Hot, 0.20)
    } else if temperature_c < 90.0 {
        (ThermalBucket::VeryHot, 0.50)
    } else {
        (ThermalBucket::Critical, 0.80)
    }
}

/// DC Fast-Charge Controller (§4.6).
pub struct DcController {
    state: Arc<Mutex<HashMap<String, StationDcState>>>,
    logger: crate::logging::StructuredLogger,
}

impl DcController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            logger: get_logger("control::dc"),
        }
    }

    /// Apply the full pipeline: validate → ramp → derate → taper (§4.6 steps 1-5).
    pub async fn set_power_limit(
        &self,
        station_id: &str,
        capability: &Capability,
        target_kw: f64,
        temperature_c: Option<f64>,
        soc_percent: Option<f64>,
        taper: DcTaperConfig,
    ) -> Result<DcSetpointRecord> {
        if target_kw < 0.0 && !capability.features.bidirectional {
            return Err(DlmError::validation(
                "power_kw",
                "negative power requires the bidirectional capability feature",
            ));
        }
        let magnitude = target_kw.abs();
        if magnitude > 0.0 && (magnitude < capability.p_min_kw || magnitude > capability.p_max_kw) {
            return Err(DlmError::constraint_violation(format!(
                "power {target_kw} kW outside envelope for {station_id}"
            )));
        }

        let mut state = self.state.lock().await;
        let now = now_ms();
        let entry = state.entry(station_id.to_string()).or_insert_with(|| StationDcState {
            applied_power_kw: 0.0,
            last_updated_ms: now,
            last_thermal_bucket: ThermalBucket::Cool,
        });
        let dt_ms = now.saturating_sub(entry.last_updated_ms).max(1);

        // Step 2: ramp limit.
        let ramped_value =
            CapabilityRegistry::ramp_limit(capability, entry.applied_power_kw, target_kw, dt_ms);
        let ramped = (ramped_value - target_kw).abs() > 1e-6;

        // Step 3: thermal derating.
        let (bucket, derate_factor) = temperature_c
            .map(thermal_bucket)
            .unwrap_or((ThermalBucket::Cool, 0.0));
        if bucket != entry.last_thermal_bucket {
            self.logger.info(&format!(
                "{station_id} thermal bucket transition {:?} -> {:?}",
                entry.last_thermal_bucket, bucket
            ));
            entry.last_thermal_bucket = bucket;
        }
        let derated = derate_factor > 0.0;
        let after_derate = ramped_value * (1.0 - derate_factor);

        // Step 4: vehicle taper.
        let (after_taper, tapered) = match (taper.enabled, soc_percent) {
            (true, Some(soc)) if soc >= taper.start_soc_percent => {
                let factor = (1.0
                    - ((soc - taper.start_soc_percent) / (100.0 - taper.start_soc_percent))
                        * taper.taper_rate)
                    .max(0.1);
                (after_derate * factor, true)
            }
            _ => (after_derate, false),
        };

        entry.applied_power_kw = after_taper;
        entry.last_updated_ms = now;

        Ok(DcSetpointRecord {
            applied_power_kw: after_taper,
            target_power_kw: target_kw,
            ramped,
            derated,
            tapered,
        })
    }

    /// Derive target power from a current limit and the last measured
    /// voltage (fallback to nominal), then delegate to `set_power_limit`.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_current_limit(
        &self,
        station_id: &str,
        capability: &Capability,
        target_current_a: f64,
        measured_voltage: Option<f64>,
        nominal_voltage: f64,
        temperature_c: Option<f64>,
        soc_percent: Option<f64>,
        taper: DcTaperConfig,
    ) -> Result<DcSetpointRecord> {
        let voltage = measured_voltage.unwrap_or(nominal_voltage);
        let target_kw = target_current_a * voltage / 1000.0;
        self.set_power_limit(station_id, capability, target_kw, temperature_c, soc_percent, taper)
            .await
    }

    pub async fn applied_power(&self, station_id: &str) -> Option<f64> {
        self.state
            .lock()
            .await
            .get(station_id)
            .map(|s| s.applied_power_kw)
    }
}

impl Default for DcController {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let epoch = EPOCH.get_or_init(std::time::Instant::now);
    epoch.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CapabilityFeatures;

    fn dc_capability(bidirectional: bool) -> Capability {
        Capability {
            i_min: 0.0,
            i_max: 0.0,
            i_step: 0.0,
            p_min_kw: 2.0,
            p_max_kw: 150.0,
            ramp_rate: 1000.0,
            min_update_interval_ms: 500,
            typical_update_interval_ms: 1_000,
            phases: 0,
            features: CapabilityFeatures {
                bidirectional,
                ..Default::default()
            },
            is_fallback: false,
        }
    }

    #[tokio::test]
    async fn test_thermal_derating_applied() {
        let controller = DcController::new();
        let cap = dc_capability(false);
        let record = controller
            .set_power_limit("s1", &cap, 100.0, Some(85.0), None, DcTaperConfig::default())
            .await
            .unwrap();
        assert!(record.derated);
        assert!(record.applied_power_kw < 100.0);
    }

    #[tokio::test]
    async fn test_vehicle_taper_applied_above_threshold() {
        let controller = DcController::new();
        let cap = dc_capability(false);
        let taper = DcTaperConfig {
            enabled: true,
            start_soc_percent: 80.0,
            taper_rate: 0.8,
        };
        let record = controller
            .set_power_limit("s1", &cap, 100.0, None, Some(95.0), taper)
            .await
            .unwrap();
        assert!(record.tapered);
        assert!(record.applied_power_kw < 100.0);
    }

    #[tokio::test]
    async fn test_negative_power_rejected_without_bidirectional() {
        let controller = DcController::new();
        let cap = dc_capability(false);
        let result = controller
            .set_power_limit("s1", &cap, -10.0, None, None, DcTaperConfig::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_negative_power_allowed_with_bidirectional() {
        let controller = DcController::new();
        let cap = dc_capability(true);
        let result = controller
            .set_power_limit("s1", &cap, -10.0, None, None, DcTaperConfig::default())
            .await;
        assert!(result.is_ok());
    }
}
