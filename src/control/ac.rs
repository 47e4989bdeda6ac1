//! AC Phase-Current Controller (§4.5)
//!
//! Holds per-station `{A, B, C}` setpoints, applies imbalance auto-balance,
//! ramp-limiting, and power↔phases conversion.

use crate::capability::CapabilityRegistry;
use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use crate::types::{Capability, PhaseCurrents};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimum live current per IEC 61851; below this a session pauses at 0 A
/// rather than a sub-minimum positive value (§4.5 tie-break).
const MIN_LIVE_CURRENT_A: f64 = 6.0;

pub struct SetPhaseCurrentsOptions {
    pub auto_balance: bool,
}

struct StationAcState {
    setpoint: PhaseCurrents,
    last_updated_ms: u64,
}

/// AC Phase-Current Controller (§4.5).
pub struct AcController {
    state: Arc<Mutex<HashMap<String, StationAcState>>>,
    logger: crate::logging::StructuredLogger,
}

impl AcController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            logger: get_logger("control::ac"),
        }
    }

    /// Set per-phase currents for a station, with validation, imbalance
    /// correction, and the IEC 61851 minimum-current tie-break (§4.5).
    pub async fn set_phase_currents(
        &self,
        station_id: &str,
        capability: &Capability,
        mut target: PhaseCurrents,
        phases_live: u8,
        options: SetPhaseCurrentsOptions,
    ) -> Result<PhaseCurrents> {
        if capability.phases == 0 {
            return Err(DlmError::state_conflict(format!(
                "station {station_id} is not an AC station"
            )));
        }

        // Normalize phases for 1Φ vs 3Φ: zero unused phases.
        if phases_live == 1 {
            target.b = 0.0;
            target.c = 0.0;
        }

        // Tie-break: below minimum live current, the session pauses at 0 A.
        for phase in [&mut target.a, &mut target.b, &mut target.c] {
            if *phase > 0.0 && *phase < MIN_LIVE_CURRENT_A {
                *phase = 0.0;
            }
        }

        if target.imbalance() > 0.20 && options.auto_balance {
            let total = target.a + target.b + target.c;
            let balanced = (total / 3.0).round();
            target = PhaseCurrents {
                a: if phases_live >= 1 { balanced } else { 0.0 },
                b: if phases_live >= 3 { balanced } else { 0.0 },
                c: if phases_live >= 3 { balanced } else { 0.0 },
            };
        }

        for phase in [target.a, target.b, target.c] {
            if phase == 0.0 {
                continue;
            }
            if phase < capability.i_min || phase > capability.i_max {
                return Err(DlmError::constraint_violation(format!(
                    "phase current {phase} A outside envelope for {station_id}"
                )));
            }
        }

        let mut state = self.state.lock().await;
        state.insert(
            station_id.to_string(),
            StationAcState {
                setpoint: target,
                last_updated_ms: now_ms(),
            },
        );
        Ok(target)
    }

    /// Ramp the live setpoint toward `target` by one step, honoring the
    /// capability's ramp rate. Returns the next value to dispatch; callers
    /// loop this until it equals `target` within ±1 A (§4.5).
    pub async fn ramp_phase_currents(
        &self,
        station_id: &str,
        capability: &Capability,
        target: PhaseCurrents,
    ) -> PhaseCurrents {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let entry = state.entry(station_id.to_string()).or_insert_with(|| StationAcState {
            setpoint: PhaseCurrents::default(),
            last_updated_ms: now,
        });
        let dt_ms = now.saturating_sub(entry.last_updated_ms).max(1);
        let next = PhaseCurrents {
            a: CapabilityRegistry::ramp_limit(capability, entry.setpoint.a, target.a, dt_ms),
            b: CapabilityRegistry::ramp_limit(capability, entry.setpoint.b, target.b, dt_ms),
            c: CapabilityRegistry::ramp_limit(capability, entry.setpoint.c, target.c, dt_ms),
        };
        entry.setpoint = next;
        entry.last_updated_ms = now;
        next
    }

    /// `P_kW = I · V / 1000` (1Φ) or `P_kW = I · √3 · V_line / 1000` (3Φ) (§4.5).
    pub fn power_to_phases(power_kw: f64, voltage: f64, phases_live: u8) -> f64 {
        if phases_live <= 1 {
            power_kw * 1000.0 / voltage
        } else {
            power_kw * 1000.0 / (3f64.sqrt() * voltage)
        }
    }

    pub fn phases_to_power(current_a: f64, voltage: f64, phases_live: u8) -> f64 {
        if phases_live <= 1 {
            current_a * voltage / 1000.0
        } else {
            current_a * 3f64.sqrt() * voltage / 1000.0
        }
    }

    /// Aggregate per-phase load across all known 3Φ stations (§4.5 `system_phase_balance`).
    pub async fn system_phase_balance(&self) -> (PhaseCurrents, bool) {
        let state = self.state.lock().await;
        let mut totals = PhaseCurrents::default();
        for s in state.values() {
            totals.a += s.setpoint.a;
            totals.b += s.setpoint.b;
            totals.c += s.setpoint.c;
        }
        let warning = totals.imbalance() > 0.20;
        (totals, warning)
    }
}

impl Default for AcController {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    // Monotonic-enough for ramp timing; avoids a wall-clock dependency in
    // hot paths. Callers only ever compare successive calls' deltas.
    static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let epoch = EPOCH.get_or_init(std::time::Instant::now);
    epoch.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple_phase_capability() -> Capability {
        Capability {
            i_min: 6.0,
            i_max: 32.0,
            i_step: 1.0,
            p_min_kw: 1.4,
            p_max_kw: 22.0,
            ramp_rate: 4.0,
            min_update_interval_ms: 1_000,
            typical_update_interval_ms: 5_000,
            phases: 3,
            features: Default::default(),
            is_fallback: false,
        }
    }

    #[tokio::test]
    async fn test_set_phase_currents_autobalances() {
        let controller = AcController::new();
        let cap = triple_phase_capability();
        let result = controller
            .set_phase_currents(
                "s1",
                &cap,
                PhaseCurrents { a: 32.0, b: 32.0, c: 6.0 },
                3,
                SetPhaseCurrentsOptions { auto_balance: true },
            )
            .await
            .unwrap();
        assert!(result.imbalance() < 0.01);
    }

    #[tokio::test]
    async fn test_below_minimum_pauses_at_zero() {
        let controller = AcController::new();
        let cap = triple_phase_capability();
        let result = controller
            .set_phase_currents(
                "s1",
                &cap,
                PhaseCurrents { a: 3.0, b: 0.0, c: 0.0 },
                1,
                SetPhaseCurrentsOptions { auto_balance: false },
            )
            .await
            .unwrap();
        assert_eq!(result.a, 0.0);
    }

    #[test]
    fn test_power_phases_round_trip() {
        let power = AcController::phases_to_power(32.0, 230.0, 3);
        let current = AcController::power_to_phases(power, 230.0, 3);
        assert!((current - 32.0).abs() < 0.01);
    }
}
