//! Capability Registry (§4.2)
//!
//! Per-station electrical envelope with profile-based defaults, command
//! validation, clamping, and ramp-limiting.

use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use crate::types::{Capability, CapabilityFeatures};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Known station hardware profiles used as `discover()` defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationProfile {
    AcLevel2Single,
    AcLevel2Triple,
    DcMedium,
    DcHigh,
    Chademo,
}

impl StationProfile {
    fn envelope(self) -> Capability {
        match self {
            StationProfile::AcLevel2Single => Capability {
                i_min: 6.0,
                i_max: 32.0,
                i_step: 1.0,
                p_min_kw: 1.4,
                p_max_kw: 7.4,
                ramp_rate: 4.0,
                min_update_interval_ms: 1_000,
                typical_update_interval_ms: 5_000,
                phases: 1,
                features: CapabilityFeatures {
                    phase_balancing: false,
                    ..Default::default()
                },
                is_fallback: false,
            },
            StationProfile::AcLevel2Triple => Capability {
                i_min: 6.0,
                i_max: 32.0,
                i_step: 1.0,
                p_min_kw: 1.4,
                p_max_kw: 22.0,
                ramp_rate: 4.0,
                min_update_interval_ms: 1_000,
                typical_update_interval_ms: 5_000,
                phases: 3,
                features: CapabilityFeatures {
                    phase_balancing: true,
                    ..Default::default()
                },
                is_fallback: false,
            },
            StationProfile::DcMedium => Capability {
                i_min: 0.0,
                i_max: 0.0,
                i_step: 0.0,
                p_min_kw: 2.0,
                p_max_kw: 50.0,
                ramp_rate: 10.0,
                min_update_interval_ms: 500,
                typical_update_interval_ms: 2_000,
                phases: 0,
                features: CapabilityFeatures {
                    thermal_management: true,
                    vehicle_taper: true,
                    ..Default::default()
                },
                is_fallback: false,
            },
            StationProfile::DcHigh => Capability {
                i_min: 0.0,
                i_max: 0.0,
                i_step: 0.0,
                p_min_kw: 5.0,
                p_max_kw: 350.0,
                ramp_rate: 50.0,
                min_update_interval_ms: 250,
                typical_update_interval_ms: 1_000,
                phases: 0,
                features: CapabilityFeatures {
                    thermal_management: true,
                    vehicle_taper: true,
                    iso15118: true,
                    bidirectional: true,
                    ..Default::default()
                },
                is_fallback: false,
            },
            StationProfile::Chademo => Capability {
                i_min: 0.0,
                i_max: 0.0,
                i_step: 0.0,
                p_min_kw: 2.0,
                p_max_kw: 62.5,
                ramp_rate: 10.0,
                min_update_interval_ms: 500,
                typical_update_interval_ms: 2_000,
                phases: 0,
                features: CapabilityFeatures {
                    thermal_management: true,
                    bidirectional: true,
                    ..Default::default()
                },
                is_fallback: false,
            },
        }
    }
}

/// A command proposed to a station, expressed generically enough to cover
/// both the AC and DC controllers' outputs.
#[derive(Debug, Clone)]
pub enum ProposedCommand {
    Ac { phases: crate::types::PhaseCurrents },
    Dc { power_kw: f64 },
}

pub struct CapabilityRegistry {
    capabilities: Arc<Mutex<HashMap<String, Capability>>>,
    logger: crate::logging::StructuredLogger,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: Arc::new(Mutex::new(HashMap::new())),
            logger: get_logger("capability"),
        }
    }

    /// Attempt to discover a station's envelope; falls back to a
    /// conservative default on any failure (§4.2).
    pub async fn discover(
        &self,
        station_id: &str,
        profile: Option<StationProfile>,
    ) -> Capability {
        let capability = match profile {
            Some(p) => p.envelope(),
            None => {
                self.logger.warn(&format!(
                    "no profile for station {station_id}, using fallback envelope"
                ));
                Capability::fallback_ac()
            }
        };
        self.capabilities
            .lock()
            .await
            .insert(station_id.to_string(), capability.clone());
        capability
    }

    /// Register an explicit, already-known envelope (e.g. restored from
    /// persistence).
    pub async fn set(&self, station_id: &str, capability: Capability) {
        self.capabilities
            .lock()
            .await
            .insert(station_id.to_string(), capability);
    }

    pub async fn get(&self, station_id: &str) -> Option<Capability> {
        self.capabilities.lock().await.get(station_id).cloned()
    }

    /// Validate a proposed command against the station's envelope (§4.2).
    ///
    /// `since_last_command_ms` is the elapsed time since the station's last
    /// accepted command, or `None` for its first command.
    pub async fn validate(
        &self,
        station_id: &str,
        command: &ProposedCommand,
        since_last_command_ms: Option<u64>,
    ) -> Result<()> {
        let capability = self.get(station_id).await.ok_or_else(|| {
            DlmError::not_discovered(format!("capability for station {station_id} not known"))
        })?;

        if let Some(elapsed) = since_last_command_ms {
            if elapsed < capability.min_update_interval_ms {
                return Err(DlmError::constraint_violation(format!(
                    "command interval {elapsed}ms below minimum {}ms for {station_id}",
                    capability.min_update_interval_ms
                )));
            }
        }

        match command {
            ProposedCommand::Ac { phases } => {
                let live_phase_count = [phases.a, phases.b, phases.c]
                    .into_iter()
                    .filter(|v| *v > 0.0)
                    .count() as u8;
                if live_phase_count > 0 && live_phase_count != capability.phases {
                    return Err(DlmError::constraint_violation(format!(
                        "live phase count {live_phase_count} does not match capability phase count {} for {station_id}",
                        capability.phases
                    )));
                }
                for current in [phases.a, phases.b, phases.c] {
                    if current == 0.0 {
                        continue;
                    }
                    if current < capability.i_min || current > capability.i_max {
                        return Err(DlmError::constraint_violation(format!(
                            "current {current} A outside envelope [{}, {}] for {station_id}",
                            capability.i_min, capability.i_max
                        )));
                    }
                    if capability.i_step > 0.0 {
                        let steps = (current / capability.i_step).round();
                        if (steps * capability.i_step - current).abs() > 1e-6 {
                            return Err(DlmError::constraint_violation(format!(
                                "current {current} A not aligned to step {} for {station_id}",
                                capability.i_step
                            )));
                        }
                    }
                }
            }
            ProposedCommand::Dc { power_kw } => {
                if *power_kw < 0.0 && !capability.features.bidirectional {
                    return Err(DlmError::validation(
                        "power_kw",
                        "negative power requires the bidirectional capability feature",
                    ));
                }
                let magnitude = power_kw.abs();
                if magnitude > 0.0
                    && (magnitude < capability.p_min_kw || magnitude > capability.p_max_kw)
                {
                    return Err(DlmError::constraint_violation(format!(
                        "power {power_kw} kW outside envelope [{}, {}] for {station_id}",
                        capability.p_min_kw, capability.p_max_kw
                    )));
                }
            }
        }
        Ok(())
    }

    /// Clamp and step-align a desired AC current (§4.2 `recommend`).
    pub fn recommend_ac(capability: &Capability, desired: f64) -> f64 {
        if desired <= 0.0 {
            return 0.0;
        }
        let clamped = desired.clamp(capability.i_min, capability.i_max);
        if capability.i_step > 0.0 {
            (clamped / capability.i_step).round() * capability.i_step
        } else {
            clamped
        }
    }

    /// Clamp a desired DC power to the envelope (§4.2 `recommend`).
    pub fn recommend_dc(capability: &Capability, desired_kw: f64) -> f64 {
        if desired_kw == 0.0 {
            return 0.0;
        }
        let sign = desired_kw.signum();
        let magnitude = desired_kw.abs().clamp(capability.p_min_kw, capability.p_max_kw);
        sign * magnitude
    }

    /// Apply a ramp rate limit between `current` and `target` over `dt_ms` (§4.2).
    pub fn ramp_limit(capability: &Capability, current: f64, target: f64, dt_ms: u64) -> f64 {
        let max_delta = capability.ramp_rate * (dt_ms as f64 / 1000.0);
        let delta = target - current;
        if delta.abs() <= max_delta {
            target
        } else {
            current + max_delta * delta.signum()
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseCurrents;

    #[tokio::test]
    async fn test_discover_and_validate_ac() {
        let registry = CapabilityRegistry::new();
        registry
            .discover("s1", Some(StationProfile::AcLevel2Triple))
            .await;
        let ok = registry
            .validate(
                "s1",
                &ProposedCommand::Ac {
                    phases: PhaseCurrents {
                        a: 16.0,
                        b: 16.0,
                        c: 16.0,
                    },
                },
                None,
            )
            .await;
        assert!(ok.is_ok());

        let bad = registry
            .validate(
                "s1",
                &ProposedCommand::Ac {
                    phases: PhaseCurrents {
                        a: 200.0,
                        b: 0.0,
                        c: 0.0,
                    },
                },
                None,
            )
            .await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_validate_before_discover_fails() {
        let registry = CapabilityRegistry::new();
        let result = registry
            .validate("unknown", &ProposedCommand::Dc { power_kw: 10.0 }, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_negative_dc_requires_bidirectional() {
        let registry = CapabilityRegistry::new();
        registry.discover("s1", Some(StationProfile::DcMedium)).await;
        let result = registry
            .validate("s1", &ProposedCommand::Dc { power_kw: -5.0 }, None)
            .await;
        assert!(result.is_err());

        registry.discover("s2", Some(StationProfile::DcHigh)).await;
        let result = registry
            .validate("s2", &ProposedCommand::Dc { power_kw: -5.0 }, None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_live_phase_count_mismatch_rejected() {
        let registry = CapabilityRegistry::new();
        registry
            .discover("s1", Some(StationProfile::AcLevel2Triple))
            .await;
        let result = registry
            .validate(
                "s1",
                &ProposedCommand::Ac {
                    phases: PhaseCurrents {
                        a: 16.0,
                        b: 16.0,
                        c: 0.0,
                    },
                },
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_command_interval_below_minimum_rejected() {
        let registry = CapabilityRegistry::new();
        registry
            .discover("s1", Some(StationProfile::AcLevel2Triple))
            .await;
        let result = registry
            .validate(
                "s1",
                &ProposedCommand::Ac {
                    phases: PhaseCurrents {
                        a: 16.0,
                        b: 16.0,
                        c: 16.0,
                    },
                },
                Some(100),
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_ramp_limit() {
        let cap = StationProfile::AcLevel2Triple.envelope();
        let next = CapabilityRegistry::ramp_limit(&cap, 6.0, 32.0, 1_000);
        assert!((next - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_recommend_ac_steps_and_clamps() {
        let cap = StationProfile::AcLevel2Triple.envelope();
        assert_eq!(CapabilityRegistry::recommend_ac(&cap, 100.0), cap.i_max);
        assert_eq!(CapabilityRegistry::recommend_ac(&cap, 0.0), 0.0);
    }
}
