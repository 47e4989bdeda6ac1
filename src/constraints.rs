//! Site Constraints Evaluator (§4.7)
//!
//! Computes available capacity and detects envelope violations across the
//! service/feeder/transformer topology.

use crate::logging::get_logger;
use crate::types::{
    FeederConfig, SiteConstraintsTopology, TransformerConfig, Violation, ViolationSeverity,
};
use chrono::Utc;

pub struct ConstraintsEvaluator {
    logger: crate::logging::StructuredLogger,
}

impl ConstraintsEvaluator {
    pub fn new() -> Self {
        Self {
            logger: get_logger("constraints"),
        }
    }

    /// Available capacity after the continuous-load factor and every
    /// feeder/transformer headroom (§4.7 "Capacity calculation").
    pub fn available_capacity(&self, topology: &SiteConstraintsTopology) -> f64 {
        let service_headroom =
            (topology.service.p_max_kw - topology.service.measured_power_kw).max(0.0)
                * topology.service.continuous_load_factor;

        let feeder_headroom = topology
            .feeders
            .iter()
            .map(|f| {
                let utilization = if f.i_max > 0.0 {
                    f.measured_current / f.i_max
                } else {
                    0.0
                };
                (f.p_max_kw * (1.0 - utilization)).max(0.0)
            })
            .fold(f64::INFINITY, f64::min);

        let transformer_headroom = topology
            .transformers
            .iter()
            .map(|t| (t.rated_kva * t.continuous_factor - t.measured_load_kw).max(0.0))
            .fold(f64::INFINITY, f64::min);

        [service_headroom, feeder_headroom, transformer_headroom]
            .into_iter()
            .filter(|v| v.is_finite())
            .fold(service_headroom, f64::min)
            .max(0.0)
    }

    /// Run the full violation sweep on the current topology snapshot (§4.7).
    pub fn evaluate_violations(&self, topology: &SiteConstraintsTopology) -> Vec<Violation> {
        let mut violations = Vec::new();
        self.evaluate_service(topology, &mut violations);
        for feeder in &topology.feeders {
            self.evaluate_feeder(feeder, &mut violations);
        }
        for transformer in &topology.transformers {
            self.evaluate_transformer(transformer, &mut violations);
        }
        violations
    }

    fn evaluate_service(&self, topology: &SiteConstraintsTopology, out: &mut Vec<Violation>) {
        let service = &topology.service;
        let now = Utc::now();

        if service.measured_power_kw > service.p_max_kw {
            out.push(violation(
                "service",
                "power_limit",
                ViolationSeverity::Critical,
                service.measured_power_kw,
                service.p_max_kw,
                "service power exceeds rated maximum",
                now,
            ));
        }

        let max_phase_current = [
            service.measured_current_per_phase.a,
            service.measured_current_per_phase.b,
            service.measured_current_per_phase.c,
        ]
        .into_iter()
        .fold(0.0, f64::max);
        if max_phase_current > service.i_max_per_phase {
            out.push(violation(
                "service",
                "phase_current_limit",
                ViolationSeverity::Critical,
                max_phase_current,
                service.i_max_per_phase,
                "per-phase current exceeds rated maximum",
                now,
            ));
        }

        let imbalance = service.measured_current_per_phase.imbalance();
        if imbalance > service.max_phase_imbalance {
            out.push(violation(
                "service",
                "phase_imbalance",
                ViolationSeverity::Warning,
                imbalance,
                service.max_phase_imbalance,
                "phase current imbalance exceeds configured ceiling",
                now,
            ));
        }

        if service.measured_power_factor < service.min_power_factor {
            out.push(violation(
                "service",
                "power_factor",
                ViolationSeverity::Warning,
                service.measured_power_factor,
                service.min_power_factor,
                "power factor below configured minimum",
                now,
            ));
        }

        let voltage_deviation = if service.voltage_nominal > 0.0 {
            (service.measured_voltage - service.voltage_nominal).abs() / service.voltage_nominal
        } else {
            0.0
        };
        if voltage_deviation > 0.10 {
            out.push(violation(
                "service",
                "voltage_deviation",
                ViolationSeverity::Critical,
                voltage_deviation,
                0.10,
                "voltage deviation exceeds 10% of nominal",
                now,
            ));
        } else if voltage_deviation > service.voltage_tolerance {
            out.push(violation(
                "service",
                "voltage_deviation",
                ViolationSeverity::Warning,
                voltage_deviation,
                service.voltage_tolerance,
                "voltage deviation exceeds configured tolerance",
                now,
            ));
        }

        let frequency_deviation = if service.frequency_nominal > 0.0 {
            (service.measured_frequency - service.frequency_nominal).abs()
                / service.frequency_nominal
        } else {
            0.0
        };
        if frequency_deviation > service.frequency_tolerance {
            out.push(violation(
                "service",
                "frequency_deviation",
                ViolationSeverity::Warning,
                frequency_deviation,
                service.frequency_tolerance,
                "frequency deviation exceeds configured tolerance",
                now,
            ));
        }
    }

    fn evaluate_feeder(&self, feeder: &FeederConfig, out: &mut Vec<Violation>) {
        let now = Utc::now();
        if feeder.measured_current > feeder.i_max {
            out.push(violation(
                &format!("feeder.{}", feeder.id),
                "current_limit",
                ViolationSeverity::Critical,
                feeder.measured_current,
                feeder.i_max,
                "feeder current exceeds rated maximum",
                now,
            ));
        } else if feeder.measured_current > feeder.breaker_rating * 0.80 {
            out.push(violation(
                &format!("feeder.{}", feeder.id),
                "breaker_headroom",
                ViolationSeverity::Warning,
                feeder.measured_current,
                feeder.breaker_rating * 0.80,
                "feeder current exceeds 80% of breaker rating",
                now,
            ));
        }
        if feeder.measured_current > feeder.cable_ampacity {
            out.push(violation(
                &format!("feeder.{}", feeder.id),
                "cable_ampacity",
                ViolationSeverity::Critical,
                feeder.measured_current,
                feeder.cable_ampacity,
                "feeder current exceeds cable ampacity",
                now,
            ));
        }
    }

    fn evaluate_transformer(&self, transformer: &TransformerConfig, out: &mut Vec<Violation>) {
        let now = Utc::now();
        let load_factor = if transformer.rated_kva > 0.0 {
            transformer.measured_load_kw / transformer.rated_kva
        } else {
            0.0
        };

        if let Some(limit) = transformer
            .thermal_curve
            .iter()
            .find(|p| load_factor >= p.load_factor)
        {
            out.push(violation(
                &format!("transformer.{}", transformer.id),
                "thermal_curve",
                ViolationSeverity::Warning,
                load_factor,
                limit.load_factor,
                &format!(
                    "load factor {load_factor:.2} permits at most {:.0} minutes at this level",
                    limit.max_minutes
                ),
                now,
            ));
        }

        if transformer.measured_temperature_c > transformer.max_temperature_c {
            out.push(violation(
                &format!("transformer.{}", transformer.id),
                "temperature",
                ViolationSeverity::Critical,
                transformer.measured_temperature_c,
                transformer.max_temperature_c,
                "transformer temperature exceeds rated maximum",
                now,
            ));
        }
    }
}

impl Default for ConstraintsEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
fn violation(
    component: &str,
    kind: &str,
    severity: ViolationSeverity,
    measured: f64,
    limit: f64,
    message: &str,
    timestamp: chrono::DateTime<Utc>,
) -> Violation {
    Violation {
        component: component.to_string(),
        kind: kind.to_string(),
        severity,
        measured,
        limit,
        message: message.to_string(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceConfig;

    #[test]
    fn test_available_capacity_applies_continuous_factor() {
        let evaluator = ConstraintsEvaluator::new();
        let topology = SiteConstraintsTopology {
            service: ServiceConfig {
                p_max_kw: 500.0,
                measured_power_kw: 100.0,
                continuous_load_factor: 0.80,
                ..Default::default()
            },
            feeders: Vec::new(),
            transformers: Vec::new(),
        };
        let capacity = evaluator.available_capacity(&topology);
        assert!((capacity - 320.0).abs() < 0.01);
    }

    #[test]
    fn test_feeder_violation_detected() {
        let evaluator = ConstraintsEvaluator::new();
        let topology = SiteConstraintsTopology {
            service: ServiceConfig::default(),
            feeders: vec![FeederConfig {
                id: "f1".to_string(),
                i_max: 100.0,
                p_max_kw: 50.0,
                breaker_rating: 100.0,
                cable_ampacity: 120.0,
                stations: Vec::new(),
                measured_current: 110.0,
            }],
            transformers: Vec::new(),
        };
        let violations = evaluator.evaluate_violations(&topology);
        assert!(violations.iter().any(|v| v.kind == "current_limit"));
    }

    #[test]
    fn test_service_sweep_detects_all_five_axes() {
        use crate::types::PhaseCurrents;
        let evaluator = ConstraintsEvaluator::new();
        let topology = SiteConstraintsTopology {
            service: ServiceConfig {
                i_max_per_phase: 100.0,
                measured_current_per_phase: PhaseCurrents {
                    a: 120.0,
                    b: 80.0,
                    c: 80.0,
                },
                min_power_factor: 0.95,
                measured_power_factor: 0.80,
                voltage_nominal: 230.0,
                voltage_tolerance: 0.05,
                measured_voltage: 260.0,
                frequency_nominal: 50.0,
                frequency_tolerance: 0.02,
                measured_frequency: 48.5,
                ..Default::default()
            },
            feeders: Vec::new(),
            transformers: Vec::new(),
        };
        let violations = evaluator.evaluate_violations(&topology);
        assert!(violations.iter().any(|v| v.kind == "phase_current_limit"));
        assert!(violations.iter().any(|v| v.kind == "phase_imbalance"));
        assert!(violations.iter().any(|v| v.kind == "power_factor"));
        assert!(violations.iter().any(|v| v.kind == "voltage_deviation"));
        assert!(violations.iter().any(|v| v.kind == "frequency_deviation"));
    }

    #[test]
    fn test_service_sweep_clean_topology_has_no_violations() {
        let evaluator = ConstraintsEvaluator::new();
        let topology = SiteConstraintsTopology {
            service: ServiceConfig::default(),
            feeders: Vec::new(),
            transformers: Vec::new(),
        };
        let violations = evaluator.evaluate_violations(&topology);
        assert!(violations.is_empty());
    }
}
