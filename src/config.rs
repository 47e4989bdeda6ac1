//! Configuration management for the DLM control plane
//!
//! This module handles loading, validation, and management of application
//! configuration from a YAML file, layered with environment variable
//! overrides (§6), and exposes a JSON Schema for the `/config/schema`
//! endpoint.

use crate::error::{DlmError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Grid capacity and pricing parameters
    pub grid: GridConfig,

    /// Site electrical topology parameters (service-level envelope)
    pub site: SiteConfig,

    /// Load shedding thresholds
    pub shedding: SheddingConfig,

    /// Fail-safe behaviour
    pub failsafe: FailSafeConfig,

    /// Allocator tick cadence
    pub allocator: AllocatorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,

    /// Path to the persistence snapshot file
    pub persistence_path: String,
}

/// Grid capacity, PV, and balancing toggles (§6 top-level env vars)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GridConfig {
    /// MAX_GRID_CAPACITY_KW
    pub max_grid_capacity_kw: f64,

    /// PEAK_DEMAND_THRESHOLD_KW
    pub peak_demand_threshold_kw: f64,

    /// MIN_CHARGING_POWER_KW
    pub min_charging_power_kw: f64,

    /// MAX_CHARGING_POWER_PER_STATION_KW
    pub max_charging_power_per_station_kw: f64,

    /// ENERGY_COST_PER_KWH
    pub energy_cost_per_kwh: f64,

    /// PEAK_COST_PER_KWH
    pub peak_cost_per_kwh: f64,

    /// PV_SYSTEM_ENABLED
    pub pv_system_enabled: bool,

    /// ENABLE_LOAD_BALANCING
    pub enable_load_balancing: bool,

    /// ENABLE_PV_EXCESS_CHARGING
    pub enable_pv_excess_charging: bool,
}

/// Service-level electrical envelope (§3 Site Constraints Topology)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SiteConfig {
    /// MAX_SERVICE_CURRENT (A, per phase)
    pub max_service_current: f64,

    /// SERVICE_VOLTAGE (line-to-neutral nominal, V)
    pub service_voltage: f64,

    /// SERVICE_PHASES
    pub service_phases: u8,

    /// MAX_PHASE_IMBALANCE (fraction, e.g. 0.20)
    pub max_phase_imbalance: f64,

    /// MIN_POWER_FACTOR
    pub min_power_factor: f64,

    /// SERVICE_FREQUENCY (Hz)
    pub service_frequency: f64,

    /// NEC625_CONTINUOUS_FACTOR
    pub nec625_continuous_factor: f64,
}

/// Load shedding hysteresis thresholds
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SheddingConfig {
    /// ENABLE_LOAD_SHEDDING
    pub enabled: bool,

    /// LOAD_SHEDDING_UPPER_THRESHOLD
    pub upper_threshold: f64,

    /// LOAD_SHEDDING_LOWER_THRESHOLD
    pub lower_threshold: f64,

    /// Rolling window size for load-ratio smoothing
    pub smoothing_window: usize,

    /// Minimum interval between re-evaluations (ms)
    pub min_update_interval_ms: u64,
}

/// Fail-safe manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FailSafeConfig {
    /// ENABLE_FAIL_SAFE
    pub enabled: bool,

    /// Heartbeat loop interval (ms)
    pub heartbeat_interval_ms: u64,

    /// System-wide watchdog timeout (ms) — §4.10.3
    pub heartbeat_timeout_ms: u64,

    /// Default per-station comm timeout (ms) if a station omits its own
    pub default_comm_timeout_ms: u64,
}

/// Allocator tick cadence
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Tick period (ms)
    pub tick_period_ms: u64,

    /// Minimum |Δ| (kW) required to redispatch a station (§4.9 step 8)
    pub dispatch_threshold_kw: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional per-layer overrides
    pub console_level: Option<String>,
    pub file_level: Option<String>,
    pub web_level: Option<String>,

    /// Path to log file (or directory)
    pub file: String,

    /// Log format label (structured or simple)
    pub format: String,

    /// Number of rotated backup files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to emit JSON-formatted lines
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default search path, falling back to
    /// built-in defaults, then apply environment variable overrides (§6).
    pub fn load() -> Result<Self> {
        let default_paths = [
            "dlm_config.yaml",
            "/data/dlm_config.yaml",
            "/etc/dlm/config.yaml",
        ];

        let mut config = default_paths
            .iter()
            .find(|p| Path::new(p).exists())
            .map(Self::from_file)
            .transpose()?
            .unwrap_or_default();

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path; missing file is an error (no silent fallback).
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides on top of file-loaded/default values.
    pub fn apply_env_overrides(&mut self) {
        macro_rules! env_f64 {
            ($key:expr, $field:expr) => {
                if let Ok(v) = std::env::var($key) {
                    if let Ok(parsed) = v.parse::<f64>() {
                        $field = parsed;
                    }
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $field:expr) => {
                if let Ok(v) = std::env::var($key) {
                    $field = v == "1" || v.eq_ignore_ascii_case("true");
                }
            };
        }

        env_f64!("MAX_GRID_CAPACITY_KW", self.grid.max_grid_capacity_kw);
        env_f64!(
            "PEAK_DEMAND_THRESHOLD_KW",
            self.grid.peak_demand_threshold_kw
        );
        env_f64!("MIN_CHARGING_POWER_KW", self.grid.min_charging_power_kw);
        env_f64!(
            "MAX_CHARGING_POWER_PER_STATION_KW",
            self.grid.max_charging_power_per_station_kw
        );
        env_f64!("ENERGY_COST_PER_KWH", self.grid.energy_cost_per_kwh);
        env_f64!("PEAK_COST_PER_KWH", self.grid.peak_cost_per_kwh);
        env_bool!("PV_SYSTEM_ENABLED", self.grid.pv_system_enabled);
        env_bool!("ENABLE_LOAD_BALANCING", self.grid.enable_load_balancing);
        env_bool!(
            "ENABLE_PV_EXCESS_CHARGING",
            self.grid.enable_pv_excess_charging
        );

        env_f64!("MAX_SERVICE_CURRENT", self.site.max_service_current);
        env_f64!("SERVICE_VOLTAGE", self.site.service_voltage);
        if let Ok(v) = std::env::var("SERVICE_PHASES") {
            if let Ok(parsed) = v.parse::<u8>() {
                self.site.service_phases = parsed;
            }
        }
        env_f64!("MAX_PHASE_IMBALANCE", self.site.max_phase_imbalance);
        env_f64!("MIN_POWER_FACTOR", self.site.min_power_factor);
        env_f64!("SERVICE_FREQUENCY", self.site.service_frequency);
        env_f64!(
            "NEC625_CONTINUOUS_FACTOR",
            self.site.nec625_continuous_factor
        );

        env_bool!("ENABLE_LOAD_SHEDDING", self.shedding.enabled);
        env_f64!(
            "LOAD_SHEDDING_UPPER_THRESHOLD",
            self.shedding.upper_threshold
        );
        env_f64!(
            "LOAD_SHEDDING_LOWER_THRESHOLD",
            self.shedding.lower_threshold
        );

        env_bool!("ENABLE_FAIL_SAFE", self.failsafe.enabled);
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration (§4.12)
    pub fn validate(&self) -> Result<()> {
        if self.grid.max_grid_capacity_kw <= 0.0 {
            return Err(DlmError::validation(
                "grid.max_grid_capacity_kw",
                "Must be positive",
            ));
        }
        if self.grid.min_charging_power_kw < 0.0 {
            return Err(DlmError::validation(
                "grid.min_charging_power_kw",
                "Must be non-negative",
            ));
        }
        if self.grid.max_charging_power_per_station_kw < self.grid.min_charging_power_kw {
            return Err(DlmError::validation(
                "grid.max_charging_power_per_station_kw",
                "Must be >= min_charging_power_kw",
            ));
        }
        if self.site.service_phases != 1 && self.site.service_phases != 3 {
            return Err(DlmError::validation(
                "site.service_phases",
                "Must be 1 or 3",
            ));
        }
        if !(0.0..=1.0).contains(&self.site.max_phase_imbalance) {
            return Err(DlmError::validation(
                "site.max_phase_imbalance",
                "Must be between 0 and 1",
            ));
        }
        if self.shedding.upper_threshold <= self.shedding.lower_threshold {
            return Err(DlmError::validation(
                "shedding.upper_threshold",
                "Must be greater than lower_threshold",
            ));
        }
        if self.shedding.smoothing_window == 0 {
            return Err(DlmError::validation(
                "shedding.smoothing_window",
                "Must be at least 1",
            ));
        }
        if self.allocator.tick_period_ms == 0 {
            return Err(DlmError::validation(
                "allocator.tick_period_ms",
                "Must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.allocator.tick_period_ms, 5_000);
        assert_eq!(config.shedding.smoothing_window, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.grid.max_grid_capacity_kw = 0.0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.shedding.upper_threshold = 0.5;
        config.shedding.lower_threshold = 0.6;
        assert!(config.validate().is_err());

        config = Config::default();
        config.site.service_phases = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            config.grid.max_grid_capacity_kw,
            deserialized.grid.max_grid_capacity_kw
        );
    }

    #[test]
    fn test_env_override() {
        // SAFETY: test-only process-wide env mutation, no other test reads this key concurrently.
        unsafe {
            std::env::set_var("MAX_GRID_CAPACITY_KW", "123.5");
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        assert!((config.grid.max_grid_capacity_kw - 123.5).abs() < f64::EPSILON);
        unsafe {
            std::env::remove_var("MAX_GRID_CAPACITY_KW");
        }
    }
}
