use super::*;

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_grid_capacity_kw: 500.0,
            peak_demand_threshold_kw: 400.0,
            min_charging_power_kw: 1.4,
            max_charging_power_per_station_kw: 22.0,
            energy_cost_per_kwh: 0.25,
            peak_cost_per_kwh: 0.45,
            pv_system_enabled: false,
            enable_load_balancing: true,
            enable_pv_excess_charging: false,
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            max_service_current: 800.0,
            service_voltage: 230.0,
            service_phases: 3,
            max_phase_imbalance: 0.20,
            min_power_factor: 0.95,
            service_frequency: 50.0,
            nec625_continuous_factor: 1.25,
        }
    }
}

impl Default for SheddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upper_threshold: 0.90,
            lower_threshold: 0.75,
            smoothing_window: 5,
            min_update_interval_ms: 10_000,
        }
    }
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            default_comm_timeout_ms: 30_000,
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 5_000,
            dispatch_threshold_kw: 0.2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            web_level: None,
            file: "/tmp/dlm.log".to_string(),
            format: "structured".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            site: SiteConfig::default(),
            shedding: SheddingConfig::default(),
            failsafe: FailSafeConfig::default(),
            allocator: AllocatorConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
            persistence_path: "/data/dlm_state.json".to_string(),
        }
    }
}
