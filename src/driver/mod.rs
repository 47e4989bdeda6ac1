//! Driver Contract (§4.3)
//!
//! Uniform async interface every protocol adapter implements, wrapped by
//! the Circuit Breaker + Watchdog (§4.4). Dispatch across protocol
//! families is a tagged enum rather than `dyn` polymorphism, per the
//! "object-oriented driver hierarchy" redesign flag (§9).

pub mod modbus;
pub mod mqtt;
pub mod ocpp;

use crate::error::Result;
use crate::types::PhaseCurrents;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Measurement pushed from a station observation (§4.3).
#[derive(Debug, Clone)]
pub struct StationObservation {
    pub status_code: String,
    pub current_power_kw: f64,
    pub session_energy_kwh: f64,
    pub phase_currents: Option<PhaseCurrents>,
    pub temperature_c: Option<f64>,
    pub soc_percent: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Measurement pushed from a meter observation (§4.3).
#[derive(Debug, Clone)]
pub struct MeterObservation {
    pub power_kw: f64,
    pub total_energy_kwh: f64,
    pub voltage: f64,
    pub current: f64,
    pub power_factor: f64,
    pub frequency: f64,
}

/// Uniform driver interface (§4.3). Every adapter implements this trait;
/// `DriverHandle` dispatches to the concrete implementation.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn observe_station(
        &self,
        station_id: &str,
        callback: Box<dyn Fn(StationObservation) + Send + Sync>,
    ) -> Result<()>;

    async fn observe_meter(
        &self,
        meter_id: &str,
        callback: Box<dyn Fn(MeterObservation) + Send + Sync>,
    ) -> Result<()>;

    async fn command_ac(&self, station_id: &str, phases: PhaseCurrents) -> Result<()>;

    /// `power_kw` may be negative for V2G export when the station's
    /// capability includes `bidirectional` (§4.6).
    async fn command_dc(&self, station_id: &str, power_kw: f64) -> Result<()>;

    async fn start_session(&self, station_id: &str, user_tag: &str) -> Result<()>;

    async fn stop_session(&self, station_id: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Status-code mapping from a protocol's native representation to the
/// canonical `StationStatus` (§4.3, per-driver configuration — §9 Open
/// Questions). Each adapter supplies its own table via this trait method
/// default-implemented here for the common vocabulary.
pub fn map_status_code(code: &str) -> crate::types::StationStatus {
    use crate::types::StationStatus;
    match code.to_ascii_lowercase().as_str() {
        "available" | "ready" | "preparing" => StationStatus::Ready,
        "charging" | "suspendedev" | "suspendedevse" => StationStatus::Charging,
        "faulted" | "error" => StationStatus::Error,
        "unavailable" => StationStatus::Unavailable,
        "disconnected" | "offline" => StationStatus::Offline,
        _ => StationStatus::Unavailable,
    }
}

/// Tagged variant dispatch over the three concrete adapters (§4.3 expansion).
pub enum DriverHandle {
    Modbus(modbus::ModbusDriver),
    Mqtt(mqtt::MqttDriver),
    Ocpp(ocpp::OcppDriver),
}

#[async_trait]
impl Driver for DriverHandle {
    async fn connect(&self) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.connect().await,
            DriverHandle::Mqtt(d) => d.connect().await,
            DriverHandle::Ocpp(d) => d.connect().await,
        }
    }

    async fn observe_station(
        &self,
        station_id: &str,
        callback: Box<dyn Fn(StationObservation) + Send + Sync>,
    ) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.observe_station(station_id, callback).await,
            DriverHandle::Mqtt(d) => d.observe_station(station_id, callback).await,
            DriverHandle::Ocpp(d) => d.observe_station(station_id, callback).await,
        }
    }

    async fn observe_meter(
        &self,
        meter_id: &str,
        callback: Box<dyn Fn(MeterObservation) + Send + Sync>,
    ) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.observe_meter(meter_id, callback).await,
            DriverHandle::Mqtt(d) => d.observe_meter(meter_id, callback).await,
            DriverHandle::Ocpp(d) => d.observe_meter(meter_id, callback).await,
        }
    }

    async fn command_ac(&self, station_id: &str, phases: PhaseCurrents) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.command_ac(station_id, phases).await,
            DriverHandle::Mqtt(d) => d.command_ac(station_id, phases).await,
            DriverHandle::Ocpp(d) => d.command_ac(station_id, phases).await,
        }
    }

    async fn command_dc(&self, station_id: &str, power_kw: f64) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.command_dc(station_id, power_kw).await,
            DriverHandle::Mqtt(d) => d.command_dc(station_id, power_kw).await,
            DriverHandle::Ocpp(d) => d.command_dc(station_id, power_kw).await,
        }
    }

    async fn start_session(&self, station_id: &str, user_tag: &str) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.start_session(station_id, user_tag).await,
            DriverHandle::Mqtt(d) => d.start_session(station_id, user_tag).await,
            DriverHandle::Ocpp(d) => d.start_session(station_id, user_tag).await,
        }
    }

    async fn stop_session(&self, station_id: &str) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.stop_session(station_id).await,
            DriverHandle::Mqtt(d) => d.stop_session(station_id).await,
            DriverHandle::Ocpp(d) => d.stop_session(station_id).await,
        }
    }

    async fn disconnect(&self) -> Result<()> {
        match self {
            DriverHandle::Modbus(d) => d.disconnect().await,
            DriverHandle::Mqtt(d) => d.disconnect().await,
            DriverHandle::Ocpp(d) => d.disconnect().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StationStatus;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(map_status_code("Charging"), StationStatus::Charging);
        assert_eq!(map_status_code("Faulted"), StationStatus::Error);
        assert_eq!(map_status_code("bogus"), StationStatus::Unavailable);
    }
}
