//! MQTT driver adapter (§4.3 expansion)
//!
//! Push-based. Topic layout `stations/{id}/status`, `stations/{id}/meter`,
//! `stations/{id}/cmd/ac`, `stations/{id}/cmd/dc`, via `rumqttc` at QoS 1.

use super::{Driver, MeterObservation, StationObservation};
use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use crate::types::PhaseCurrents;
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Deserialize, Serialize)]
struct StatusPayload {
    status: String,
    power_kw: f64,
    energy_kwh: f64,
    #[serde(default)]
    phase_a: Option<f64>,
    #[serde(default)]
    phase_b: Option<f64>,
    #[serde(default)]
    phase_c: Option<f64>,
    #[serde(default)]
    temperature_c: Option<f64>,
    #[serde(default)]
    soc_percent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct MeterPayload {
    power_kw: f64,
    total_energy_kwh: f64,
    voltage: f64,
    current: f64,
    power_factor: f64,
    frequency: f64,
}

/// MQTT adapter holding a single broker connection shared across stations.
pub struct MqttDriver {
    client: AsyncClient,
    eventloop: Arc<Mutex<rumqttc::EventLoop>>,
    logger: crate::logging::StructuredLogger,
}

impl MqttDriver {
    pub fn new(broker_host: &str, broker_port: u16, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, broker_host, broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);
        Self {
            client,
            eventloop: Arc::new(Mutex::new(eventloop)),
            logger: get_logger("driver::mqtt"),
        }
    }

    fn status_topic(station_id: &str) -> String {
        format!("stations/{station_id}/status")
    }
    fn meter_topic(meter_id: &str) -> String {
        format!("stations/{meter_id}/meter")
    }
    fn cmd_ac_topic(station_id: &str) -> String {
        format!("stations/{station_id}/cmd/ac")
    }
    fn cmd_dc_topic(station_id: &str) -> String {
        format!("stations/{station_id}/cmd/dc")
    }

    /// Drain the event loop, dispatching any matching publishes to `callback`.
    /// Intended to be called from a long-running per-connection task (§5 T4).
    pub async fn poll_once(&self) -> Result<Option<(String, Vec<u8>)>> {
        let mut eventloop = self.eventloop.lock().await;
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                Ok(Some((publish.topic, publish.payload.to_vec())))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(DlmError::transport(format!("mqtt event loop error: {e}"))),
        }
    }
}

#[async_trait]
impl Driver for MqttDriver {
    async fn connect(&self) -> Result<()> {
        // The rumqttc event loop establishes the connection lazily on the
        // first `poll()`; subscriptions below trigger that.
        self.client
            .subscribe("stations/+/status", QoS::AtLeastOnce)
            .await
            .map_err(|e| DlmError::transport(format!("mqtt subscribe failed: {e}")))?;
        self.client
            .subscribe("stations/+/meter", QoS::AtLeastOnce)
            .await
            .map_err(|e| DlmError::transport(format!("mqtt subscribe failed: {e}")))?;
        Ok(())
    }

    async fn observe_station(
        &self,
        station_id: &str,
        callback: Box<dyn Fn(StationObservation) + Send + Sync>,
    ) -> Result<()> {
        // Push-based: a single drain of the buffered event loop is enough
        // to surface the most recent retained/queued message, if any.
        if let Some((topic, payload)) = self.poll_once().await? {
            if topic == Self::status_topic(station_id) {
                let parsed: StatusPayload = serde_json::from_slice(&payload)?;
                callback(StationObservation {
                    status_code: parsed.status,
                    current_power_kw: parsed.power_kw,
                    session_energy_kwh: parsed.energy_kwh,
                    phase_currents: Some(PhaseCurrents {
                        a: parsed.phase_a.unwrap_or(0.0),
                        b: parsed.phase_b.unwrap_or(0.0),
                        c: parsed.phase_c.unwrap_or(0.0),
                    }),
                    temperature_c: parsed.temperature_c,
                    soc_percent: parsed.soc_percent,
                    observed_at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    async fn observe_meter(
        &self,
        meter_id: &str,
        callback: Box<dyn Fn(MeterObservation) + Send + Sync>,
    ) -> Result<()> {
        if let Some((topic, payload)) = self.poll_once().await? {
            if topic == Self::meter_topic(meter_id) {
                let parsed: MeterPayload = serde_json::from_slice(&payload)?;
                callback(MeterObservation {
                    power_kw: parsed.power_kw,
                    total_energy_kwh: parsed.total_energy_kwh,
                    voltage: parsed.voltage,
                    current: parsed.current,
                    power_factor: parsed.power_factor,
                    frequency: parsed.frequency,
                });
            }
        }
        Ok(())
    }

    async fn command_ac(&self, station_id: &str, phases: PhaseCurrents) -> Result<()> {
        let payload = serde_json::to_vec(&phases)
            .map_err(|e| DlmError::Serialization { message: e.to_string() })?;
        self.client
            .publish(Self::cmd_ac_topic(station_id), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DlmError::transport(format!("mqtt publish failed: {e}")))
    }

    async fn command_dc(&self, station_id: &str, power_kw: f64) -> Result<()> {
        let payload = serde_json::to_vec(&serde_json::json!({ "power_kw": power_kw }))
            .map_err(|e| DlmError::Serialization { message: e.to_string() })?;
        self.client
            .publish(Self::cmd_dc_topic(station_id), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DlmError::transport(format!("mqtt publish failed: {e}")))
    }

    async fn start_session(&self, station_id: &str, user_tag: &str) -> Result<()> {
        let payload = serde_json::to_vec(&serde_json::json!({ "action": "start", "user_tag": user_tag }))
            .map_err(|e| DlmError::Serialization { message: e.to_string() })?;
        self.client
            .publish(
                format!("stations/{station_id}/cmd/session"),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|e| DlmError::transport(format!("mqtt publish failed: {e}")))
    }

    async fn stop_session(&self, station_id: &str) -> Result<()> {
        let payload = serde_json::to_vec(&serde_json::json!({ "action": "stop" }))
            .map_err(|e| DlmError::Serialization { message: e.to_string() })?;
        self.client
            .publish(
                format!("stations/{station_id}/cmd/session"),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|e| DlmError::transport(format!("mqtt publish failed: {e}")))
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| DlmError::transport(format!("mqtt disconnect failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(MqttDriver::status_topic("s1"), "stations/s1/status");
        assert_eq!(MqttDriver::meter_topic("m1"), "stations/m1/meter");
        assert_eq!(MqttDriver::cmd_ac_topic("s1"), "stations/s1/cmd/ac");
        assert_eq!(MqttDriver::cmd_dc_topic("s1"), "stations/s1/cmd/dc");
    }
}
