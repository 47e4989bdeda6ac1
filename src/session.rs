//! Charging session tracking (§3 Station "Session energy accumulator")
//!
//! Per-station session lifecycle: energy delivered, peak/average power,
//! and a bounded history, generalized from a single-charger tracker to a
//! fleet keyed by station id.

use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingSession {
    pub id: String,
    pub station_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_energy_kwh: f64,
    pub end_energy_kwh: Option<f64>,
    pub energy_delivered_kwh: f64,
    pub peak_power_kw: f64,
    pub average_power_kw: f64,
    pub cost: Option<f64>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Interrupted,
    Failed,
}

struct StationSessions {
    current: Option<ChargingSession>,
    last: Option<ChargingSession>,
    history: Vec<ChargingSession>,
}

/// Tracks one active + bounded history of sessions per station.
pub struct SessionManager {
    stations: HashMap<String, StationSessions>,
    max_history_size: usize,
    energy_cost_per_kwh: f64,
    logger: crate::logging::StructuredLogger,
}

impl SessionManager {
    pub fn new(max_history_size: usize, energy_cost_per_kwh: f64) -> Self {
        Self {
            stations: HashMap::new(),
            max_history_size,
            energy_cost_per_kwh,
            logger: get_logger("session"),
        }
    }

    pub fn start_session(&mut self, station_id: &str, start_energy_kwh: f64) -> Result<()> {
        let entry = self
            .stations
            .entry(station_id.to_string())
            .or_insert_with(|| StationSessions {
                current: None,
                last: None,
                history: Vec::new(),
            });

        if entry.current.is_some() {
            return Err(DlmError::state_conflict(format!(
                "station {station_id} already has an active session"
            )));
        }

        let session = ChargingSession {
            id: uuid::Uuid::new_v4().to_string(),
            station_id: station_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            start_energy_kwh,
            end_energy_kwh: None,
            energy_delivered_kwh: 0.0,
            peak_power_kw: 0.0,
            average_power_kw: 0.0,
            cost: None,
            status: SessionStatus::Active,
        };

        self.logger
            .info(&format!("started session {} for {station_id}", session.id));
        entry.current = Some(session);
        Ok(())
    }

    pub fn update(&mut self, station_id: &str, power_kw: f64, energy_kwh: f64) {
        let Some(entry) = self.stations.get_mut(station_id) else {
            return;
        };
        let Some(session) = entry.current.as_mut() else {
            return;
        };

        session.energy_delivered_kwh = energy_kwh - session.start_energy_kwh;
        if power_kw > session.peak_power_kw {
            session.peak_power_kw = power_kw;
        }
        let duration_hours =
            (Utc::now() - session.start_time).num_seconds() as f64 / 3600.0;
        if duration_hours > 0.0 {
            session.average_power_kw = session.energy_delivered_kwh / duration_hours;
        }
    }

    pub fn end_session(&mut self, station_id: &str, end_energy_kwh: f64) -> Result<()> {
        let entry = self
            .stations
            .get_mut(station_id)
            .ok_or_else(|| DlmError::state_conflict(format!("no sessions for {station_id}")))?;

        let mut session = entry
            .current
            .take()
            .ok_or_else(|| DlmError::state_conflict(format!("no active session for {station_id}")))?;

        session.end_time = Some(Utc::now());
        session.end_energy_kwh = Some(end_energy_kwh);
        session.energy_delivered_kwh = end_energy_kwh - session.start_energy_kwh;
        session.cost = Some(session.energy_delivered_kwh * self.energy_cost_per_kwh);
        session.status = SessionStatus::Completed;

        self.logger.info(&format!(
            "ended session {} for {station_id}, delivered {:.3} kWh",
            session.id, session.energy_delivered_kwh
        ));

        entry.last = Some(session.clone());
        entry.history.push(session);
        if entry.history.len() > self.max_history_size {
            entry.history.remove(0);
        }
        Ok(())
    }

    pub fn current_session(&self, station_id: &str) -> Option<&ChargingSession> {
        self.stations.get(station_id)?.current.as_ref()
    }

    pub fn last_session(&self, station_id: &str) -> Option<&ChargingSession> {
        self.stations.get(station_id)?.last.as_ref()
    }

    pub fn history(&self, station_id: &str) -> &[ChargingSession] {
        self.stations
            .get(station_id)
            .map(|s| s.history.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(100, 0.25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_end_session() {
        let mut manager = SessionManager::new(10, 0.25);
        manager.start_session("s1", 10.0).unwrap();
        assert!(manager.current_session("s1").is_some());

        manager.update("s1", 7.0, 13.0);
        manager.end_session("s1", 15.0).unwrap();

        assert!(manager.current_session("s1").is_none());
        let last = manager.last_session("s1").unwrap();
        assert!((last.energy_delivered_kwh - 5.0).abs() < 1e-9);
        assert_eq!(last.status, SessionStatus::Completed);
    }

    #[test]
    fn test_double_start_rejected() {
        let mut manager = SessionManager::new(10, 0.25);
        manager.start_session("s1", 0.0).unwrap();
        assert!(manager.start_session("s1", 0.0).is_err());
    }

    #[test]
    fn test_independent_per_station() {
        let mut manager = SessionManager::new(10, 0.25);
        manager.start_session("s1", 0.0).unwrap();
        manager.start_session("s2", 0.0).unwrap();
        assert!(manager.current_session("s1").is_some());
        assert!(manager.current_session("s2").is_some());
    }
}
