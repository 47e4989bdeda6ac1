//! Event Bus & State Store (§4.1)
//!
//! Single in-process authority over mutable state. Every mutation is
//! serialized through an async mutex; readers take an immutable snapshot.
//! Change events are published on a broadcast channel and are best-effort,
//! at-most-once, delivered only after the mutation has committed.

use crate::error::{DlmError, Result};
use crate::logging::get_logger;
use crate::types::{
    FailSafeStationState, Meter, PhaseCurrents, SheddingState, SiteConstraintsTopology, Station,
    StationStatus, Violation, ZoneConfig,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_VIOLATION_HISTORY: usize = 1000;
const MAX_TICK_HISTORY: usize = 100;

/// Commands accepted by the store's `apply` (§4.1).
#[derive(Debug, Clone)]
pub enum Command {
    RegisterStation(Station),
    UpdateStation(Box<Station>),
    RemoveStation { station_id: String },
    ObserveStationMeasurement {
        station_id: String,
        current_power_kw: f64,
        session_energy_kwh: f64,
        phase_currents: Option<PhaseCurrents>,
        temperature_c: Option<f64>,
        soc_percent: Option<f64>,
        status: Option<StationStatus>,
    },
    ObserveMeterMeasurement(Meter),
    RecordAllocation {
        station_id: String,
        decided_power_kw: f64,
    },
    RecordViolation(Violation),
    SetSheddingLevel(SheddingState),
    SetFailSafeState(FailSafeStationState),
}

/// Event emitted after a committed mutation, tagged with its topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
    StationRegistered(Station),
    StationUpdated(Station),
    StationDeleted { station_id: String },
    MeterUpdated(Meter),
    LoadUpdated { total_kw: f64 },
    SheddingTransition(SheddingState),
    Violation(Violation),
    StationCommand { station_id: String, power_kw: f64 },
}

impl Event {
    /// Topic string matching §4.1's `station.*`, `meter.*`, etc.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::StationRegistered(_) => "station.registered",
            Event::StationUpdated(_) => "station.updated",
            Event::StationDeleted { .. } => "station.deleted",
            Event::MeterUpdated(_) => "meter.updated",
            Event::LoadUpdated { .. } => "load.updated",
            Event::SheddingTransition(_) => "shedding.transition",
            Event::Violation(_) => "violation",
            Event::StationCommand { .. } => "station.command",
        }
    }
}

/// Immutable point-in-time view returned by `snapshot()`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub stations: HashMap<String, Station>,
    pub meters: HashMap<String, Meter>,
    pub constraints: SiteConstraintsTopology,
    pub zones: Vec<ZoneConfig>,
    pub shedding: SheddingState,
    pub failsafe: HashMap<String, FailSafeStationState>,
}

struct Inner {
    stations: HashMap<String, Station>,
    meters: HashMap<String, Meter>,
    constraints: SiteConstraintsTopology,
    zones: Vec<ZoneConfig>,
    shedding: SheddingState,
    failsafe: HashMap<String, FailSafeStationState>,
    violations: Vec<Violation>,
    ticks: Vec<crate::types::AllocationTickResult>,
    version: u64,
}

/// The State Store (§4.1). Cheaply cloneable; internally `Arc`-shared.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<Event>,
    tick_counter: Arc<AtomicU64>,
    logger: crate::logging::StructuredLogger,
}

impl StateStore {
    pub fn new(constraints: SiteConstraintsTopology, zones: Vec<ZoneConfig>) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stations: HashMap::new(),
                meters: HashMap::new(),
                constraints,
                zones,
                shedding: SheddingState::default(),
                failsafe: HashMap::new(),
                violations: Vec::new(),
                ticks: Vec::new(),
                version: 0,
            })),
            events: tx,
            tick_counter: Arc::new(AtomicU64::new(0)),
            logger: get_logger("state"),
        }
    }

    /// Seed the store from a persisted document (§4.11), restoring
    /// topology, stations, meters, shedding and fail-safe state.
    pub async fn restore(&self, doc: &crate::types::PersistedDocument) {
        let mut inner = self.inner.lock().await;
        inner.stations = doc.stations.clone();
        inner.meters = doc.meters.clone();
        inner.constraints = doc.constraints.clone();
        inner.zones = doc.zones.clone();
        inner.shedding = doc.shedding.clone();
        inner.failsafe = doc.failsafe.clone();
        inner.version += 1;
    }

    /// Export the current state into a persistable document (§4.11).
    pub async fn to_document(&self) -> crate::types::PersistedDocument {
        let inner = self.inner.lock().await;
        let last_known_good = inner
            .failsafe
            .values()
            .map(|f| (f.station_id.clone(), f.last_known_good_kw))
            .collect();
        crate::types::PersistedDocument {
            stations: inner.stations.clone(),
            meters: inner.meters.clone(),
            constraints: inner.constraints.clone(),
            zones: inner.zones.clone(),
            shedding: inner.shedding.clone(),
            failsafe: inner.failsafe.clone(),
            last_known_good,
        }
    }

    fn publish(&self, event: Event) {
        // A dropped receiver (no subscribers) is not an error.
        let _ = self.events.send(event);
    }

    /// Subscribe to the event bus, filtered to a topic prefix (e.g. `"station."`).
    /// Pass `""` to receive every event.
    pub fn subscribe(&self, topic_filter: &str) -> impl tokio_stream::Stream<Item = Event> {
        use tokio_stream::StreamExt;
        let filter = topic_filter.to_string();
        let rx = self.events.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |res| match res {
            Ok(event) if event.topic().starts_with(filter.as_str()) => Some(event),
            Ok(_) => None,
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "event subscriber lagged, events dropped");
                None
            }
        })
    }

    /// Take a consistent snapshot for the Allocator and read-only API handlers.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().await;
        Snapshot {
            version: inner.version,
            stations: inner.stations.clone(),
            meters: inner.meters.clone(),
            constraints: inner.constraints.clone(),
            zones: inner.zones.clone(),
            shedding: inner.shedding.clone(),
            failsafe: inner.failsafe.clone(),
        }
    }

    pub async fn recent_violations(&self, limit: usize) -> Vec<Violation> {
        let inner = self.inner.lock().await;
        inner
            .violations
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn recent_ticks(&self, limit: usize) -> Vec<crate::types::AllocationTickResult> {
        let inner = self.inner.lock().await;
        inner.ticks.iter().rev().take(limit).cloned().collect()
    }

    pub fn next_tick_id(&self) -> u64 {
        self.tick_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn record_tick(&self, result: crate::types::AllocationTickResult) {
        let mut inner = self.inner.lock().await;
        inner.ticks.push(result.clone());
        if inner.ticks.len() > MAX_TICK_HISTORY {
            inner.ticks.remove(0);
        }
        inner.version += 1;
        drop(inner);
        self.publish(Event::LoadUpdated {
            total_kw: result.total_allocated_kw,
        });
    }

    /// Apply a command, mutating state under the single-writer lock and
    /// publishing the resulting events after the lock is released.
    pub async fn apply(&self, command: Command) -> Result<Vec<Event>> {
        let mut inner = self.inner.lock().await;
        let events = match command {
            Command::RegisterStation(station) => {
                if inner.stations.contains_key(&station.id) {
                    return Err(DlmError::state_conflict(format!(
                        "station {} already registered",
                        station.id
                    )));
                }
                inner.stations.insert(station.id.clone(), station.clone());
                inner.version += 1;
                vec![Event::StationRegistered(station)]
            }
            Command::UpdateStation(station) => {
                if !inner.stations.contains_key(&station.id) {
                    return Err(DlmError::not_discovered(format!(
                        "station {} not registered",
                        station.id
                    )));
                }
                inner.stations.insert(station.id.clone(), (*station).clone());
                inner.version += 1;
                vec![Event::StationUpdated(*station)]
            }
            Command::RemoveStation { station_id } => {
                if inner.stations.remove(&station_id).is_none() {
                    return Err(DlmError::not_discovered(format!(
                        "station {station_id} not registered"
                    )));
                }
                inner.failsafe.remove(&station_id);
                inner.version += 1;
                vec![Event::StationDeleted { station_id }]
            }
            Command::ObserveStationMeasurement {
                station_id,
                current_power_kw,
                session_energy_kwh,
                phase_currents,
                temperature_c,
                soc_percent,
                status,
            } => {
                let station = inner.stations.get_mut(&station_id).ok_or_else(|| {
                    DlmError::not_discovered(format!("station {station_id} not registered"))
                })?;
                station.current_power_kw = current_power_kw;
                station.session_energy_kwh = session_energy_kwh;
                if let Some(pc) = phase_currents {
                    station.phase_currents = pc;
                }
                if let Some(t) = temperature_c {
                    station.temperature_c = Some(t);
                }
                if let Some(s) = soc_percent {
                    station.soc_percent = Some(s);
                }
                if let Some(st) = status {
                    station.status = st;
                    station.online = !matches!(st, StationStatus::Offline);
                }
                station.last_seen = Utc::now();
                let updated = station.clone();
                if let Some(fs) = inner.failsafe.get_mut(&station_id) {
                    fs.last_comm = Utc::now();
                    fs.failsafe_active = false;
                    fs.consecutive_timeouts = 0;
                }
                inner.version += 1;
                vec![Event::StationUpdated(updated)]
            }
            Command::ObserveMeterMeasurement(mut meter) => {
                meter.last_seen = Utc::now();
                inner.meters.insert(meter.id.clone(), meter.clone());
                inner.version += 1;
                vec![Event::MeterUpdated(meter)]
            }
            Command::RecordAllocation {
                station_id,
                decided_power_kw,
            } => {
                if let Some(station) = inner.stations.get_mut(&station_id) {
                    station.current_power_kw = decided_power_kw;
                    station.last_command_at = Some(Utc::now());
                }
                if let Some(fs) = inner.failsafe.get_mut(&station_id) {
                    fs.last_known_good_kw = decided_power_kw;
                }
                inner.version += 1;
                vec![Event::StationCommand {
                    station_id,
                    power_kw: decided_power_kw,
                }]
            }
            Command::RecordViolation(violation) => {
                inner.violations.push(violation.clone());
                if inner.violations.len() > MAX_VIOLATION_HISTORY {
                    inner.violations.remove(0);
                }
                inner.version += 1;
                vec![Event::Violation(violation)]
            }
            Command::SetSheddingLevel(state) => {
                inner.shedding = state.clone();
                inner.version += 1;
                vec![Event::SheddingTransition(state)]
            }
            Command::SetFailSafeState(state) => {
                inner.failsafe.insert(state.station_id.clone(), state);
                inner.version += 1;
                vec![]
            }
        };
        drop(inner);
        for event in &events {
            self.publish(event.clone());
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StationClass;

    fn store() -> StateStore {
        StateStore::new(SiteConstraintsTopology::default(), Vec::new())
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let store = store();
        let station = Station::new("s1", "Station 1", StationClass::Ac3Phase);
        store
            .apply(Command::RegisterStation(station.clone()))
            .await
            .unwrap();
        let snap = store.snapshot().await;
        assert!(snap.stations.contains_key("s1"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let store = store();
        let station = Station::new("s1", "Station 1", StationClass::Ac3Phase);
        store
            .apply(Command::RegisterStation(station.clone()))
            .await
            .unwrap();
        let result = store.apply(Command::RegisterStation(station)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_station_fails() {
        let store = store();
        let station = Station::new("unknown", "X", StationClass::Ac3Phase);
        let result = store.apply(Command::UpdateStation(Box::new(station))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_receives_published_event() {
        let store = store();
        let mut stream = Box::pin(store.subscribe("station."));
        let station = Station::new("s1", "Station 1", StationClass::Ac3Phase);
        store
            .apply(Command::RegisterStation(station))
            .await
            .unwrap();
        use tokio_stream::StreamExt;
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic(), "station.registered");
    }
}
