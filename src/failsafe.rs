//! Fail-Safe Manager (§4.10)
//!
//! Monitors per-station `last_comm` and applies `offline_action` on
//! timeout; also runs a system-wide heartbeat watchdog.

use crate::breaker::Watchdog;
use crate::logging::get_logger;
use crate::state::{Command, StateStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct FailSafeManager {
    store: StateStore,
    heartbeat_interval_ms: u64,
    system_watchdog: Arc<Watchdog>,
    logger: crate::logging::StructuredLogger,
}

impl FailSafeManager {
    pub fn new(store: StateStore, heartbeat_interval_ms: u64, heartbeat_timeout_ms: u64) -> Self {
        Self {
            store,
            heartbeat_interval_ms,
            system_watchdog: Arc::new(Watchdog::new(Duration::from_millis(heartbeat_timeout_ms))),
            logger: get_logger("failsafe"),
        }
    }

    /// The controller's own heartbeat; call periodically from whatever
    /// drives the core event loop (§4.10 step 3).
    pub async fn kick_system_heartbeat(&self) {
        self.system_watchdog.kick().await;
    }

    /// One heartbeat cycle over every known station (§4.10 steps 1-3).
    pub async fn heartbeat_once(&self) {
        let snapshot = self.store.snapshot().await;
        let system_offline = self.system_watchdog.expired().await;
        let now = Utc::now();

        for (station_id, mut fs) in snapshot.failsafe {
            let timed_out = system_offline
                || now
                    .signed_duration_since(fs.last_comm)
                    .num_milliseconds()
                    .max(0) as u64
                    > fs.comm_timeout_ms;

            if timed_out {
                fs.consecutive_timeouts += 1;
                if !fs.failsafe_active {
                    self.logger.warn(&format!(
                        "station {station_id} fail-safe engaged after {} consecutive timeouts",
                        fs.consecutive_timeouts
                    ));
                }
                fs.failsafe_active = true;
                let _ = self.store.apply(Command::SetFailSafeState(fs)).await;
            }
        }
    }

    /// Simulate the timeout path for a station without mutating durable
    /// state; returns the action that would be taken (§4.10 `test_failsafe`).
    pub async fn test_failsafe(&self, station_id: &str) -> Option<crate::types::OfflineAction> {
        let snapshot = self.store.snapshot().await;
        snapshot
            .failsafe
            .get(station_id)
            .map(|fs| fs.offline_action.clone())
    }

    /// Heartbeat loop, selecting against a shutdown signal (§5 T3).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.heartbeat_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.kick_system_heartbeat().await;
                    self.heartbeat_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.logger.info("fail-safe manager shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Command as StateCommand;
    use crate::types::{FailSafeStationState, OfflineAction, SiteConstraintsTopology};

    #[tokio::test]
    async fn test_heartbeat_engages_on_timeout() {
        let store = StateStore::new(SiteConstraintsTopology::default(), Vec::new());
        let mut fs = FailSafeStationState::new("s1", 10);
        fs.last_comm = Utc::now() - chrono::Duration::milliseconds(100);
        fs.offline_action = OfflineAction::Stop;
        store
            .apply(StateCommand::SetFailSafeState(fs))
            .await
            .unwrap();

        let manager = FailSafeManager::new(store.clone(), 100, 100_000);
        manager.heartbeat_once().await;

        let snapshot = store.snapshot().await;
        assert!(snapshot.failsafe.get("s1").unwrap().failsafe_active);
    }

    #[tokio::test]
    async fn test_no_timeout_leaves_inactive() {
        let store = StateStore::new(SiteConstraintsTopology::default(), Vec::new());
        let fs = FailSafeStationState::new("s1", 100_000);
        store
            .apply(StateCommand::SetFailSafeState(fs))
            .await
            .unwrap();

        let manager = FailSafeManager::new(store.clone(), 100, 100_000);
        manager.heartbeat_once().await;

        let snapshot = store.snapshot().await;
        assert!(!snapshot.failsafe.get("s1").unwrap().failsafe_active);
    }
}
